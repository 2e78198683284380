//! Operations external callers may perform on tasks.

use std::sync::Arc;

use tracing::info;

use crate::cancel::CancellationRegistry;
use crate::error::{CoreError, Result};
use crate::pipeline::{self, Segment};
use crate::task::{now_millis, Task, TaskStatus, TaskStore, TaskUpdate};

pub const CANCELLED_MSG: &str = "cancelled";

const CANCEL_ATTEMPTS: usize = 3;

/// Cancel, continue and confirm tasks on behalf of the panel.
#[derive(Clone)]
pub struct TaskControl {
    store: Arc<dyn TaskStore>,
    cancellations: Arc<CancellationRegistry>,
}

impl TaskControl {
    pub fn new(store: Arc<dyn TaskStore>, cancellations: Arc<CancellationRegistry>) -> Self {
        Self { store, cancellations }
    }

    /// A queued or waiting task fails immediately; a running one has its
    /// model process killed and is failed by the scheduler.
    pub async fn cancel(&self, task_id: i64) -> Result<Task> {
        for _ in 0..CANCEL_ATTEMPTS {
            let task = self.store.get_task(task_id).await?;
            match task.status {
                TaskStatus::Queue | TaskStatus::Wait => {
                    let update = TaskUpdate::status(TaskStatus::Fail).msg(CANCELLED_MSG).end_time(now_millis());
                    if let Some(cancelled) = self.store.transition(task_id, task.status, update).await? {
                        info!(task_id, status = %task.status, "task cancelled");
                        return Ok(cancelled);
                    }
                    // Claimed or confirmed in between; look again.
                }
                TaskStatus::Running => {
                    self.cancellations.cancel(task_id)?;
                    return Ok(task);
                }
                other => return Err(CoreError::invalid_state(format!("task status {other} cannot be cancelled"))),
            }
        }
        Err(CoreError::invalid_state("task status keeps changing, try again"))
    }

    /// Requeue a failed task. Pipelines pick up at their saved step.
    pub async fn continue_task(&self, task_id: i64) -> Result<Task> {
        let update = TaskUpdate::status(TaskStatus::Queue).msg("").end_time(0);
        let task = self
            .store
            .transition(task_id, TaskStatus::Fail, update)
            .await?
            .ok_or_else(|| CoreError::invalid_state("task status must be fail"))?;
        info!(task_id, "task continued");
        Ok(task)
    }

    pub async fn submit_confirm(&self, task_id: i64, records: Vec<Segment>) -> Result<Task> {
        pipeline::submit_confirm(self.store.as_ref(), task_id, records).await
    }
}
