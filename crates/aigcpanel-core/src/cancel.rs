//! Routes external "cancel task N" requests to the runner executing task N.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::runner::ModelRunner;

/// Task id → in-flight runner.
///
/// The lock is held only for map access; cancelling a runner signals its
/// kill switch and never waits for the subprocess.
#[derive(Default)]
pub struct CancellationRegistry {
    runners: Mutex<HashMap<i64, Arc<dyn ModelRunner>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, Arc<dyn ModelRunner>>> {
        self.runners.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, task_id: i64, runner: Arc<dyn ModelRunner>) {
        debug!(task_id, "runner registered");
        self.lock().insert(task_id, runner);
    }

    pub fn unregister(&self, task_id: i64) {
        if self.lock().remove(&task_id).is_some() {
            debug!(task_id, "runner unregistered");
        }
    }

    pub fn is_running(&self, task_id: i64) -> bool {
        self.lock().contains_key(&task_id)
    }

    /// Cancel the runner registered for `task_id`.
    pub fn cancel(&self, task_id: i64) -> Result<()> {
        let runner = self
            .lock()
            .get(&task_id)
            .cloned()
            .ok_or(CoreError::TaskNotRunning { id: task_id })?;
        info!(task_id, "cancelling running task");
        runner.cancel();
        Ok(())
    }
}

/// Unregisters a task when dropped, so every exit path of a call cleans up.
pub(crate) struct Registration<'a> {
    registry: &'a CancellationRegistry,
    task_id: i64,
}

impl<'a> Registration<'a> {
    pub(crate) fn new(registry: &'a CancellationRegistry, task_id: i64, runner: Arc<dyn ModelRunner>) -> Self {
        registry.register(task_id, runner);
        Self { registry, task_id }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.task_id);
    }
}
