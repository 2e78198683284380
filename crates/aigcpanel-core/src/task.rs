//! Task rows and the persistence seam the scheduler drives.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::RwLock;

use crate::error::{CoreError, Result};

/// Business tag of pipelined audio replacement.
pub const BIZ_SOUND_REPLACE: &str = "SoundReplace";

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle state of a [`Task`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Queue,
    /// Paused for human confirmation.
    Wait,
    Running,
    Success,
    Fail,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Fail)
    }
}

/// A unit of work. The row is the single source of truth for its progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub biz: String,
    #[serde(rename = "type")]
    pub kind: i32,
    pub title: String,
    pub status: TaskStatus,
    pub status_msg: String,
    /// Epoch millis; 0 until set.
    pub start_time: i64,
    pub end_time: i64,
    pub server_name: String,
    pub server_title: String,
    pub server_version: String,
    pub param: Value,
    /// Per-biz configuration captured at creation time.
    pub model_config: Value,
    /// Incremental pipeline progress; `{}` for single-shot tasks.
    pub job_result: Value,
    pub result: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn is_sound_replace(&self) -> bool {
        self.biz == BIZ_SOUND_REPLACE
    }
}

/// Fields of a task to create.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub biz: String,
    pub kind: Option<i32>,
    pub title: String,
    pub param: Value,
    pub model_config: Value,
    pub server_name: String,
    pub server_title: String,
    pub server_version: String,
}

impl NewTask {
    pub fn into_task(self, id: i64, now: i64) -> Task {
        Task {
            id,
            biz: self.biz,
            kind: self.kind.unwrap_or(1),
            title: self.title,
            status: TaskStatus::Queue,
            status_msg: String::new(),
            start_time: 0,
            end_time: 0,
            server_name: self.server_name,
            server_title: self.server_title,
            server_version: self.server_version,
            param: if self.param.is_null() { Value::Object(Default::default()) } else { self.param },
            model_config: self.model_config,
            job_result: Value::Object(Default::default()),
            result: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update: only `Some` fields change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub status_msg: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub server_name: Option<String>,
    pub server_title: Option<String>,
    pub server_version: Option<String>,
    pub job_result: Option<Value>,
    pub result: Option<Value>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    pub fn msg(mut self, msg: impl Into<String>) -> Self {
        self.status_msg = Some(msg.into());
        self
    }

    pub fn start_time(mut self, at: i64) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn end_time(mut self, at: i64) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn job_result(mut self, value: Value) -> Self {
        self.job_result = Some(value);
        self
    }

    pub fn result(mut self, value: Value) -> Self {
        self.result = Some(value);
        self
    }

    /// Apply to `task` and bump `updatedAt`.
    pub fn apply(self, task: &mut Task, now: i64) {
        if let Some(v) = self.status {
            task.status = v;
        }
        if let Some(v) = self.status_msg {
            task.status_msg = v;
        }
        if let Some(v) = self.start_time {
            task.start_time = v;
        }
        if let Some(v) = self.end_time {
            task.end_time = v;
        }
        if let Some(v) = self.server_name {
            task.server_name = v;
        }
        if let Some(v) = self.server_title {
            task.server_title = v;
        }
        if let Some(v) = self.server_version {
            task.server_version = v;
        }
        if let Some(v) = self.job_result {
            task.job_result = v;
        }
        if let Some(v) = self.result {
            task.result = v;
        }
        task.updated_at = now;
    }
}

/// Status message written when start-up recovery requeues a task.
pub const INTERRUPTED_MSG: &str = "interrupted, requeued";

/// Task persistence. Reads are snapshots; writes are serialized by the store.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Tasks in `queue`, newest first.
    async fn list_queued(&self) -> Result<Vec<Task>>;

    /// Fails with [`CoreError::TaskNotFound`] when absent.
    async fn get_task(&self, id: i64) -> Result<Task>;

    /// Apply `update` and return the stored row.
    async fn update_task(&self, id: i64, update: TaskUpdate) -> Result<Task>;

    /// Apply `update` only while the task is still `expected`. `None` means
    /// another writer moved the task first and nothing was written.
    async fn transition(&self, id: i64, expected: TaskStatus, update: TaskUpdate) -> Result<Option<Task>>;

    async fn create_task(&self, task: NewTask) -> Result<Task>;

    /// Move every `running` task back to `queue`. Returns the number moved.
    async fn requeue_interrupted(&self) -> Result<u64>;
}

// ── In-memory store ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    tasks: BTreeMap<i64, Task>,
}

/// [`TaskStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_queued(&self) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .rev()
            .filter(|t| t.status == TaskStatus::Queue)
            .cloned()
            .collect())
    }

    async fn get_task(&self, id: i64) -> Result<Task> {
        self.inner
            .read()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or(CoreError::TaskNotFound { id })
    }

    async fn update_task(&self, id: i64, update: TaskUpdate) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id).ok_or(CoreError::TaskNotFound { id })?;
        update.apply(task, now_millis());
        Ok(task.clone())
    }

    async fn transition(&self, id: i64, expected: TaskStatus, update: TaskUpdate) -> Result<Option<Task>> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id).ok_or(CoreError::TaskNotFound { id })?;
        if task.status != expected {
            return Ok(None);
        }
        update.apply(task, now_millis());
        Ok(Some(task.clone()))
    }

    async fn create_task(&self, new: NewTask) -> Result<Task> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let task = new.into_task(inner.next_id, now_millis());
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn requeue_interrupted(&self) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let now = now_millis();
        let mut moved = 0;
        for task in inner.tasks.values_mut().filter(|t| t.status == TaskStatus::Running) {
            TaskUpdate::status(TaskStatus::Queue).msg(INTERRUPTED_MSG).apply(task, now);
            moved += 1;
        }
        Ok(moved)
    }
}
