use thiserror::Error;

/// Message surfaced when a model finished without the expected output key.
pub const INSPECT_MODEL_LOG: &str = "execution failed, inspect model log";

/// Errors produced by the orchestration core.
///
/// Every variant renders to a human-readable message; the scheduler stores
/// that message verbatim in the task's `statusMsg` when a task fails.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or malformed configuration (server key, config file, modelConfig).
    #[error("config error: {0}")]
    Config(String),

    /// The model registry has no entry for the requested key.
    #[error("model not found: {key}")]
    ModelNotFound { key: String },

    /// The model subprocess could not be launched.
    #[error("failed to spawn model process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reading the model subprocess output failed.
    #[error("model process pipe error: {0}")]
    Pipe(String),

    /// No final result and no liveness marker within the idle window.
    #[error("model process timed out after {secs}s without output marker")]
    Timeout { secs: u64 },

    /// The in-flight call was cancelled.
    #[error("task cancelled")]
    Cancelled,

    /// The model reported completion but the expected output is absent.
    #[error("{0}")]
    ResultShape(String),

    /// The result envelope could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Cancel was requested for a task with no registered runner.
    #[error("task {id} is not running")]
    TaskNotRunning { id: i64 },

    /// The referenced task does not exist.
    #[error("task not found: {id}")]
    TaskNotFound { id: i64 },

    /// An operation was requested in a state that does not allow it.
    #[error("{0}")]
    InvalidState(String),

    /// The media tool exited unsuccessfully.
    #[error("media tool failed: {0}")]
    Media(String),

    /// The task persistence layer failed.
    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        CoreError::InvalidState(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CoreError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
