//! Orchestration core for local AIGC model servers.
//!
//! Model executables are launched once per function call and report results
//! through marker lines on their console output ([`protocol`]). The
//! [`scheduler::TaskScheduler`] drains the persisted task queue through
//! [`runner::ProcessRunner`]s; SoundReplace tasks run through the resumable
//! [`pipeline::SoundReplacePipeline`].

pub mod cancel;
pub mod config;
pub mod control;
pub mod error;
pub mod media;
pub mod model;
pub mod pipeline;
pub mod protocol;
pub mod runner;
pub mod scheduler;
pub mod task;

#[cfg(test)]
mod test_support;

pub use cancel::CancellationRegistry;
pub use config::{SchedulerConfig, TaskConfig};
pub use control::TaskControl;
pub use error::{CoreError, Result};
pub use media::{FfmpegTool, MediaTool};
pub use model::{FileModelRegistry, ModelDescriptor, ModelRegistry, ServerFunction};
pub use pipeline::{SoundReplaceJob, SoundReplacePipeline};
pub use runner::{ModelRunner, ProcessRunner, ProcessRunnerFactory, RunRequest, RunResult, RunnerFactory};
pub use scheduler::TaskScheduler;
pub use task::{MemoryTaskStore, NewTask, Task, TaskStatus, TaskStore, TaskUpdate};
