//! Model invocation: the [`ModelRunner`] seam and its subprocess implementation.
//!
//! A runner wraps one installed model. Each function call spawns a fresh OS
//! process, hands it a JSON job file, and waits for the result marker on the
//! process output (see [`crate::protocol`]).

mod env;
mod process;

pub use env::{compose_environment, substitute_placeholders, CONFIG_PLACEHOLDER, ROOT_PLACEHOLDER};
pub use process::ProcessRunner;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::model::{ModelDescriptor, ServerFunction};

/// Idle window after which a silent model process is killed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// `statusMsg` of a task put back in the queue after a retry envelope.
pub const RETRY_MSG: &str = "server not ready, waiting to retry";

// ── Request / result types ───────────────────────────────────────────────────

/// Input of one function call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    /// Correlation id echoed back in the result marker.
    pub id: String,
    pub function: ServerFunction,
    pub param: Map<String, Value>,
    pub text: Option<String>,
    pub prompt_audio: Option<String>,
    pub prompt_text: Option<String>,
    pub video: Option<String>,
    pub audio: Option<String>,
}

impl RunRequest {
    pub fn new(id: impl Into<String>, function: ServerFunction) -> Self {
        Self {
            id: id.into(),
            function,
            param: Map::new(),
            text: None,
            prompt_audio: None,
            prompt_text: None,
            video: None,
            audio: None,
        }
    }

    pub fn with_param(mut self, param: Map<String, Value>) -> Self {
        self.param = param;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_prompt(mut self, audio: impl Into<String>, text: impl Into<String>) -> Self {
        self.prompt_audio = Some(audio.into());
        self.prompt_text = Some(text.into());
        self
    }

    pub fn with_video(mut self, video: impl Into<String>) -> Self {
        self.video = Some(video.into());
        self
    }

    pub fn with_audio(mut self, audio: impl Into<String>) -> Self {
        self.audio = Some(audio.into());
        self
    }
}

/// Outcome of a call that did not fail outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub code: i32,
    pub msg: String,
    pub data: ResultEnvelope,
}

impl RunResult {
    pub fn ok(data: ResultEnvelope) -> Self {
        Self { code: 0, msg: "ok".to_owned(), data }
    }

    pub fn retry() -> Self {
        Self::ok(ResultEnvelope::Retry)
    }

    pub fn is_retry(&self) -> bool {
        matches!(self.data, ResultEnvelope::Retry)
    }
}

/// `data` of a [`RunResult`], tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultEnvelope {
    /// The model is not accepting work yet; try again later.
    Retry,
    /// Epoch seconds for `start`/`end`; `data` is function specific.
    Success {
        start: i64,
        end: i64,
        data: Map<String, Value>,
    },
}

/// Per-runner tuning.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub idle_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self { idle_timeout: DEFAULT_IDLE_TIMEOUT }
    }
}

// ── Traits ───────────────────────────────────────────────────────────────────

/// One installed model that can execute function calls.
///
/// `start` only flips the runner into the ready state; processes are spawned
/// per call. `cancel` is the externally triggered form of `stop`.
#[async_trait]
pub trait ModelRunner: Send + Sync + 'static {
    fn start(&self);

    /// Kill the in-flight process, if any, and clear the ready flag.
    fn stop(&self);

    fn cancel(&self) {
        self.stop()
    }

    fn ping(&self) -> bool;

    /// Execute `request.function`. A not-ready runner answers with a retry
    /// envelope without spawning anything.
    async fn call(&self, request: RunRequest) -> Result<RunResult>;

    async fn sound_tts(&self, mut request: RunRequest) -> Result<RunResult> {
        request.function = ServerFunction::SoundTts;
        self.call(request).await
    }

    async fn sound_clone(&self, mut request: RunRequest) -> Result<RunResult> {
        request.function = ServerFunction::SoundClone;
        self.call(request).await
    }

    async fn video_gen(&self, mut request: RunRequest) -> Result<RunResult> {
        request.function = ServerFunction::VideoGen;
        self.call(request).await
    }

    async fn asr(&self, mut request: RunRequest) -> Result<RunResult> {
        request.function = ServerFunction::Asr;
        self.call(request).await
    }
}

/// Builds runners for resolved models. Tests substitute scripted runners here.
pub trait RunnerFactory: Send + Sync + 'static {
    fn create(&self, descriptor: ModelDescriptor) -> Arc<dyn ModelRunner>;
}

/// Factory producing [`ProcessRunner`]s.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunnerFactory {
    options: RunnerOptions,
}

impl ProcessRunnerFactory {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }
}

impl RunnerFactory for ProcessRunnerFactory {
    fn create(&self, descriptor: ModelDescriptor) -> Arc<dyn ModelRunner> {
        Arc::new(ProcessRunner::with_options(descriptor, self.options.clone()))
    }
}
