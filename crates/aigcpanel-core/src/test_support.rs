//! Scripted collaborators shared by the unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{CoreError, Result};
use crate::media::MediaTool;
use crate::model::{ModelDescriptor, ModelRegistry};
use crate::runner::{ModelRunner, RunRequest, RunResult, RunnerFactory};

// ── Media ────────────────────────────────────────────────────────────────────

/// Records every invocation and touches the output file (last argument).
/// Probes answer by file-name suffix, falling back to `default_duration`.
#[derive(Default)]
pub(crate) struct RecordingMedia {
    runs: Mutex<Vec<Vec<String>>>,
    durations: Mutex<Vec<(String, i64)>>,
    default_duration: i64,
}

impl RecordingMedia {
    pub fn with_default_duration(ms: i64) -> Self {
        Self { default_duration: ms, ..Default::default() }
    }

    pub fn set_duration(&self, suffix: &str, ms: i64) {
        self.durations.lock().unwrap().insert(0, (suffix.to_owned(), ms));
    }

    pub fn runs(&self) -> Vec<Vec<String>> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaTool for RecordingMedia {
    async fn run(&self, args: Vec<String>) -> Result<()> {
        if let Some(out) = args.last() {
            let out = Path::new(out);
            if out.parent().map(Path::exists).unwrap_or(false) {
                std::fs::write(out, b"")?;
            }
        }
        self.runs.lock().unwrap().push(args);
        Ok(())
    }

    async fn probe_duration_ms(&self, path: &Path) -> Result<i64> {
        let name = path.to_string_lossy();
        Ok(self
            .durations
            .lock()
            .unwrap()
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix.as_str()))
            .map(|(_, ms)| *ms)
            .unwrap_or(self.default_duration))
    }
}

/// Fails every invocation.
pub(crate) struct FailingMedia;

#[async_trait]
impl MediaTool for FailingMedia {
    async fn run(&self, _args: Vec<String>) -> Result<()> {
        Err(CoreError::Media("boom".into()))
    }

    async fn probe_duration_ms(&self, _path: &Path) -> Result<i64> {
        Err(CoreError::Media("boom".into()))
    }
}

// ── Runners ──────────────────────────────────────────────────────────────────

type Handler = Box<dyn Fn(&RunRequest) -> Result<RunResult> + Send + Sync>;

/// Runner answering calls from a closure. A `cold` runner never becomes ready.
pub(crate) struct ScriptedRunner {
    ready: AtomicBool,
    cold: bool,
    handler: Handler,
    requests: Mutex<Vec<RunRequest>>,
}

impl ScriptedRunner {
    pub fn new(handler: impl Fn(&RunRequest) -> Result<RunResult> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(false),
            cold: false,
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn cold() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(false),
            cold: true,
            handler: Box::new(|_| Err(CoreError::Protocol("cold runner called".into()))),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelRunner for ScriptedRunner {
    fn start(&self) {
        if !self.cold {
            self.ready.store(true, Ordering::SeqCst);
        }
    }

    fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    fn ping(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn call(&self, request: RunRequest) -> Result<RunResult> {
        if !self.ping() {
            return Ok(RunResult::retry());
        }
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(&request)
    }
}

/// Hands out the same runner for every model.
pub(crate) struct ScriptedFactory {
    runner: Arc<dyn ModelRunner>,
    created: Mutex<Vec<String>>,
}

impl ScriptedFactory {
    pub fn new(runner: Arc<dyn ModelRunner>) -> Arc<Self> {
        Arc::new(Self { runner, created: Mutex::new(Vec::new()) })
    }

    /// Keys of the models runners were created for.
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl RunnerFactory for ScriptedFactory {
    fn create(&self, descriptor: ModelDescriptor) -> Arc<dyn ModelRunner> {
        self.created.lock().unwrap().push(descriptor.key);
        self.runner.clone()
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct StaticRegistry {
    models: HashMap<String, ModelDescriptor>,
}

impl StaticRegistry {
    pub fn with_keys(keys: &[&str]) -> Arc<Self> {
        let models = keys
            .iter()
            .map(|key| {
                let descriptor = ModelDescriptor { key: (*key).to_owned(), ..Default::default() };
                ((*key).to_owned(), descriptor)
            })
            .collect();
        Arc::new(Self { models })
    }
}

impl ModelRegistry for StaticRegistry {
    fn lookup(&self, key: &str) -> Result<ModelDescriptor> {
        self.models
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::ModelNotFound { key: key.to_owned() })
    }
}
