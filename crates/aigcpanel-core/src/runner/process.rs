//! [`ModelRunner`] that launches the model executable once per call.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::env::{compose_environment, substitute_placeholders};
use super::{ModelRunner, ResultEnvelope, RunRequest, RunResult, RunnerOptions};
use crate::error::{CoreError, Result, INSPECT_MODEL_LOG};
use crate::model::{ModelDescriptor, ServerFunction};
use crate::protocol::{self, Marker};

#[derive(Debug, Default)]
struct RunnerState {
    ready: bool,
    /// Kill switch of the in-flight call.
    active: Option<CancellationToken>,
}

/// Runs one model executable per function call.
#[derive(Debug)]
pub struct ProcessRunner {
    descriptor: ModelDescriptor,
    options: RunnerOptions,
    state: Mutex<RunnerState>,
}

enum StreamEvent {
    Marker(Marker),
    Failed { stream: &'static str, error: String },
}

enum Exit {
    Status(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

impl ProcessRunner {
    pub fn new(descriptor: ModelDescriptor) -> Self {
        Self::with_options(descriptor, RunnerOptions::default())
    }

    pub fn with_options(descriptor: ModelDescriptor, options: RunnerOptions) -> Self {
        Self {
            descriptor,
            options,
            state: Mutex::new(RunnerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the executable, wait for its final marker and return the raw
    /// extracted map.
    async fn execute(&self, request: &RunRequest, kill: &CancellationToken) -> Result<Map<String, Value>> {
        let config = job_config(request, &self.descriptor.setting);
        let mut config_file = tempfile::Builder::new()
            .prefix("aigcpanel-config-")
            .suffix(".json")
            .tempfile()?;
        config_file.write_all(&serde_json::to_vec(&config)?)?;
        config_file.flush()?;
        let config_path = config_file.path().to_path_buf();

        let root = self.descriptor.local_path.as_path();
        let program = resolve_program(
            &substitute_placeholders(&self.descriptor.entry, &config_path, root),
            root,
        );
        let args: Vec<String> = self
            .descriptor
            .entry_args
            .iter()
            .map(|a| substitute_placeholders(a, &config_path, root))
            .collect();
        let envs = compose_environment(std::env::vars(), &self.descriptor, &config_path);

        debug!(
            task_id = %request.id,
            program = %program.display(),
            ?args,
            cwd = %root.display(),
            env_count = envs.len(),
            "launching model process"
        );

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(root)
            .env_clear()
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CoreError::Spawn)?;
        let pid = child.id();
        info!(task_id = %request.id, ?pid, server_key = %self.descriptor.key, "model process started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Pipe("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::Pipe("stderr not captured".into()))?;

        let readers = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(read_stream(stdout, "stdout", request.id.clone(), tx.clone(), readers.clone()));
        tokio::spawn(read_stream(stderr, "stderr", request.id.clone(), tx, readers.clone()));
        let _stop_readers = readers.drop_guard();

        let idle = self.options.idle_timeout;
        let deadline = sleep(idle);
        tokio::pin!(deadline);
        let mut read_error: Option<String> = None;

        let extracted = loop {
            tokio::select! {
                _ = kill.cancelled() => {
                    warn!(task_id = %request.id, ?pid, "call cancelled, killing model process");
                    terminate(&mut child).await;
                    return Err(CoreError::Cancelled);
                }
                _ = &mut deadline => {
                    warn!(task_id = %request.id, ?pid, timeout_secs = idle.as_secs(), "model process idle, killing");
                    terminate(&mut child).await;
                    return Err(CoreError::Timeout { secs: idle.as_secs() });
                }
                event = rx.recv() => match event {
                    Some(StreamEvent::Marker(Marker::Alive)) => {
                        deadline.as_mut().reset(Instant::now() + idle);
                    }
                    Some(StreamEvent::Marker(Marker::Final(map))) => {
                        info!(task_id = %request.id, keys = ?map.keys().collect::<Vec<_>>(), "result extracted");
                        break Some(map);
                    }
                    Some(StreamEvent::Failed { stream, error }) => {
                        warn!(task_id = %request.id, stream, %error, "failed reading model output");
                        read_error.get_or_insert(format!("error reading from {stream}: {error}"));
                    }
                    None => break None,
                },
            }
        };

        if let Some(map) = extracted {
            terminate(&mut child).await;
            return Ok(map);
        }

        // Both streams closed without a final marker.
        let exit = tokio::select! {
            _ = kill.cancelled() => Exit::Cancelled,
            _ = &mut deadline => Exit::TimedOut,
            status = child.wait() => Exit::Status(status),
        };
        let status = match exit {
            Exit::Status(status) => status?,
            Exit::Cancelled => {
                terminate(&mut child).await;
                return Err(CoreError::Cancelled);
            }
            Exit::TimedOut => {
                terminate(&mut child).await;
                return Err(CoreError::Timeout { secs: idle.as_secs() });
            }
        };
        if let Some(error) = read_error {
            return Err(CoreError::Pipe(error));
        }
        if !status.success() {
            return Err(CoreError::Pipe(format!("model process exited with {status}")));
        }
        Ok(Map::new())
    }
}

#[async_trait]
impl ModelRunner for ProcessRunner {
    fn start(&self) {
        self.lock().ready = true;
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.ready = false;
        if let Some(token) = state.active.take() {
            token.cancel();
        }
    }

    fn ping(&self) -> bool {
        self.lock().ready
    }

    async fn call(&self, request: RunRequest) -> Result<RunResult> {
        let kill = {
            let mut state = self.lock();
            if !state.ready {
                debug!(task_id = %request.id, server_key = %self.descriptor.key, "runner not ready, asking for retry");
                return Ok(RunResult::retry());
            }
            let token = CancellationToken::new();
            state.active = Some(token.clone());
            token
        };

        let start = chrono::Utc::now().timestamp();
        let outcome = self.execute(&request, &kill).await;
        {
            let mut state = self.lock();
            if !kill.is_cancelled() {
                state.active = None;
            }
        }

        let data = build_output(request.function, &outcome?)?;
        Ok(RunResult::ok(ResultEnvelope::Success {
            start,
            end: chrono::Utc::now().timestamp(),
            data,
        }))
    }
}

/// JSON job file handed to the executable.
fn job_config(request: &RunRequest, setting: &Map<String, Value>) -> Value {
    let text = request.text.clone().unwrap_or_default();
    let model_config = match request.function {
        ServerFunction::SoundTts => json!({
            "type": "soundTts",
            "param": request.param,
            "text": text,
        }),
        ServerFunction::SoundClone => json!({
            "type": "soundClone",
            "param": request.param,
            "text": text,
            "promptAudio": request.prompt_audio.clone().unwrap_or_default(),
            "promptText": request.prompt_text.clone().unwrap_or_default(),
        }),
        ServerFunction::VideoGen => json!({
            "type": "videoGen",
            "param": request.param,
            "video": request.video.clone().unwrap_or_default(),
            "audio": request.audio.clone().unwrap_or_default(),
        }),
        ServerFunction::Asr => json!({
            "type": "asr",
            "param": request.param,
            "audio": request.audio.clone().unwrap_or_default(),
        }),
    };
    json!({
        "id": request.id,
        "mode": "local",
        "modelConfig": model_config,
        "setting": setting,
    })
}

/// Shape the extracted map into the function's output.
fn build_output(function: ServerFunction, extracted: &Map<String, Value>) -> Result<Map<String, Value>> {
    let key = match function {
        ServerFunction::Asr => "records",
        _ => "url",
    };
    match extracted.get(key) {
        Some(value) => {
            let mut out = Map::new();
            out.insert(key.to_owned(), value.clone());
            Ok(out)
        }
        None => Err(CoreError::ResultShape(match extracted.get("error") {
            Some(Value::String(msg)) => msg.clone(),
            Some(other) => other.to_string(),
            None => INSPECT_MODEL_LOG.to_owned(),
        })),
    }
}

/// Relative entries containing a separator are resolved against the install dir.
fn resolve_program(entry: &str, root: &Path) -> PathBuf {
    let path = Path::new(entry);
    if path.is_relative() && path.components().count() > 1 {
        root.join(path)
    } else {
        path.to_path_buf()
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "model process already gone");
    }
}

async fn read_stream<R>(
    reader: R,
    stream: &'static str,
    task_id: String,
    tx: mpsc::Sender<StreamEvent>,
    stop: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = stop.cancelled() => return,
            r = reader.read_until(b'\n', &mut buf) => r,
        };
        match read {
            Ok(0) => return,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                debug!(task_id = %task_id, stream, "{line}");
                if let Some(marker) = protocol::extract(&task_id, line) {
                    if tx.send(StreamEvent::Marker(marker)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Failed { stream, error: e.to_string() })
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn runner_for(root: &Path, script: &str, idle: Duration) -> ProcessRunner {
        let descriptor = ModelDescriptor {
            key: "demo|1.0.0".into(),
            local_path: root.to_path_buf(),
            entry: "sh".into(),
            entry_args: vec!["-c".into(), script.into(), "${CONFIG}".into()],
            setting: json!({"device": "cpu"}).as_object().cloned().unwrap(),
            ..Default::default()
        };
        ProcessRunner::with_options(descriptor, RunnerOptions { idle_timeout: idle })
    }

    #[tokio::test]
    async fn not_ready_runner_returns_retry_without_spawning() {
        let descriptor = ModelDescriptor {
            entry: "/definitely/not/a/binary".into(),
            ..Default::default()
        };
        let runner = ProcessRunner::new(descriptor);
        let result = runner
            .sound_tts(RunRequest::new("t0", ServerFunction::SoundTts).with_text("hi"))
            .await
            .unwrap();
        assert!(result.is_retry());
    }

    #[test]
    fn output_builder_prefers_model_error() {
        let err = build_output(ServerFunction::SoundTts, &Map::new()).unwrap_err();
        assert_eq!(err.to_string(), INSPECT_MODEL_LOG);

        let with_error = json!({"error": "cuda oom"}).as_object().cloned().unwrap();
        let err = build_output(ServerFunction::Asr, &with_error).unwrap_err();
        assert_eq!(err.to_string(), "cuda oom");

        let ok = json!({"records": [], "extra": 1}).as_object().cloned().unwrap();
        let out = build_output(ServerFunction::Asr, &ok).unwrap();
        assert_eq!(Value::Object(out), json!({"records": []}));
    }

    #[test]
    fn job_config_carries_function_fields() {
        let request = RunRequest::new("task-3", ServerFunction::SoundClone)
            .with_text("hello")
            .with_prompt("/p.wav", "prompt");
        let setting = json!({"port": 1}).as_object().cloned().unwrap();
        let cfg = job_config(&request, &setting);
        assert_eq!(cfg["id"], "task-3");
        assert_eq!(cfg["mode"], "local");
        assert_eq!(cfg["modelConfig"]["type"], "soundClone");
        assert_eq!(cfg["modelConfig"]["promptAudio"], "/p.wav");
        assert_eq!(cfg["setting"]["port"], 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn final_marker_ends_call_and_config_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"echo "$0" > cfg_path.txt; cp "$0" seen.json; echo loading; echo "AigcPanelRunResult[t1][eyJ1cmwiOiIvb3V0LndhdiJ9]"; sleep 30"#;
        let runner = runner_for(tmp.path(), script, Duration::from_secs(20));
        runner.start();

        let started = std::time::Instant::now();
        let result = runner
            .sound_tts(RunRequest::new("t1", ServerFunction::SoundTts).with_text("hello"))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(15));

        match result.data {
            ResultEnvelope::Success { data, .. } => assert_eq!(data["url"], "/out.wav"),
            other => panic!("unexpected {other:?}"),
        }

        let seen: Value = serde_json::from_slice(&std::fs::read(tmp.path().join("seen.json")).unwrap()).unwrap();
        assert_eq!(seen["modelConfig"]["text"], "hello");
        assert_eq!(seen["setting"]["device"], "cpu");

        let cfg_path = std::fs::read_to_string(tmp.path().join("cfg_path.txt")).unwrap();
        assert!(!Path::new(cfg_path.trim()).exists());
        assert!(runner.ping(), "a call must not clear readiness");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn error_payload_fails_the_call() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"echo "RunResult[t2][eyJlcnJvciI6ImJvb20ifQ==]" >&2; sleep 30"#;
        let runner = runner_for(tmp.path(), script, Duration::from_secs(20));
        runner.start();
        let err = runner
            .call(RunRequest::new("t2", ServerFunction::VideoGen))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_process_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_for(tmp.path(), "sleep 30", Duration::from_millis(300));
        runner.start();
        let err = runner
            .call(RunRequest::new("t3", ServerFunction::SoundTts))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn liveness_markers_extend_the_idle_window() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"for i in 1 2 3 4 5 6; do echo "Result[t4][tick $i]"; sleep 0.2; done; echo "RunResult[t4][eyJ1cmwiOiIvb3V0LndhdiJ9]"; sleep 30"#;
        let runner = runner_for(tmp.path(), script, Duration::from_millis(700));
        runner.start();
        let result = runner
            .call(RunRequest::new("t4", ServerFunction::SoundTts))
            .await
            .unwrap();
        assert!(!result.is_retry());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_without_marker_points_at_model_log() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner_for(tmp.path(), "echo just logging", Duration::from_secs(20));
        runner.start();
        let err = runner
            .call(RunRequest::new("t5", ServerFunction::SoundTts))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), INSPECT_MODEL_LOG);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_kills_in_flight_call() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner_for(tmp.path(), "sleep 30", Duration::from_secs(20)));
        runner.start();

        let call = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.call(RunRequest::new("t6", ServerFunction::SoundTts)).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        runner.cancel();

        let err = tokio::time::timeout(Duration::from_secs(10), call)
            .await
            .expect("call finished")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert!(!runner.ping());
    }
}
