//! Polling loop that turns queued tasks into finished ones.
//!
//! One tick lists every `queue` task and processes them one after another; a
//! task's model call completes before the next task of the tick starts.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancel::{CancellationRegistry, Registration};
use crate::config::{SchedulerConfig, TaskConfig};
use crate::error::{CoreError, Result};
use crate::media::MediaTool;
use crate::model::ModelRegistry;
use crate::pipeline::SoundReplacePipeline;
use crate::runner::{ResultEnvelope, RunResult, RunnerFactory, RETRY_MSG};
use crate::task::{now_millis, Task, TaskStatus, TaskStore, TaskUpdate};

pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn ModelRegistry>,
    runners: Arc<dyn RunnerFactory>,
    cancellations: Arc<CancellationRegistry>,
    pipeline: SoundReplacePipeline,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<dyn ModelRegistry>,
        runners: Arc<dyn RunnerFactory>,
        cancellations: Arc<CancellationRegistry>,
        media: Arc<dyn MediaTool>,
        config: SchedulerConfig,
    ) -> Self {
        let pipeline = SoundReplacePipeline::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&runners),
            Arc::clone(&cancellations),
            media,
        );
        Self {
            store,
            registry,
            runners,
            cancellations,
            pipeline,
            config,
        }
    }

    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    /// Run the polling loop on the current runtime until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(poll_interval_ms = self.config.poll_interval.as_millis() as u64, "task scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
            info!("task scheduler stopped");
        })
    }

    /// One tick. Per-task failures are logged and recorded on the task; only
    /// failing to list the queue is returned.
    pub async fn run_once(&self) -> Result<usize> {
        let tasks = self.store.list_queued().await?;
        let count = tasks.len();
        for task in tasks {
            let id = task.id;
            if let Err(e) = self.handle(task).await {
                warn!(task_id = id, error = %e, "task failed");
                if let Err(e) = self.fail(id, &e.to_string()).await {
                    error!(task_id = id, error = %e, "could not record task failure");
                }
            }
        }
        Ok(count)
    }

    async fn handle(&self, task: Task) -> Result<()> {
        // The listing is a snapshot; the task may have been cancelled since.
        let claim = TaskUpdate::status(TaskStatus::Running).start_time(now_millis());
        let Some(task) = self.store.transition(task.id, TaskStatus::Queue, claim).await? else {
            debug!(task_id = task.id, "task left the queue before pickup, skipped");
            return Ok(());
        };
        info!(task_id = task.id, biz = %task.biz, "task picked up");

        let config = TaskConfig::parse(&task.biz, &task.model_config)?;
        if let TaskConfig::SoundReplace(config) = &config {
            return self.pipeline.run(&task, config).await;
        }

        let server_key = config.server_key()?;
        let descriptor = self.registry.lookup(server_key)?;
        let request = config
            .request(task.id)
            .ok_or_else(|| CoreError::config("task has no model function"))?;
        if !descriptor.supports(request.function) {
            warn!(task_id = task.id, server_key, function = %request.function, "model does not declare this function");
        }
        let server = TaskUpdate {
            server_name: Some(descriptor.name.clone()),
            server_title: Some(descriptor.title.clone()),
            server_version: Some(descriptor.version.clone()),
            ..Default::default()
        };
        self.store.update_task(task.id, server).await?;

        let runner = self.runners.create(descriptor);
        let outcome = {
            runner.start();
            let _registration = Registration::new(&self.cancellations, task.id, Arc::clone(&runner));
            runner.call(request).await
        }?;
        self.record(task.id, server_key, outcome).await
    }

    async fn record(&self, task_id: i64, server_key: &str, outcome: RunResult) -> Result<()> {
        let envelope = serde_json::to_value(&outcome.data)?;
        match outcome.data {
            ResultEnvelope::Retry => {
                info!(task_id, server_key, "server not ready, task requeued");
                self.store
                    .update_task(task_id, TaskUpdate::status(TaskStatus::Queue).msg(RETRY_MSG))
                    .await?;
            }
            ResultEnvelope::Success { data, .. } => {
                let update = TaskUpdate::status(TaskStatus::Success)
                    .msg("")
                    .end_time(now_millis())
                    .job_result(envelope)
                    .result(Value::Object(data));
                self.store.update_task(task_id, update).await?;
                info!(task_id, server_key, "task succeeded");
            }
        }
        Ok(())
    }

    async fn fail(&self, task_id: i64, msg: &str) -> Result<()> {
        self.store
            .update_task(
                task_id,
                TaskUpdate::status(TaskStatus::Fail).msg(msg).end_time(now_millis()),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::control::{TaskControl, CANCELLED_MSG};
    use crate::model::ServerFunction;
    use crate::runner::{ModelRunner, RunRequest};
    use crate::pipeline::{SoundReplaceJob, Step};
    use crate::task::{MemoryTaskStore, NewTask, BIZ_SOUND_REPLACE};
    use crate::test_support::{RecordingMedia, ScriptedFactory, ScriptedRunner, StaticRegistry};

    fn scheduler(store: Arc<MemoryTaskStore>, runner: Arc<ScriptedRunner>) -> (TaskScheduler, Arc<ScriptedFactory>) {
        scheduler_with(store, runner, Arc::new(CancellationRegistry::new()))
    }

    fn scheduler_with(
        store: Arc<MemoryTaskStore>,
        runner: Arc<dyn ModelRunner>,
        cancellations: Arc<CancellationRegistry>,
    ) -> (TaskScheduler, Arc<ScriptedFactory>) {
        let factory = ScriptedFactory::new(runner);
        let scheduler = TaskScheduler::new(
            store,
            StaticRegistry::with_keys(&["demo|1.0.0", "asr|1"]),
            factory.clone(),
            cancellations,
            Arc::new(RecordingMedia::with_default_duration(1_000)),
            SchedulerConfig { poll_interval: Duration::from_millis(10) },
        );
        (scheduler, factory)
    }

    /// Answers every call with a url and, during the first call, cancels
    /// `victim` through [`TaskControl`].
    struct CancellingRunner {
        control: TaskControl,
        victim: AtomicI64,
        ready: AtomicBool,
    }

    #[async_trait]
    impl ModelRunner for CancellingRunner {
        fn start(&self) {
            self.ready.store(true, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.ready.store(false, Ordering::SeqCst);
        }

        fn ping(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn call(&self, _request: RunRequest) -> Result<RunResult> {
            let victim = self.victim.swap(0, Ordering::SeqCst);
            if victim > 0 {
                self.control.cancel(victim).await?;
            }
            let mut data = serde_json::Map::new();
            data.insert("url".into(), json!("/out.wav"));
            Ok(RunResult::ok(ResultEnvelope::Success { start: 1, end: 2, data }))
        }
    }

    async fn queue(store: &MemoryTaskStore, biz: &str, model_config: Value) -> Task {
        store
            .create_task(NewTask { biz: biz.into(), model_config, ..Default::default() })
            .await
            .unwrap()
    }

    fn url_runner() -> Arc<ScriptedRunner> {
        ScriptedRunner::new(|_| {
            let mut data = serde_json::Map::new();
            data.insert("url".into(), json!("/out.wav"));
            Ok(RunResult::ok(ResultEnvelope::Success { start: 1, end: 2, data }))
        })
    }

    #[tokio::test]
    async fn single_tts_task_succeeds() {
        let store = Arc::new(MemoryTaskStore::new());
        let runner = url_runner();
        let (scheduler, factory) = scheduler(store.clone(), runner.clone());
        let task = queue(&store, "SoundGenerate", json!({"type": "soundTts", "ttsServerKey": "demo|1.0.0", "text": "hello"})).await;

        assert_eq!(scheduler.run_once().await.unwrap(), 1);

        let task = store.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.result["url"], "/out.wav");
        assert_eq!(task.job_result["type"], "success");
        assert!(task.start_time > 0 && task.end_time >= task.start_time);
        assert_eq!(factory.created(), vec!["demo|1.0.0".to_string()]);

        let requests = runner.requests();
        assert_eq!(requests[0].id, format!("task-{}", task.id));
        assert_eq!(requests[0].function, ServerFunction::SoundTts);
        assert_eq!(requests[0].text.as_deref(), Some("hello"));
        assert!(!scheduler.cancellations().is_running(task.id));
    }

    #[tokio::test]
    #[traced_test]
    async fn cold_server_requeues_without_failing() {
        let store = Arc::new(MemoryTaskStore::new());
        let (scheduler, _) = scheduler(store.clone(), ScriptedRunner::cold());
        let task = queue(&store, "SoundGenerate", json!({"ttsServerKey": "demo|1.0.0", "text": "hi"})).await;

        scheduler.run_once().await.unwrap();
        scheduler.run_once().await.unwrap();

        let task = store.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queue);
        assert_eq!(task.status_msg, RETRY_MSG);
        assert!(logs_contain("server not ready"));
    }

    #[tokio::test]
    async fn failures_are_recorded_and_do_not_stop_the_tick() {
        let store = Arc::new(MemoryTaskStore::new());
        let (scheduler, _) = scheduler(
            store.clone(),
            ScriptedRunner::new(|_| Err(CoreError::ResultShape(crate::error::INSPECT_MODEL_LOG.into()))),
        );
        let unknown = queue(&store, "SoundGenerate", json!({"ttsServerKey": "nope|0"})).await;
        let no_key = queue(&store, "VideoGen", json!({"type": "videoGen"})).await;
        let broken = queue(&store, "SoundGenerate", json!({"ttsServerKey": "demo|1.0.0", "text": "x"})).await;

        assert_eq!(scheduler.run_once().await.unwrap(), 3);

        let unknown = store.get_task(unknown.id).await.unwrap();
        assert_eq!(unknown.status, TaskStatus::Fail);
        assert_eq!(unknown.status_msg, "model not found: nope|0");
        assert!(unknown.end_time > 0);
        assert_eq!(store.get_task(no_key.id).await.unwrap().status_msg, "config error: server key is required");
        assert_eq!(
            store.get_task(broken.id).await.unwrap().status_msg,
            "execution failed, inspect model log"
        );
    }

    #[tokio::test]
    async fn task_cancelled_while_the_tick_runs_is_not_picked_up() {
        let store = Arc::new(MemoryTaskStore::new());
        let cancellations = Arc::new(CancellationRegistry::new());
        let runner = Arc::new(CancellingRunner {
            control: TaskControl::new(store.clone(), cancellations.clone()),
            victim: AtomicI64::new(0),
            ready: AtomicBool::new(false),
        });
        let (scheduler, _) = scheduler_with(store.clone(), runner.clone(), cancellations);
        let older = queue(&store, "SoundGenerate", json!({"ttsServerKey": "demo|1.0.0", "text": "a"})).await;
        let newer = queue(&store, "SoundGenerate", json!({"ttsServerKey": "demo|1.0.0", "text": "b"})).await;
        // Newest first: the older task is cancelled while the newer one runs.
        runner.victim.store(older.id, Ordering::SeqCst);

        assert_eq!(scheduler.run_once().await.unwrap(), 2);

        let older = store.get_task(older.id).await.unwrap();
        assert_eq!(older.status, TaskStatus::Fail);
        assert_eq!(older.status_msg, CANCELLED_MSG);
        assert_eq!(older.start_time, 0);
        assert_eq!(store.get_task(newer.id).await.unwrap().status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn cancelling_a_running_call_fails_the_task() {
        let store = Arc::new(MemoryTaskStore::new());
        let cancellations = Arc::new(CancellationRegistry::new());
        let registry = cancellations.clone();
        let runner = ScriptedRunner::new(move |request| {
            let id: i64 = request.id.trim_start_matches("task-").parse().unwrap();
            // The runner is registered and already started while its call runs.
            registry.cancel(id).unwrap();
            Err(CoreError::Cancelled)
        });
        let (scheduler, _) = scheduler_with(store.clone(), runner.clone(), cancellations.clone());
        let task = queue(&store, "SoundGenerate", json!({"ttsServerKey": "demo|1.0.0", "text": "x"})).await;

        scheduler.run_once().await.unwrap();

        let task = store.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Fail);
        assert_eq!(task.status_msg, CoreError::Cancelled.to_string());
        assert!(!runner.ping(), "cancel leaves the runner stopped");
        assert!(!cancellations.is_running(task.id));
    }

    #[tokio::test]
    async fn sound_replace_is_delegated_to_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("in.mp4");
        let store = Arc::new(MemoryTaskStore::new());
        let runner = ScriptedRunner::new(|_| {
            let mut data = serde_json::Map::new();
            data.insert("records".into(), json!([{"segments": [{"text": "hi", "start": 0, "end": 800}]}]));
            Ok(RunResult::ok(ResultEnvelope::Success { start: 1, end: 2, data }))
        });
        let (scheduler, _) = scheduler(store.clone(), runner.clone());
        let task = queue(&store, BIZ_SOUND_REPLACE, json!({
            "video": video.to_string_lossy(),
            "soundAsr": {"serverKey": "asr|1"},
            "soundGenerate": {"type": "soundTts", "ttsServerKey": "demo|1.0.0"}
        }))
        .await;

        scheduler.run_once().await.unwrap();

        let task = store.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Wait);
        let job = SoundReplaceJob::from_value(&task.job_result).unwrap();
        assert_eq!(job.step, Step::Confirm);
        assert_eq!(runner.requests()[0].function, ServerFunction::Asr);

        // Paused tasks are not picked up again.
        assert_eq!(scheduler.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let store = Arc::new(MemoryTaskStore::new());
        let (scheduler, _) = scheduler(store.clone(), url_runner());
        let task = queue(&store, "SoundGenerate", json!({"ttsServerKey": "demo|1.0.0", "text": "x"})).await;

        let shutdown = CancellationToken::new();
        let handle = Arc::new(scheduler).spawn(shutdown.clone());
        for _ in 0..100 {
            if store.get_task(task.id).await.unwrap().status == TaskStatus::Success {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Success);
    }
}
