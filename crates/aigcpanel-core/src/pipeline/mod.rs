//! SoundReplace: swap a video's audio track for regenerated speech.
//!
//! The pipeline is a resumable state machine whose only state is the task's
//! `jobResult` ([`SoundReplaceJob`]). Each invocation of [`SoundReplacePipeline::run`]
//! continues from `jobResult.step`:
//!
//! ```text
//! ToAudio ─► SoundAsr ─► Confirm ══(wait / submit_confirm)══► SoundGenerate ─► Combine ─► CombineConfirm
//! ```
//!
//! Every stage transition is persisted before the next expensive operation
//! starts, so a crash resumes from the last saved snapshot.

mod job;
mod timeline;

pub use job::{
    parse_asr_records, AsrStage, CombineStage, RecordsStage, Segment, SoundReplaceJob, StageStatus,
    StatusStage, Step, ToAudioStage,
};
pub use timeline::{align, plan_timeline, silence, Piece};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::cancel::{CancellationRegistry, Registration};
use crate::config::{GenerateConfig, SoundReplaceConfig};
use crate::error::{CoreError, Result};
use crate::media::{self, MediaTool};
use crate::model::{ModelRegistry, ServerFunction};
use crate::runner::{ModelRunner, ResultEnvelope, RunRequest, RunnerFactory, RETRY_MSG};
use crate::task::{now_millis, Task, TaskStatus, TaskStore, TaskUpdate};

/// Drives SoundReplace tasks through their stages.
pub struct SoundReplacePipeline {
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn ModelRegistry>,
    runners: Arc<dyn RunnerFactory>,
    cancellations: Arc<CancellationRegistry>,
    media: Arc<dyn MediaTool>,
}

impl SoundReplacePipeline {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<dyn ModelRegistry>,
        runners: Arc<dyn RunnerFactory>,
        cancellations: Arc<CancellationRegistry>,
        media: Arc<dyn MediaTool>,
    ) -> Self {
        Self {
            store,
            registry,
            runners,
            cancellations,
            media,
        }
    }

    /// Advance `task` as far as possible.
    ///
    /// Returns `Ok` when the task was left in a consistent state (`wait`,
    /// `queue` after a retry, or `success`). An error leaves the failure status
    /// to the caller.
    pub async fn run(&self, task: &Task, config: &SoundReplaceConfig) -> Result<()> {
        if config.video.trim().is_empty() {
            return Err(CoreError::config("video is required"));
        }
        let mut job = SoundReplaceJob::from_value(&task.job_result)?;
        info!(task_id = task.id, step = ?job.step, "sound replace started");

        if job.step.before_review() {
            self.recognize(task.id, config, &mut job).await
        } else {
            self.produce(task.id, config, &mut job).await
        }
    }

    /// See [`submit_confirm`].
    pub async fn submit_confirm(&self, task_id: i64, records: Vec<Segment>) -> Result<Task> {
        submit_confirm(self.store.as_ref(), task_id, records).await
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    async fn save(
        &self,
        task_id: i64,
        status: TaskStatus,
        job: &SoundReplaceJob,
        msg: &str,
        result: Option<Value>,
    ) -> Result<()> {
        let mut update = TaskUpdate::status(status).job_result(job.to_value()?);
        if !msg.is_empty() {
            update = update.msg(msg);
        }
        if status.is_terminal() {
            update = update.end_time(now_millis());
        }
        if let Some(result) = result {
            update = update.result(result);
        }
        self.store.update_task(task_id, update).await?;
        Ok(())
    }

    fn runner_for(&self, server_key: &str) -> Result<Arc<dyn ModelRunner>> {
        let descriptor = self.registry.lookup(server_key)?;
        info!(server_key, model = %descriptor.name, "model resolved");
        Ok(self.runners.create(descriptor))
    }

    // ── ToAudio / SoundAsr / Confirm ─────────────────────────────────────────

    async fn recognize(&self, task_id: i64, config: &SoundReplaceConfig, job: &mut SoundReplaceJob) -> Result<()> {
        if job.step == Step::Confirm {
            job.confirm.status = StageStatus::Pending;
            return self.save(task_id, TaskStatus::Wait, job, "", None).await;
        }
        if job.step == Step::ToAudio || job.to_audio.file.is_empty() {
            self.extract_audio(task_id, config, job).await?;
        }
        self.transcribe(task_id, config, job).await
    }

    async fn extract_audio(&self, task_id: i64, config: &SoundReplaceConfig, job: &mut SoundReplaceJob) -> Result<()> {
        job.step = Step::ToAudio;
        job.to_audio.status = StageStatus::Running;
        self.save(task_id, TaskStatus::Running, job, "", None).await?;

        let video = Path::new(&config.video);
        let workdir = tempfile::Builder::new()
            .prefix(&format!("sound-replace-{task_id}-"))
            .tempdir()?;
        let wav = workdir.path().join("source_audio.wav");
        let mp3 = output_dir(video).join(format!("sound_replace_{}_source.mp3", now_millis()));

        self.media.run(media::extract_audio_args(video, &wav)).await?;
        self.media.run(media::encode_mp3_args(&wav, &mp3)).await?;
        let duration = match self.media.probe_duration_ms(&mp3).await {
            Ok(ms) => ms,
            Err(e) => {
                warn!(task_id, error = %e, "could not probe source audio duration");
                0
            }
        };
        info!(task_id, file = %mp3.display(), duration, "source audio extracted");

        job.step = Step::SoundAsr;
        job.to_audio = ToAudioStage {
            status: StageStatus::Success,
            file: path_string(&mp3),
            duration,
        };
        job.sound_asr.status = StageStatus::Running;
        self.save(task_id, TaskStatus::Running, job, "", None).await
    }

    async fn transcribe(&self, task_id: i64, config: &SoundReplaceConfig, job: &mut SoundReplaceJob) -> Result<()> {
        let asr = &config.sound_asr;
        if asr.server_key.trim().is_empty() {
            return Err(CoreError::config("soundAsr server key is required"));
        }
        let runner = self.runner_for(&asr.server_key)?;
        let request = RunRequest::new(format!("task-{task_id}-asr"), ServerFunction::Asr)
            .with_param(asr.param.clone())
            .with_audio(job.to_audio.file.clone());

        let started = now_millis();
        let outcome = {
            runner.start();
            let _registration = Registration::new(&self.cancellations, task_id, Arc::clone(&runner));
            let outcome = runner.asr(request).await;
            runner.stop();
            outcome
        }?;
        let ended = now_millis();

        let data = match outcome.data {
            ResultEnvelope::Retry => {
                info!(task_id, server_key = %asr.server_key, "asr server not ready, requeueing");
                return self.save(task_id, TaskStatus::Queue, job, RETRY_MSG, None).await;
            }
            ResultEnvelope::Success { data, .. } => data,
        };
        let records = parse_asr_records(&data)?;
        info!(task_id, segments = records.len(), "transcript ready for review");

        job.sound_asr = AsrStage {
            status: StageStatus::Success,
            start: started,
            end: ended,
            duration: ended - started,
            records: records.clone(),
        };
        job.confirm = RecordsStage { status: StageStatus::Pending, records };
        job.sound_generate = RecordsStage::default();
        job.step = Step::Confirm;
        self.save(task_id, TaskStatus::Wait, job, "", None).await
    }

    // ── SoundGenerate / Combine / CombineConfirm ─────────────────────────────

    async fn produce(&self, task_id: i64, config: &SoundReplaceConfig, job: &mut SoundReplaceJob) -> Result<()> {
        if job.step == Step::CombineConfirm && job.combine.status == StageStatus::Success {
            return self.finish(task_id, job).await;
        }
        if job.confirm.records.is_empty() {
            return Err(CoreError::invalid_state("confirm records empty"));
        }
        let dir = output_dir(Path::new(&config.video));
        self.synthesize(task_id, &config.sound_generate, &dir, job).await?;
        self.combine(task_id, Path::new(&config.video), &dir, job).await?;
        self.finish(task_id, job).await
    }

    async fn synthesize(
        &self,
        task_id: i64,
        generate: &GenerateConfig,
        dir: &Path,
        job: &mut SoundReplaceJob,
    ) -> Result<()> {
        let server_key = generate.server_key();
        if server_key.trim().is_empty() {
            return Err(CoreError::config("soundGenerate server key is required"));
        }

        job.step = Step::SoundGenerate;
        job.confirm.status = StageStatus::Success;
        job.sound_generate.status = StageStatus::Running;
        if job.sound_generate.records.len() != job.confirm.records.len() {
            job.sound_generate.records = job
                .confirm
                .records
                .iter()
                .map(|r| Segment::new(r.text.clone(), r.start, r.end))
                .collect();
        }
        self.save(task_id, TaskStatus::Running, job, "", None).await?;

        let runner = self.runner_for(server_key)?;
        runner.start();
        let _registration = Registration::new(&self.cancellations, task_id, Arc::clone(&runner));
        let outcome = self.synthesize_segments(task_id, generate, runner.as_ref(), dir, job).await;
        runner.stop();
        outcome
    }

    async fn synthesize_segments(
        &self,
        task_id: i64,
        generate: &GenerateConfig,
        runner: &dyn ModelRunner,
        dir: &Path,
        job: &mut SoundReplaceJob,
    ) -> Result<()> {
        let stamp = now_millis();
        for index in 0..job.sound_generate.records.len() {
            let rec = &job.sound_generate.records[index];
            if !rec.audio.is_empty() {
                continue;
            }
            if !runner.ping() {
                return Err(CoreError::Cancelled);
            }

            let target = rec.duration_ms().max(1);
            let text = rec.text.trim().to_owned();
            let aligned = dir.join(format!("sound_replace_{stamp}_seg_{index}.wav"));
            if text.is_empty() {
                silence(self.media.as_ref(), &aligned, target).await?;
            } else {
                let raw = dir.join(format!("sound_replace_{stamp}_seg_{index}_raw.wav"));
                let produced = match self.speak(runner, generate.request(task_id, index, &text), &raw).await {
                    Ok(()) => align(self.media.as_ref(), &raw, &aligned, target).await,
                    Err(e) => Err(e),
                };
                match produced {
                    Ok(()) => {}
                    Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                    Err(e) => {
                        warn!(task_id, segment = index, error = %e, "segment generation failed, using silence");
                        silence(self.media.as_ref(), &aligned, target).await?;
                    }
                }
            }

            let rec = &mut job.sound_generate.records[index];
            rec.audio = path_string(&aligned);
            rec.actual_start = rec.start;
            rec.actual_end = rec.end;
            info!(task_id, segment = index, audio = %rec.audio, "segment ready");
            self.save(task_id, TaskStatus::Running, job, "", None).await?;
        }
        Ok(())
    }

    /// Synthesise one utterance and copy the model's output to `raw`.
    async fn speak(&self, runner: &dyn ModelRunner, request: RunRequest, raw: &Path) -> Result<()> {
        let result = runner.call(request).await?;
        let data = match result.data {
            ResultEnvelope::Success { data, .. } => data,
            // A runner only stops answering mid-phase when it was cancelled.
            ResultEnvelope::Retry => return Err(CoreError::Cancelled),
        };
        let url = data
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| CoreError::ResultShape("sound generate result url empty".into()))?;
        tokio::fs::copy(url, raw).await?;
        Ok(())
    }

    async fn combine(&self, task_id: i64, video: &Path, dir: &Path, job: &mut SoundReplaceJob) -> Result<()> {
        job.sound_generate.status = StageStatus::Success;
        job.step = Step::Combine;
        job.combine.status = StageStatus::Running;
        self.save(task_id, TaskStatus::Running, job, "", None).await?;

        let records = &job.sound_generate.records;
        let total = if job.to_audio.duration > 0 {
            job.to_audio.duration
        } else {
            records.last().map(|r| r.end).unwrap_or_default()
        };
        let stamp = now_millis();

        let mut files = Vec::new();
        for (n, piece) in plan_timeline(records, total).into_iter().enumerate() {
            match piece {
                Piece::Silence { start, end } => {
                    let filler = dir.join(format!("sound_replace_{stamp}_silence_{n}.wav"));
                    silence(self.media.as_ref(), &filler, end - start).await?;
                    files.push(filler);
                }
                Piece::Segment { index, .. } => {
                    let audio = &records[index].audio;
                    if audio.is_empty() {
                        return Err(CoreError::invalid_state(format!("segment {index} has no audio")));
                    }
                    files.push(PathBuf::from(audio));
                }
            }
        }
        if files.is_empty() {
            return Err(CoreError::Media("no audio files to concat".into()));
        }

        let list = dir.join(format!("sound_replace_{stamp}_concat.txt"));
        let wav = dir.join(format!("sound_replace_{stamp}_combined.wav"));
        let mp3 = dir.join(format!("sound_replace_{stamp}_combined.mp3"));
        let output = dir.join(format!("sound_replace_{stamp}_output.mp4"));

        tokio::fs::write(&list, media::concat_list(&files)).await?;
        self.media.run(media::concat_args(&list, &wav)).await?;
        self.media.run(media::encode_mp3_args(&wav, &mp3)).await?;
        self.media.run(media::replace_audio_args(video, &mp3, &output)).await?;
        info!(task_id, output = %output.display(), pieces = files.len(), "audio track replaced");

        job.combine = CombineStage {
            status: StageStatus::Success,
            audio: path_string(&mp3),
            file: path_string(&output),
        };
        job.step = Step::CombineConfirm;
        Ok(())
    }

    async fn finish(&self, task_id: i64, job: &mut SoundReplaceJob) -> Result<()> {
        job.combine_confirm.status = StageStatus::Success;
        let result = json!({
            "url": job.combine.file,
            "audio": job.combine.audio,
            "records": job.sound_generate.records,
        });
        self.save(task_id, TaskStatus::Success, job, "", Some(result)).await?;
        info!(task_id, "sound replace finished");
        Ok(())
    }
}

/// Accept the reviewed transcript of a task paused at `Confirm`.
///
/// Records with blank text or `end <= start` are dropped, the rest are sorted
/// by `(start, end)`. The generate stages are reset and the task goes back to
/// `queue`.
pub async fn submit_confirm(store: &dyn TaskStore, task_id: i64, records: Vec<Segment>) -> Result<Task> {
    let task = store.get_task(task_id).await?;
    if !task.is_sound_replace() {
        return Err(CoreError::invalid_state("task is not sound replace"));
    }
    if task.status != TaskStatus::Wait {
        return Err(CoreError::invalid_state("task status must be wait"));
    }
    let mut job = SoundReplaceJob::from_value(&task.job_result)?;
    if job.step != Step::Confirm {
        return Err(CoreError::invalid_state("task is not waiting for confirm"));
    }

    let mut records: Vec<Segment> = records
        .into_iter()
        .filter_map(|r| {
            let text = r.text.trim();
            (!text.is_empty() && r.end > r.start).then(|| Segment::new(text, r.start, r.end))
        })
        .collect();
    if records.is_empty() {
        return Err(CoreError::invalid_state("confirm records empty"));
    }
    records.sort_by_key(|r| (r.start, r.end));

    job.confirm = RecordsStage { status: StageStatus::Success, records };
    job.sound_generate = RecordsStage::default();
    job.combine = CombineStage::default();
    job.combine_confirm = StatusStage::default();
    job.step = Step::SoundGenerate;

    let update = TaskUpdate::status(TaskStatus::Queue).msg("").job_result(job.to_value()?);
    let task = store
        .transition(task_id, TaskStatus::Wait, update)
        .await?
        .ok_or_else(|| CoreError::invalid_state("task status must be wait"))?;
    info!(task_id, segments = job.confirm.records.len(), "transcript confirmed");
    Ok(task)
}

/// Directory generated files are written to: next to the source video.
fn output_dir(video: &Path) -> PathBuf {
    match video.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
