//! Typed task configuration and scheduler settings.
//!
//! `modelConfig` is stored as opaque JSON on the task row; it is decoded once
//! into a [`TaskConfig`] when the scheduler picks the task up.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::model::ServerFunction;
use crate::runner::RunRequest;
use crate::task::BIZ_SOUND_REPLACE;

// ── Scheduler ────────────────────────────────────────────────────────────────

/// Environment variable overriding the poll interval, in milliseconds.
pub const POLL_INTERVAL_ENV: &str = "AIGCPANEL_TASK_POLL_INTERVAL_MS";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { poll_interval: DEFAULT_POLL_INTERVAL }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset, unparsable and non-positive values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let poll_interval = lookup(POLL_INTERVAL_ENV)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        Self { poll_interval }
    }
}

// ── Task configuration ───────────────────────────────────────────────────────

fn object_or_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SoundTtsConfig {
    #[serde(deserialize_with = "string_or_empty")]
    pub tts_server_key: String,
    #[serde(deserialize_with = "object_or_empty")]
    pub tts_param: Map<String, Value>,
    #[serde(deserialize_with = "string_or_empty")]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SoundCloneConfig {
    #[serde(deserialize_with = "string_or_empty")]
    pub clone_server_key: String,
    #[serde(deserialize_with = "object_or_empty")]
    pub clone_param: Map<String, Value>,
    #[serde(deserialize_with = "string_or_empty")]
    pub prompt_url: String,
    #[serde(deserialize_with = "string_or_empty")]
    pub prompt_text: String,
    #[serde(deserialize_with = "string_or_empty")]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoGenConfig {
    #[serde(deserialize_with = "string_or_empty")]
    pub server_key: String,
    #[serde(deserialize_with = "object_or_empty")]
    pub param: Map<String, Value>,
    #[serde(deserialize_with = "string_or_empty")]
    pub video: String,
    #[serde(deserialize_with = "string_or_empty")]
    pub audio: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AsrConfig {
    #[serde(deserialize_with = "string_or_empty")]
    pub server_key: String,
    #[serde(deserialize_with = "object_or_empty")]
    pub param: Map<String, Value>,
    #[serde(deserialize_with = "string_or_empty")]
    pub audio: String,
}

/// Speech generation settings of a SoundReplace task.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerateConfig {
    #[serde(rename = "type", deserialize_with = "string_or_empty")]
    pub kind: String,
    #[serde(deserialize_with = "string_or_empty")]
    pub tts_server_key: String,
    #[serde(deserialize_with = "object_or_empty")]
    pub tts_param: Map<String, Value>,
    #[serde(deserialize_with = "string_or_empty")]
    pub clone_server_key: String,
    #[serde(deserialize_with = "object_or_empty")]
    pub clone_param: Map<String, Value>,
    #[serde(deserialize_with = "string_or_empty")]
    pub prompt_url: String,
    #[serde(deserialize_with = "string_or_empty")]
    pub prompt_text: String,
}

impl GenerateConfig {
    pub fn is_clone(&self) -> bool {
        self.kind.to_lowercase().contains("clone")
    }

    pub fn server_key(&self) -> &str {
        if self.is_clone() { &self.clone_server_key } else { &self.tts_server_key }
    }

    /// Request synthesising `text` for segment `index` of task `task_id`.
    pub fn request(&self, task_id: i64, index: usize, text: &str) -> RunRequest {
        let id = format!("task-{task_id}-gen-{index}");
        if self.is_clone() {
            RunRequest::new(id, ServerFunction::SoundClone)
                .with_param(self.clone_param.clone())
                .with_text(text)
                .with_prompt(self.prompt_url.clone(), self.prompt_text.clone())
        } else {
            RunRequest::new(id, ServerFunction::SoundTts)
                .with_param(self.tts_param.clone())
                .with_text(text)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SoundReplaceConfig {
    #[serde(deserialize_with = "string_or_empty")]
    pub video: String,
    pub sound_asr: AsrConfig,
    pub sound_generate: GenerateConfig,
}

/// Decoded `modelConfig`, one variant per function.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskConfig {
    SoundTts(SoundTtsConfig),
    SoundClone(SoundCloneConfig),
    VideoGen(VideoGenConfig),
    Asr(AsrConfig),
    SoundReplace(SoundReplaceConfig),
}

impl TaskConfig {
    /// Decode `model_config` of a task with business tag `biz`.
    ///
    /// A missing or empty `type` means `soundTts`. A JSON string holding an
    /// encoded object is accepted as well.
    pub fn parse(biz: &str, model_config: &Value) -> Result<Self> {
        let decoded;
        let value = match model_config {
            Value::String(raw) => {
                decoded = serde_json::from_str::<Value>(raw)
                    .map_err(|e| CoreError::config(format!("invalid modelConfig: {e}")))?;
                &decoded
            }
            other => other,
        };
        if !value.is_object() {
            return Err(CoreError::config("modelConfig must be a JSON object"));
        }

        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let decode = |what: &str| CoreError::config(format!("invalid {what} modelConfig"));
        let parsed = if biz == BIZ_SOUND_REPLACE || kind == "soundReplace" {
            TaskConfig::SoundReplace(
                serde_json::from_value(value.clone()).map_err(|_| decode("soundReplace"))?,
            )
        } else {
            match kind {
                "" | "soundTts" => TaskConfig::SoundTts(
                    serde_json::from_value(value.clone()).map_err(|_| decode("soundTts"))?,
                ),
                "soundClone" => TaskConfig::SoundClone(
                    serde_json::from_value(value.clone()).map_err(|_| decode("soundClone"))?,
                ),
                "videoGen" => TaskConfig::VideoGen(
                    serde_json::from_value(value.clone()).map_err(|_| decode("videoGen"))?,
                ),
                "soundAsr" | "asr" => TaskConfig::Asr(
                    serde_json::from_value(value.clone()).map_err(|_| decode("asr"))?,
                ),
                other => return Err(CoreError::config(format!("unsupported task type: {other}"))),
            }
        };
        Ok(parsed)
    }

    /// Server key of the single model a non-pipelined task calls.
    pub fn server_key(&self) -> Result<&str> {
        let key = match self {
            TaskConfig::SoundTts(c) => c.tts_server_key.as_str(),
            TaskConfig::SoundClone(c) => c.clone_server_key.as_str(),
            TaskConfig::VideoGen(c) => c.server_key.as_str(),
            TaskConfig::Asr(c) => c.server_key.as_str(),
            TaskConfig::SoundReplace(_) => {
                return Err(CoreError::config("sound replace tasks use per-stage server keys"));
            }
        };
        if key.trim().is_empty() {
            return Err(CoreError::config("server key is required"));
        }
        Ok(key)
    }

    /// Function request for task `task_id`; `None` for pipelined tasks.
    pub fn request(&self, task_id: i64) -> Option<RunRequest> {
        let id = format!("task-{task_id}");
        let request = match self {
            TaskConfig::SoundTts(c) => RunRequest::new(id, ServerFunction::SoundTts)
                .with_param(c.tts_param.clone())
                .with_text(c.text.clone()),
            TaskConfig::SoundClone(c) => RunRequest::new(id, ServerFunction::SoundClone)
                .with_param(c.clone_param.clone())
                .with_text(c.text.clone())
                .with_prompt(c.prompt_url.clone(), c.prompt_text.clone()),
            TaskConfig::VideoGen(c) => RunRequest::new(id, ServerFunction::VideoGen)
                .with_param(c.param.clone())
                .with_video(c.video.clone())
                .with_audio(c.audio.clone()),
            TaskConfig::Asr(c) => RunRequest::new(id, ServerFunction::Asr)
                .with_param(c.param.clone())
                .with_audio(c.audio.clone()),
            TaskConfig::SoundReplace(_) => return None,
        };
        Some(request)
    }
}
