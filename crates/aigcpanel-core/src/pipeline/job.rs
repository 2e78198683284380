//! Persisted progress of a sound replace task (`jobResult`).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Current stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Step {
    #[default]
    ToAudio,
    SoundAsr,
    Confirm,
    SoundGenerate,
    Combine,
    #[serde(alias = "End")]
    CombineConfirm,
}

impl Step {
    /// Steps handled before the human review pause.
    pub fn before_review(self) -> bool {
        matches!(self, Step::ToAudio | Step::SoundAsr | Step::Confirm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Queue,
    Running,
    /// Waiting on a human decision.
    Pending,
    Success,
}

/// Accepts integers, floats and numeric strings; anything else is 0.
fn lenient_i64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(millis(&Value::deserialize(deserializer)?))
}

pub(crate) fn millis(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        Value::String(s) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or_default(),
        _ => 0,
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_default_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// One time-bounded piece of the transcript, `[start, end)` in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Segment {
    #[serde(deserialize_with = "null_as_default_string")]
    pub text: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub start: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub end: i64,
    /// Generated, duration-aligned clip; empty until produced.
    #[serde(deserialize_with = "null_as_default_string")]
    pub audio: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub actual_start: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub actual_end: i64,
}

impl Segment {
    pub fn new(text: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            text: text.into(),
            start,
            end,
            ..Default::default()
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToAudioStage {
    pub status: StageStatus,
    /// Source audio re-encoded to mp3 next to the video.
    pub file: String,
    /// Source audio length in milliseconds; 0 when unknown.
    #[serde(deserialize_with = "lenient_i64")]
    pub duration: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrStage {
    pub status: StageStatus,
    #[serde(deserialize_with = "lenient_i64")]
    pub start: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub end: i64,
    /// Wall time of the recognition call.
    #[serde(deserialize_with = "lenient_i64")]
    pub duration: i64,
    #[serde(deserialize_with = "null_as_empty")]
    pub records: Vec<Segment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsStage {
    pub status: StageStatus,
    #[serde(deserialize_with = "null_as_empty")]
    pub records: Vec<Segment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombineStage {
    pub status: StageStatus,
    /// Combined mp3 track.
    pub audio: String,
    /// Remuxed output video.
    pub file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusStage {
    pub status: StageStatus,
}

/// `jobResult` of a SoundReplace task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundReplaceJob {
    pub step: Step,
    #[serde(rename = "ToAudio")]
    pub to_audio: ToAudioStage,
    #[serde(rename = "SoundAsr")]
    pub sound_asr: AsrStage,
    #[serde(rename = "Confirm")]
    pub confirm: RecordsStage,
    #[serde(rename = "SoundGenerate")]
    pub sound_generate: RecordsStage,
    #[serde(rename = "Combine")]
    pub combine: CombineStage,
    #[serde(rename = "CombineConfirm")]
    pub combine_confirm: StatusStage,
}

impl SoundReplaceJob {
    /// Decode a task's `jobResult`; null, `""` and `{}` start a fresh job.
    pub fn from_value(value: &Value) -> Result<Self> {
        let decoded;
        let value = match value {
            Value::Null => return Ok(Self::default()),
            Value::String(raw) if raw.trim().is_empty() => return Ok(Self::default()),
            Value::String(raw) => {
                decoded = serde_json::from_str::<Value>(raw)
                    .map_err(|e| CoreError::config(format!("invalid jobResult: {e}")))?;
                &decoded
            }
            other => other,
        };
        serde_json::from_value(value.clone())
            .map_err(|e| CoreError::config(format!("invalid jobResult: {e}")))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Transcript segments from an ASR payload: `records[].segments[]`, with
/// `record` accepted as a fallback key. Segments with `end <= start` are dropped.
pub fn parse_asr_records(data: &serde_json::Map<String, Value>) -> Result<Vec<Segment>> {
    let items = ["records", "record"]
        .iter()
        .filter_map(|key| data.get(*key).and_then(Value::as_array))
        .find(|items| !items.is_empty())
        .ok_or_else(|| CoreError::ResultShape("asr records not found".into()))?;

    let segments: Vec<Segment> = items
        .iter()
        .filter_map(|item| item.get("segments").and_then(Value::as_array))
        .flatten()
        .filter_map(|segment| {
            let start = segment.get("start").map(millis).unwrap_or_default();
            let end = segment.get("end").map(millis).unwrap_or_default();
            if end <= start {
                return None;
            }
            let text = segment.get("text").and_then(Value::as_str).unwrap_or_default();
            Some(Segment::new(text.trim(), start, end))
        })
        .collect();

    if segments.is_empty() {
        return Err(CoreError::ResultShape("asr records empty".into()));
    }
    Ok(segments)
}
