//! Media-tool seam used by the sound replace pipeline.
//!
//! The pipeline only needs "run ffmpeg with these arguments" and "how long is
//! this file". [`FfmpegTool`] implements both on top of `ffmpeg-sidecar`;
//! tests plug in a recorder instead.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ffmpeg_sidecar::command::FfmpegCommand;
use ffmpeg_sidecar::event::FfmpegEvent;
use tokio::task;
use tracing::debug;

use crate::error::{CoreError, Result};

#[async_trait]
pub trait MediaTool: Send + Sync + 'static {
    /// Run the tool; a non-zero exit is an error carrying its output.
    async fn run(&self, args: Vec<String>) -> Result<()>;

    /// Duration of a media file in milliseconds.
    async fn probe_duration_ms(&self, path: &Path) -> Result<i64>;
}

/// [`MediaTool`] backed by the ffmpeg/ffprobe binaries.
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTool {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn ffprobe(&self) -> &Path {
        &self.ffprobe
    }

    /// Binaries as located by `ffmpeg-sidecar` (next to the executable, else `PATH`).
    pub fn from_sidecar() -> Self {
        Self::new(
            ffmpeg_sidecar::paths::ffmpeg_path(),
            ffmpeg_sidecar::ffprobe::ffprobe_path(),
        )
    }
}

impl Default for FfmpegTool {
    fn default() -> Self {
        Self::from_sidecar()
    }
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn run(&self, args: Vec<String>) -> Result<()> {
        let ffmpeg = self.ffmpeg.clone();
        task::spawn_blocking(move || -> Result<()> {
            debug!(?args, "running ffmpeg");
            let mut command = FfmpegCommand::new_with_path(&ffmpeg);
            let mut child = command
                .hide_banner()
                .args(&args)
                .spawn()
                .map_err(|e| CoreError::Media(format!("failed to spawn {}: {e}", ffmpeg.display())))?;

            let mut output = Vec::new();
            let events = child
                .iter()
                .map_err(|e| CoreError::Media(format!("failed to read ffmpeg output: {e}")))?;
            for event in events {
                match event {
                    FfmpegEvent::Log(level, msg) => {
                        debug!("[FFmpeg {:?}] {}", level, msg);
                        output.push(msg);
                    }
                    FfmpegEvent::Error(e) => output.push(e),
                    _ => {}
                }
            }

            let status = child.wait()?;
            if !status.success() {
                return Err(CoreError::Media(format!("ffmpeg exited with {status}: {}", output.join("\n"))));
            }
            Ok(())
        })
        .await
        .map_err(|e| CoreError::Media(format!("ffmpeg worker failed: {e}")))?
    }

    async fn probe_duration_ms(&self, path: &Path) -> Result<i64> {
        let output = tokio::process::Command::new(&self.ffprobe)
            .args(probe_duration_args(path))
            .output()
            .await
            .map_err(|e| CoreError::Media(format!("failed to spawn {}: {e}", self.ffprobe.display())))?;
        if !output.status.success() {
            return Err(CoreError::Media(format!(
                "ffprobe exited with {}: {}{}",
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        parse_duration_ms(&String::from_utf8_lossy(&output.stdout))
    }
}

/// ffprobe prints the duration as fractional seconds.
pub fn parse_duration_ms(stdout: &str) -> Result<i64> {
    let secs: f64 = stdout
        .trim()
        .parse()
        .map_err(|_| CoreError::Media(format!("unexpected ffprobe duration output: {:?}", stdout.trim())))?;
    Ok((secs * 1000.0).round() as i64)
}

// ── Argument builders ────────────────────────────────────────────────────────

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn seconds(ms: i64) -> String {
    format!("{:.3}", ms.max(0) as f64 / 1000.0)
}

pub fn probe_duration_args(path: &Path) -> Vec<String> {
    vec![
        "-v".into(),
        "error".into(),
        "-show_entries".into(),
        "format=duration".into(),
        "-of".into(),
        "default=noprint_wrappers=1:nokey=1".into(),
        path_arg(path),
    ]
}

/// Video's audio track → 16-bit PCM wav.
pub fn extract_audio_args(video: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        path_arg(video),
        "-vn".into(),
        "-acodec".into(),
        "pcm_s16le".into(),
        path_arg(output),
    ]
}

pub fn encode_mp3_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        path_arg(input),
        "-codec:a".into(),
        "libmp3lame".into(),
        "-q:a".into(),
        "2".into(),
        path_arg(output),
    ]
}

/// Mono 16 kHz silence of `duration_ms`.
pub fn silence_args(output: &Path, duration_ms: i64) -> Vec<String> {
    vec![
        "-y".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        "anullsrc=r=16000:cl=mono".into(),
        "-t".into(),
        seconds(duration_ms),
        "-acodec".into(),
        "pcm_s16le".into(),
        path_arg(output),
    ]
}

pub fn trim_args(input: &Path, output: &Path, duration_ms: i64) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        path_arg(input),
        "-t".into(),
        seconds(duration_ms),
        "-acodec".into(),
        "pcm_s16le".into(),
        path_arg(output),
    ]
}

/// Pad with trailing silence up to `duration_ms`.
pub fn pad_args(input: &Path, output: &Path, duration_ms: i64) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        path_arg(input),
        "-af".into(),
        "apad".into(),
        "-t".into(),
        seconds(duration_ms),
        "-acodec".into(),
        "pcm_s16le".into(),
        path_arg(output),
    ]
}

pub fn concat_args(list_file: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        path_arg(list_file),
        "-acodec".into(),
        "pcm_s16le".into(),
        path_arg(output),
    ]
}

/// Copy the video stream of `video`, take audio from `audio`.
pub fn replace_audio_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        path_arg(video),
        "-i".into(),
        path_arg(audio),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "1:a:0".into(),
        "-c:v".into(),
        "copy".into(),
        "-shortest".into(),
        path_arg(output),
    ]
}

/// Body of an ffmpeg concat-demuxer list file.
pub fn concat_list(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|f| format!("file '{}'\n", path_arg(f).replace('\'', r"'\''")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_output() {
        assert_eq!(parse_duration_ms("10.000000\n").unwrap(), 10_000);
        assert_eq!(parse_duration_ms(" 2.5 ").unwrap(), 2_500);
        assert!(parse_duration_ms("N/A").is_err());
    }

    #[test]
    fn concat_list_escapes_quotes() {
        let list = concat_list(&[PathBuf::from("/a/b.wav"), PathBuf::from("/a/it's.wav")]);
        assert_eq!(list, "file '/a/b.wav'\nfile '/a/it'\\''s.wav'\n");
    }

    #[test]
    fn durations_render_as_seconds() {
        let args = silence_args(Path::new("s.wav"), 1500);
        assert!(args.windows(2).any(|w| w[0] == "-t" && w[1] == "1.500"));
        assert_eq!(args.last().map(String::as_str), Some("s.wav"));
    }
}
