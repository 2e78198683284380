//! Daemon configuration, loaded from environment variables at startup.

use std::path::PathBuf;

use aigcpanel_core::SchedulerConfig;

/// Runtime configuration for aigcpaneld.
///
/// Every field has a default so the daemon starts without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of daemon state (default: `"data"`).
    pub data_dir: PathBuf,

    /// sqlx SQLite URL (default: `sqlite://<data_dir>/aigcpanel.db`).
    pub database_url: String,

    /// Model registry index (default: `<data_dir>/models.json`).
    pub model_registry: PathBuf,

    /// ffmpeg / ffprobe binaries; `None` lets ffmpeg-sidecar locate them.
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,

    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    /// `data_dir` (from the command line) wins over `AIGCPANEL_DATA_DIR`.
    pub fn from_env(data_dir: Option<PathBuf>) -> Self {
        Self::from_lookup(data_dir, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(data_dir: Option<PathBuf>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = data_dir
            .or_else(|| non_empty(lookup("AIGCPANEL_DATA_DIR")).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("data"));
        let database_url = non_empty(lookup("AIGCPANEL_DATABASE_URL"))
            .unwrap_or_else(|| format!("sqlite://{}?mode=rwc", data_dir.join("aigcpanel.db").display()));
        let model_registry = non_empty(lookup("AIGCPANEL_MODEL_REGISTRY"))
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models.json"));

        Self {
            database_url,
            model_registry,
            ffmpeg: non_empty(lookup("AIGCPANEL_FFMPEG")).map(PathBuf::from),
            ffprobe: non_empty(lookup("AIGCPANEL_FFPROBE")).map(PathBuf::from),
            log_level: non_empty(lookup("AIGCPANEL_LOG")).unwrap_or_else(|| "info".to_owned()),
            log_json: lookup("AIGCPANEL_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            scheduler: SchedulerConfig::from_lookup(&lookup),
            data_dir,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
