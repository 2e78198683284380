//! Installed-model metadata and the registry that resolves it.
//!
//! [`ModelRegistry`] is the seam the scheduler depends on. The shipped
//! implementation, [`FileModelRegistry`], reads the JSON index the desktop
//! panel maintains (`{"records": [...]}`) plus each model's `config.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumString};
use tracing::{info, warn};

use crate::error::{CoreError, Result};

/// A callable function exposed by a model executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum ServerFunction {
    SoundTts,
    SoundClone,
    VideoGen,
    #[strum(to_string = "asr", serialize = "soundAsr")]
    Asr,
}

/// Read-only view of one installed model version.
#[derive(Debug, Clone, Default)]
pub struct ModelDescriptor {
    /// `name|version`.
    pub key: String,
    pub name: String,
    pub title: String,
    pub version: String,
    /// Install directory; also the working directory of every call.
    pub local_path: PathBuf,
    pub functions: Vec<String>,
    /// Launch command template (`${CONFIG}` / `${ROOT}` placeholders allowed).
    pub entry: String,
    pub entry_args: Vec<String>,
    /// Extra environment entries, applied last.
    pub envs: Vec<(String, String)>,
    /// Current setting values, forwarded to the model as `setting`.
    pub setting: Map<String, Value>,
}

impl ModelDescriptor {
    pub fn supports(&self, function: ServerFunction) -> bool {
        self.functions.iter().any(|f| {
            f.parse::<ServerFunction>()
                .map(|parsed| parsed == function)
                .unwrap_or(false)
        })
    }
}

/// Resolves a `name|version` server key to a [`ModelDescriptor`].
pub trait ModelRegistry: Send + Sync + 'static {
    /// Fails with [`CoreError::ModelNotFound`] for unknown keys.
    fn lookup(&self, key: &str) -> Result<ModelDescriptor>;
}

pub fn model_key(name: &str, version: &str) -> String {
    format!("{name}|{version}")
}

// ── Registry file ────────────────────────────────────────────────────────────

/// One entry of the registry index file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelRecord {
    pub key: String,
    pub name: String,
    pub title: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub auto_start: bool,
    pub functions: Vec<String>,
    pub local_path: String,
    pub settings: Vec<Value>,
    pub setting: Map<String, Value>,
    /// The model's `config.json`, cached at registration time.
    pub config: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryIndex {
    #[serde(default)]
    records: Vec<ModelRecord>,
}

/// Launch block of a model's `config.json` (`easyServer` or `launcher`).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LaunchSpec {
    entry: String,
    entry_args: Vec<String>,
    envs: Value,
}

/// [`ModelRegistry`] backed by a JSON index on disk.
///
/// The index is re-read on every lookup so models registered by the panel
/// while the daemon runs become visible without a restart.
#[derive(Debug, Clone)]
pub struct FileModelRegistry {
    path: PathBuf,
}

impl FileModelRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RegistryIndex> {
        if !self.path.exists() {
            return Ok(RegistryIndex::default());
        }
        let buf = std::fs::read(&self.path)?;
        serde_json::from_slice(&buf)
            .map_err(|e| CoreError::config(format!("invalid model registry {}: {e}", self.path.display())))
    }

    fn save(&self, index: &RegistryIndex) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(index)?)?;
        Ok(())
    }

    /// Register (or re-point) a model from its `config.json`.
    ///
    /// Records whose install directory has disappeared are dropped first.
    pub fn register(&self, config_path: &Path) -> Result<ModelRecord> {
        if config_path.file_name().and_then(|n| n.to_str()) != Some("config.json") {
            return Err(CoreError::config(format!(
                "model config must be named config.json: {}",
                config_path.display()
            )));
        }
        let config = read_object(config_path)?;
        let local_path = config_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let str_field = |k: &str| config.get(k).and_then(Value::as_str).unwrap_or_default().to_owned();
        let name = str_field("name");
        let version = str_field("version");
        let key = model_key(&name, &version);

        let mut index = self.load()?;
        let before = index.records.len();
        index.records.retain(|r| {
            let alive = Path::new(&r.local_path).exists();
            if !alive {
                warn!(key = %r.key, path = %r.local_path, "dropping model with missing install dir");
            }
            alive
        });
        if before != index.records.len() {
            info!(before, after = index.records.len(), "model registry cleaned");
        }

        if let Some(existing) = index.records.iter_mut().find(|r| r.key == key) {
            if Path::new(&existing.local_path) == Path::new(&local_path) {
                return Err(CoreError::invalid_state("model already exists"));
            }
            warn!(%key, old = %existing.local_path, new = %local_path, "model path changed");
            existing.local_path = local_path;
            existing.config = config;
            let record = existing.clone();
            self.save(&index)?;
            return Ok(record);
        }

        let record = ModelRecord {
            key: key.clone(),
            title: str_field("title"),
            kind: "localDir".to_owned(),
            auto_start: true,
            functions: config
                .get("functions")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
                .unwrap_or_default(),
            settings: config
                .get("settings")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            setting: config
                .get("setting")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            name,
            version,
            local_path,
            config,
        };
        index.records.push(record.clone());
        self.save(&index)?;
        info!(%key, "model registered");
        Ok(record)
    }
}

impl ModelRegistry for FileModelRegistry {
    fn lookup(&self, key: &str) -> Result<ModelDescriptor> {
        let index = self.load()?;
        let record = index
            .records
            .into_iter()
            .find(|r| r.key == key)
            .ok_or_else(|| CoreError::ModelNotFound { key: key.to_owned() })?;
        descriptor_from_record(record)
    }
}

fn descriptor_from_record(record: ModelRecord) -> Result<ModelDescriptor> {
    let config = if record.config.is_empty() {
        read_object(&Path::new(&record.local_path).join("config.json"))?
    } else {
        record.config
    };

    let launch_block = |name: &str| -> Result<LaunchSpec> {
        match config.get(name) {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| CoreError::config(format!("invalid {name} block for {}: {e}", record.key))),
            None => Ok(LaunchSpec::default()),
        }
    };
    let mut launch = launch_block("easyServer")?;
    if launch.entry == "launcher" {
        launch = launch_block("launcher")?;
    }
    if launch.entry.is_empty() {
        return Err(CoreError::config(format!("model {} has no launch entry", record.key)));
    }

    let functions = if record.functions.is_empty() {
        config
            .get("functions")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
            .unwrap_or_default()
    } else {
        record.functions
    };

    Ok(ModelDescriptor {
        key: record.key,
        name: record.name,
        title: record.title,
        version: record.version,
        local_path: PathBuf::from(record.local_path),
        functions,
        entry: launch.entry,
        entry_args: launch.entry_args,
        envs: parse_envs(&launch.envs),
        setting: record.setting,
    })
}

/// Accepts either `["K=V", ...]` or `{"K": "V", ...}`.
fn parse_envs(value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let v = v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string());
                (k.clone(), v)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn read_object(path: &Path) -> Result<Map<String, Value>> {
    let buf = std::fs::read(path)
        .map_err(|e| CoreError::config(format!("failed to read {}: {e}", path.display())))?;
    match serde_json::from_slice::<Value>(&buf) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CoreError::config(format!("{} is not a JSON object", path.display()))),
        Err(e) => Err(CoreError::config(format!("failed to parse {}: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_model(root: &Path, dir: &str, config: Value) -> PathBuf {
        let model_dir = root.join(dir);
        std::fs::create_dir_all(&model_dir).unwrap();
        let path = model_dir.join("config.json");
        std::fs::write(&path, config.to_string()).unwrap();
        path
    }

    #[test]
    fn register_then_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = FileModelRegistry::new(tmp.path().join("data/models.json"));
        let cfg = write_model(
            tmp.path(),
            "demo",
            json!({
                "name": "demo", "version": "1.0.0", "title": "Demo",
                "functions": ["soundTts", "soundClone"],
                "easyServer": {"entry": "./run.sh", "entryArgs": ["--config", "${CONFIG}"], "envs": ["A=1", "B=${ROOT}/x"]},
                "setting": {"port": 1}
            }),
        );

        let record = registry.register(&cfg).unwrap();
        assert_eq!(record.key, "demo|1.0.0");

        let desc = registry.lookup("demo|1.0.0").unwrap();
        assert_eq!(desc.entry, "./run.sh");
        assert_eq!(desc.entry_args, vec!["--config", "${CONFIG}"]);
        assert_eq!(
            desc.envs,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "${ROOT}/x".to_string()),
            ]
        );
        assert_eq!(desc.local_path, tmp.path().join("demo"));
        assert!(desc.supports(ServerFunction::SoundClone));
        assert!(!desc.supports(ServerFunction::Asr));
        assert_eq!(desc.setting.get("port"), Some(&json!(1)));

        let err = registry.register(&cfg).unwrap_err();
        assert_eq!(err.to_string(), "model already exists");
    }

    #[test]
    fn launcher_entry_redirects() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = FileModelRegistry::new(tmp.path().join("models.json"));
        let cfg = write_model(
            tmp.path(),
            "wrapped",
            json!({
                "name": "wrapped", "version": "2",
                "easyServer": {"entry": "launcher"},
                "launcher": {"entry": "bin/launch", "entryArgs": ["${CONFIG}"], "envs": {"MODE": "fast"}}
            }),
        );
        registry.register(&cfg).unwrap();

        let desc = registry.lookup("wrapped|2").unwrap();
        assert_eq!(desc.entry, "bin/launch");
        assert_eq!(desc.envs, vec![("MODE".to_string(), "fast".to_string())]);
    }

    #[test]
    fn unknown_key_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = FileModelRegistry::new(tmp.path().join("missing.json"));
        assert!(matches!(
            registry.lookup("nope|0"),
            Err(CoreError::ModelNotFound { .. })
        ));
    }

    #[test]
    fn rejects_non_config_file_name() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = FileModelRegistry::new(tmp.path().join("models.json"));
        assert!(registry.register(&tmp.path().join("model.json")).is_err());
    }

    #[test]
    fn server_function_parses_aliases() {
        assert_eq!("soundTts".parse::<ServerFunction>().unwrap(), ServerFunction::SoundTts);
        assert_eq!("asr".parse::<ServerFunction>().unwrap(), ServerFunction::Asr);
        assert_eq!("soundAsr".parse::<ServerFunction>().unwrap(), ServerFunction::Asr);
        assert_eq!(ServerFunction::VideoGen.to_string(), "videoGen");
    }
}
