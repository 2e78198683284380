//! Environment and launch-template preparation for model processes.

use std::path::Path;

use crate::model::ModelDescriptor;

pub const CONFIG_PLACEHOLDER: &str = "${CONFIG}";
pub const ROOT_PLACEHOLDER: &str = "${ROOT}";

const VENV_DIR: &str = "_aienv";

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

/// Replace `${CONFIG}` and `${ROOT}` in a launch template.
pub fn substitute_placeholders(template: &str, config_path: &Path, root: &Path) -> String {
    template
        .replace(CONFIG_PLACEHOLDER, &config_path.to_string_lossy())
        .replace(ROOT_PLACEHOLDER, &root.to_string_lossy())
}

/// Child environment for one call.
///
/// Starts from `inherited`, prepends the install directory, its `binary`
/// subfolder and the embedded virtual env (when present) to `PATH`, sets the
/// encoding and placeholder variables, then overlays the descriptor's own
/// entries. Placeholders are substituted in every value.
pub fn compose_environment<I>(
    inherited: I,
    descriptor: &ModelDescriptor,
    config_path: &Path,
) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let root = descriptor.local_path.as_path();
    let mut env: Vec<(String, String)> = inherited.into_iter().collect();

    let mut prefix = vec![root.to_path_buf(), root.join("binary")];
    let venv = root.join(VENV_DIR);
    if venv.is_dir() {
        prefix.push(venv.join("Scripts"));
        prefix.push(venv.join("bin"));
        prefix.push(venv.join("Lib").join("site-packages").join("torch").join("lib"));
        prefix.push(venv);
    }
    let mut parts: Vec<String> = prefix
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

    let path_key = env
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("PATH"))
        .map(|(k, _)| k.clone())
        .unwrap_or_else(|| "PATH".to_owned());
    if let Some(existing) = lookup(&env, &path_key).filter(|v| !v.is_empty()) {
        parts.push(existing.to_owned());
    }
    set(&mut env, &path_key, parts.join(PATH_SEPARATOR));

    set(&mut env, "PYTHONIOENCODING", "utf-8".to_owned());
    set(
        &mut env,
        "AIGCPANEL_SERVER_PLACEHOLDER_CONFIG",
        config_path.to_string_lossy().into_owned(),
    );
    set(
        &mut env,
        "AIGCPANEL_SERVER_PLACEHOLDER_ROOT",
        root.to_string_lossy().into_owned(),
    );

    for (key, value) in &descriptor.envs {
        set(&mut env, key, value.clone());
    }

    for (_, value) in env.iter_mut() {
        if value.contains("${") {
            *value = substitute_placeholders(value, config_path, root);
        }
    }
    env
}

fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn set(env: &mut Vec<(String, String)>, key: &str, value: String) {
    match env.iter_mut().find(|(k, _)| k == key) {
        Some(slot) => slot.1 = value,
        None => env.push((key.to_owned(), value)),
    }
}
