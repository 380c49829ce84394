use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

pub const DEFAULT_PLANNER_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ACTION_MODEL: &str = "gpt-4o";

const API_KEY_VAR: &str = "OPENROUTER_API_KEY";
const PLANNER_VAR: &str = "PLANNER_MODEL";
const ACTION_VAR: &str = "EXPLAINER_MODEL";

/// The resolved configuration snapshot. Cheap to clone; handed by value to
/// whoever needs it so a concurrent settings update never mutates state
/// under a running request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_key: Option<String>,
    pub planner_model: String,
    pub action_model: String,
}

/// What `GET /settings` exposes. The credential itself is write-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub has_api_key: bool,
    pub planner_model: String,
    pub action_model: String,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Settings {
            has_api_key: config.api_key.is_some(),
            planner_model: config.planner_model.clone(),
            action_model: config.action_model.clone(),
        }
    }
}

/// Fields present in a `PUT /settings` body. Omitted fields stay unchanged;
/// an empty `api_key` clears the stored credential.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub api_key: Option<String>,
    pub planner_model: Option<String>,
    pub action_model: Option<String>,
}

/// Deprecated JSON config kept as the lowest file-backed layer.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacyConfig {
    api_key: Option<String>,
    planner_model: Option<String>,
    explainer_model: Option<String>,
}

/// Owns the on-disk configuration and the active snapshot. Updates hold the
/// write lock for the whole persist-then-reload cycle, so readers only ever
/// observe a fully swapped snapshot.
pub struct ConfigStore {
    env_path: PathBuf,
    legacy_path: PathBuf,
    models_path: PathBuf,
    active: RwLock<Config>,
}

impl ConfigStore {
    pub fn open(config_dir: &Path) -> Self {
        let env_path = config_dir.join(".env");
        let legacy_path = config_dir.join("openrouter.json");
        let models_path = config_dir.join("models.json");
        let active = RwLock::new(load_config(&env_path, &legacy_path));
        Self { env_path, legacy_path, models_path, active }
    }

    pub fn models_path(&self) -> &Path {
        &self.models_path
    }

    pub async fn current(&self) -> Config {
        self.active.read().await.clone()
    }

    pub async fn settings(&self) -> Settings {
        Settings::from(&*self.active.read().await)
    }

    /// Merge the patch into the env file, then reload every layer and swap
    /// the active snapshot.
    pub async fn update(&self, patch: SettingsPatch) -> anyhow::Result<Settings> {
        let mut active = self.active.write().await;

        let mut env = read_env_file(&self.env_path);
        if let Some(api_key) = patch.api_key {
            let api_key = api_key.trim();
            if api_key.is_empty() {
                env.remove(API_KEY_VAR);
            } else {
                env.insert(API_KEY_VAR.to_string(), api_key.to_string());
            }
        }
        if let Some(planner) = patch.planner_model {
            let planner = planner.trim();
            if !planner.is_empty() {
                env.insert(PLANNER_VAR.to_string(), planner.to_string());
            }
        }
        if let Some(action) = patch.action_model {
            let action = action.trim();
            if !action.is_empty() {
                env.insert(ACTION_VAR.to_string(), action.to_string());
            }
        }
        write_env_file(&self.env_path, &env)?;

        *active = load_config(&self.env_path, &self.legacy_path);
        Ok(Settings::from(&*active))
    }
}

fn load_config(env_path: &Path, legacy_path: &Path) -> Config {
    let file = read_env_file(env_path);
    let legacy = load_legacy(legacy_path);
    resolve_config(&file, &|key| std::env::var(key).ok(), &legacy)
}

/// Layered resolution, highest priority first: env file, process
/// environment, legacy JSON, hardcoded default.
fn resolve_config(
    file: &BTreeMap<String, String>,
    process: &dyn Fn(&str) -> Option<String>,
    legacy: &LegacyConfig,
) -> Config {
    let layer = |key: &str, legacy_value: Option<&String>| -> Option<String> {
        non_empty(file.get(key).cloned())
            .or_else(|| non_empty(process(key)))
            .or_else(|| non_empty(legacy_value.cloned()))
    };
    Config {
        api_key: layer(API_KEY_VAR, legacy.api_key.as_ref()),
        planner_model: layer(PLANNER_VAR, legacy.planner_model.as_ref())
            .unwrap_or_else(|| DEFAULT_PLANNER_MODEL.to_string()),
        action_model: layer(ACTION_VAR, legacy.explainer_model.as_ref())
            .unwrap_or_else(|| DEFAULT_ACTION_MODEL.to_string()),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn load_legacy(path: &Path) -> LegacyConfig {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn read_env_file(path: &Path) -> BTreeMap<String, String> {
    fs::read_to_string(path).map(|raw| parse_env_file(&raw)).unwrap_or_default()
}

/// `KEY=value` lines; `#` comments skipped; double-quoted values unescape
/// `\"` and `\\`, single-quoted values are literal.
pub(crate) fn parse_env_file(content: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(idx) = trimmed.find('=') else { continue };
        let key = trimmed[..idx].trim();
        if key.is_empty() {
            continue;
        }
        let raw = trimmed[idx + 1..].trim();
        let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            unescape(&raw[1..raw.len() - 1])
        } else if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
            raw[1..raw.len() - 1].to_string()
        } else {
            raw.to_string()
        };
        out.insert(key.to_string(), value);
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn serialize_env_value(value: &str) -> String {
    if value.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '=') {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        value.to_string()
    }
}

pub(crate) fn write_env_file(path: &Path, env: &BTreeMap<String, String>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let entries: Vec<String> = env
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(key, value)| format!("{key}={}", serialize_env_value(value)))
        .collect();
    let mut content = entries.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(path, content)
}
