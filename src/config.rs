use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{env, fs};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Directory holding `config/` and `plugins/`.
pub const ROOT_VAR: &str = "CLUSIC_ROOT";
/// Name of the running environment, e.g. `production`.
pub const ENV_VAR: &str = "CLUSIC_ENV";
pub const DEFAULT_ENV: &str = "development";
/// Host framework identifier plugins are matched against.
pub const FRAMEWORK: &str = "clusic";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    AsRefStr,
    Display,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Agent,
    Worker,
}

/// Who this process is and where it finds its configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    pub root: PathBuf,
    pub env: String,
    pub kind: ProcessKind,
    pub name: String,
    pub framework: String,
}

impl ProcessOptions {
    /// Options for process `name`, with root and environment taken from
    /// `CLUSIC_ROOT` / `CLUSIC_ENV` when set.
    pub fn new(kind: ProcessKind, name: impl Into<String>) -> Self {
        let root = env::var(ROOT_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let env = env::var(ENV_VAR).unwrap_or_else(|_| DEFAULT_ENV.to_string());
        Self {
            root,
            env,
            kind,
            name: name.into(),
            framework: FRAMEWORK.to_string(),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }
}

/// Load `<root>/.env` into the process environment if it exists.
pub fn load_dotenv(root: &Path) -> Option<PathBuf> {
    let env_file = root.join(".env");
    if !env_file.exists() {
        debug!("no .env at {}", env_file.display());
        return None;
    }
    match dotenvy::from_path(&env_file) {
        Ok(()) => {
            info!("Loaded .env from {}", env_file.display());
            Some(env_file)
        }
        Err(e) => {
            tracing::warn!("could not load .env from {}: {e}", env_file.display());
            None
        }
    }
}

/// A single name or a list of names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

impl From<&str> for OneOrMany {
    fn from(s: &str) -> Self {
        OneOrMany::One(s.to_string())
    }
}

impl From<Vec<&str>> for OneOrMany {
    fn from(v: Vec<&str>) -> Self {
        OneOrMany::Many(v.into_iter().map(str::to_string).collect())
    }
}

/// Declared settings of one plugin in `config/plugin.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PluginConfig {
    /// Plugins are off unless enabled.
    pub enable: bool,
    /// Environments the plugin runs in. Empty means the current one.
    pub env: OneOrMany,
    /// Agent processes the plugin runs in. Agents load nothing when empty.
    pub agent: OneOrMany,
    /// Framework the plugin targets. Falls back to the package hint, then the host.
    pub framework: Option<String>,
    pub dependencies: OneOrMany,
}

impl PluginConfig {
    pub fn enabled() -> Self {
        Self {
            enable: true,
            ..Self::default()
        }
    }

    pub fn depends_on(mut self, deps: impl Into<OneOrMany>) -> Self {
        self.dependencies = deps.into();
        self
    }

    pub fn agents(mut self, agents: impl Into<OneOrMany>) -> Self {
        self.agent = agents.into();
        self
    }

    pub fn envs(mut self, envs: impl Into<OneOrMany>) -> Self {
        self.env = envs.into();
        self
    }
}

/// Shape of `config/plugin.json`, used for the schema.
pub type PluginFile = BTreeMap<String, PluginConfig>;

/// Declared plugins in file order plus the per-environment runtime config.
#[derive(Debug, Clone, Default)]
pub struct PluginManifest {
    plugins: Vec<(String, PluginConfig)>,
    overrides: Map<String, Value>,
}

impl PluginManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, name: impl Into<String>, config: PluginConfig) -> Self {
        self.plugins.push((name.into(), config));
        self
    }

    pub fn with_override(mut self, name: impl Into<String>, config: Value) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Read `<root>/config/plugin.json` and `<root>/config/plugin.<env>.json`.
    /// Either file may be missing.
    pub fn load(root: &Path, env: &str) -> Result<Self, ConfigError> {
        let dir = root.join("config");
        let plugin_file = dir.join("plugin.json");
        let env_file = dir.join(format!("plugin.{env}.json"));

        let mut plugins = Vec::new();
        for (name, value) in read_object(&plugin_file)?.unwrap_or_default() {
            let config = serde_json::from_value(value).map_err(|source| ConfigError::Parse {
                path: plugin_file.clone(),
                source,
            })?;
            plugins.push((name, config));
        }
        let overrides = read_object(&env_file)?.unwrap_or_default();
        debug!(
            plugins = plugins.len(),
            overrides = overrides.len(),
            "loaded plugin manifest from {}",
            dir.display()
        );
        Ok(Self { plugins, overrides })
    }

    pub fn plugins(&self) -> &[(String, PluginConfig)] {
        &self.plugins
    }

    /// Runtime config for `name` in the current environment; an empty object
    /// when none is given.
    pub fn override_for(&self, name: &str) -> Value {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

fn read_object(path: &Path) -> Result<Option<Map<String, Value>>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })? {
        Value::Object(map) => Ok(Some(map)),
        other => Err(ConfigError::Invalid(format!(
            "{} must hold an object, found {}",
            path.display(),
            kind_of(&other)
        ))),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;
    use tempfile::tempdir;

    #[test]
    fn process_kind_names() {
        assert_eq!(ProcessKind::from_str("agent").unwrap(), ProcessKind::Agent);
        assert_eq!(ProcessKind::Worker.to_string(), "worker");
    }

    #[test]
    fn plugin_config_accepts_string_or_list() {
        let cfg: PluginConfig = serde_json::from_value(json!({
            "enable": true,
            "env": "production",
            "dependencies": ["a", "b"]
        }))
        .unwrap();
        assert!(cfg.enable);
        assert_eq!(cfg.env.to_vec(), vec!["production"]);
        assert_eq!(cfg.dependencies.to_vec(), vec!["a", "b"]);
        assert!(cfg.agent.to_vec().is_empty());
        assert_eq!(cfg.framework, None);
    }

    #[test]
    fn missing_files_give_an_empty_manifest() {
        let dir = tempdir().unwrap();
        let manifest = PluginManifest::load(dir.path(), "development").unwrap();
        assert!(manifest.plugins().is_empty());
        assert_eq!(manifest.override_for("x"), json!({}));
    }

    #[test]
    fn manifest_keeps_file_order_and_reads_env_overrides() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config");
        fs::create_dir_all(&config).unwrap();
        fs::write(
            config.join("plugin.json"),
            r#"{"zeta": {"enable": true}, "alpha": {"enable": false}, "mid": {}}"#,
        )
        .unwrap();
        fs::write(config.join("plugin.test.json"), r#"{"zeta": {"port": 6379}}"#).unwrap();

        let manifest = PluginManifest::load(dir.path(), "test").unwrap();
        let names: Vec<&str> = manifest.plugins().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(manifest.override_for("zeta"), json!({"port": 6379}));
    }

    #[test]
    fn non_object_manifest_is_invalid() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config");
        fs::create_dir_all(&config).unwrap();
        fs::write(config.join("plugin.json"), "[1, 2]").unwrap();

        let err = PluginManifest::load(dir.path(), "development").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn broken_json_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config");
        fs::create_dir_all(&config).unwrap();
        fs::write(config.join("plugin.json"), "{ nope").unwrap();

        let err = PluginManifest::load(dir.path(), "development").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn dotenv_is_optional() {
        let dir = tempdir().unwrap();
        assert_eq!(load_dotenv(dir.path()), None);
        fs::write(dir.path().join(".env"), "CLUSIC_DOTENV_TEST=1\n").unwrap();
        assert_eq!(load_dotenv(dir.path()), Some(dir.path().join(".env")));
        assert_eq!(env::var("CLUSIC_DOTENV_TEST").unwrap(), "1");
    }
}
