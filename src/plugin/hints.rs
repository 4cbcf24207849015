use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::config::OneOrMany;
use crate::error::ConfigError;

/// The `plugin` section a plugin ships in its own `package.json`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PackageHints {
    pub framework: Option<String>,
    pub dependencies: OneOrMany,
}

#[derive(Deserialize)]
struct PackageFile {
    #[serde(default)]
    plugin: Option<PackageHints>,
}

impl PackageHints {
    /// Read hints from `<dir>/package.json`. No file, or no `plugin` key,
    /// means no hints.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join("package.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let file: PackageFile =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?;
        Ok(file.plugin.unwrap_or_default())
    }
}
