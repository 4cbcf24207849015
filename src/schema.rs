use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Error;
use schemars::schema_for;

use crate::config::PluginFile;

pub const PLUGIN_SCHEMA_FILE: &str = "plugin.schema.json";

/// Write the JSON Schema of `config/plugin.json` into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<PathBuf, Error> {
    fs::create_dir_all(out_dir)?;
    let schema = schema_for!(PluginFile);
    let path = out_dir.join(PLUGIN_SCHEMA_FILE);
    fs::write(&path, serde_json::to_string_pretty(&schema)?)?;
    Ok(path)
}
