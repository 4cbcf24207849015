use std::path::PathBuf;

use thiserror::Error;

/// Startup configuration failures. Any of these aborts process creation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("plugin[{plugin}] depends on missing plugins: {}", missing.join(","))]
    MissingDependency { plugin: String, missing: Vec<String> },

    #[error("cyclic plugin dependency between: {}", cycle.join(","))]
    CyclicDependency { cycle: Vec<String> },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid plugin configuration: {0}")]
    Invalid(String),
}
