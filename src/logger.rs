use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `cluster_ipc=debug,info`.
    pub log_level: String,
    /// Daily rolling log files go here. Without it logs go to stderr.
    pub log_dir: Option<PathBuf>,
    /// Newline-delimited JSON instead of text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            json: false,
        }
    }
}

/// Install the global subscriber. Never writes to stdout, which carries the
/// message protocol when running under a master.
pub fn init_tracing(config: &LogConfig, file_name: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(&config.log_level)?;

    let (writer, ansi) = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, file_name);
            (BoxMakeWriter::new(appender), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let registry = Registry::default().with(env_filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_writer(writer).with_target(true))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_writer(writer).with_ansi(ansi))
            .try_init()?;
    }
    Ok(())
}
