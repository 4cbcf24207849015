use std::any::{Any, type_name};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

pub(crate) type ExportTable = Arc<DashMap<String, Arc<dyn Any + Send + Sync>>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginAccessError {
    #[error("{dependency} is not one of {declared:?}")]
    NotDeclared {
        dependency: String,
        declared: Vec<String>,
    },

    #[error("plugin[{0}] has not exported anything yet")]
    NotExported(String),

    #[error("plugin[{dependency}] does not export a `{expected}`")]
    TypeMismatch {
        dependency: String,
        expected: &'static str,
    },
}

/// What a resolved plugin may see: its own settings, and the exports of the
/// plugins it declared as dependencies. Nothing else.
#[derive(Clone)]
pub struct PluginScope {
    name: String,
    directory: PathBuf,
    dependencies: Vec<String>,
    config: Value,
    exports: ExportTable,
}

impl PluginScope {
    pub(crate) fn new(
        name: String,
        directory: PathBuf,
        dependencies: Vec<String>,
        config: Value,
        exports: ExportTable,
    ) -> Self {
        Self {
            name,
            directory,
            dependencies,
            config,
            exports,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Runtime config from `plugin.<env>.json`.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Publish `value` to the plugins that depend on this one. A later export
    /// replaces an earlier one.
    pub fn export<T: Any + Send + Sync>(&self, value: T) {
        self.exports.insert(self.name.clone(), Arc::new(value));
    }

    /// The value exported by the declared dependency `name`.
    pub fn dependency<T: Any + Send + Sync>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, PluginAccessError> {
        if !self.dependencies.iter().any(|d| d == name) {
            return Err(PluginAccessError::NotDeclared {
                dependency: name.to_string(),
                declared: self.dependencies.clone(),
            });
        }
        let exported = self
            .exports
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| PluginAccessError::NotExported(name.to_string()))?;
        exported
            .downcast::<T>()
            .map_err(|_| PluginAccessError::TypeMismatch {
                dependency: name.to_string(),
                expected: type_name::<T>(),
            })
    }
}

impl std::fmt::Debug for PluginScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginScope")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .field("dependencies", &self.dependencies)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
