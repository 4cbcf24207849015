use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::config::ProcessKind;
use crate::plugin::scope::PluginScope;
use crate::process::ClusterProcess;

pub type PluginEntry = Arc<
    dyn Fn(ClusterProcess, PluginScope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;

/// Entry code of each plugin, keyed by plugin name and the kind of process it
/// initializes. A plugin with no entry for a kind is configuration only there.
#[derive(Clone, Default)]
pub struct PluginEntries {
    entries: HashMap<(String, ProcessKind), PluginEntry>,
}

impl PluginEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the entry `plugin` runs in processes of `kind`. Registering
    /// again replaces the previous entry.
    pub fn register<F, Fut>(
        &mut self,
        plugin: impl Into<String>,
        kind: ProcessKind,
        entry: F,
    ) -> &mut Self
    where
        F: Fn(ClusterProcess, PluginScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let entry: PluginEntry = Arc::new(move |process, scope| entry(process, scope).boxed());
        self.entries.insert((plugin.into(), kind), entry);
        self
    }

    pub fn get(&self, plugin: &str, kind: ProcessKind) -> Option<PluginEntry> {
        self.entries.get(&(plugin.to_string(), kind)).cloned()
    }

    /// Plugin names with an entry that none of `known` matches.
    pub fn unknown<'a>(&'a self, known: &[&str]) -> Vec<&'a str> {
        let mut names: Vec<&str> = self
            .entries
            .keys()
            .map(|(name, _)| name.as_str())
            .filter(|name| !known.contains(name))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl std::fmt::Debug for PluginEntries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}
