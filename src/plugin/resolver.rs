//! Turns the declared plugin set into the order plugins are initialized in.
//!
//! Declared settings are merged with defaults and package hints, filtered for
//! the running process, checked for missing dependencies and cycles, ranked
//! by dependency depth and stably sorted by that rank.

use std::path::PathBuf;
use std::sync::Arc;

use petgraph::Direction::Incoming;
use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, info, warn};

use crate::config::{PluginConfig, PluginManifest, ProcessKind, ProcessOptions};
use crate::error::ConfigError;
use crate::plugin::entries::{PluginEntries, PluginEntry};
use crate::plugin::hints::PackageHints;
use crate::plugin::scope::{ExportTable, PluginScope};

/// A plugin that survived resolution, in initialization order.
#[derive(Clone)]
pub struct PluginDescriptor {
    name: String,
    directory: PathBuf,
    dependencies: Vec<String>,
    entry: Option<PluginEntry>,
    depth: usize,
    scope: PluginScope,
}

impl PluginDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &std::path::Path {
        &self.directory
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// 0 without dependencies, else one more than the deepest dependency.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn entry(&self) -> Option<&PluginEntry> {
        self.entry.as_ref()
    }

    pub fn scope(&self) -> &PluginScope {
        &self.scope
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .field("dependencies", &self.dependencies)
            .field("depth", &self.depth)
            .field("entry", &self.entry.is_some())
            .finish()
    }
}

/// Effective settings after defaults and package hints are applied.
#[derive(Debug, Clone, PartialEq)]
struct Settings {
    enable: bool,
    env: Vec<String>,
    agent: Vec<String>,
    framework: String,
    dependencies: Vec<String>,
}

impl Settings {
    fn merge(
        declared: &PluginConfig,
        hints: PackageHints,
        env: &str,
        host_framework: &str,
    ) -> Self {
        let mut envs = declared.env.to_vec();
        if envs.is_empty() {
            envs.push(env.to_string());
        }
        let framework = declared
            .framework
            .clone()
            .or(hints.framework)
            .unwrap_or_else(|| host_framework.to_string());

        let mut dependencies: Vec<String> = Vec::new();
        for dep in declared.dependencies.to_vec().into_iter().chain(hints.dependencies.to_vec()) {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        Self {
            enable: declared.enable,
            env: envs,
            agent: declared.agent.to_vec(),
            framework,
            dependencies,
        }
    }
}

struct Candidate {
    name: String,
    directory: PathBuf,
    dependencies: Vec<String>,
}

pub struct PluginResolver {
    options: ProcessOptions,
    entries: PluginEntries,
    exports: ExportTable,
}

impl PluginResolver {
    pub fn new(options: ProcessOptions, entries: PluginEntries) -> Self {
        Self {
            options,
            entries,
            exports: ExportTable::default(),
        }
    }

    /// Where plugin `name` lives: absolute names as given, names starting
    /// with `.` under `<root>/config`, everything else under `<root>/plugins`.
    pub fn plugin_dir(&self, name: &str) -> PathBuf {
        let path = PathBuf::from(name);
        if path.is_absolute() {
            path
        } else if name.starts_with('.') {
            self.options.config_dir().join(name)
        } else {
            self.options.root.join("plugins").join(name)
        }
    }

    /// Why a plugin does not run in this process, if it does not.
    fn excluded(&self, settings: &Settings) -> Option<String> {
        let opts = &self.options;
        if !settings.enable {
            return Some("disabled".into());
        }
        if !settings.env.contains(&opts.env) {
            return Some(format!("env `{}` not in {:?}", opts.env, settings.env));
        }
        if settings.framework != opts.framework {
            return Some(format!("framework `{}` is not `{}`", settings.framework, opts.framework));
        }
        if opts.kind == ProcessKind::Agent && !settings.agent.contains(&opts.name) {
            return Some(format!("agent `{}` not in {:?}", opts.name, settings.agent));
        }
        None
    }

    pub fn resolve(&self, manifest: &PluginManifest) -> Result<Vec<PluginDescriptor>, ConfigError> {
        let mut candidates = Vec::new();
        for (name, declared) in manifest.plugins() {
            let directory = self.plugin_dir(name);
            let hints = PackageHints::load(&directory)?;
            let settings =
                Settings::merge(declared, hints, &self.options.env, &self.options.framework);
            if let Some(reason) = self.excluded(&settings) {
                debug!(plugin = %name, "skipping plugin: {reason}");
                continue;
            }
            candidates.push(Candidate {
                name: name.clone(),
                directory,
                dependencies: settings.dependencies,
            });
        }

        let known: Vec<&str> = manifest.plugins().iter().map(|(n, _)| n.as_str()).collect();
        for name in self.entries.unknown(&known) {
            warn!(plugin = %name, "entry registered for a plugin that is not declared");
        }

        let depths = rank(&candidates)?;

        let mut resolved: Vec<PluginDescriptor> = candidates
            .into_iter()
            .zip(depths)
            .map(|(c, depth)| {
                let scope = PluginScope::new(
                    c.name.clone(),
                    c.directory.clone(),
                    c.dependencies.clone(),
                    manifest.override_for(&c.name),
                    Arc::clone(&self.exports),
                );
                PluginDescriptor {
                    entry: self.entries.get(&c.name, self.options.kind),
                    name: c.name,
                    directory: c.directory,
                    dependencies: c.dependencies,
                    depth,
                    scope,
                }
            })
            .collect();
        // Stable: equal depths keep declaration order.
        resolved.sort_by_key(|p| p.depth);

        info!(
            process = %self.options.name,
            kind = %self.options.kind,
            order = ?resolved.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            "resolved plugins"
        );
        Ok(resolved)
    }
}

/// Dependency depth of every candidate, in candidate order.
fn rank(candidates: &[Candidate]) -> Result<Vec<usize>, ConfigError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..candidates.len()).map(|i| graph.add_node(i)).collect();
    let index_of = |name: &str| candidates.iter().position(|c| c.name == name);

    for (i, c) in candidates.iter().enumerate() {
        let missing: Vec<String> = c
            .dependencies
            .iter()
            .filter(|d| index_of(d).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingDependency {
                plugin: c.name.clone(),
                missing,
            });
        }
        for dep in &c.dependencies {
            if let Some(j) = index_of(dep) {
                graph.add_edge(nodes[j], nodes[i], ());
            }
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        let at = cycle.node_id();
        let members = kosaraju_scc(&graph)
            .into_iter()
            .find(|scc| scc.contains(&at))
            .unwrap_or_else(|| vec![at]);
        let mut members: Vec<usize> = members.into_iter().map(|n| graph[n]).collect();
        members.sort_unstable();
        ConfigError::CyclicDependency {
            cycle: members.into_iter().map(|i| candidates[i].name.clone()).collect(),
        }
    })?;

    let mut depths = vec![0usize; candidates.len()];
    for n in order {
        let depth = graph
            .neighbors_directed(n, Incoming)
            .map(|dep| depths[graph[dep]] + 1)
            .max()
            .unwrap_or(0);
        depths[graph[n]] = depth;
    }
    Ok(depths)
}
