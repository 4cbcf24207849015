use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use clusic::cluster_ipc::LocalHub;
use clusic::config::{PluginConfig, PluginManifest, ProcessKind, ProcessOptions};
use clusic::error::ConfigError;
use clusic::plugin::{PluginAccessError, PluginDescriptor, PluginEntries, PluginResolver};
use clusic::process::ClusterProcess;
use serde_json::json;
use tempfile::{TempDir, tempdir};

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn options(root: &Path, kind: ProcessKind, name: &str) -> ProcessOptions {
    ProcessOptions::new(kind, name).with_root(root).with_env("production")
}

fn names(plugins: &[PluginDescriptor]) -> Vec<&str> {
    plugins.iter().map(|p| p.name()).collect()
}

fn resolve(
    root: &Path,
    kind: ProcessKind,
    name: &str,
) -> Result<Vec<PluginDescriptor>, ConfigError> {
    let manifest = PluginManifest::load(root, "production")?;
    PluginResolver::new(options(root, kind, name), PluginEntries::new()).resolve(&manifest)
}

fn app_root(plugin_json: &str) -> TempDir {
    let dir = tempdir().unwrap();
    write(dir.path(), "config/plugin.json", plugin_json);
    dir
}

#[test]
fn dependencies_come_first() {
    let root = app_root(
        r#"{
            "c": {"enable": true, "dependencies": ["a", "b"]},
            "b": {"enable": true, "dependencies": "a"},
            "a": {"enable": true}
        }"#,
    );
    let plugins = resolve(root.path(), ProcessKind::Worker, "app").unwrap();
    assert_eq!(names(&plugins), vec!["a", "b", "c"]);
    let depths: Vec<usize> = plugins.iter().map(|p| p.depth()).collect();
    assert_eq!(depths, vec![0, 1, 2]);
}

#[test]
fn equal_depth_keeps_declaration_order() {
    let root = app_root(
        r#"{
            "zeta": {"enable": true},
            "alpha": {"enable": true},
            "uses-zeta": {"enable": true, "dependencies": "zeta"},
            "mid": {"enable": true}
        }"#,
    );
    let plugins = resolve(root.path(), ProcessKind::Worker, "app").unwrap();
    assert_eq!(names(&plugins), vec!["zeta", "alpha", "mid", "uses-zeta"]);
}

#[test]
fn missing_dependency_is_named() {
    let root = app_root(
        r#"{
            "a": {"enable": true},
            "b": {"enable": true, "dependencies": ["a", "ghost"]}
        }"#,
    );
    match resolve(root.path(), ProcessKind::Worker, "app").unwrap_err() {
        ConfigError::MissingDependency { plugin, missing } => {
            assert_eq!(plugin, "b");
            assert_eq!(missing, vec!["ghost"]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn dependency_on_filtered_plugin_is_missing() {
    let root = app_root(
        r#"{
            "a": {"enable": false},
            "b": {"enable": true, "dependencies": "a"}
        }"#,
    );
    let err = resolve(root.path(), ProcessKind::Worker, "app").unwrap_err();
    assert!(matches!(err, ConfigError::MissingDependency { .. }), "{err}");
    assert!(err.to_string().contains("a"));
}

#[test]
fn cycles_are_rejected() {
    let root = app_root(
        r#"{
            "free": {"enable": true},
            "a": {"enable": true, "dependencies": "c"},
            "b": {"enable": true, "dependencies": "a"},
            "c": {"enable": true, "dependencies": "b"}
        }"#,
    );
    match resolve(root.path(), ProcessKind::Worker, "app").unwrap_err() {
        ConfigError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["a", "b", "c"]),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn filters_apply_per_process() {
    let root = app_root(
        r#"{
            "everywhere": {"enable": true, "agent": ["vs", "mail"]},
            "off": {"enable": false, "agent": "vs"},
            "staging-only": {"enable": true, "env": "staging", "agent": "vs"},
            "foreign": {"enable": true, "framework": "other", "agent": "vs"},
            "no-agents": {"enable": true}
        }"#,
    );
    let worker = resolve(root.path(), ProcessKind::Worker, "app").unwrap();
    assert_eq!(names(&worker), vec!["everywhere", "no-agents"]);

    let vs = resolve(root.path(), ProcessKind::Agent, "vs").unwrap();
    assert_eq!(names(&vs), vec!["everywhere"]);

    let other = resolve(root.path(), ProcessKind::Agent, "other").unwrap();
    assert!(other.is_empty());
}

#[test]
fn package_hints_add_dependencies_and_framework() {
    let root = app_root(
        r#"{
            "cache": {"enable": true, "dependencies": "log"},
            "redis": {"enable": true},
            "log": {"enable": true},
            "legacy": {"enable": true}
        }"#,
    );
    write(
        root.path(),
        "plugins/cache/package.json",
        r#"{"plugin": {"dependencies": ["redis", "log"]}}"#,
    );
    write(root.path(), "plugins/legacy/package.json", r#"{"plugin": {"framework": "koa"}}"#);

    let plugins = resolve(root.path(), ProcessKind::Worker, "app").unwrap();
    assert_eq!(names(&plugins), vec!["redis", "log", "cache"]);
    assert_eq!(plugins[2].dependencies(), ["log".to_string(), "redis".to_string()]);
}

#[test]
fn plugin_directories_follow_the_name() {
    let root = app_root("{}");
    let abs = root.path().join("vendor/auth");
    let manifest = PluginManifest::new()
        .with_plugin("redis", PluginConfig::enabled())
        .with_plugin("./local", PluginConfig::enabled())
        .with_plugin(abs.to_string_lossy(), PluginConfig::enabled());

    let resolver = PluginResolver::new(
        options(root.path(), ProcessKind::Worker, "app"),
        PluginEntries::new(),
    );
    let plugins = resolver.resolve(&manifest).unwrap();
    assert_eq!(plugins[0].directory(), root.path().join("plugins/redis"));
    assert_eq!(plugins[1].directory(), root.path().join("config/local"));
    assert_eq!(plugins[2].directory(), abs);
}

#[derive(Debug)]
struct Pool {
    url: String,
}

#[tokio::test]
async fn create_runs_entries_in_order_with_scoped_access() {
    let root = app_root(
        r#"{
            "session": {"enable": true, "dependencies": "redis"},
            "redis": {"enable": true},
            "audit": {"enable": true}
        }"#,
    );
    write(
        root.path(),
        "config/plugin.production.json",
        r#"{"redis": {"url": "redis://cache:6379"}}"#,
    );

    let ran = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut entries = PluginEntries::new();
    let r = Arc::clone(&ran);
    entries.register("redis", ProcessKind::Worker, move |_process, scope| {
        let r = Arc::clone(&r);
        async move {
            let url = scope.config()["url"].as_str().unwrap_or_default().to_string();
            scope.export(Pool { url });
            r.lock().unwrap().push("redis".into());
            Ok(())
        }
    });
    let r = Arc::clone(&ran);
    entries.register("session", ProcessKind::Worker, move |_process, scope| {
        let r = Arc::clone(&r);
        async move {
            let pool = scope.dependency::<Pool>("redis")?;
            assert!(matches!(
                scope.dependency::<Pool>("audit"),
                Err(PluginAccessError::NotDeclared { .. })
            ));
            r.lock().unwrap().push(format!("session via {}", pool.url));
            Ok(())
        }
    });
    // Agent-only entry; a worker treats the plugin as configuration.
    entries.register("audit", ProcessKind::Agent, |_process, _scope| async {
        anyhow::bail!("agent entry must not run in a worker")
    });

    let opts = options(root.path(), ProcessKind::Worker, "app");
    let manifest = PluginManifest::load(root.path(), "production").unwrap();
    let plugins = PluginResolver::new(opts.clone(), entries).resolve(&manifest).unwrap();
    assert_eq!(names(&plugins), vec!["redis", "audit", "session"]);
    assert!(plugins[1].entry().is_none());

    let hub = LocalHub::new();
    let (transport, _inbox) = hub.connect("app").unwrap();
    let process = ClusterProcess::new(opts, Arc::new(transport));
    let r = Arc::clone(&ran);
    process
        .create_with(&plugins, move |p| async move {
            r.lock().unwrap().push(format!("bootstrap {}", p.name()));
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(
        *ran.lock().unwrap(),
        vec!["redis", "session via redis://cache:6379", "bootstrap app"]
    );
}

#[tokio::test]
async fn failing_entry_stops_creation() {
    let root = app_root(
        r#"{
            "first": {"enable": true},
            "second": {"enable": true}
        }"#,
    );
    let ran = Arc::new(Mutex::new(Vec::<&str>::new()));
    let mut entries = PluginEntries::new();
    entries.register("first", ProcessKind::Worker, |_p, _s| async {
        anyhow::bail!("no credentials")
    });
    let r = Arc::clone(&ran);
    entries.register("second", ProcessKind::Worker, move |_p, _s| {
        r.lock().unwrap().push("second");
        async { Ok(()) }
    });

    let opts = options(root.path(), ProcessKind::Worker, "app");
    let manifest = PluginManifest::load(root.path(), "production").unwrap();
    let plugins = PluginResolver::new(opts.clone(), entries).resolve(&manifest).unwrap();

    let hub = LocalHub::new();
    let (transport, _inbox) = hub.connect("app").unwrap();
    let process = ClusterProcess::new(opts, Arc::new(transport));
    let err = process.create(&plugins).await.unwrap_err();
    assert_eq!(err.to_string(), "plugin[first] failed to initialize");
    assert_eq!(format!("{err:#}"), "plugin[first] failed to initialize: no credentials");
    assert!(ran.lock().unwrap().is_empty());
}

#[tokio::test]
async fn entries_can_register_feed_handlers() {
    let root = app_root(r#"{"stats": {"enable": true, "agent": "vs"}}"#);
    let mut entries = PluginEntries::new();
    entries.register("stats", ProcessKind::Agent, |process, _scope| async move {
        process.on_feed("count", |_| async { Ok(json!(3)) })?;
        Ok(())
    });

    let hub = LocalHub::new();
    let (agent_tx, agent_inbox) = hub.connect("vs").unwrap();
    let (worker_tx, worker_inbox) = hub.connect("app").unwrap();

    let agent_opts = options(root.path(), ProcessKind::Agent, "vs");
    let manifest = PluginManifest::load(root.path(), "production").unwrap();
    let plugins = PluginResolver::new(agent_opts.clone(), entries).resolve(&manifest).unwrap();
    let agent = ClusterProcess::new(agent_opts, Arc::new(agent_tx));
    agent.serve(agent_inbox);
    agent.create(&plugins).await.unwrap();

    let worker_opts = options(root.path(), ProcessKind::Worker, "app");
    let worker = ClusterProcess::new(worker_opts, Arc::new(worker_tx));
    worker.serve(worker_inbox);
    assert_eq!(worker.feed("vs", "count", json!(null)).await, Ok(Some(json!(3))));
}
