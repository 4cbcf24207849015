use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use clusic::cluster_ipc::stdio::{LineTransport, read_stdin};
use clusic::{
    config::{PluginManifest, ProcessKind, ProcessOptions, load_dotenv},
    logger::{LogConfig, init_tracing},
    plugin::{PluginEntries, PluginResolver},
    process::ClusterProcess,
    schema::write_schema,
};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "clusic",
    about = "Agent and worker processes for a clusic cluster",
    version
)]
struct Cli {
    /// Application root; defaults to CLUSIC_ROOT, then the current directory
    #[arg(long, short = 'r', global = true)]
    root: Option<PathBuf>,

    /// Environment name; defaults to CLUSIC_ENV, then `development`
    #[arg(long, short = 'e', global = true)]
    env: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the plugins a process would load, in initialization order
    Plugins(ProcessArgs),

    /// Run one process, exchanging messages with the master over stdin/stdout
    Run(RunArgs),

    /// Emit the JSON-Schema of config/plugin.json
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct ProcessArgs {
    #[arg(long, value_enum, default_value_t = ProcessKind::Worker)]
    kind: ProcessKind,

    #[arg(long, default_value = "app")]
    name: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    process: ProcessArgs,

    /// Log filter (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write daily rolling logs here instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log as newline-delimited JSON
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory; defaults to `<root>/schemas`
    #[arg(long)]
    out: Option<PathBuf>,
}

fn process_options(
    cli_root: &Option<PathBuf>,
    cli_env: &Option<String>,
    args: &ProcessArgs,
) -> ProcessOptions {
    let mut options = ProcessOptions::new(args.kind, args.name.clone());
    if let Some(root) = cli_root {
        options = options.with_root(root.clone());
    }
    if let Some(env) = cli_env {
        options = options.with_env(env.clone());
    }
    options
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Plugins(args) => {
            let options = process_options(&cli.root, &cli.env, args);
            load_dotenv(&options.root);
            let manifest = PluginManifest::load(&options.root, &options.env)?;
            let plugins = PluginResolver::new(options, PluginEntries::new()).resolve(&manifest)?;
            for plugin in plugins {
                println!(
                    "{}\t{}\t{}\t[{}]",
                    plugin.depth(),
                    plugin.name(),
                    plugin.directory().display(),
                    plugin.dependencies().join(",")
                );
            }
            Ok(())
        }
        Commands::Run(args) => {
            let options = process_options(&cli.root, &cli.env, &args.process);
            run(options, args).await
        }
        Commands::Schema(args) => {
            let root = cli
                .root
                .clone()
                .unwrap_or_else(|| ProcessOptions::new(ProcessKind::Worker, "app").root);
            let out_dir = args.out.clone().unwrap_or_else(|| root.join("schemas"));
            let path = write_schema(&out_dir)?;
            println!("Schema written to {}", path.display());
            Ok(())
        }
    }
}

async fn run(options: ProcessOptions, args: &RunArgs) -> anyhow::Result<()> {
    if !options.root.exists() {
        bail!("root directory `{}` does not exist", options.root.display());
    }
    load_dotenv(&options.root);

    let log = LogConfig {
        log_level: args.log_level.clone(),
        log_dir: args.log_dir.clone(),
        json: args.log_json,
    };
    init_tracing(&log, &format!("clusic-{}.log", options.name))?;
    info!(kind = %options.kind, name = %options.name, env = %options.env, "process starting");

    let manifest = PluginManifest::load(&options.root, &options.env)?;
    let plugins = PluginResolver::new(options.clone(), PluginEntries::new()).resolve(&manifest)?;

    let (transport, writer) = LineTransport::stdout(options.name.clone());
    let process = ClusterProcess::new(options, Arc::new(transport));

    let (tx, inbox) = mpsc::unbounded_channel();
    let server = process.serve(inbox);
    let reader = tokio::spawn(read_stdin(tx));

    if let Err(e) = process.create(&plugins).await {
        error!("failed to create {}: {e:#}", process.name());
        return Err(e);
    }
    info!(process = %process.name(), plugins = plugins.len(), "process running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        res = reader => match res {
            Ok(Ok(())) => info!("master closed the channel"),
            Ok(Err(e)) => error!("reading from master failed: {e}"),
            Err(e) => error!("reader task failed: {e}"),
        },
    }

    process.destroy().await?;
    server.abort();
    drop(process);
    // Give the writer a moment to flush what is still queued for the master.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    Ok(())
}
