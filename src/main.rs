use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::{fs, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use conduit::{
    config::{GraphConfig, graph_schema},
    graph::TaskGraph,
    handler::HandlerRegistry,
    logger::{LogConfig, LogLevel, init_tracing},
    node::PluginRegistry,
    server,
    worker::{PoolOptions, WorkerPool},
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "conduit",
    about = "Run declarative plugin pipelines across workers",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the graph, activate it and optionally serve remote dispatches
    Run(RunArgs),

    /// Build the graph and report wiring problems
    Validate(ValidateArgs),

    /// Emit the JSON schema of a graph document
    Schema {
        /// Write to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Graph document (.json, .yaml or .yml)
    #[arg(long, env = "CONDUIT_CONFIG")]
    config: PathBuf,

    /// Only activate this task
    #[arg(long)]
    task: Option<String>,

    #[arg(long, env = "CONDUIT_WORKERS", default_value_t = 1)]
    workers: u32,

    /// Request context handed to every invocation, as JSON
    #[arg(long, default_value = "null")]
    request: String,

    /// Serve remote dispatches on this address and keep running until ctrl-c
    #[arg(long, env = "CONDUIT_LISTEN")]
    listen: Option<SocketAddr>,

    /// Seed for distributed placement
    #[arg(long, env = "CONDUIT_SEED")]
    seed: Option<u64>,

    /// Milliseconds to let fire-and-forget dispatches finish before exiting
    #[arg(long, default_value_t = 200)]
    drain_ms: u64,

    #[command(flatten)]
    log: LogArgs,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(long, env = "CONDUIT_CONFIG")]
    config: PathBuf,

    #[command(flatten)]
    log: LogArgs,
}

#[derive(Args, Debug)]
struct LogArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CONDUIT_LOG_LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Also write daily-rolling logs into this directory
    #[arg(long, env = "CONDUIT_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

impl LogArgs {
    fn config(&self) -> LogConfig {
        LogConfig::new(self.log_level, self.log_dir.clone(), self.log_json)
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Validate(args) => validate(args).map(|()| ExitCode::SUCCESS),
        Commands::Schema { out } => {
            let schema = serde_json::to_string_pretty(&graph_schema())?;
            match out {
                Some(path) => {
                    fs::write(&path, schema)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Schema written to {}", path.display());
                }
                None => println!("{schema}"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    // held until return; dropping it flushes the log file
    let _guard = init_tracing(&args.log.config())?;
    let config = GraphConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let request: Value = serde_json::from_str(&args.request).context("--request is not valid JSON")?;

    let plugins = PluginRegistry::with_builtins();
    let handlers = HandlerRegistry::with_builtins();

    let pool = WorkerPool::start(
        &config,
        &plugins,
        &handlers,
        PoolOptions {
            workers: args.workers,
            seed: args.seed,
            ..PoolOptions::default()
        },
    )?;
    let Some(entry) = pool.scheduler(0).cloned() else {
        anyhow::bail!("worker pool has no workers");
    };
    for warning in entry.graph().lint() {
        warn!("{warning}");
    }

    let shutdown = CancellationToken::new();
    let server = args.listen.map(|addr| {
        let scheduler = entry.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { server::serve(addr, scheduler, token).await })
    });

    let invocations = entry.activate(args.task.as_deref(), request).await?;
    let failed = invocations.iter().filter(|i| !i.is_ok()).count();
    println!("{}", serde_json::to_string_pretty(&invocations)?);
    info!(invocations = invocations.len(), failed, "activation finished");

    match server {
        Some(handle) => {
            info!("serving until ctrl-c");
            tokio::signal::ctrl_c().await?;
            shutdown.cancel();
            handle.await??;
        }
        None => tokio::time::sleep(Duration::from_millis(args.drain_ms)).await,
    }
    pool.shutdown().await;

    if failed > 0 {
        error!(failed, "some invocations failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn validate(args: ValidateArgs) -> anyhow::Result<()> {
    let _guard = init_tracing(&args.log.config())?;
    let config = GraphConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let graph = TaskGraph::build(
        &config,
        &PluginRegistry::with_builtins(),
        &HandlerRegistry::with_builtins(),
    )?;

    let warnings = graph.lint();
    if warnings.is_empty() {
        println!("Graph is valid: {} task(s)", graph.tasks().len());
    } else {
        for warning in &warnings {
            println!("warning: {warning}");
        }
        println!("Graph builds with {} warning(s)", warnings.len());
    }
    Ok(())
}
