use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use jsclaw_core::load_config;
use tracing::info;

use jsclawd::container::runner::{cleanup_orphans, ensure_runtime_available};
use jsclawd::ipc::{IpcWatcher, IpcWatcherConfig, LogOnlyDelegate};
use jsclawd::queue::{DEFAULT_SHUTDOWN_GRACE_MS, GroupQueue};

#[derive(Parser, Debug)]
#[command(name = "jsclawd", version, about = "jsclaw container-agent orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon: group queue plus IPC watcher.
    Serve(ServeArgs),
    /// Print the effective configuration as JSON.
    PrintConfig(PrintConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "jsclaw.toml")]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "jsclaw.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("jsclaw.toml"),
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
    }
}

fn init_tracing() {
    let default_level =
        std::env::var("JSCLAW_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let runtime_bin = config.container_runtime.as_str();
    ensure_runtime_available(runtime_bin).await?;
    cleanup_orphans(runtime_bin).await;

    let queue = Arc::new(GroupQueue::new(&config));
    let watcher = IpcWatcher::new(
        IpcWatcherConfig {
            data_dir: config.data_dir.clone(),
            poll_interval: Duration::from_millis(config.ipc_poll_interval_ms),
        },
        Arc::new(LogOnlyDelegate),
    );
    let watcher_handle = watcher.start()?;

    info!(
        runtime = runtime_bin,
        image = %config.container_image,
        max_concurrent = config.max_concurrent_containers,
        "jsclawd running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    watcher_handle.stop();
    queue.shutdown(DEFAULT_SHUTDOWN_GRACE_MS).await;
    Ok(())
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
