//! The monitoring scheduler: owns per-task control loops and doubles as the
//! admin command surface for tasks and proxies.
//!
//! A small CLI parsed with `clap`, JSON-formatted `tracing` logs written to
//! a daily rolling file, and a daemon mode that installs a signal handler
//! and shuts down its background tasks gracefully within a bounded timeout.

mod admin;
mod recovery;
mod scheduler;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use shared::bus::Bus;
use shared::config::SystemConfig;
use shared::proxy_manager::ProxyManager;
use shared::store::Store;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scheduler", about = "Monitoring scheduler daemon and admin CLI")]
struct Cli {
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon (default when no subcommand is given).
    Run,
    #[command(subcommand)]
    Task(TaskCommand),
    #[command(subcommand)]
    Proxy(ProxyCommand),
    /// Print a snapshot of task and proxy counts.
    Status,
}

#[derive(Subcommand)]
enum TaskCommand {
    Create {
        owner_id: String,
        name: String,
        url: String,
        #[arg(long, default_value = "{}")]
        filters: String,
        #[arg(long, default_value_t = 300)]
        interval_seconds: i64,
    },
    List {
        #[arg(long)]
        owner_id: Option<String>,
    },
    Show {
        task_id: i64,
    },
    Activate {
        task_id: i64,
    },
    Deactivate {
        task_id: i64,
    },
    Delete {
        task_id: i64,
    },
    /// Delete found-item de-duplication records older than the given number
    /// of days. Disabled unless explicitly invoked.
    Prune {
        older_than_days: i64,
    },
}

#[derive(Subcommand)]
enum ProxyCommand {
    Register {
        endpoint: String,
    },
    List,
    Unblock {
        proxy_id: i64,
    },
    Deactivate {
        proxy_id: i64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match SystemConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config {}: {e}", cli.config);
            return ExitCode::from(2);
        }
    };

    let _log_guard = init_tracing(&config.log_dir);

    let store = Store::new(&config.database_path, Duration::from_secs(config.database_busy_timeout_seconds));
    if let Err(e) = store.migrate() {
        error!(error = %e, "failed to migrate database");
        return ExitCode::from(2);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(2);
        }
    };

    let outcome = runtime.block_on(dispatch(cli.command.unwrap_or(Command::Run), store, &config));

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::from(2)
        }
    }
}

async fn dispatch(command: Command, store: Store, config: &SystemConfig) -> shared::Result<()> {
    match command {
        Command::Run => run_daemon(store, config).await,
        Command::Status => admin::status(&store),
        Command::Task(cmd) => dispatch_task(cmd, &store),
        Command::Proxy(cmd) => {
            let manager = ProxyManager::new(store, Duration::from_secs(config.proxy_rate_limit_cooloff_seconds as u64));
            dispatch_proxy(cmd, &manager)
        }
    }
}

fn dispatch_task(command: TaskCommand, store: &Store) -> shared::Result<()> {
    match command {
        TaskCommand::Create { owner_id, name, url, filters, interval_seconds } => {
            admin::create_task(store, &owner_id, &name, &url, &filters, interval_seconds)
        }
        TaskCommand::List { owner_id } => admin::list_tasks(store, owner_id.as_deref()),
        TaskCommand::Show { task_id } => admin::show_task(store, task_id),
        TaskCommand::Activate { task_id } => admin::activate_task(store, task_id),
        TaskCommand::Deactivate { task_id } => admin::deactivate_task(store, task_id),
        TaskCommand::Delete { task_id } => admin::delete_task(store, task_id),
        TaskCommand::Prune { older_than_days } => admin::prune_found_items(store, older_than_days),
    }
}

fn dispatch_proxy(command: ProxyCommand, manager: &ProxyManager) -> shared::Result<()> {
    match command {
        ProxyCommand::Register { endpoint } => admin::register_proxy(manager, &endpoint),
        ProxyCommand::List => admin::list_proxies(manager),
        ProxyCommand::Unblock { proxy_id } => admin::unblock_proxy(manager, proxy_id),
        ProxyCommand::Deactivate { proxy_id } => admin::deactivate_proxy(manager, proxy_id),
    }
}

async fn run_daemon(store: Store, config: &SystemConfig) -> shared::Result<()> {
    info!("scheduler starting");

    let bus = Bus::new(store.clone());
    let task_scheduler = Arc::new(scheduler::TaskScheduler::new(
        store.clone(),
        bus,
        Duration::from_millis(config.scheduler_tick_interval_ms),
    ));

    let (shutdown_tx, _) = broadcast::channel(1);

    let scheduler_handle = {
        let task_scheduler = task_scheduler.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { task_scheduler.run(shutdown_rx).await })
    };

    let checkpoint_handle = {
        let store = store.clone();
        let interval = Duration::from_secs(config.wal_checkpoint_interval_seconds);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = store.checkpoint_wal() {
                            tracing::warn!(error = %e, "WAL checkpoint failed");
                        }
                    }
                }
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    let shutdown_timeout = Duration::from_secs(config.graceful_shutdown_timeout_seconds);
    let _ = tokio::time::timeout(shutdown_timeout, scheduler_handle).await;
    let _ = tokio::time::timeout(shutdown_timeout, checkpoint_handle).await;

    info!("scheduler stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_tracing(log_dir: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, "scheduler.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(non_blocking)
        .init();

    guard
}
