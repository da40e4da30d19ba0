//! The parsing/notification worker: runs a pool of parsing workers and a
//! single result processor that together drain the check bus.
//!
//! Structured the same way as the scheduler binary: `clap` CLI, JSON
//! `tracing` logs to a daily rolling file, and a bounded graceful shutdown
//! driven by a `broadcast` channel.

mod processor;
mod worker;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use shared::bus::Bus;
use shared::config::SystemConfig;
use shared::fetcher::{HttpFetcher, JsonListingParser};
use shared::notifier::{LoggingNotifier, Notifier, WebhookNotifier};
use shared::proxy_manager::ProxyManager;
use shared::store::Store;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::processor::ResultProcessor;
use crate::worker::ParsingWorker;

#[derive(Parser)]
#[command(name = "worker", about = "Parsing worker and result processor daemon")]
struct Cli {
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker daemon (default when no subcommand is given).
    Run,
    /// Sweep both bus queues for expired leases and exit. Useful for manual
    /// recovery; the daemon also does this continuously in the background.
    ReclaimLeases,
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
        Command::ReclaimLeases => {
            let bus = Bus::new(store);
            let reclaimed = bus.reclaim_expired_leases()?;
            println!("reclaimed {reclaimed} expired lease(s)");
            Ok(())
        }
    }
}

fn build_notifier(config: &SystemConfig) -> shared::Result<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) => {
            let notifier = WebhookNotifier::new(url.clone(), Duration::from_secs(config.http_client_timeout_seconds))?;
            Ok(Arc::new(notifier))
        }
        None => Ok(Arc::new(LoggingNotifier)),
    }
}

async fn run_daemon(store: Store, config: &SystemConfig) -> shared::Result<()> {
    info!(worker_count = config.parsing_worker_count, "worker daemon starting");

    let bus = Bus::new(store.clone());
    let proxy_manager = ProxyManager::new(store.clone(), Duration::from_secs(config.proxy_rate_limit_cooloff_seconds as u64));
    let fetcher: Arc<dyn shared::fetcher::Fetcher> = Arc::new(HttpFetcher::new(
        Duration::from_secs(config.http_client_timeout_seconds),
        Box::new(JsonListingParser),
    ));
    let notifier = build_notifier(config)?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut handles = Vec::new();

    for index in 0..config.parsing_worker_count {
        let worker = ParsingWorker::new(
            bus.clone(),
            proxy_manager.clone(),
            fetcher.clone(),
            Duration::from_millis(config.bus_poll_interval_ms),
        );
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            info!(index, "parsing worker starting");
            worker.run(shutdown_rx).await;
        }));
    }

    {
        let processor = ResultProcessor::new(store.clone(), bus.clone(), notifier, Duration::from_millis(config.bus_poll_interval_ms));
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            processor.run(shutdown_rx).await;
        }));
    }

    let reclaim_handle = {
        let bus = bus.clone();
        let interval = Duration::from_secs(config.bus_redelivery_sweep_interval_seconds);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        match bus.reclaim_expired_leases() {
                            Ok(0) => {}
                            Ok(n) => info!(reclaimed = n, "reclaimed expired bus leases"),
                            Err(e) => tracing::warn!(error = %e, "failed to reclaim expired bus leases"),
                        }
                    }
                }
            }
        })
    };
    handles.push(reclaim_handle);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    let shutdown_timeout = Duration::from_secs(config.graceful_shutdown_timeout_seconds);
    for handle in handles {
        let _ = tokio::time::timeout(shutdown_timeout, handle).await;
    }

    info!("worker daemon stopped");
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
    let file_appender = tracing_appender::rolling::daily(log_dir, "worker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(non_blocking)
        .init();

    guard
}
