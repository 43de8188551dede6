//! BENIRAGE monitor: command-line front end for the realtime resilience layer.
//!
//! Reads `SUPABASE_URL` and `SUPABASE_ANON_KEY` from the environment. Set
//! `RUST_LOG=info` (or `debug`) to see the connection manager's logs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use benirage_realtime::{
    BackendConfig, ConnectionConfig, ConnectionEvent, ConnectionManager, Diagnostics,
    DiagnosticsConfig, HttpProbe, NetworkMonitor, OfflineQueue, QueuePolicy, RocksQueueStore,
    StoreConfig, SupabaseBackend,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every connectivity check and print the health report
    Diagnose {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Time a small request against the backend
    Speed,
    /// Keep a realtime connection open and print row changes
    Watch {
        /// Tables to subscribe to
        #[arg(short, long, default_values_t = vec!["messages".to_string()])]
        table: Vec<String>,
        /// Optional row filter, e.g. `room_id=eq.42`
        #[arg(short, long)]
        filter: Option<String>,
        /// host:port polled to detect network loss
        #[arg(long, default_value = "1.1.1.1:443")]
        reachability: String,
    },
    /// Inspect or replay the persistent offline queue
    Queue {
        /// Queue database directory
        #[arg(long, default_value = "benirage_queue")]
        path: PathBuf,
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Pending operations per target
    Status,
    /// Replay pending operations against the backend once
    Drain,
    /// Discard pending operations
    Clear {
        /// Only this target (default: everything)
        target: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Diagnose { json } => diagnose(json).await,
        Command::Speed => speed().await,
        Command::Watch {
            table,
            filter,
            reachability,
        } => watch(table, filter, reachability).await,
        Command::Queue { path, action } => queue(path, action).await,
    }
}

fn backend_config() -> Result<BackendConfig> {
    BackendConfig::from_env().context("backend configuration")
}

async fn diagnose(json: bool) -> Result<()> {
    let config = backend_config()?;
    let backend = Arc::new(SupabaseBackend::new(config.clone())?);
    let manager = ConnectionManager::new(backend, ConnectionConfig::default());
    if let Err(e) = manager.connect().await {
        log::warn!("Realtime connection unavailable: {e}");
    }

    let diagnostics_config = DiagnosticsConfig::default();
    let probe = HttpProbe::new(config, diagnostics_config.clone())?;
    let diagnostics =
        Diagnostics::new(probe, diagnostics_config).with_connection(manager.watch_state());
    let result = diagnostics.run_diagnostics().await;
    manager.cleanup().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    for check in &result.checks {
        let mark = if check.passed { "ok  " } else { "FAIL" };
        println!(
            "[{mark}] {:<10} {:>5}ms  {}",
            check.check.as_str(),
            check.elapsed_ms,
            check.detail
        );
    }
    println!(
        "\n{}/{} checks passed ({}%): {:?}",
        result.passed, result.total, result.health_percent, result.overall
    );
    for recommendation in &result.recommendations {
        println!("  - {recommendation}");
    }
    Ok(())
}

async fn speed() -> Result<()> {
    let config = DiagnosticsConfig::default();
    let diagnostics = Diagnostics::new(HttpProbe::new(backend_config()?, config.clone())?, config);
    let speed = diagnostics.test_network_speed().await;
    match speed.latency_ms {
        Some(ms) => println!("{ms}ms ({:?})", speed.rating),
        None => println!("backend unreachable"),
    }
    Ok(())
}

async fn watch(tables: Vec<String>, filter: Option<String>, reachability: String) -> Result<()> {
    let backend = Arc::new(SupabaseBackend::new(backend_config()?)?);
    let manager = ConnectionManager::new(backend, ConnectionConfig::default());

    let _events = manager.add_callback(|event| match event {
        ConnectionEvent::StateChanged { state, message } => println!("* {state}: {message}"),
        ConnectionEvent::Error { kind, message } => println!("! {kind}: {message}"),
        ConnectionEvent::ReconnectAttempt { attempt, delay } => {
            println!("~ reconnect attempt {attempt} in {}ms", delay.as_millis())
        }
    });

    let network = NetworkMonitor::new(true);
    let stop = CancellationToken::new();
    let _poller = network.watch_reachability(
        reachability,
        Duration::from_secs(10),
        Duration::from_secs(3),
        stop.clone(),
    );
    let _forwarder = manager.watch_network(&network);

    let mut subscriptions = Vec::new();
    for table in &tables {
        let subscription = manager
            .subscribe_to_table(table, filter.as_deref(), |change| {
                println!(
                    "{:?} {}.{}: {}",
                    change.event_type, change.schema, change.table, change.record
                );
            })
            .await;
        subscriptions.push(subscription);
    }

    if let Err(e) = manager.connect().await {
        log::warn!("Initial connect failed, retrying in the background: {e}");
    }

    tokio::signal::ctrl_c().await?;
    stop.cancel();
    manager.cleanup().await;
    Ok(())
}

async fn queue(path: PathBuf, action: QueueAction) -> Result<()> {
    let store = RocksQueueStore::open(StoreConfig {
        path,
        ..StoreConfig::default()
    })?;
    let queue = OfflineQueue::open(store, QueuePolicy::chat())?;

    match action {
        QueueAction::Status => {
            let targets = queue.targets();
            if targets.is_empty() {
                println!("queue is empty");
            }
            for target in targets {
                let pending = queue.pending(&target);
                let retried = pending.iter().filter(|op| op.retry_count > 0).count();
                println!("{target}: {} pending ({retried} retried)", pending.len());
            }
        }
        QueueAction::Drain => {
            let backend = SupabaseBackend::new(backend_config()?)?;
            let report = queue.drain(&backend).await?;
            println!(
                "replayed {}, retained {}, dropped {}",
                report.replayed,
                report.retained,
                report.dropped.len()
            );
            for op in &report.dropped {
                println!("  dropped {} for {}: {}", op.id, op.target, op.payload);
            }
        }
        QueueAction::Clear { target } => {
            let removed = match target {
                Some(target) => queue.clear(&target)?,
                None => queue.clear_all()?,
            };
            println!("removed {removed} operation(s)");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_queue_clear_parses_target() {
        let cli = Cli::parse_from(["benirage-monitor", "queue", "--path", "/tmp/q", "clear", "messages"]);
        match cli.command {
            Command::Queue {
                path,
                action: QueueAction::Clear { target },
            } => {
                assert_eq!(path, PathBuf::from("/tmp/q"));
                assert_eq!(target.as_deref(), Some("messages"));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_watch_defaults() {
        let cli = Cli::parse_from(["benirage-monitor", "watch"]);
        match cli.command {
            Command::Watch { table, filter, .. } => {
                assert_eq!(table, vec!["messages".to_string()]);
                assert!(filter.is_none());
            }
            _ => panic!("wrong command"),
        }
    }
}
