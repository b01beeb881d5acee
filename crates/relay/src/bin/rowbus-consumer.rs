//! rowbus-consumer: feed queued rows into a stored procedure, forever.
//!
//! Subscribes to `QUEUE_NAME` with prefetch 1 and calls `PROCEDURE_NAME` once
//! per message inside a transaction, acknowledging only after commit. Lost
//! connections are re-established after a flat backoff. Stops on SIGINT or
//! SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use rowbus_core::config::{load_dotenv, load_dotenv_from};
use rowbus_core::Config;
use rowbus_queue::AmqpBroker;
use rowbus_relay::{Dispatcher, ReconnectSupervisor, SessionConnector};
use rowbus_store::PgTargetConnector;

// ── CLI ─────────────────────────────────────────────────────────────

/// Consume a RabbitMQ queue into a PostgreSQL stored procedure.
#[derive(Parser, Debug)]
#[command(name = "rowbus-consumer", version, about)]
struct Cli {
    /// Read environment variables from this file instead of `./.env`.
    #[arg(long, env = "ROWBUS_ENV_FILE")]
    env_file: Option<PathBuf>,
}

// ── signals ─────────────────────────────────────────────────────────

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to register signal handlers; falling back to ctrl_c");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for ctrl_c");
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    }
    info!("shutdown signal received");
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match &cli.env_file {
        Some(path) => load_dotenv_from(path)?,
        None => load_dotenv(),
    }

    let settings = match Config::from_env().and_then(|config| {
        config.log_summary();
        config.consumer_settings()
    }) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "consumer not started");
            return Err(e.into());
        }
    };

    let broker = Arc::new(AmqpBroker::new(&settings.broker)?);
    let targets = Arc::new(PgTargetConnector::new(
        &settings.target,
        &settings.procedure_name,
    ));
    let connector = SessionConnector::new(broker, targets, &settings.queue_name);
    let dispatcher = Dispatcher::new(&settings.queue_name, settings.failure_policy);

    info!(
        queue = %settings.queue_name,
        procedure = %settings.procedure_name,
        policy = ?settings.failure_policy,
        backoff = ?settings.reconnect_backoff,
        "starting consumer"
    );

    let stats = ReconnectSupervisor::new(connector, dispatcher, settings.reconnect_backoff)
        .run_until(shutdown_signal())
        .await;

    info!(
        acked = stats.acked,
        failed = stats.failed,
        dead_lettered = stats.dead_lettered,
        "consumer exited"
    );
    Ok(())
}
