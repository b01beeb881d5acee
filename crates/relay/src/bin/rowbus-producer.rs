//! rowbus-producer: publish the rows of one configured job onto its queue.
//!
//! Looks the job up in the configuration store, runs its query on the source
//! database and publishes one persistent JSON message per row. Exits non-zero
//! when the job is unknown or any step fails; re-running is left to the
//! scheduler that invoked it.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use rowbus_core::config::{load_dotenv, load_dotenv_from};
use rowbus_core::Config;
use rowbus_queue::AmqpBroker;
use rowbus_relay::Producer;
use rowbus_store::{PgJobStore, PgSource};

// ── CLI ─────────────────────────────────────────────────────────────

/// Publish the result rows of a configured job to its RabbitMQ queue.
#[derive(Parser, Debug)]
#[command(name = "rowbus-producer", version, about)]
struct Cli {
    /// Name of the job in the configuration store.
    job_name: String,

    /// Read environment variables from this file instead of `./.env`.
    #[arg(long, env = "ROWBUS_ENV_FILE")]
    env_file: Option<PathBuf>,
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

    let config = Config::from_env().context("invalid configuration")?;
    config.log_summary();
    let settings = config
        .producer_settings()
        .context("producer configuration is incomplete")?;

    let jobs = PgJobStore::new(&settings.config_store, &settings.jobs_table);
    let source = PgSource::new(&settings.source).context("invalid source database settings")?;
    let broker = AmqpBroker::new(&settings.broker).context("invalid broker settings")?;

    let report = Producer::new(&jobs, &source, &broker)
        .run(&cli.job_name)
        .await
        .with_context(|| format!("job '{}' failed", cli.job_name))?;

    info!(
        job = %report.job,
        queue = %report.queue,
        published = report.published,
        "producer finished"
    );
    Ok(())
}
