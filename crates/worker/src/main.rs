mod processor;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use bucketd_daemon::controller::RowDispatch;
use bucketd_daemon::results::LocalResultStore;
use bucketd_daemon::store::PostgresTaskStore;
use bucketd_daemon::{Daemon, DaemonConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::time::MissedTickBehavior;

use processor::{WebhookConfig, WebhookProcessor};
use telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Values already in the environment win over .env
    let _ = dotenvy::dotenv();

    init_telemetry(TelemetryConfig::from_env());

    tracing::info!("bucketd-worker starting...");

    let config = match DaemonConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };
    let webhook = WebhookConfig::from_env()?;

    tracing::info!(
        table = %config.table,
        workers = config.worker_count,
        bucket_size = config.bucket_size,
        webhook = %webhook.url,
        "Starting daemon"
    );

    // Connections are opened on demand so an unreachable store at boot is
    // handled by the controller's probe loop.
    let pg = PgPoolOptions::new()
        .max_connections(max_db_connections(config.worker_count))
        .acquire_timeout(config.sleep_interval)
        .connect_lazy(&config.database_url)
        .context("Invalid DATABASE_URL")?;

    let processor = WebhookProcessor::new(webhook, &config)?;
    let builder = Daemon::builder(config.clone())
        .store(Arc::new(PostgresTaskStore::new(pg, config.table.clone())))
        .fetcher(Arc::new(RowDispatch(processor)))
        .result_store(Arc::new(LocalResultStore::new(config.results_db_path.clone())));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut daemon = tokio::select! {
        daemon = builder.start() => daemon.context("Failed to start daemon")?,
        _ = &mut shutdown => {
            tracing::info!("Received shutdown signal before startup completed");
            return Ok(());
        }
    };

    let mut ticker = tokio::time::interval(config.sleep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match daemon.run_once().await {
                    Ok(state) => tracing::debug!(%state, "Pass complete"),
                    Err(e) => tracing::error!(error = %e, "Pass failed"),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    daemon.shutdown().await;
    tracing::info!("Worker shutdown complete");
    Ok(())
}

/// One connection per worker plus headroom for the controller
fn max_db_connections(worker_count: usize) -> u32 {
    u32::try_from(worker_count)
        .unwrap_or(u32::MAX)
        .saturating_add(2)
}
