//! Outpost - Delivery pipeline entry point

use anyhow::{Context, Result};
use outpost_common::config::{Config, LoggingConfig};
use outpost_core::{HttpProvider, PipelineBuilder, Repositories};
use outpost_storage::db::DatabasePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Outpost delivery pipeline...");

    // Initialize storage
    let repos = match config.database.backend.as_str() {
        "memory" => {
            warn!("Using in-memory storage; queued jobs are lost on restart");
            Repositories::in_memory()
        }
        _ => {
            let db_pool = DatabasePool::new(&config.database).await?;
            db_pool.migrate().await?;
            db_pool.health_check().await?;
            Repositories::postgres(db_pool)
        }
    };

    // Initialize provider
    let provider = Arc::new(HttpProvider::new(
        &config.provider,
        config.queue.provider_timeout(),
    )?);

    if config.webhook.signing_key.is_none() {
        warn!("webhook.signing_key is not set; every webhook will be rejected");
    }

    let pipeline = Arc::new(
        PipelineBuilder::new(config.clone(), repos, provider)
            .build()
            .await?,
    );

    let shutdown = CancellationToken::new();

    // Start delivery worker
    let worker_handle = {
        let worker = pipeline.worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            worker.run(shutdown).await;
        })
    };

    // Start maintenance loop
    let maintenance_handle = {
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            pipeline.run_maintenance(shutdown).await;
        })
    };

    info!(
        workers = config.queue.workers,
        provider = %config.provider.base_url,
        "Outpost started successfully"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    if let Err(e) = worker_handle.await {
        error!("Delivery worker task error: {}", e);
    }
    if let Err(e) = maintenance_handle.await {
        error!("Maintenance task error: {}", e);
    }

    match pipeline.queue.stats().await {
        Ok(stats) => info!(
            pending = stats.pending,
            sent = stats.sent,
            failed = stats.failed,
            dead_letter = stats.dead_letter,
            "Final queue state"
        ),
        Err(e) => warn!("Failed to read queue stats: {}", e),
    }

    info!("Outpost shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},outpost=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
