use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use commit_engine::config::{IngestConfig, SinkType, load_config};
use commit_engine::source::KafkaSource;
use commit_engine::telemetry::init_tracing;
use commit_engine::{Connector, DeltaSink, Ingestor, MemorySink, Sink};

/// Entry point for a long-running ingestion job on container hosting
/// services like AWS EKS, ECS, etc.
///
/// Loads config from the path given as first argument, or from `INGEST_CONFIG`,
/// then consumes from kafka and commits batches to the configured sink until
/// SIGINT or SIGTERM, draining everything queued before exiting.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = load_config(path.as_deref())
        .await
        .context("Failed to load config")?;
    config.validate()?;

    let sink = build_sink(&config)?;
    let registry = Arc::new(config.registry());
    let connector = Connector::builder(registry, sink)
        .save_request_payloads(config.processing.save_request_payloads)
        .build();
    connector
        .prepare()
        .await
        .context("Failed to prepare batches")?;

    let source = KafkaSource::new(&config.source.options).await?;
    let mut ingestor = Ingestor::new(
        source,
        Arc::new(connector),
        Duration::from_millis(config.processing.commit_interval_ms),
    );

    info!(
        topics = ?config.source.options.topics,
        commit_interval_ms = config.processing.commit_interval_ms,
        "ingestion started"
    );
    let report = ingestor.run(wait_for_shutdown()).await?;
    info!(
        tasks = report.tasks_sent,
        rows = report.rows_sent,
        failed_batches = report.batches_failed,
        "ingestion finished"
    );
    Ok(())
}

fn build_sink(config: &IngestConfig) -> Result<Arc<dyn Sink>> {
    match config.sink.target_type {
        SinkType::Delta => {
            let options = config
                .sink
                .options
                .as_ref()
                .context("Delta sink requires options")?;
            Ok(Arc::new(DeltaSink::new(options)))
        }
        SinkType::Memory => Ok(Arc::new(MemorySink::new())),
    }
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
