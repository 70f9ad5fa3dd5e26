mod collector;
mod config;
mod error;
mod http;
mod kafka;
mod metrics;
#[cfg(test)]
mod test_cluster;

use crate::collector::exporter::{Exporter, ExporterOptions};
use crate::collector::pruner::Pruner;
use crate::config::Config;
use crate::http::server::HttpServer;
use crate::kafka::client::ZookeeperOffsets;
use crate::kafka::rd::{RdCluster, RdClusterFactory};
use crate::kafka::zookeeper::ZkOffsetStore;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "kmeter")]
#[command(about = "Kafka cluster telemetry collector with offset and time-based consumer lag metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("starting kmeter");

    let config = Config::load(Some(&args.config))?;
    info!(
        brokers = ?config.kafka.brokers,
        metadata_refresh_interval = ?config.exporter.metadata_refresh_interval,
        allow_concurrent = config.exporter.allow_concurrent,
        "configuration loaded"
    );

    let filters = config.filters.compile()?;
    let client = Arc::new(RdCluster::connect(&config)?);

    let zookeeper: Option<Arc<dyn ZookeeperOffsets>> = if config.zookeeper.enabled {
        info!(servers = ?config.zookeeper.servers, "zookeeper lag enabled");
        Some(Arc::new(ZkOffsetStore::connect(&config.zookeeper.servers).await?))
    } else {
        None
    };

    let exporter = Arc::new(Exporter::new(
        client,
        zookeeper,
        filters,
        ExporterOptions {
            labels: config.exporter.labels.clone(),
            metadata_refresh_interval: config.exporter.metadata_refresh_interval,
            offset_show_all: config.exporter.offset_show_all,
            topic_workers: config.exporter.topic_workers,
            allow_concurrent: config.exporter.allow_concurrent,
        },
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let pruner = Pruner::new(
        Arc::new(RdClusterFactory::new(config.clone())),
        exporter.timeline(),
        config.exporter.prune_interval,
        config.exporter.max_offsets,
    );
    let pruner_handle = tokio::spawn(pruner.run(shutdown_tx.subscribe()));

    let server = HttpServer::new(
        &config.exporter.http_host,
        config.exporter.http_port,
        Arc::clone(&exporter),
    )?;
    let shutdown_rx = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!(error = %e, "http server error");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, stopping");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;
    let _ = pruner_handle.await;

    info!("kmeter stopped");
    Ok(())
}

fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
