//! Dinghy Ping - ad-hoc connectivity checks and cluster inspection.
//!
//! Serves HTTP, TCP and DNS probes that record their outcomes, plus pod log
//! and event relays over websockets.

mod cluster;
mod config;
mod db;
mod metrics;
mod probe;
mod relay;
mod web;

use cluster::{ClusterApi, KubeClient};
use config::ServerConfig;
use db::{PingHistory, Store};
use metrics::Metrics;
use probe::{Dispatcher, DnsProber, HttpProber, TcpProber};
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("dinghy_ping=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Dinghy Ping on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize result store
    let store = Arc::new(Store::new(&cfg.db_path)?);
    let history = PingHistory::new(store);
    tracing::info!("Database initialized successfully");

    let metrics = Arc::new(Metrics::new(&cfg.environment)?);

    // Probe executors share the history and metrics handles
    let http = Arc::new(HttpProber::new(history.clone(), metrics.clone())?);
    let dispatcher = Dispatcher::new(http);
    let tcp = Arc::new(TcpProber::new(history.clone(), metrics.clone()));
    let dns = Arc::new(DnsProber::new(history.clone(), metrics.clone()));

    let cluster: Option<Arc<dyn ClusterApi>> = if cfg.testing {
        tracing::info!("Testing mode, cluster routes disabled");
        None
    } else {
        match KubeClient::from_config(&cfg) {
            Ok(client) => {
                let client: Arc<dyn ClusterApi> = Arc::new(client);
                Some(client)
            }
            Err(e) => {
                tracing::error!("Cluster client unavailable: {}", e);
                None
            }
        }
    };

    let server = Server::new(AppState {
        config: cfg,
        dispatcher,
        tcp,
        dns,
        history,
        cluster,
        metrics,
    });
    server.start().await?;

    Ok(())
}
