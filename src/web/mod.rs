//! Web server module.

mod cluster;
mod handlers;
mod stream;

use crate::cluster::ClusterApi;
use crate::config::ServerConfig;
use crate::db::PingHistory;
use crate::metrics::Metrics;
use crate::probe::{Dispatcher, DnsProber, TcpProber};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub dispatcher: Dispatcher,
    pub tcp: Arc<TcpProber>,
    pub dns: Arc<DnsProber>,
    pub history: PingHistory,
    /// Absent when no cluster client could be built
    pub cluster: Option<Arc<dyn ClusterApi>>,
    pub metrics: Arc<Metrics>,
}

/// Web server for Dinghy Ping.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

pub(crate) fn default_namespace() -> String {
    "default".to_string()
}

pub(crate) fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        // Landing page and service endpoints
        .route("/", get(handlers::handle_index))
        .route("/health", get(handlers::handle_health))
        .route("/history", get(handlers::handle_history))
        .route("/metrics", get(handlers::handle_metrics))
        // Probes
        .route("/ping/domains", post(handlers::handle_ping_domains))
        .route("/ping/{protocol}/{*domain}", get(handlers::handle_ping))
        .route("/form-input", get(handlers::handle_form_input))
        .route(
            "/form-input-tcp-connection-test",
            get(handlers::handle_tcp_check),
        )
        .route("/form-input-dns-info", get(handlers::handle_dns_info))
        // Cluster reads
        .route("/list-pods", get(cluster::handle_list_pods))
        .route("/get/namespaces", get(cluster::handle_namespaces))
        .route("/input-pod-logs", get(cluster::handle_pod_logs))
        .route("/pod-describe", get(cluster::handle_pod_describe))
        .route(
            "/api/pod-events/{namespace}/{pod}",
            get(cluster::handle_pod_events),
        )
        .route(
            "/deployment-logs/{namespace}/{name}",
            get(cluster::handle_deployment_logs),
        )
        .route("/get/deployments", get(cluster::handle_deployments))
        .route(
            "/get/deployment-details",
            get(cluster::handle_deployment_details),
        )
        .route("/get/pod-details", get(cluster::handle_pod_details))
        // Streaming relays
        .route("/input-pod-logs-stream", get(stream::handle_pod_logs_page))
        .route(
            "/event-stream/{namespace}/{filter}",
            get(stream::handle_events_page),
        )
        .route("/ws/logstream", get(stream::handle_logstream))
        .route("/ws/event-stream", get(stream::handle_event_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}
