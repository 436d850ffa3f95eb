//! Configuration module for Dinghy Ping.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite file backing the result store (default: "dinghy-ping.db")
    pub db_path: String,
    /// Number of log lines requested when tailing a pod (default: 100)
    pub tail_lines: u32,
    /// Number of characters kept when previewing deployment logs (default: 1000)
    pub logs_preview_length: usize,
    /// Deployment environment label (default: "none")
    pub environment: String,
    pub app_name: String,
    pub cluster_domain: String,
    /// Explicit Kubernetes API server, e.g. a `kubectl proxy` address
    pub kube_api: Option<String>,
    /// Skip building a cluster client entirely
    pub testing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "dinghy-ping.db".to_string(),
            tail_lines: 100,
            logs_preview_length: 1000,
            environment: "none".to_string(),
            app_name: "dinghy-ping".to_string(),
            cluster_domain: "localhost".to_string(),
            kube_api: None,
            testing: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DINGHY_PING_HTTP_PORT`: HTTP port (default: 8080)
    /// - `DINGHY_PING_DB_PATH`: Database file path (default: "dinghy-ping.db")
    /// - `DINGHY_PING_TAIL_LINES`: Pod log tail length (default: 100)
    /// - `DINGHY_PING_LOGS_PREVIEW`: Deployment log preview length (default: 1000)
    /// - `DINGHY_PING_ENVIRONMENT`: Environment label (default: "none")
    /// - `DINGHY_PING_APP_NAME`: Public app name (default: "dinghy-ping")
    /// - `DINGHY_PING_CLUSTER_DOMAIN`: Public cluster domain (default: "localhost")
    /// - `DINGHY_PING_KUBE_API`: Kubernetes API server URL (default: in-cluster)
    /// - `DINGHY_PING_TESTING`: Disable the cluster client (default: false)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("DINGHY_PING_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("DINGHY_PING_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(lines) = env::var("DINGHY_PING_TAIL_LINES") {
            if let Ok(lines) = lines.parse() {
                cfg.tail_lines = lines;
            }
        }

        if let Ok(preview) = env::var("DINGHY_PING_LOGS_PREVIEW") {
            if let Ok(preview) = preview.parse() {
                cfg.logs_preview_length = preview;
            }
        }

        if let Ok(environment) = env::var("DINGHY_PING_ENVIRONMENT") {
            cfg.environment = environment;
        }

        if let Ok(app_name) = env::var("DINGHY_PING_APP_NAME") {
            cfg.app_name = app_name;
        }

        if let Ok(domain) = env::var("DINGHY_PING_CLUSTER_DOMAIN") {
            cfg.cluster_domain = domain;
        }

        cfg.kube_api = env::var("DINGHY_PING_KUBE_API")
            .ok()
            .filter(|api| !api.trim().is_empty());

        if let Ok(testing) = env::var("DINGHY_PING_TESTING") {
            cfg.testing = parse_flag(&testing);
        }

        cfg
    }

    /// Public websocket host the relay pages connect back to.
    pub fn web_socket_host(&self) -> String {
        if self.cluster_domain == "localhost" {
            format!("ws://localhost:{}", self.http_port)
        } else {
            format!("wss://{}.{}:443", self.app_name, self.cluster_domain)
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
