//! TCP handshake probe.

use std::sync::Arc;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

use super::PROBE_TIMEOUT;
use crate::db::{PingHistory, PingRecord};
use crate::metrics::Metrics;

/// Result of a TCP handshake check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionOutcome {
    pub message: String,
    pub succeeded: bool,
}

/// Attempts connect-only handshakes and records every attempt.
pub struct TcpProber {
    history: PingHistory,
    metrics: Arc<Metrics>,
}

impl TcpProber {
    pub fn new(history: PingHistory, metrics: Arc<Metrics>) -> Self {
        Self { history, metrics }
    }

    /// Connect to `endpoint:port` and close straight away.
    ///
    /// Name resolution and every address attempt share one deadline. Both
    /// success and failure are persisted under `"<endpoint>:<port>"`.
    pub async fn execute(&self, endpoint: &str, port: u16) -> ConnectionOutcome {
        let deadline = Instant::now() + PROBE_TIMEOUT;
        let key = format!("{}:{}", endpoint, port);

        let attempt = match timeout_at(deadline, TcpStream::connect((endpoint, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timed out".to_string()),
        };

        let outcome = match attempt {
            Ok(()) => {
                tracing::info!(endpoint = %endpoint, port, "TCP handshake succeeded");
                self.history
                    .save(&key, PingRecord::new("tcp handshake success", "N/A"));
                ConnectionOutcome {
                    message: format!("Connection created to {} on port {}", endpoint, port),
                    succeeded: true,
                }
            }
            Err(detail) => {
                tracing::warn!(endpoint = %endpoint, port, error = %detail, "TCP handshake failed");
                self.history.save(
                    &key,
                    PingRecord::new(format!("tcp handshake failed: {}", detail), "N/A"),
                );
                ConnectionOutcome {
                    message: format!(
                        "Failed to connect to {} on port {}: {}",
                        endpoint, port, detail
                    ),
                    succeeded: false,
                }
            }
        };

        self.metrics.record_tcp_check(outcome.succeeded);
        outcome
    }
}
