//! HTTP probe implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;

use super::{HttpResponse, ProbeError, ProbeOutcome, ProbeTarget, PROBE_TIMEOUT};
use crate::db::{PingHistory, PingRecord};
use crate::metrics::{HttpCheckOutcome, Metrics};

/// Issues HTTP GET checks and records successful outcomes.
pub struct HttpProber {
    client: reqwest::Client,
    history: PingHistory,
    metrics: Arc<Metrics>,
}

impl HttpProber {
    pub fn new(history: PingHistory, metrics: Arc<Metrics>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(history, metrics, PROBE_TIMEOUT)
    }

    fn with_timeout(
        history: PingHistory,
        metrics: Arc<Metrics>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dinghy-ping/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            history,
            metrics,
        })
    }

    /// Run an HTTP check against the target.
    ///
    /// Failures are classified into the returned outcome; only completed
    /// exchanges are persisted.
    pub async fn execute(&self, target: &ProbeTarget) -> ProbeOutcome {
        let _timer = self.metrics.http_check_duration_seconds.start_timer();
        let url = target.url();

        let mut request = self.client.get(&url).query(&target.query);
        for (name, value) in &target.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let start = Instant::now();
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return self.fail(&url, ProbeError::from_reqwest(&e)),
        };
        let elapsed = start.elapsed();

        let status_code = response.status().as_u16();
        let resolved_url = response.url().to_string();
        let response_headers = flatten_headers(response.headers());

        let body_text = match response.text().await {
            Ok(body) => body,
            Err(e) => return self.fail(&url, ProbeError::from_reqwest(&e)),
        };

        // NOTE: only the sub-second part of the elapsed time is reported, so
        // requests slower than one second under-report their latency.
        let elapsed_ms = sub_second_millis(elapsed);

        self.metrics.record_http_check(HttpCheckOutcome::Success);
        tracing::info!(
            url = %resolved_url,
            status = status_code,
            elapsed_ms,
            "HTTP check completed"
        );

        self.history
            .save(&resolved_url, PingRecord::new(status_code, elapsed_ms));

        ProbeOutcome::Completed(HttpResponse {
            status_code,
            body_text,
            elapsed_ms,
            response_headers,
            resolved_url,
        })
    }

    fn fail(&self, url: &str, err: ProbeError) -> ProbeOutcome {
        let outcome = match err {
            ProbeError::Timeout(_) => HttpCheckOutcome::Timeout,
            ProbeError::TooManyRedirects(_) => HttpCheckOutcome::Redirects,
            ProbeError::Request(_) => HttpCheckOutcome::Exception,
        };
        self.metrics.record_http_check(outcome);
        tracing::warn!(url = %url, error = %err, "HTTP check failed");
        ProbeOutcome::Failed(err)
    }
}

/// Milliseconds within the current second of `elapsed`.
pub fn sub_second_millis(elapsed: Duration) -> f64 {
    elapsed.subsec_micros() as f64 / 1000.0
}

/// Collapse a header map to one value per name, joining repeats with ", ".
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RecordValue, Store};
    use axum::{http::HeaderMap as AxumHeaders, response::Redirect, routing::get, Router};
    use std::net::SocketAddr;

    async fn spawn_stub() -> SocketAddr {
        let app = Router::new()
            .route("/", get(|| async { "OK" }))
            .route(
                "/echo",
                get(|headers: AxumHeaders| async move {
                    headers
                        .get("x-probe")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("missing")
                        .to_string()
                }),
            )
            .route(
                "/query",
                get(|axum::extract::RawQuery(q): axum::extract::RawQuery| async move {
                    q.unwrap_or_default()
                }),
            )
            .route("/moved", get(|| async { Redirect::temporary("/") }))
            .route("/loop", get(|| async { Redirect::temporary("/loop") }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    "late"
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn prober(timeout: Duration) -> (HttpProber, PingHistory, Arc<Metrics>) {
        let history = PingHistory::new(Arc::new(Store::in_memory().unwrap()));
        let metrics = Arc::new(Metrics::new("test").unwrap());
        let prober = HttpProber::with_timeout(history.clone(), metrics.clone(), timeout).unwrap();
        (prober, history, metrics)
    }

    #[tokio::test]
    async fn test_success_is_recorded_by_resolved_url() {
        let addr = spawn_stub().await;
        let (prober, history, metrics) = prober(PROBE_TIMEOUT);

        let outcome = prober
            .execute(&ProbeTarget::new("http", addr.to_string()))
            .await;

        let response = match outcome {
            ProbeOutcome::Completed(r) => r,
            ProbeOutcome::Failed(e) => panic!("probe failed: {e}"),
        };
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body_text, "OK");
        assert!(response.elapsed_ms >= 0.0 && response.elapsed_ms < 1000.0);
        assert!(response.response_headers.contains_key("content-type"));
        assert_eq!(response.resolved_url, format!("http://{}/", addr));

        let record = history.get(&response.resolved_url).unwrap();
        assert_eq!(record.response_code, Some(RecordValue::Int(200)));
        assert_eq!(
            metrics.http_checks.with_label_values(&["success"]).get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_redirect_followed_and_final_url_recorded() {
        let addr = spawn_stub().await;
        let (prober, history, _) = prober(PROBE_TIMEOUT);

        let outcome = prober
            .execute(&ProbeTarget::new("http", format!("{}/moved", addr)))
            .await;

        assert_eq!(outcome.status_code(), Some(200));
        assert!(history.get(&format!("http://{}/", addr)).is_some());
        assert!(history.get(&format!("http://{}/moved", addr)).is_none());
    }

    #[tokio::test]
    async fn test_headers_and_query_forwarded() {
        let addr = spawn_stub().await;
        let (prober, _, _) = prober(PROBE_TIMEOUT);

        let mut headers = BTreeMap::new();
        headers.insert("X-Probe".to_string(), "dinghy".to_string());
        let outcome = prober
            .execute(&ProbeTarget::new("http", format!("{}/echo", addr)).with_headers(headers))
            .await;
        assert_eq!(outcome.body_text(), "dinghy");

        let query = vec![
            ("tag".to_string(), "a".to_string()),
            ("tag".to_string(), "b".to_string()),
        ];
        let outcome = prober
            .execute(&ProbeTarget::new("http", format!("{}/query?x=1", addr)).with_query(query))
            .await;
        assert_eq!(outcome.body_text(), "x=1&tag=a&tag=b");
    }

    #[tokio::test]
    async fn test_redirect_loop_classified() {
        let addr = spawn_stub().await;
        let (prober, history, metrics) = prober(PROBE_TIMEOUT);

        let outcome = prober
            .execute(&ProbeTarget::new("http", format!("{}/loop", addr)))
            .await;

        assert!(matches!(
            outcome,
            ProbeOutcome::Failed(ProbeError::TooManyRedirects(_))
        ));
        assert!(outcome.body_text().starts_with("TooManyRedirects: "));
        assert!(history.list_all().is_empty());
        assert_eq!(
            metrics.http_checks.with_label_values(&["redirects"]).get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_timeout_classified() {
        let addr = spawn_stub().await;
        let (prober, history, _) = prober(Duration::from_millis(200));

        let outcome = prober
            .execute(&ProbeTarget::new("http", format!("{}/slow", addr)))
            .await;

        assert!(matches!(outcome, ProbeOutcome::Failed(ProbeError::Timeout(_))));
        assert_eq!(outcome.status_code(), None);
        assert_eq!(outcome.elapsed_ms(), None);
        assert!(outcome.response_headers().is_empty());
        assert!(history.list_all().is_empty());
    }

    #[tokio::test]
    async fn test_connection_error_classified() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (prober, history, _) = prober(PROBE_TIMEOUT);
        let outcome = prober
            .execute(&ProbeTarget::new("http", addr.to_string()))
            .await;

        assert!(matches!(outcome, ProbeOutcome::Failed(ProbeError::Request(_))));
        assert!(outcome.body_text().starts_with("RequestException: "));
        assert!(history.list_all().is_empty());
    }

    #[test]
    fn test_sub_second_millis() {
        assert_eq!(sub_second_millis(Duration::from_micros(123_456)), 123.456);
        // Whole seconds are dropped
        assert_eq!(sub_second_millis(Duration::from_millis(2_250)), 250.0);
        assert!(sub_second_millis(Duration::from_secs(7)) < 1000.0);
    }
}
