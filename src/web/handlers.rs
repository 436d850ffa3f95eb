//! HTTP request handlers for the probe pages and service endpoints.

use super::AppState;
use crate::probe::{parse_batch, parse_headers, parse_query, FormUrl, ProbeOutcome, ProbeTarget};

use axum::{
    body::Bytes,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Templates (placeholder substitution, values escaped before insertion)
// ============================================================================

const LAYOUT_TEMPLATE: &str = include_str!("templates/layout.html");
const INDEX_TEMPLATE: &str = include_str!("templates/index.html");
const PING_TEMPLATE: &str = include_str!("templates/ping_response.html");
const TCP_TEMPLATE: &str = include_str!("templates/tcp_response.html");
const DNS_TEMPLATE: &str = include_str!("templates/dns_info.html");

pub(crate) fn render_page(state: &AppState, title: &str, content: &str) -> Html<String> {
    Html(fill(
        LAYOUT_TEMPLATE,
        &[
            ("title", escape_html(title).as_str()),
            ("environment", escape_html(&state.config.environment).as_str()),
            ("content", content),
        ],
    ))
}

/// Substitute `{{name}}` placeholders in a single pass over `template`.
///
/// Inserted values are never scanned again, so placeholder-like text in a
/// value stays literal. Unknown placeholders are left as they are.
pub(crate) fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = match after.find("}}") {
            Some(end) => end,
            None => {
                rest = &rest[start..];
                break;
            }
        };
        let name = &after[..end];
        match values.iter().find(|(key, _)| *key == name) {
            Some((_, value)) => out.push_str(value),
            None => out.push_str(&rest[start..start + end + 4]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// True when the `Accept` header ranks JSON above HTML.
pub(crate) fn wants_json(headers: &HeaderMap) -> bool {
    let accept = match headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        Some(accept) => accept,
        None => return false,
    };

    let mut json_q = 0.0f32;
    let mut html_q = 0.0f32;
    for part in accept.split(',') {
        let mut params = part.split(';');
        let media = params.next().unwrap_or_default().trim().to_ascii_lowercase();
        let q = params
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|q| q.parse::<f32>().ok())
            .unwrap_or(1.0);
        match media.as_str() {
            "application/json" => json_q = json_q.max(q),
            "text/html" => html_q = html_q.max(q),
            _ => {}
        }
    }
    json_q > html_q
}

fn table_rows<'a>(rows: impl IntoIterator<Item = (&'a String, &'a String)>) -> String {
    rows.into_iter()
        .map(|(k, v)| {
            format!(
                "        <tr><td>{}</td><td>{}</td></tr>",
                escape_html(k),
                escape_html(v)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Landing page and service endpoints
// ============================================================================

pub async fn handle_index(State(state): State<AppState>) -> impl IntoResponse {
    let history = state.history.list_all();
    let content = fill(INDEX_TEMPLATE, &[("history_rows", table_rows(&history).as_str())]);
    render_page(&state, "Dinghy Ping", &content)
}

pub async fn handle_health() -> &'static str {
    "Ok"
}

pub async fn handle_history(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "history": state.history.list_all() }))
}

pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}

// ============================================================================
// HTTP checks
// ============================================================================

/// One HTTP check as returned to the caller.
#[derive(Debug, Serialize)]
pub struct PingView {
    pub request_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme_notes: Option<String>,
    pub domain_response_code: Option<u16>,
    pub domain_response_text: String,
    pub domain_response_time_ms: Option<f64>,
    pub domain_response_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_response_error: Option<String>,
}

impl PingView {
    fn new(request_url: String, scheme_notes: Option<String>, outcome: &ProbeOutcome) -> Self {
        Self {
            request_url,
            scheme_notes,
            domain_response_code: outcome.status_code(),
            domain_response_text: outcome.body_text(),
            domain_response_time_ms: outcome.elapsed_ms(),
            domain_response_headers: outcome.response_headers(),
            domain_response_error: outcome.error().map(ToString::to_string),
        }
    }

    fn render(self, state: &AppState, headers: &HeaderMap) -> Response {
        if wants_json(headers) {
            return Json(self).into_response();
        }

        let (code, status_class) = match self.domain_response_code {
            Some(code) if code < 400 => (code.to_string(), "ok"),
            Some(code) => (code.to_string(), "failed"),
            None => (String::new(), "failed"),
        };
        let time = self
            .domain_response_time_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_default();

        let content = fill(
            PING_TEMPLATE,
            &[
                ("request_url", escape_html(&self.request_url).as_str()),
                (
                    "scheme_notes",
                    escape_html(self.scheme_notes.as_deref().unwrap_or_default()).as_str(),
                ),
                ("status_class", status_class),
                ("response_code", code.as_str()),
                ("response_time", escape_html(&time).as_str()),
                ("header_rows", table_rows(&self.domain_response_headers).as_str()),
                ("response_text", escape_html(&self.domain_response_text).as_str()),
            ],
        );

        render_page(state, &format!("Ping {}", self.request_url), &content).into_response()
    }
}

pub async fn handle_ping(
    State(state): State<AppState>,
    Path((protocol, domain)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let query = query.as_deref().map(parse_query).unwrap_or_default();
    let target = ProbeTarget::new(protocol, domain).with_query(query);

    let outcome = state.dispatcher.ping(&target).await;
    PingView::new(target.url(), None, &outcome).render(&state, &headers)
}

pub async fn handle_ping_domains(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> impl IntoResponse {
    let query = query.as_deref().map(parse_query).unwrap_or_default();
    let entries = parse_batch(&body);
    tracing::info!(count = entries.len(), "Running batch HTTP check");

    let results = state.dispatcher.ping_batch(&entries, &query).await;
    Json(serde_json::json!({ "domains_response_results": results }))
}

#[derive(Debug, Deserialize)]
pub struct FormInputQuery {
    pub url: Option<String>,
    pub headers: Option<String>,
}

pub async fn handle_form_input(
    State(state): State<AppState>,
    Query(query): Query<FormInputQuery>,
    headers: HeaderMap,
) -> Response {
    let url = match query.url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => url,
        _ => return (StatusCode::BAD_REQUEST, "Missing url parameter").into_response(),
    };

    let form = FormUrl::parse(url);
    let notes = form.scheme_notes();
    let request_url = form.request_url();
    let target = form.into_target(parse_headers(query.headers.as_deref()));

    let outcome = state.dispatcher.ping(&target).await;
    PingView::new(request_url, Some(notes), &outcome).render(&state, &headers)
}

// ============================================================================
// TCP and DNS checks
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TcpCheckQuery {
    #[serde(rename = "tcp-endpoint")]
    pub endpoint: Option<String>,
    #[serde(rename = "tcp-port")]
    pub port: Option<String>,
}

pub async fn handle_tcp_check(
    State(state): State<AppState>,
    Query(query): Query<TcpCheckQuery>,
    headers: HeaderMap,
) -> Response {
    let endpoint = match query.endpoint.as_deref().map(str::trim) {
        Some(e) if !e.is_empty() => e,
        _ => return (StatusCode::BAD_REQUEST, "Missing tcp-endpoint parameter").into_response(),
    };
    let port = match query.port.as_deref().map(str::trim).map(str::parse::<u16>) {
        Some(Ok(port)) => port,
        _ => return (StatusCode::BAD_REQUEST, "Invalid tcp-port parameter").into_response(),
    };

    let outcome = state.tcp.execute(endpoint, port).await;
    let status = if outcome.succeeded {
        StatusCode::OK
    } else {
        StatusCode::PAYMENT_REQUIRED
    };

    if wants_json(&headers) {
        return (status, Json(outcome)).into_response();
    }

    let content = fill(
        TCP_TEMPLATE,
        &[
            ("status_class", if outcome.succeeded { "ok" } else { "failed" }),
            ("message", escape_html(&outcome.message).as_str()),
        ],
    );
    let title = format!("TCP {}:{}", endpoint, port);
    (status, render_page(&state, &title, &content)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DnsInfoQuery {
    pub domain: Option<String>,
    pub nameserver: Option<String>,
}

pub async fn handle_dns_info(
    State(state): State<AppState>,
    Query(query): Query<DnsInfoQuery>,
    headers: HeaderMap,
) -> Response {
    let domain = match query.domain.as_deref().map(str::trim) {
        Some(d) if !d.is_empty() => d,
        _ => return (StatusCode::BAD_REQUEST, "Missing domain parameter").into_response(),
    };
    let nameserver = query
        .nameserver
        .as_deref()
        .map(str::trim)
        .filter(|ns| !ns.is_empty());

    let report = match state.dns.check(domain, nameserver).await {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(domain = %domain, error = %e, "DNS check failed");
            return (
                StatusCode::BAD_GATEWAY,
                format!("DNS lookup for {} failed: {}", domain, e),
            )
                .into_response();
        }
    };

    if wants_json(&headers) {
        return Json(report).into_response();
    }

    let content = fill(
        DNS_TEMPLATE,
        &[
            ("domain", escape_html(&report.domain).as_str()),
            (
                "nameserver",
                escape_html(report.nameserver.as_deref().unwrap_or("system resolver")).as_str(),
            ),
            ("dns_a", escape_html(&report.a.to_string()).as_str()),
            ("dns_ns", escape_html(&report.ns.to_string()).as_str()),
            ("dns_mx", escape_html(&report.mx.to_string()).as_str()),
        ],
    );
    render_page(&state, &format!("DNS {}", report.domain), &content).into_response()
}

#[cfg(test)]
mod tests {
    use super::super::testing::{spawn, state};
    use super::*;
    use axum::{http::HeaderValue, routing::get, Router};

    async fn stub_server() -> std::net::SocketAddr {
        let app = Router::new().route("/status", get(|| async { "OK" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn json_client() -> reqwest::Client {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .unwrap()
    }

    #[test]
    fn test_wants_json() {
        let mut headers = HeaderMap::new();
        assert!(!wants_json(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert!(wants_json(&headers));

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,*/*;q=0.8"),
        );
        assert!(!wants_json(&headers));

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html;q=0.5, application/json"),
        );
        assert!(wants_json(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        assert!(!wants_json(&headers));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_fill_is_single_pass() {
        let template = "<h2>{{url}}</h2><pre>{{body}}</pre>{{unknown}}{{";
        let page = fill(template, &[("url", "/{{body}}"), ("body", "secret")]);
        assert_eq!(page, "<h2>/{{body}}</h2><pre>secret</pre>{{unknown}}{{");
    }

    #[tokio::test]
    async fn test_placeholder_in_url_stays_literal() {
        let stub = stub_server().await;
        let base = spawn(state(None)).await;

        let page = reqwest::Client::new()
            .get(format!("{}/form-input", base))
            .query(&[("url", format!("http://{}/status/{{{{content}}}}", stub))])
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(page.contains("<title>Ping http://"));
        assert!(page.contains("/status/{{content}}</title>"));
        assert!(page.contains("/status/{{content}}</h2>"));
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let base = spawn(state(None)).await;

        let health = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "Ok");

        let metrics = reqwest::get(format!("{}/metrics", base)).await.unwrap();
        assert_eq!(metrics.status(), 200);
        assert!(metrics.text().await.unwrap().contains("dinghy_ping_dns_checks_total"));
    }

    #[tokio::test]
    async fn test_ping_route_json_and_history() {
        let stub = stub_server().await;
        let base = spawn(state(None)).await;

        let resp = json_client()
            .get(format!("{}/ping/http/{}/status?probe=1", base, stub))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["domain_response_code"], 200);
        assert_eq!(body["domain_response_text"], "OK");
        assert_eq!(body["request_url"], format!("http://{}/status", stub));
        assert!(body["domain_response_time_ms"].as_f64().unwrap() < 1000.0);

        let history: serde_json::Value = reqwest::get(format!("{}/history", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let key = format!("http://{}/status?probe=1", stub);
        let summary = history["history"][key.as_str()].as_str().unwrap();
        assert!(summary.starts_with("code: 200 response time: "));
        assert!(summary.ends_with("ms"));
    }

    #[tokio::test]
    async fn test_ping_route_renders_html_failure() {
        let base = spawn(state(None)).await;

        let resp = reqwest::get(format!("{}/ping/http/127.0.0.1:{}/", base, closed_port()))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let page = resp.text().await.unwrap();
        assert!(page.contains("RequestException: "));
        assert!(page.contains("class=\"failed\""));
    }

    #[tokio::test]
    async fn test_batch_route() {
        let stub = stub_server().await;
        let base = spawn(state(None)).await;
        let client = reqwest::Client::new();

        let payload = serde_json::json!({"domains": [
            {"protocol": "http", "domain": format!("{}/status", stub), "headers": {"X-Probe": "yes"}},
            {"protocol": "http", "domain": format!("127.0.0.1:{}", closed_port())}
        ]});
        let body: serde_json::Value = client
            .post(format!("{}/ping/domains", base))
            .json(&payload)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let results = body["domains_response_results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["domain_response_code"], 200);
        assert!(results[1]["domain_response_code"].is_null());

        let empty: serde_json::Value = client
            .post(format!("{}/ping/domains", base))
            .body("")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(empty, serde_json::json!({"domains_response_results": []}));
    }

    #[tokio::test]
    async fn test_form_input() {
        let stub = stub_server().await;
        let base = spawn(state(None)).await;

        let missing = reqwest::get(format!("{}/form-input", base)).await.unwrap();
        assert_eq!(missing.status(), 400);

        let body: serde_json::Value = json_client()
            .get(format!("{}/form-input", base))
            .query(&[
                ("url", format!("http://{}/status?a=1", stub)),
                ("headers", "{not json".to_string()),
            ])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["scheme_notes"], "Scheme http provided");
        assert_eq!(body["request_url"], format!("http://{}/status", stub));
        assert_eq!(body["domain_response_code"], 200);
    }

    #[tokio::test]
    async fn test_tcp_check_statuses() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let base = spawn(state(None)).await;

        let ok = reqwest::get(format!(
            "{}/form-input-tcp-connection-test?tcp-endpoint=127.0.0.1&tcp-port={}",
            base, open
        ))
        .await
        .unwrap();
        assert_eq!(ok.status(), 200);
        assert!(ok.text().await.unwrap().contains("Connection created to 127.0.0.1"));

        let closed = closed_port();
        let failed = json_client()
            .get(format!(
                "{}/form-input-tcp-connection-test?tcp-endpoint=127.0.0.1&tcp-port={}",
                base, closed
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(failed.status(), 402);
        let body: serde_json::Value = failed.json().await.unwrap();
        assert_eq!(body["succeeded"], false);

        let bad_port = reqwest::get(format!(
            "{}/form-input-tcp-connection-test?tcp-endpoint=127.0.0.1&tcp-port=http",
            base
        ))
        .await
        .unwrap();
        assert_eq!(bad_port.status(), 400);

        let index = reqwest::get(format!("{}/", base)).await.unwrap().text().await.unwrap();
        assert!(index.contains(&format!("127.0.0.1:{}", closed)));
        assert!(index.contains("code: tcp handshake success response time: N/Ams"));
    }

    #[tokio::test]
    async fn test_dns_requires_domain() {
        let base = spawn(state(None)).await;
        let resp = reqwest::get(format!("{}/form-input-dns-info?nameserver=", base))
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }
}
