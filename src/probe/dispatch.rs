//! Request dispatch: single probes, batch probes, and input normalization.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{HttpProber, ProbeOutcome, ProbeTarget};

/// Parse a JSON object of header names to values.
///
/// Missing, blank or malformed input yields no headers. Non-string values
/// are kept in their JSON text form.
pub fn parse_headers(raw: Option<&str>) -> BTreeMap<String, String> {
    let raw = match raw.map(str::trim) {
        Some(r) if !r.is_empty() => r,
        _ => return BTreeMap::new(),
    };

    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => headers_from_value(value),
        Err(e) => {
            tracing::error!(error = %e, "Error decoding headers input");
            BTreeMap::new()
        }
    }
}

fn headers_from_value(value: serde_json::Value) -> BTreeMap<String, String> {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        serde_json::Value::Null => BTreeMap::new(),
        other => {
            tracing::error!(headers = %other, "Headers input is not a JSON object");
            BTreeMap::new()
        }
    }
}

/// Split a query string into ordered pairs.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// A URL typed into the HTTP check form.
#[derive(Debug, Clone, PartialEq)]
pub struct FormUrl {
    /// Scheme as typed; empty when none was given
    pub scheme: String,
    /// Host and path, without query or fragment
    pub location: String,
    pub query: Vec<(String, String)>,
}

impl FormUrl {
    /// Parse `scheme://host/path?query#fragment`; every part but the host
    /// is optional.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("", input),
        };
        let rest = rest.split('#').next().unwrap_or_default();
        let (location, query) = rest.split_once('?').unwrap_or((rest, ""));

        Self {
            scheme: scheme.to_ascii_lowercase(),
            location: location.to_string(),
            query: parse_query(query),
        }
    }

    /// Note shown alongside the response about which scheme was used.
    pub fn scheme_notes(&self) -> String {
        if self.scheme.is_empty() {
            "Scheme not given, defaulting to https".to_string()
        } else {
            format!("Scheme {} provided", self.scheme)
        }
    }

    /// The request URL as shown to the user.
    pub fn request_url(&self) -> String {
        format!("{}://{}", self.scheme, self.location)
    }

    pub fn into_target(self, headers: BTreeMap<String, String>) -> ProbeTarget {
        ProbeTarget {
            protocol: self.scheme,
            host: self.location,
            query: self.query,
            headers,
        }
    }
}

/// One entry of a batch request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchTarget {
    #[serde(default)]
    pub protocol: String,
    pub domain: String,
    #[serde(default)]
    pub headers: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    #[serde(default)]
    domains: Vec<BatchTarget>,
}

/// Parse a batch payload; an empty or malformed payload yields no targets.
pub fn parse_batch(body: &[u8]) -> Vec<BatchTarget> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Vec::new();
    }
    match serde_json::from_slice::<BatchRequest>(body) {
        Ok(req) => req.domains,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed batch payload");
            Vec::new()
        }
    }
}

/// Outcome of one batch entry, tagged with the entry as submitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub protocol: String,
    pub domain: String,
    pub domain_response_code: Option<u16>,
    pub domain_response_headers: BTreeMap<String, String>,
    pub domain_response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_response_error: Option<String>,
}

impl BatchResult {
    fn new(entry: &BatchTarget, outcome: &ProbeOutcome) -> Self {
        Self {
            protocol: entry.protocol.clone(),
            domain: entry.domain.clone(),
            domain_response_code: outcome.status_code(),
            domain_response_headers: outcome.response_headers(),
            domain_response_time_ms: outcome.elapsed_ms(),
            domain_response_error: outcome.error().map(ToString::to_string),
        }
    }
}

/// Forwards single and batch requests to the HTTP prober.
#[derive(Clone)]
pub struct Dispatcher {
    http: Arc<HttpProber>,
}

impl Dispatcher {
    pub fn new(http: Arc<HttpProber>) -> Self {
        Self { http }
    }

    /// Probe one target.
    pub async fn ping(&self, target: &ProbeTarget) -> ProbeOutcome {
        self.http.execute(target).await
    }

    /// Probe every entry in input order; one entry failing does not stop
    /// the rest.
    pub async fn ping_batch(
        &self,
        entries: &[BatchTarget],
        query: &[(String, String)],
    ) -> Vec<BatchResult> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let target = ProbeTarget::new(entry.protocol.clone(), entry.domain.clone())
                .with_query(query.to_vec())
                .with_headers(headers_from_value(entry.headers.clone()));
            let outcome = self.ping(&target).await;
            results.push(BatchResult::new(entry, &outcome));
        }
        results
    }
}
