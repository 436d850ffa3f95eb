//! Probe module for ad-hoc connectivity checks.
//!
//! Supports HTTP, TCP, and DNS probes, plus single and batch dispatch.

mod dispatch;
mod dns;
mod http;
mod tcp;

pub use dispatch::*;
pub use dns::*;
pub use http::*;
pub use tcp::*;

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Hard budget for a single HTTP or TCP probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Classified HTTP probe failure.
///
/// The display form carries the failure kind as a prefix, e.g.
/// `"Timeout: ..."`, which is what the response pages show as body text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("TooManyRedirects: {0}")]
    TooManyRedirects(String),
    #[error("RequestException: {0}")]
    Request(String),
}

impl ProbeError {
    fn from_reqwest(err: &reqwest::Error) -> Self {
        let detail = report(err);
        if err.is_timeout() {
            ProbeError::Timeout(detail)
        } else if err.is_redirect() {
            ProbeError::TooManyRedirects(detail)
        } else {
            ProbeError::Request(detail)
        }
    }
}

/// Flatten an error and its sources into one line.
fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = err.to_string();
    while let Some(src) = err.source() {
        let src_text = src.to_string();
        if !s.ends_with(&src_text) {
            s.push_str(": ");
            s.push_str(&src_text);
        }
        err = src;
    }
    s
}

/// Input descriptor for one HTTP check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeTarget {
    /// Scheme to use; empty means https
    pub protocol: String,
    /// Host, optionally followed by a path and query string
    pub host: String,
    /// Extra query parameters, in order, keys may repeat
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
}

impl ProbeTarget {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// The protocol actually used, substituting https when none was given.
    pub fn effective_protocol(&self) -> &str {
        if self.protocol.is_empty() {
            "https"
        } else {
            &self.protocol
        }
    }

    /// The URL dispatched before query parameters are appended.
    pub fn url(&self) -> String {
        format!("{}://{}", self.effective_protocol(), self.host)
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body_text: String,
    /// Sub-second component of the elapsed time, in milliseconds
    pub elapsed_ms: f64,
    pub response_headers: BTreeMap<String, String>,
    /// Final URL after redirects; the persistence key
    pub resolved_url: String,
}

/// Result of executing one [`ProbeTarget`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Completed(HttpResponse),
    Failed(ProbeError),
}

impl ProbeOutcome {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProbeOutcome::Completed(r) => Some(r.status_code),
            ProbeOutcome::Failed(_) => None,
        }
    }

    /// Response body, or the classified error message on failure.
    pub fn body_text(&self) -> String {
        match self {
            ProbeOutcome::Completed(r) => r.body_text.clone(),
            ProbeOutcome::Failed(e) => e.to_string(),
        }
    }

    pub fn elapsed_ms(&self) -> Option<f64> {
        match self {
            ProbeOutcome::Completed(r) => Some(r.elapsed_ms),
            ProbeOutcome::Failed(_) => None,
        }
    }

    pub fn response_headers(&self) -> BTreeMap<String, String> {
        match self {
            ProbeOutcome::Completed(r) => r.response_headers.clone(),
            ProbeOutcome::Failed(_) => BTreeMap::new(),
        }
    }

    pub fn error(&self) -> Option<&ProbeError> {
        match self {
            ProbeOutcome::Completed(_) => None,
            ProbeOutcome::Failed(e) => Some(e),
        }
    }
}
