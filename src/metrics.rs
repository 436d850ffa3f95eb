//! Prometheus metrics for Dinghy Ping.
//!
//! Metrics are fire-and-forget: recording never fails a request, and a
//! metric that cannot be registered is reported at start-up only.

use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};

/// Outcome label for HTTP checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCheckOutcome {
    Success,
    Timeout,
    Redirects,
    Exception,
}

impl HttpCheckOutcome {
    fn label(self) -> &'static str {
        match self {
            HttpCheckOutcome::Success => "success",
            HttpCheckOutcome::Timeout => "timeout",
            HttpCheckOutcome::Redirects => "redirects",
            HttpCheckOutcome::Exception => "exception",
        }
    }
}

/// All Dinghy Ping metrics, registered in their own registry.
pub struct Metrics {
    registry: Registry,

    /// HTTP checks (by outcome)
    pub http_checks: CounterVec,

    /// Time spent issuing an HTTP check, in seconds
    pub http_check_duration_seconds: Histogram,

    /// TCP handshake checks (by outcome)
    pub tcp_checks: CounterVec,

    /// DNS checks requested
    pub dns_checks: IntCounter,

    /// Relay sessions opened (by kind: logs, events)
    pub relay_sessions: CounterVec,

    /// Relay session lifetime, in seconds (by kind)
    pub relay_duration_seconds: HistogramVec,
}

impl Metrics {
    /// Create and register all metrics, tagging them with the environment.
    pub fn new(environment: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(
            Some("dinghy_ping".to_string()),
            Some([("environment".to_string(), environment.to_string())].into()),
        )?;

        let http_checks = CounterVec::new(
            Opts::new("http_checks_total", "Total HTTP connection checks"),
            &["outcome"],
        )?;
        let http_check_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "http_check_duration_seconds",
                "Time spent processing an HTTP connection check",
            )
            // 10ms to 5s, the probe deadline
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let tcp_checks = CounterVec::new(
            Opts::new("tcp_checks_total", "Total TCP handshake checks"),
            &["outcome"],
        )?;
        let dns_checks = IntCounter::new("dns_checks_total", "Total DNS checks")?;
        let relay_sessions = CounterVec::new(
            Opts::new("relay_sessions_total", "Total streaming relay sessions"),
            &["kind"],
        )?;
        let relay_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relay_duration_seconds",
                "Lifetime of streaming relay sessions",
            )
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0]),
            &["kind"],
        )?;

        registry.register(Box::new(http_checks.clone()))?;
        registry.register(Box::new(http_check_duration_seconds.clone()))?;
        registry.register(Box::new(tcp_checks.clone()))?;
        registry.register(Box::new(dns_checks.clone()))?;
        registry.register(Box::new(relay_sessions.clone()))?;
        registry.register(Box::new(relay_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            http_checks,
            http_check_duration_seconds,
            tcp_checks,
            dns_checks,
            relay_sessions,
            relay_duration_seconds,
        })
    }

    pub fn record_http_check(&self, outcome: HttpCheckOutcome) {
        self.http_checks.with_label_values(&[outcome.label()]).inc();
    }

    pub fn record_tcp_check(&self, succeeded: bool) {
        let outcome = if succeeded { "success" } else { "failed" };
        self.tcp_checks.with_label_values(&[outcome]).inc();
    }

    pub fn record_relay(&self, kind: &str, seconds: f64) {
        self.relay_sessions.with_label_values(&[kind]).inc();
        self.relay_duration_seconds
            .with_label_values(&[kind])
            .observe(seconds);
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_ok() {
            String::from_utf8(buffer).unwrap_or_default()
        } else {
            String::new()
        }
    }
}
