//! Prometheus metrics collection.
//!
//! Provides runtime metrics in Prometheus format.

use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::state::AppState;

/// HTTP request labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    pub method: String,
    /// Route template, not the raw path, to bound cardinality.
    pub route: String,
    pub status: u16,
}

/// Fragment invocation labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InvocationLabels {
    /// Extension point: script, event_listener, hook, controller, widget.
    pub kind: String,
    pub outcome: String,
}

/// Contained failure labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub kind: String,
    pub cause: String,
}

/// Runtime metrics.
pub struct Metrics {
    registry: Registry,

    /// HTTP request counter by method/route/status.
    pub http_requests: Family<HttpLabels, Counter>,

    /// HTTP request duration histogram.
    pub http_duration_seconds: Family<HttpLabels, Histogram>,

    /// Compiled-unit cache hits.
    pub compile_cache_hits: Counter,

    /// Compiled-unit cache misses (fresh compiles).
    pub compile_cache_misses: Counter,

    /// Fragments that failed to compile.
    pub compile_errors: Counter,

    /// Fragment invocation duration by extension point and outcome.
    pub invocation_duration_seconds: Family<InvocationLabels, Histogram>,

    /// Contained failures by taxonomy kind and cause.
    pub failures: Family<FailureLabels, Counter>,
}

impl Metrics {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests = Family::<HttpLabels, Counter>::default();
        registry.register(
            "http_requests",
            "Total HTTP requests",
            http_requests.clone(),
        );

        let http_duration_seconds = Family::<HttpLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 12))
        });
        registry.register(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
            http_duration_seconds.clone(),
        );

        let compile_cache_hits = Counter::default();
        registry.register(
            "plugin_compile_cache_hits",
            "Compiled fragment cache hits",
            compile_cache_hits.clone(),
        );

        let compile_cache_misses = Counter::default();
        registry.register(
            "plugin_compile_cache_misses",
            "Compiled fragment cache misses",
            compile_cache_misses.clone(),
        );

        let compile_errors = Counter::default();
        registry.register(
            "plugin_compile_errors",
            "Fragments that failed to compile",
            compile_errors.clone(),
        );

        let invocation_duration_seconds =
            Family::<InvocationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.0001, 2.0, 14))
            });
        registry.register(
            "plugin_invocation_duration_seconds",
            "Plugin fragment invocation duration in seconds",
            invocation_duration_seconds.clone(),
        );

        let failures = Family::<FailureLabels, Counter>::default();
        registry.register(
            "plugin_failures",
            "Contained plugin failures",
            failures.clone(),
        );

        Self {
            registry,
            http_requests,
            http_duration_seconds,
            compile_cache_hits,
            compile_cache_misses,
            compile_errors,
            invocation_duration_seconds,
            failures,
        }
    }

    /// Record an HTTP request.
    pub fn record_request(&self, method: &str, route: &str, status: u16, duration_secs: f64) {
        let labels = HttpLabels {
            method: method.to_string(),
            route: route.to_string(),
            status,
        };

        self.http_requests.get_or_create(&labels).inc();
        self.http_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_cache_hit(&self) {
        self.compile_cache_hits.inc();
    }

    pub fn record_cache_miss(&self) {
        self.compile_cache_misses.inc();
    }

    pub fn record_compile_error(&self) {
        self.compile_errors.inc();
    }

    /// Record one fragment invocation.
    pub fn record_invocation(&self, kind: &str, ok: bool, duration_secs: f64) {
        let labels = InvocationLabels {
            kind: kind.to_string(),
            outcome: if ok { "ok" } else { "error" }.to_string(),
        };
        self.invocation_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a contained failure.
    pub fn record_failure(&self, kind: &str, cause: &str) {
        let labels = FailureLabels {
            kind: kind.to_string(),
            cause: cause.to_string(),
        };
        self.failures.get_or_create(&labels).inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Panics
    ///
    /// Panics if Prometheus metric encoding to a `String` buffer fails.
    /// The `fmt::Write` impl for `String` is infallible.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        #[allow(clippy::expect_used)]
        encode(&mut buffer, &self.registry).expect("encoding metrics");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}

/// Middleware recording request count and latency per route template.
pub async fn track_http(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());

    let response = next.run(request).await;

    state.metrics().record_request(
        &method,
        &route,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        let output = metrics.encode();
        assert!(output.contains("plugin_compile_cache_hits"));
        assert!(output.contains("plugin_compile_errors"));
    }

    #[test]
    fn test_record_failure() {
        let metrics = Metrics::new();
        metrics.record_failure("listener", "thrown");

        let output = metrics.encode();
        assert!(output.contains("plugin_failures_total{kind=\"listener\",cause=\"thrown\"} 1"));
    }

    #[test]
    fn test_record_invocation() {
        let metrics = Metrics::new();
        metrics.record_invocation("controller", true, 0.002);

        let output = metrics.encode();
        assert!(output.contains("plugin_invocation_duration_seconds"));
    }
}
