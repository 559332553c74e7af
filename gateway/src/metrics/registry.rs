use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Rule evaluations are bounded by the evaluator timeout, so the interesting
/// range is well under a second.
const RULE_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.05, 0.1, 0.5,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup, before traffic is accepted.
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("gateway_http_request_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Full("gateway_upstream_request_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Full("guard_rule_duration_seconds".to_string()),
                RULE_BUCKETS,
            )?
            .install_recorder()?;

        // request path
        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed, by final stage"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "gateway_upstream_request_duration_seconds",
            Unit::Seconds,
            "Time spent waiting for the site upstream"
        );
        describe_gauge!(
            "gateway_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );

        // admission
        describe_counter!(
            "guard_decisions_total",
            Unit::Count,
            "Policy decisions by policy, conclusion and reason"
        );
        describe_counter!(
            "guard_dry_run_denials_total",
            Unit::Count,
            "Denials observed but not enforced by DRY_RUN policies"
        );
        describe_counter!(
            "guard_rule_errors_total",
            Unit::Count,
            "Rule evaluations that failed or timed out (failed open)"
        );
        describe_histogram!(
            "guard_rule_duration_seconds",
            Unit::Seconds,
            "Duration of a single rule evaluation"
        );
        describe_counter!(
            "gateway_auth_failures_total",
            Unit::Count,
            "Protected route requests without a valid session"
        );

        // limiter state
        describe_gauge!(
            "guard_limiter_buckets",
            Unit::Count,
            "Token buckets currently held per policy"
        );
        describe_counter!(
            "guard_limiter_evictions_total",
            Unit::Count,
            "Token buckets evicted for idleness or capacity"
        );

        // connections
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Ok(Self { handle })
    }

    /// Handle backed by a recorder that is not installed globally.
    ///
    /// Renders only what is recorded through it directly, so nothing; used
    /// where a `Metrics` is needed without owning the process recorder.
    pub fn standalone() -> Self {
        Self {
            handle: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
