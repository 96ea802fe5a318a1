use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
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
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "relayd_http_requests_total",
            Unit::Count,
            "Total HTTP requests proxied"
        );
        describe_histogram!(
            "relayd_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_gauge!(
            "relayd_requests_in_flight",
            Unit::Count,
            "Number of requests currently being proxied"
        );

        // target health / lifecycle
        describe_counter!(
            "relayd_health_check_total",
            Unit::Count,
            "Total active health check attempts"
        );
        describe_gauge!(
            "relayd_target_healthy",
            Unit::Count,
            "Target health: 1=healthy 0=not healthy"
        );
        describe_counter!(
            "relayd_target_drains_total",
            Unit::Count,
            "Total target drains started"
        );

        // pause
        describe_counter!(
            "relayd_service_paused_total",
            Unit::Count,
            "Total times a service was paused"
        );
        describe_counter!(
            "relayd_service_stopped_total",
            Unit::Count,
            "Total times a service was stopped"
        );

        // reproxy / buffering
        describe_counter!(
            "relayd_reproxy_retries_total",
            Unit::Count,
            "Total reproxy retry attempts"
        );
        describe_counter!(
            "relayd_buffer_spilled_total",
            Unit::Count,
            "Total request buffers that spilled to disk"
        );

        // deployment
        describe_counter!(
            "relayd_deployments_total",
            Unit::Count,
            "Total deployments applied, by result"
        );
        describe_gauge!(
            "relayd_services_total",
            Unit::Count,
            "Number of services currently registered"
        );

        // connections
        describe_gauge!(
            "relayd_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "relayd_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
