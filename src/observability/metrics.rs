//! # Metrics
//!
//! Counters and histograms are recorded through the `metrics` facade wherever
//! the event happens. This module installs the Prometheus exporter and
//! describes the gateway metrics.
//!
//! | metric | kind | labels |
//! |---|---|---|
//! | `gateway_requests_total` | counter | api, status |
//! | `gateway_request_duration_seconds` | histogram | api |
//! | `gateway_in_flight_requests` | gauge | |
//! | `gateway_deployed_apis` | gauge | |
//! | `gateway_flows_executed_total` | counter | scope, phase |
//! | `gateway_flows_skipped_total` | counter | scope |
//! | `gateway_flow_duration_seconds` | histogram | scope |
//! | `gateway_condition_errors_total` | counter | |
//! | `gateway_endpoint_selections_total` | counter | group, endpoint |
//! | `gateway_endpoint_unavailable_total` | counter | group |
//! | `gateway_upstream_duration_seconds` | histogram | backend |
//! | `gateway_upstream_errors_total` | counter | backend |
//! | `gateway_messages_filtered_total` | counter | |

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tracing::info;

use crate::core::config::MetricsConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Latency buckets in seconds
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install the Prometheus exporter when metrics are enabled
///
/// Returns whether an exporter was installed. Must run inside the Tokio
/// runtime since the scrape listener is spawned on it.
pub fn install_metrics(config: &MetricsConfig) -> GatewayResult<bool> {
    if !config.enabled {
        return Ok(false);
    }

    let address: SocketAddr = config.address.parse().map_err(|e| {
        GatewayError::config(format!("invalid metrics address '{}': {}", config.address, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(address)
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| GatewayError::config(format!("Failed to set histogram buckets: {}", e)))?
        .install()
        .map_err(|e| GatewayError::internal(format!("Failed to install metrics exporter: {}", e)))?;

    describe_metrics();
    info!(%address, "Prometheus exporter listening");
    Ok(true)
}

fn describe_metrics() {
    describe_counter!("gateway_requests_total", "Requests handled, by API and status");
    describe_histogram!(
        "gateway_request_duration_seconds",
        Unit::Seconds,
        "Time from accepting a request to producing its response"
    );
    describe_gauge!("gateway_in_flight_requests", "Requests currently being handled");
    describe_gauge!("gateway_deployed_apis", "APIs active in the current deployment");
    describe_counter!("gateway_flows_executed_total", "Flows executed");
    describe_counter!("gateway_flows_skipped_total", "Flows skipped by their condition");
    describe_histogram!(
        "gateway_flow_duration_seconds",
        Unit::Seconds,
        "Time spent running the steps of one flow"
    );
    describe_counter!(
        "gateway_condition_errors_total",
        "Conditions that failed to evaluate"
    );
    describe_counter!("gateway_endpoint_selections_total", "Endpoints selected");
    describe_counter!(
        "gateway_endpoint_unavailable_total",
        "Selections that found no available endpoint"
    );
    describe_histogram!(
        "gateway_upstream_duration_seconds",
        Unit::Seconds,
        "Time until the backend response headers arrived"
    );
    describe_counter!("gateway_upstream_errors_total", "Backend requests that failed");
    describe_counter!(
        "gateway_messages_filtered_total",
        "Stream messages dropped by a message condition"
    );
}
