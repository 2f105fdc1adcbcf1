//! # Prometheus Metrics
//!
//! Operational metrics of the relay node, scraped at the `/metrics`
//! HTTP endpoint on the configured metrics port. All metrics live in a
//! dedicated [`prometheus::Registry`] so they cannot collide with any
//! default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the relay node.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Prometheus registry that owns the metrics below.
    registry: Registry,
    /// Number of endpoints currently joined to the relay.
    pub network_size: IntGauge,
    /// Total number of membership changes observed since start.
    pub membership_changes_total: IntCounter,
}

impl RelayMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("stepswap".into()), None)
            .expect("failed to create prometheus registry");

        let network_size = IntGauge::new(
            "relay_network_size",
            "Number of endpoints currently joined to the relay",
        )
        .expect("metric creation");
        registry
            .register(Box::new(network_size.clone()))
            .expect("metric registration");

        let membership_changes_total = IntCounter::new(
            "relay_membership_changes_total",
            "Total membership changes (joins, takeovers, disconnects)",
        )
        .expect("metric creation");
        registry
            .register(Box::new(membership_changes_total.clone()))
            .expect("metric registration");

        Self {
            registry,
            network_size,
            membership_changes_total,
        }
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<RelayMetrics>;

/// Axum handler rendering `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
