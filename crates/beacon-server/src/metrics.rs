//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const BROADCASTS_TOTAL: &str = "beacon_broadcasts_total";
    pub const MESSAGES_DROPPED: &str = "beacon_messages_dropped";
    pub const MESSAGES_DELIVERED: &str = "beacon_messages_delivered";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "beacon_subscriptions_active";
    pub const DISPATCH_ERRORS_TOTAL: &str = "beacon_dispatch_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::BROADCASTS_TOTAL,
        "Total number of batch broadcasts since start"
    );
    metrics::describe_gauge!(
        names::MESSAGES_DROPPED,
        "Messages evicted from full queues"
    );
    metrics::describe_gauge!(
        names::MESSAGES_DELIVERED,
        "Messages queued without eviction"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of subscriptions"
    );
    metrics::describe_counter!(
        names::DISPATCH_ERRORS_TOTAL,
        "Total number of failed dispatches"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a successful broadcast.
pub fn record_broadcast() {
    counter!(names::BROADCASTS_TOTAL).increment(1);
}

/// Record a dispatch failure.
pub fn record_dispatch_error() {
    counter!(names::DISPATCH_ERRORS_TOTAL).increment(1);
}

/// Publish the summed queue counters.
pub fn set_queue_counters(dropped: u64, delivered: u64) {
    gauge!(names::MESSAGES_DROPPED).set(dropped as f64);
    gauge!(names::MESSAGES_DELIVERED).set(delivered as f64);
}

/// Update the subscription count.
pub fn set_active_subscriptions(count: usize) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: calls are no-ops
        init_metrics();
        record_broadcast();
        record_dispatch_error();
        set_queue_counters(3, 7);
        set_active_subscriptions(2);
    }
}
