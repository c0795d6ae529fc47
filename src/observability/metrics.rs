//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define control plane metrics (packets, sessions, families, scaling)
//! - Expose a Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `magiclink_packets_received_total` (counter): by identification, outcome
//! - `magiclink_packets_published_total` (counter): by identification
//! - `magiclink_sessions_active` (gauge): registered loaders
//! - `family_members` / `family_locked_members` (gauge): by family
//! - `family_selections_total` (counter): by family, outcome
//! - `scaling_recommendations_total` (counter): by family, action
//! - `transport_state_changes_total` (counter): by state

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_packet_received(identification: &str, outcome: &'static str) {
    counter!(
        "magiclink_packets_received_total",
        "identification" => identification.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_packet_published(identification: &str) {
    counter!(
        "magiclink_packets_published_total",
        "identification" => identification.to_string()
    )
    .increment(1);
}

pub fn record_active_sessions(count: usize) {
    gauge!("magiclink_sessions_active").set(count as f64);
}

pub fn record_family_members(family: &str, members: usize, locked: usize) {
    gauge!("family_members", "family" => family.to_string()).set(members as f64);
    gauge!("family_locked_members", "family" => family.to_string()).set(locked as f64);
}

pub fn record_selection(family: &str, outcome: &'static str) {
    counter!(
        "family_selections_total",
        "family" => family.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_scaling_recommendation(family: &str, action: &'static str) {
    counter!(
        "scaling_recommendations_total",
        "family" => family.to_string(),
        "action" => action
    )
    .increment(1);
}

pub fn record_transport_state(state: &'static str) {
    counter!("transport_state_changes_total", "state" => state).increment(1);
}
