// observability/metrics.rs - Prometheus Metrics

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Configuration for metrics
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Address to expose the metrics endpoint
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

/// Session-related metrics
pub struct SessionMetrics;

impl SessionMetrics {
    pub const STARTED_TOTAL: &'static str = "cnp_sessions_started_total";
    pub const FINISHED_TOTAL: &'static str = "cnp_sessions_finished_total";
    pub const ACTIVE: &'static str = "cnp_sessions_active";
    pub const HANDLER_FAILURES_TOTAL: &'static str = "cnp_handler_failures_total";
}

/// Message-related metrics
pub struct MessageMetrics;

impl MessageMetrics {
    pub const SENT_TOTAL: &'static str = "cnp_messages_sent_total";
    pub const RECEIVED_TOTAL: &'static str = "cnp_messages_received_total";
    pub const DROPPED_TOTAL: &'static str = "cnp_messages_dropped_total";
}

/// Install the Prometheus recorder with its HTTP listener.
///
/// Must be called from within a tokio runtime. Without a recorder every
/// `record_*` call below is a no-op.
pub fn init_metrics(config: MetricsConfig) -> Result<(), Box<dyn std::error::Error>> {
    PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .install()?;

    describe_counter!(SessionMetrics::STARTED_TOTAL, "Negotiation sessions started");
    describe_counter!(
        SessionMetrics::FINISHED_TOTAL,
        "Negotiation sessions finished, by terminal state"
    );
    describe_gauge!(SessionMetrics::ACTIVE, "Negotiation sessions currently registered");
    describe_counter!(
        SessionMetrics::HANDLER_FAILURES_TOTAL,
        "Agent callbacks that failed and moved their session to wtf"
    );
    describe_counter!(MessageMetrics::SENT_TOTAL, "Messages sent");
    describe_counter!(MessageMetrics::RECEIVED_TOTAL, "Messages received");
    describe_counter!(
        MessageMetrics::DROPPED_TOTAL,
        "Inbound messages dropped without a transition"
    );

    tracing::info!(addr = %config.listen_addr, "Metrics initialized");
    Ok(())
}

// Recording functions

pub fn record_session_started(role: &str, protocol: &str) {
    counter!(
        SessionMetrics::STARTED_TOTAL,
        "role" => role.to_string(),
        "protocol" => protocol.to_string()
    )
    .increment(1);
    gauge!(SessionMetrics::ACTIVE, "role" => role.to_string()).increment(1.0);
}

pub fn record_session_finished(role: &str, state: &str) {
    counter!(
        SessionMetrics::FINISHED_TOTAL,
        "role" => role.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
    gauge!(SessionMetrics::ACTIVE, "role" => role.to_string()).decrement(1.0);
}

pub fn record_handler_failure(role: &str) {
    counter!(SessionMetrics::HANDLER_FAILURES_TOTAL, "role" => role.to_string()).increment(1);
}

pub fn record_message_sent(kind: &str, fan_out: usize) {
    counter!(MessageMetrics::SENT_TOTAL, "kind" => kind.to_string()).increment(fan_out as u64);
}

pub fn record_message_received(kind: &str) {
    counter!(MessageMetrics::RECEIVED_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_message_dropped(reason: &str) {
    counter!(MessageMetrics::DROPPED_TOTAL, "reason" => reason.to_string()).increment(1);
}
