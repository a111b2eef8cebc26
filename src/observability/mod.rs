// observability/mod.rs - Tracing and Metrics

//! Observability module providing structured logging and Prometheus metrics.
//!
//! # Example
//!
//! ```ignore
//! use fipa_contract_net::observability::{init_tracing, init_metrics, MetricsConfig, TracingConfig};
//!
//! init_tracing(TracingConfig::default());
//! init_metrics(MetricsConfig::default())?;
//! ```

mod metrics;
mod tracing_setup;

pub use metrics::{
    init_metrics, record_handler_failure, record_message_dropped, record_message_received,
    record_message_sent, record_session_finished, record_session_started, MessageMetrics,
    MetricsConfig, SessionMetrics,
};

pub use tracing_setup::{init_tracing, try_init_tracing, TracingConfig, TracingFormat};
