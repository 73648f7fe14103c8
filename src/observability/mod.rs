// observability/mod.rs - Tracing and Metrics

//! Structured logging and Prometheus metrics.
//!
//! # Example
//!
//! ```no_run
//! use peer_trust::observability::{init_metrics, init_tracing, MetricsConfig, TracingConfig};
//!
//! init_tracing(TracingConfig::default()).unwrap();
//! let handle = init_metrics(MetricsConfig::default()).unwrap();
//! println!("{}", handle.render());
//! ```

mod metrics;
mod tracing_setup;

pub use metrics::{
    init_metrics, record_handshake_finished, record_handshake_started, record_message_received,
    record_message_sent, record_signature_rejected, record_subject_added, record_subject_purged,
    record_sync_applied, set_subject_count, MetricsConfig, MetricsHandle, ProtocolMetrics,
    TrustMetrics,
};

pub use tracing_setup::{init_tracing, TracingConfig, TracingFormat};
