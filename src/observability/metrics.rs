// observability/metrics.rs - Prometheus Metrics

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Configuration for metrics
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Histogram buckets for handshake duration (in seconds)
    pub handshake_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            handshake_buckets: vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
        }
    }
}

/// Handle to the Prometheus recorder
#[derive(Clone)]
pub struct MetricsHandle {
    handle: PrometheusHandle,
}

impl MetricsHandle {
    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Trust graph metrics
pub struct TrustMetrics;

impl TrustMetrics {
    pub const SUBJECTS: &'static str = "peer_trust_subjects";
    pub const SUBJECTS_ADDED_TOTAL: &'static str = "peer_trust_subjects_added_total";
    pub const SUBJECTS_PURGED_TOTAL: &'static str = "peer_trust_subjects_purged_total";
    pub const SIGNATURES_REJECTED_TOTAL: &'static str = "peer_trust_signatures_rejected_total";
}

/// Handshake and sync metrics
pub struct ProtocolMetrics;

impl ProtocolMetrics {
    pub const HANDSHAKES_STARTED_TOTAL: &'static str = "peer_trust_handshakes_started_total";
    pub const HANDSHAKES_FINISHED_TOTAL: &'static str = "peer_trust_handshakes_finished_total";
    pub const HANDSHAKE_SECONDS: &'static str = "peer_trust_handshake_seconds";
    pub const SYNCS_TOTAL: &'static str = "peer_trust_syncs_total";
    pub const SYNC_ITEMS_TOTAL: &'static str = "peer_trust_sync_items_total";
    pub const MESSAGES_SENT_TOTAL: &'static str = "peer_trust_messages_sent_total";
    pub const MESSAGES_RECEIVED_TOTAL: &'static str = "peer_trust_messages_received_total";
}

fn builder(config: &MetricsConfig) -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(ProtocolMetrics::HANDSHAKE_SECONDS.into()),
        &config.handshake_buckets,
    )
}

/// Install the Prometheus recorder globally
///
/// No listener is started; callers scrape through [`MetricsHandle::render`].
pub fn init_metrics(config: MetricsConfig) -> Result<MetricsHandle, BuildError> {
    let handle = builder(&config)?.install_recorder()?;
    describe_metrics();

    tracing::info!("Metrics initialized");
    Ok(MetricsHandle { handle })
}

fn describe_metrics() {
    describe_gauge!(TrustMetrics::SUBJECTS, "Subjects currently in the trust graph");
    describe_counter!(TrustMetrics::SUBJECTS_ADDED_TOTAL, "Total subjects added");
    describe_counter!(
        TrustMetrics::SUBJECTS_PURGED_TOTAL,
        "Total subjects purged for lack of a valid trust path"
    );
    describe_counter!(
        TrustMetrics::SIGNATURES_REJECTED_TOTAL,
        "Total certificates dropped because they failed verification"
    );

    describe_counter!(ProtocolMetrics::HANDSHAKES_STARTED_TOTAL, "Total handshakes started");
    describe_counter!(
        ProtocolMetrics::HANDSHAKES_FINISHED_TOTAL,
        "Total handshakes finished, by outcome"
    );
    describe_histogram!(ProtocolMetrics::HANDSHAKE_SECONDS, "Handshake duration in seconds");
    describe_counter!(ProtocolMetrics::SYNCS_TOTAL, "Total sync bags applied");
    describe_counter!(ProtocolMetrics::SYNC_ITEMS_TOTAL, "Sync items processed, by result");
    describe_counter!(ProtocolMetrics::MESSAGES_SENT_TOTAL, "Protocol messages sent");
    describe_counter!(ProtocolMetrics::MESSAGES_RECEIVED_TOTAL, "Protocol messages received");
}

// Recording functions

pub fn set_subject_count(count: usize) {
    gauge!(TrustMetrics::SUBJECTS).set(count as f64);
}

pub fn record_subject_added() {
    counter!(TrustMetrics::SUBJECTS_ADDED_TOTAL).increment(1);
}

pub fn record_subject_purged() {
    counter!(TrustMetrics::SUBJECTS_PURGED_TOTAL).increment(1);
}

pub fn record_signature_rejected() {
    counter!(TrustMetrics::SIGNATURES_REJECTED_TOTAL).increment(1);
}

/// Record a handshake being started, by which side started it
pub fn record_handshake_started(role: &str) {
    counter!(ProtocolMetrics::HANDSHAKES_STARTED_TOTAL, "role" => role.to_string()).increment(1);
}

/// Record a handshake ending: accepted, rejected or failed
pub fn record_handshake_finished(outcome: &str, duration: Duration) {
    counter!(
        ProtocolMetrics::HANDSHAKES_FINISHED_TOTAL,
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        ProtocolMetrics::HANDSHAKE_SECONDS,
        "outcome" => outcome.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record the result counts of one applied sync bag
pub fn record_sync_applied(added: usize, rejected: usize) {
    counter!(ProtocolMetrics::SYNCS_TOTAL).increment(1);
    counter!(ProtocolMetrics::SYNC_ITEMS_TOTAL, "result" => "added").increment(added as u64);
    counter!(ProtocolMetrics::SYNC_ITEMS_TOTAL, "result" => "rejected").increment(rejected as u64);
}

pub fn record_message_sent(kind: &str) {
    counter!(ProtocolMetrics::MESSAGES_SENT_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_message_received(kind: &str) {
    counter!(ProtocolMetrics::MESSAGES_RECEIVED_TOTAL, "kind" => kind.to_string()).increment(1);
}
