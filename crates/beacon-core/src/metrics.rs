//! Metrics hooks for Beacon.
//!
//! Instrumentation goes through the `metrics` facade; the embedding
//! application decides whether and how to export it.

use metrics::{counter, gauge};
use tracing::info;

/// Metric names.
pub mod names {
    pub const MESSAGES_PUBLISHED: &str = "beacon_messages_published_total";
    pub const MESSAGES_BYTES: &str = "beacon_messages_bytes_total";
    pub const DELIVERIES_TOTAL: &str = "beacon_deliveries_total";
    pub const DELIVERIES_SKIPPED: &str = "beacon_deliveries_skipped_total";
    pub const BACKPRESSURE_TOTAL: &str = "beacon_backpressure_total";
    pub const TASK_FAILURES: &str = "beacon_task_failures_total";
    pub const TOPICS_ACTIVE: &str = "beacon_topics_active";
    pub const SESSIONS_ACTIVE: &str = "beacon_sessions_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "beacon_subscriptions_total";
}

/// Describe every Beacon metric to the installed recorder.
pub fn init_metrics() {
    metrics::describe_counter!(names::MESSAGES_PUBLISHED, "Messages appended to topic logs");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Payload bytes appended to topic logs");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Publish frames handed to session outbound channels"
    );
    metrics::describe_counter!(
        names::DELIVERIES_SKIPPED,
        "Messages skipped because a cursor fell behind the log"
    );
    metrics::describe_counter!(
        names::BACKPRESSURE_TOTAL,
        "Deliveries deferred by a full in-flight window"
    );
    metrics::describe_counter!(names::TASK_FAILURES, "Delivery tasks that failed or panicked");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of topics");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of sessions");
    metrics::describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Subscriptions installed");

    info!("Metrics initialized");
}

/// Record a publish.
pub fn record_publish(bytes: usize) {
    counter!(names::MESSAGES_PUBLISHED).increment(1);
    counter!(names::MESSAGES_BYTES).increment(bytes as u64);
}

/// Record a delivery at the given QoS level.
pub fn record_delivery(qos: u8) {
    counter!(names::DELIVERIES_TOTAL, "qos" => qos.to_string()).increment(1);
}

/// Record messages a cursor skipped over.
pub fn record_skipped(count: u64) {
    counter!(names::DELIVERIES_SKIPPED).increment(count);
}

/// Record a delivery deferred by backpressure.
pub fn record_backpressure() {
    counter!(names::BACKPRESSURE_TOTAL).increment(1);
}

/// Record a failed delivery task.
pub fn record_task_failure(kind: &'static str) {
    counter!(names::TASK_FAILURES, "kind" => kind).increment(1);
}

/// Set the number of topics.
pub fn set_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Set the number of sessions.
pub fn set_sessions(count: usize) {
    gauge!(names::SESSIONS_ACTIVE).set(count as f64);
}

/// Record a new subscription.
pub fn record_subscription(shared: bool) {
    counter!(names::SUBSCRIPTIONS_TOTAL, "shared" => shared.to_string()).increment(1);
}
