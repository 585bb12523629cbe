//! Prometheus metrics for the broker.
//!
//! Provides observability into producer throughput, handler outcomes, and
//! the maintenance loops.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");
        info!("Prometheus metrics initialized");
        handle
    });
}

/// Get the Prometheus handle for rendering metrics.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus exposition format.
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Record a task appended to a stream (or the scheduled set).
pub fn record_enqueued(stream: &str) {
    counter!(
        "backstage_tasks_enqueued_total",
        "stream" => stream.to_string()
    )
    .increment(1);
}

/// Record an enqueue rejected by the dedup guard.
pub fn record_deduplicated(task: &str) {
    counter!(
        "backstage_tasks_deduplicated_total",
        "task" => task.to_string()
    )
    .increment(1);
}

/// Record a handled message. `status` is one of `success`, `failed`,
/// `discarded`.
pub fn record_processed(stream: &str, status: &str) {
    counter!(
        "backstage_tasks_processed_total",
        "stream" => stream.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record handler duration for a successful invocation.
pub fn record_duration(stream: &str, duration: Duration) {
    histogram!(
        "backstage_task_duration_seconds",
        "stream" => stream.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a message claimed back from a dead or stalled worker.
pub fn record_reclaimed(stream: &str) {
    counter!(
        "backstage_tasks_reclaimed_total",
        "stream" => stream.to_string()
    )
    .increment(1);
}

/// Record a message moved to a dead-letter stream.
pub fn record_dead_lettered(dead_letter_stream: &str) {
    counter!(
        "backstage_tasks_dead_lettered_total",
        "stream" => dead_letter_stream.to_string()
    )
    .increment(1);
}

/// Record delayed tasks promoted onto their streams.
pub fn record_promoted(count: u64) {
    counter!("backstage_tasks_promoted_total").increment(count);
}

/// Record a broadcast message delivered to this worker.
pub fn record_broadcast_delivered() {
    counter!("backstage_broadcast_delivered_total").increment(1);
}

/// Update the in-flight handler gauge.
pub fn set_in_flight(count: usize) {
    gauge!("backstage_tasks_in_flight").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_without_recorder_is_empty() {
        // Recording before init is a no-op; rendering yields nothing.
        record_enqueued("backstage:default");
        assert_eq!(render_metrics(), "");
    }
}
