//! Prometheus metrics for the job runtime
//!
//! Recorded through the `metrics` facade; without an installed recorder every
//! call is a no-op.

use crate::error::JobError;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls return the existing handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, JobError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| JobError::configuration(format!("prometheus recorder: {e}")))?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Record a message sent to `topic`.
pub fn message_published(topic: &str) {
    counter!("job_runtime_messages_published_total", "topic" => topic.to_string()).increment(1);
}

/// Record a failed connection attempt.
pub fn broker_connect_failed(host: &str) {
    counter!("job_runtime_broker_connect_failures_total", "host" => host.to_string())
        .increment(1);
}

/// Per-job metrics helper
#[derive(Debug, Clone)]
pub struct JobMetrics {
    job: String,
    topic: String,
}

impl JobMetrics {
    pub fn new(job: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            topic: topic.into(),
        }
    }

    /// Record messages handed to the delivery handler
    pub fn received(&self, count: usize) {
        counter!(
            "job_runtime_messages_received_total",
            "job" => self.job.clone(),
            "topic" => self.topic.clone()
        )
        .increment(count as u64);
    }

    pub fn acknowledged(&self, count: usize) {
        self.settled("ack", count);
    }

    pub fn negatively_acknowledged(&self, count: usize) {
        self.settled("nack", count);
    }

    pub fn dead_lettered(&self, count: usize) {
        self.settled("dead_letter", count);
    }

    fn settled(&self, decision: &'static str, count: usize) {
        counter!(
            "job_runtime_messages_settled_total",
            "job" => self.job.clone(),
            "topic" => self.topic.clone(),
            "decision" => decision
        )
        .increment(count as u64);
    }

    /// Record how long the handler body ran
    pub fn handled(&self, duration: Duration, success: bool) {
        histogram!(
            "job_runtime_handler_duration_seconds",
            "job" => self.job.clone(),
            "status" => if success { "success" } else { "failure" }
        )
        .record(duration.as_secs_f64());
    }

    pub fn poll_error(&self) {
        counter!(
            "job_runtime_poll_errors_total",
            "job" => self.job.clone(),
            "topic" => self.topic.clone()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        let metrics = JobMetrics::new("MailerJob", "jobs.mail");
        metrics.received(2);
        metrics.acknowledged(1);
        metrics.negatively_acknowledged(1);
        metrics.dead_lettered(1);
        metrics.handled(Duration::from_millis(5), true);
        metrics.poll_error();
        message_published("jobs.mail");
        broker_connect_failed("localhost:4222");
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics().map(|h| h as *const PrometheusHandle);
        let second = init_metrics().map(|h| h as *const PrometheusHandle);
        if let (Ok(a), Ok(b)) = (first, second) {
            assert_eq!(a, b);
        }

        JobMetrics::new("ReportJob", "jobs.reports").acknowledged(3);
        if PROMETHEUS_HANDLE.get().is_some() {
            assert!(render_metrics().contains("job_runtime_messages_settled_total"));
        }
    }
}
