//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the orchestration pipeline:
//! - Orchestrator outcomes and latency
//! - Work queue settlement (acks, requeues, dead letters)
//! - Fan-out job counts
//! - Event publisher deliveries and deferrals
//!
//! # Example
//!
//! ```rust,no_run
//! use syncflow_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.serve()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use syncflow_core::entity::EntityKind;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    fn builder() -> Result<PrometheusBuilder, MetricsError> {
        register_metrics();

        PrometheusBuilder::new()
            // Configure histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))
    }

    /// Install the recorder without an HTTP listener and keep a render handle.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics exporter cannot be installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        match Self::builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            },
            Err(e) => Self::tolerate_reinstall(&e),
        }
    }

    /// Install the recorder and serve `/metrics` on the configured address.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or the listener cannot be installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        match Self::builder()?.with_http_listener(self.addr).install() {
            Ok(()) => {
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(e) => Self::tolerate_reinstall(&e),
        }
    }

    fn tolerate_reinstall(error: &BuildError) -> Result<(), MetricsError> {
        let err_msg = error.to_string();
        if err_msg.contains("already initialized") {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            Ok(())
        } else {
            Err(MetricsError::Install(err_msg))
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by [`start`](Self::start).
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "syncflow_orchestrator_outcomes_total",
        "Jobs processed by the orchestrator, by outcome and entity kind"
    );
    describe_counter!(
        "syncflow_orchestrator_mutations_total",
        "Entity writes committed, by kind and operation"
    );
    describe_counter!(
        "syncflow_orchestrator_write_conflicts_total",
        "Conditional writes that lost a race and were re-resolved"
    );
    describe_histogram!(
        "syncflow_orchestrator_duration_seconds",
        "Time taken to run one job through the orchestrator"
    );

    describe_counter!("syncflow_queue_acked_total", "Jobs acknowledged");
    describe_counter!("syncflow_queue_requeued_total", "Jobs returned to the queue with backoff");
    describe_counter!(
        "syncflow_queue_dead_lettered_total",
        "Jobs moved to the dead-letter destination"
    );
    describe_gauge!("syncflow_queue_in_flight", "Jobs currently being processed by this worker");

    describe_counter!("syncflow_splitter_jobs_total", "Refresh jobs emitted by the fan-out splitter");

    describe_counter!("syncflow_publisher_published_total", "Internal events delivered to the bus");
    describe_counter!(
        "syncflow_publisher_deferred_total",
        "Committed events left in the outbox after immediate delivery failed"
    );
    describe_gauge!("syncflow_publisher_pending", "Unpublished events in the outbox");

    describe_counter!("syncflow_ingress_received_total", "External envelopes received from the bus");
    describe_counter!(
        "syncflow_ingress_undecodable_total",
        "Bus messages that could not be decoded into an envelope"
    );
    describe_counter!(
        "syncflow_ingress_redelivered_total",
        "Bus messages released for redelivery after handling failed"
    );
}

/// Orchestrator metrics recorder.
pub struct OrchestratorMetrics;

impl OrchestratorMetrics {
    /// Record the outcome of one job.
    pub fn record_outcome(kind: EntityKind, outcome: &'static str, duration: Duration) {
        counter!(
            "syncflow_orchestrator_outcomes_total",
            "kind" => kind.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("syncflow_orchestrator_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a committed write.
    pub fn record_mutation(kind: EntityKind, operation: &'static str) {
        counter!(
            "syncflow_orchestrator_mutations_total",
            "kind" => kind.as_str(),
            "operation" => operation
        )
        .increment(1);
    }

    /// Record a lost write race.
    pub fn record_write_conflict(kind: EntityKind) {
        counter!("syncflow_orchestrator_write_conflicts_total", "kind" => kind.as_str())
            .increment(1);
    }
}

/// Work queue metrics recorder.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record an acknowledged job.
    pub fn record_ack() {
        counter!("syncflow_queue_acked_total").increment(1);
    }

    /// Record a requeued job.
    pub fn record_requeue() {
        counter!("syncflow_queue_requeued_total").increment(1);
    }

    /// Record a dead-lettered job.
    pub fn record_dead_letter(permanent: bool) {
        counter!(
            "syncflow_queue_dead_lettered_total",
            "permanent" => if permanent { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Record the number of jobs currently in flight.
    #[allow(clippy::cast_precision_loss)] // in-flight counts are tiny
    pub fn record_in_flight(count: usize) {
        gauge!("syncflow_queue_in_flight").set(count as f64);
    }
}

/// Fan-out splitter metrics recorder.
pub struct SplitterMetrics;

impl SplitterMetrics {
    /// Record jobs emitted for one trigger.
    pub fn record_jobs(trigger: EntityKind, count: usize) {
        counter!("syncflow_splitter_jobs_total", "trigger" => trigger.as_str())
            .increment(count as u64);
    }
}

/// Event publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a delivered event.
    pub fn record_published(kind: EntityKind) {
        counter!("syncflow_publisher_published_total", "kind" => kind.as_str()).increment(1);
    }

    /// Record an event left in the outbox for the relay.
    pub fn record_deferred(kind: EntityKind) {
        counter!("syncflow_publisher_deferred_total", "kind" => kind.as_str()).increment(1);
    }

    /// Record the outbox size.
    #[allow(clippy::cast_precision_loss)] // outbox sizes are tiny
    pub fn record_pending(count: usize) {
        gauge!("syncflow_publisher_pending").set(count as f64);
    }
}

/// Ingress metrics recorder.
pub struct IngressMetrics;

impl IngressMetrics {
    /// Record a received envelope.
    pub fn record_received(kind: EntityKind) {
        counter!("syncflow_ingress_received_total", "kind" => kind.as_str()).increment(1);
    }

    /// Record a message that could not be decoded.
    pub fn record_undecodable() {
        counter!("syncflow_ingress_undecodable_total").increment(1);
    }

    /// Record a message released for redelivery.
    pub fn record_redelivery(topic: &str) {
        counter!("syncflow_ingress_redelivered_total", "topic" => topic.to_string()).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        OrchestratorMetrics::record_outcome(
            EntityKind::Course,
            "applied",
            Duration::from_millis(5),
        );
        QueueMetrics::record_dead_letter(true);

        // If another test installed the recorder first, handle is None.
        // Metrics are still recorded globally.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("syncflow_orchestrator_outcomes_total"));
            assert!(rendered.contains("syncflow_queue_dead_lettered_total"));
        }
    }
}
