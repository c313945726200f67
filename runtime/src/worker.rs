//! Worker pool: pulls jobs off the work queue and settles each one.
//!
//! | Outcome | Settlement |
//! |---------|------------|
//! | `Applied`, `Unchanged`, `Stale` | ack |
//! | `Requeue`, transient `Failed` | retry with backoff, dead-letter after `max_attempts` deliveries |
//! | permanent `Failed` | dead-letter immediately |
//!
//! Jobs in one batch run concurrently up to `concurrency`. Nothing here orders
//! jobs: correctness under concurrency comes from the store's conditional writes.

use crate::config::WorkerConfig;
use crate::metrics::QueueMetrics;
use crate::orchestrator::{Orchestrator, UpsertOutcome};
use crate::publisher::EventPublisher;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use syncflow_core::work_queue::{Delivery, QueueError, Receipt, WorkQueue};
use tokio::sync::watch;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Removed from the queue
    Acked,
    /// Made visible again after a delay
    Retried,
    /// Moved to the dead-letter destination
    DeadLettered {
        /// Whether the failure was permanent
        permanent: bool,
    },
}

/// Drains the work queue through the orchestrator.
#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    orchestrator: Orchestrator,
    publisher: Arc<EventPublisher>,
    config: WorkerConfig,
    in_flight: Arc<AtomicUsize>,
}

impl Worker {
    /// Create a worker.
    #[must_use]
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        orchestrator: Orchestrator,
        publisher: Arc<EventPublisher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            publisher,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Receive one batch and settle every job in it.
    ///
    /// Returns how many jobs were received.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the batch could not be received. Settlement
    /// failures are logged; the job reappears when its visibility times out.
    pub async fn tick(&self) -> Result<usize, QueueError> {
        let batch = self
            .queue
            .receive(self.config.batch_size, self.config.visibility_timeout)
            .await?;
        let received = batch.len();

        futures::stream::iter(batch)
            .for_each_concurrent(self.config.concurrency, |delivery| async move {
                self.in_flight.fetch_add(1, Ordering::Relaxed);
                QueueMetrics::record_in_flight(self.in_flight.load(Ordering::Relaxed));

                if let Err(e) = self.handle(delivery).await {
                    tracing::warn!(error = %e, "Could not settle job");
                }

                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                QueueMetrics::record_in_flight(self.in_flight.load(Ordering::Relaxed));
            })
            .await;

        Ok(received)
    }

    /// Process one delivery and settle it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the settlement call fails.
    pub async fn handle(&self, delivery: Delivery) -> Result<Settlement, QueueError> {
        let Delivery { receipt, job } = delivery;
        let outcome = self.orchestrator.process(job.envelope).await;
        self.settle(receipt, outcome).await
    }

    async fn settle(
        &self,
        receipt: Receipt,
        outcome: UpsertOutcome,
    ) -> Result<Settlement, QueueError> {
        match outcome {
            UpsertOutcome::Applied { .. } | UpsertOutcome::Unchanged | UpsertOutcome::Stale => {
                self.queue.ack(receipt).await?;
                QueueMetrics::record_ack();
                Ok(Settlement::Acked)
            },
            UpsertOutcome::Failed {
                reason,
                permanent: true,
            } => self.dead_letter(receipt, reason, true).await,
            UpsertOutcome::Requeue { reason }
            | UpsertOutcome::Failed {
                reason,
                permanent: false,
            } => {
                if receipt.attempt >= self.config.max_attempts {
                    return self.dead_letter(receipt, reason, false).await;
                }
                let delay = self
                    .config
                    .requeue_backoff
                    .delay_for_attempt(receipt.attempt.saturating_sub(1));
                tracing::info!(
                    job_id = %receipt.job_id,
                    attempt = receipt.attempt,
                    delay_ms = delay.as_millis(),
                    reason = %reason,
                    "Requeueing job"
                );
                self.queue.retry(receipt, delay).await?;
                QueueMetrics::record_requeue();
                Ok(Settlement::Retried)
            },
        }
    }

    async fn dead_letter(
        &self,
        receipt: Receipt,
        reason: String,
        permanent: bool,
    ) -> Result<Settlement, QueueError> {
        tracing::error!(
            job_id = %receipt.job_id,
            attempt = receipt.attempt,
            permanent,
            reason = %reason,
            "Dead-lettering job"
        );
        self.queue.dead_letter(receipt, reason, permanent).await?;
        QueueMetrics::record_dead_letter(permanent);
        Ok(Settlement::DeadLettered { permanent })
    }

    /// Poll until `shutdown` flips to `true`.
    ///
    /// Sleeps `poll_interval` whenever a poll comes back empty or fails. The
    /// outbox is relayed once per poll. Also stops if the sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            "Worker started"
        );

        while !*shutdown.borrow() {
            if let Err(e) = self.publisher.relay().await {
                tracing::error!(error = %e, "Failed to relay outbox");
            }

            let idle = match self.tick().await {
                Ok(received) => received == 0,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to receive jobs");
                    true
                },
            };

            if idle {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => {},
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    },
                }
            }
        }

        tracing::info!("Worker stopped");
    }
}
