//! Event publisher: relays committed internal events from the outbox to the bus.
//!
//! Events are written to the [`Outbox`] in the same transaction as the entity
//! write they announce, so a committed write always has its event on disk. The
//! publisher then tries to deliver them right away with [`RetryPolicy`](crate::retry::RetryPolicy)
//! backoff and marks them published. Anything the bus refuses stays in the
//! outbox until [`EventPublisher::relay`] delivers it, from this process or a
//! fresh one after a restart. Nothing is ever evicted.
//!
//! Internal event ids are derived from the causing event (see
//! [`EventEnvelope::internal`]), so a relay that publishes an event twice
//! publishes the same id and consumers can deduplicate.

use crate::config::PublisherConfig;
use crate::metrics::PublisherMetrics;
use crate::retry::retry_with_predicate;
use std::sync::Arc;
use syncflow_core::entity_store::StoreError;
use syncflow_core::envelope::EventEnvelope;
use syncflow_core::event_bus::{EventBus, EventBusError};
use syncflow_core::outbox::Outbox;
use thiserror::Error;

/// Errors from relaying the outbox.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    /// The bus rejected an event
    #[error(transparent)]
    Bus(#[from] EventBusError),

    /// The outbox could not be read or updated
    #[error(transparent)]
    Outbox(#[from] StoreError),
}

/// Publishes committed events and relays the ones left behind.
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    outbox: Arc<dyn Outbox>,
    config: PublisherConfig,
}

impl EventPublisher {
    /// Create a publisher over a bus and the outbox its writes land in.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, outbox: Arc<dyn Outbox>, config: PublisherConfig) -> Self {
        Self {
            bus,
            outbox,
            config,
        }
    }

    /// Try to deliver events that were just committed to the outbox.
    ///
    /// Failures are not errors: an undelivered event is already durable and
    /// the next [`relay`](Self::relay) picks it up. Returns how many were
    /// delivered and marked.
    pub async fn publish_committed(&self, events: Vec<EventEnvelope>) -> usize {
        let mut delivered = 0;
        for envelope in events {
            let topic = envelope.topic().to_string();
            let result = retry_with_predicate(
                &self.config.retry,
                || self.bus.publish(&topic, &envelope),
                |e| !matches!(e, EventBusError::InvalidTopic(_)),
            )
            .await;

            if let Err(e) = result {
                tracing::warn!(
                    topic = %topic,
                    event_id = %envelope.event_id,
                    error = %e,
                    "Publish failed after retries, leaving event in outbox"
                );
                PublisherMetrics::record_deferred(envelope.kind);
                continue;
            }

            PublisherMetrics::record_published(envelope.kind);
            match self.outbox.mark_published(envelope.event_id).await {
                Ok(()) => {
                    tracing::debug!(
                        topic = %topic,
                        event_id = %envelope.event_id,
                        "Published internal event"
                    );
                    delivered += 1;
                },
                Err(e) => {
                    tracing::warn!(
                        event_id = %envelope.event_id,
                        error = %e,
                        "Published event could not be marked, relay will send it again"
                    );
                },
            }
        }
        delivered
    }

    /// Deliver one batch of unpublished events, oldest first.
    ///
    /// Each event gets one attempt; the relay stops at the first bus failure so
    /// ordering is preserved. Returns how many were delivered.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Outbox`] if the outbox cannot be read or marked.
    /// A bus failure ends the batch without an error.
    pub async fn relay(&self) -> Result<usize, PublishError> {
        let batch = self.outbox.pending(self.config.relay_batch_size).await?;
        let mut relayed = 0;

        for envelope in batch {
            let topic = envelope.topic().to_string();
            if let Err(e) = self.bus.publish(&topic, &envelope).await {
                tracing::debug!(topic = %topic, error = %e, "Outbox relay stopped");
                break;
            }
            self.outbox.mark_published(envelope.event_id).await?;
            PublisherMetrics::record_published(envelope.kind);
            relayed += 1;
        }

        if relayed > 0 {
            tracing::info!(relayed, "Relayed pending internal events");
        }
        PublisherMetrics::record_pending(self.pending().await?);
        Ok(relayed)
    }

    /// Number of unpublished events in the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Outbox`] if the outbox cannot be read.
    pub async fn pending(&self) -> Result<usize, PublishError> {
        Ok(self.outbox.pending_count().await?)
    }
}
