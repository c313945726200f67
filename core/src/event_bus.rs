//! Event bus abstraction for entity change notifications.
//!
//! This module provides the [`EventBus`] trait for publishing and subscribing to
//! [`EventEnvelope`]s. Writes land in the entity store first; the bus only
//! distributes them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ external.<k>.<op>│◄─── Ingress API stamps webhooks
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   Orchestrator   │
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  1. Entity Store │◄─── Source of truth (conditional write)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ internal.<k>.<op>│◄─── At-least-once delivery
//! └────────┬─────────┘
//!          │
//!     ┌────┴────┐
//!     │         │
//!     ▼         ▼
//! ┌───────┐ ┌────────┐
//! │Fan-out│ │ Source │
//! │       │ │  sync  │
//! └───────┘ └────────┘
//! ```
//!
//! # Key Principles
//!
//! - **Store First**: Entities are written before their event is published
//! - **At-least-once delivery**: Envelopes may be delivered multiple times
//! - **Idempotency**: Subscribers must handle duplicates (internal event ids are deterministic)
//! - **Explicit settlement**: A [`BusMessage`] is redelivered until it is acked
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (syncflow-testing) - For testing
//! - `RedpandaEventBus` (syncflow-redpanda) - For production (Kafka-compatible)

use crate::envelope::EventEnvelope;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an envelope to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize an envelope
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Topic not found or invalid
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Settles a delivered message: `true` to commit it, `false` to have it redelivered.
pub type Acknowledger = Box<dyn FnOnce(bool) + Send>;

/// One message received from a subscription.
///
/// The raw bytes are kept so that a message which does not decode can still be
/// set aside intact. A message must be settled with [`ack`](Self::ack) once it
/// has been handled; [`nack`](Self::nack), or dropping it unsettled, asks the
/// bus to deliver it again.
pub struct BusMessage {
    topic: String,
    payload: Vec<u8>,
    acknowledger: Option<Acknowledger>,
}

impl BusMessage {
    /// A message settled through `acknowledger`.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, acknowledger: Acknowledger) -> Self {
        Self {
            topic: topic.into(),
            payload,
            acknowledger: Some(acknowledger),
        }
    }

    /// A message whose settlement is ignored.
    #[must_use]
    pub fn unacknowledged(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            acknowledger: None,
        }
    }

    /// Topic the message was received on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Raw message bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload as an [`EventEnvelope`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::DeserializationFailed`] if the bytes are not a valid envelope.
    pub fn decode(&self) -> Result<EventEnvelope, EventBusError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| EventBusError::DeserializationFailed(e.to_string()))
    }

    /// The message was handled; do not deliver it again.
    pub fn ack(mut self) {
        self.settle(true);
    }

    /// The message was not handled; deliver it again.
    pub fn nack(mut self) {
        self.settle(false);
    }

    fn settle(&mut self, handled: bool) {
        if let Some(acknowledger) = self.acknowledger.take() {
            acknowledger(handled);
        }
    }
}

impl Drop for BusMessage {
    fn drop(&mut self) {
        self.settle(false);
    }
}

impl std::fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMessage")
            .field("topic", &self.topic)
            .field("bytes", &self.payload.len())
            .field("settled", &self.acknowledger.is_none())
            .finish()
    }
}

/// Stream of messages from subscriptions.
///
/// # Examples
///
/// ```rust,ignore
/// use futures::StreamExt;
///
/// let mut stream = event_bus.subscribe(&["internal.course.updated"]).await?;
/// while let Some(result) = stream.next().await {
///     match result {
///         Ok(message) => match message.decode() {
///             Ok(envelope) if split(envelope).await.is_ok() => message.ack(),
///             _ => message.nack(),
///         },
///         Err(e) => tracing::error!("Event stream error: {}", e),
///     }
/// }
/// ```
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<BusMessage, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` to support concurrent access
/// from many workers.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventBus>`).
pub trait EventBus: Send + Sync {
    /// Publish an envelope to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of messages.
    ///
    /// Delivery is at least once: a message is delivered again until it is acked.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>>;
}
