//! Redpanda event bus for syncflow.
//!
//! [`RedpandaEventBus`] implements [`EventBus`] over rdkafka, so any
//! Kafka-compatible broker works.
//!
//! Messages are JSON [`EventEnvelope`]s keyed by `entity_id`: all changes to
//! one entity share a partition and arrive in publish order.
//!
//! Subscriptions commit an offset only after the subscriber acked the message
//! (see [`BusMessage`](syncflow_core::event_bus::BusMessage)). Unhandled
//! messages are delivered again, and anything uncommitted at a crash comes
//! back from the broker. Delivery is therefore at-least-once and consumers
//! deduplicate on `event_id`.
//!
//! ```no_run
//! use futures::StreamExt;
//! use syncflow_core::event_bus::EventBus;
//! use syncflow_redpanda::{RedpandaConfig, RedpandaEventBus};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::connect(
//!     RedpandaConfig::new("localhost:9092").with_consumer_group("syncflow-ingress"),
//! )?;
//!
//! let mut stream = bus.subscribe(&["external.course.updated"]).await?;
//! while let Some(Ok(message)) = stream.next().await {
//!     match message.decode() {
//!         Ok(envelope) => {
//!             println!("{}", envelope.entity_id);
//!             message.ack();
//!         },
//!         Err(_) => message.nack(),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod consumer;

pub use config::RedpandaConfig;

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use syncflow_core::envelope::{EventEnvelope, Topic};
use syncflow_core::event_bus::{EventBus, EventBusError, MessageStream};

/// [`EventBus`] backed by a Kafka-compatible broker.
pub struct RedpandaEventBus {
    producer: FutureProducer,
    config: RedpandaConfig,
}

impl RedpandaEventBus {
    /// Connect with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::connect(RedpandaConfig::new(brokers))
    }

    /// Connect with explicit settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no brokers are configured
    /// or the producer cannot be created.
    pub fn connect(config: RedpandaConfig) -> Result<Self, EventBusError> {
        if config.brokers.trim().is_empty() {
            return Err(EventBusError::ConnectionFailed(
                "No brokers configured".to_string(),
            ));
        }

        let producer: FutureProducer = config.producer().create().map_err(|e| {
            EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %config.brokers,
            acks = %config.producer_acks,
            compression = %config.compression,
            consumer_group = ?config.consumer_group,
            "Connected Redpanda event bus"
        );

        Ok(Self { producer, config })
    }

    /// Settings this bus was connected with.
    #[must_use]
    pub const fn config(&self) -> &RedpandaConfig {
        &self.config
    }

    async fn send(&self, topic: String, envelope: EventEnvelope) -> Result<(), EventBusError> {
        if topic.parse::<Topic>().is_err() {
            return Err(EventBusError::InvalidTopic(topic));
        }
        let payload = serde_json::to_vec(&envelope).map_err(|e| EventBusError::PublishFailed {
            topic: topic.clone(),
            reason: format!("Failed to serialize envelope: {e}"),
        })?;

        let record = FutureRecord::to(&topic)
            .key(&envelope.entity_id)
            .payload(&payload);
        match self
            .producer
            .send(record, Timeout::After(self.config.send_timeout))
            .await
        {
            Ok((partition, offset)) => {
                tracing::debug!(
                    topic = %topic,
                    partition,
                    offset,
                    event_id = %envelope.event_id,
                    entity_id = %envelope.entity_id,
                    "Published envelope"
                );
                Ok(())
            },
            Err((e, _)) => {
                tracing::error!(
                    topic = %topic,
                    event_id = %envelope.event_id,
                    error = %e,
                    "Failed to publish envelope"
                );
                Err(EventBusError::PublishFailed {
                    topic,
                    reason: e.to_string(),
                })
            },
        }
    }

    async fn open(&self, topics: Vec<String>) -> Result<MessageStream, EventBusError> {
        let group = self.config.group_for(&topics);
        let failed = |reason: String| EventBusError::SubscriptionFailed {
            topics: topics.clone(),
            reason,
        };

        let consumer: StreamConsumer = self
            .config
            .consumer(&group)
            .create()
            .map_err(|e| failed(format!("Failed to create consumer: {e}")))?;
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| failed(format!("Failed to subscribe: {e}")))?;

        tracing::info!(
            topics = ?topics,
            consumer_group = %group,
            auto_offset_reset = %self.config.auto_offset_reset,
            "Subscribed to topics"
        );

        // One in flight: the pump waits for each message to be settled
        let (outlet, mut inbox) = tokio::sync::mpsc::channel(1);
        tokio::spawn(consumer::pump(consumer, outlet, self.config.redelivery_delay));

        let stream = async_stream::stream! {
            while let Some(item) = inbox.recv().await {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(self.send(topic.to_string(), envelope.clone()))
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let topics = topics.iter().map(|t| (*t).to_string()).collect();
        Box::pin(self.open(topics))
    }
}
