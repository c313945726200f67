//! Connection and delivery settings for [`RedpandaEventBus`](crate::RedpandaEventBus).

use rdkafka::config::ClientConfig;
use std::time::Duration;

/// Settings shared by the producer and every subscription of one bus.
///
/// | Setting | Default |
/// |---|---|
/// | `producer_acks` | `"all"` |
/// | `compression` | `"none"` |
/// | `send_timeout` | 5s |
/// | `consumer_group` | `syncflow-<sorted topics>` |
/// | `auto_offset_reset` | `"latest"` |
/// | `redelivery_delay` | 1s |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedpandaConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,
    /// Producer `acks` setting.
    pub producer_acks: String,
    /// Producer compression codec.
    pub compression: String,
    /// How long a publish may wait for the broker.
    pub send_timeout: Duration,
    /// Group every subscription of this bus joins.
    pub consumer_group: Option<String>,
    /// Where a group without committed offsets starts.
    pub auto_offset_reset: String,
    /// Pause before a message the subscriber did not handle is delivered again.
    pub redelivery_delay: Duration,
}

impl RedpandaConfig {
    /// Defaults for the given brokers.
    #[must_use]
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            producer_acks: "all".to_string(),
            compression: "none".to_string(),
            send_timeout: Duration::from_secs(5),
            consumer_group: None,
            auto_offset_reset: "latest".to_string(),
            redelivery_delay: Duration::from_secs(1),
        }
    }

    /// Set the producer `acks` mode (`"0"`, `"1"` or `"all"`).
    #[must_use]
    pub fn with_producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = acks.into();
        self
    }

    /// Set the compression codec (`"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`).
    #[must_use]
    pub fn with_compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = compression.into();
        self
    }

    /// Set the publish timeout.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Join an explicit consumer group, so several workers share the partitions.
    #[must_use]
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// Set the offset reset policy (`"earliest"` or `"latest"`).
    #[must_use]
    pub fn with_auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = policy.into();
        self
    }

    /// Set the pause before an unhandled message is delivered again.
    #[must_use]
    pub const fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Group a subscription to `topics` joins.
    pub(crate) fn group_for(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("syncflow-{}", sorted.join("-"))
        })
    }

    pub(crate) fn producer(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.brokers)
            .set("acks", &self.producer_acks)
            .set("compression.type", &self.compression)
            .set("message.timeout.ms", self.send_timeout.as_millis().to_string());
        client
    }

    /// Offsets are committed by hand, only for handled messages.
    pub(crate) fn consumer(&self, group: &str) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false");
        client
    }
}
