//! The task behind a subscription.
//!
//! Each consumer keeps exactly one message in flight. The message is handed to
//! the subscriber and the task waits until it is settled. An ack commits the
//! offset past it. A nack, or a message dropped unsettled, gets the same bytes
//! delivered again after the redelivery delay, so a partition never moves past
//! a message nobody handled. If the process dies first, the uncommitted offset
//! makes the broker deliver it again.

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use syncflow_core::event_bus::{BusMessage, EventBusError};
use tokio::sync::{mpsc, oneshot};

pub(crate) type Outlet = mpsc::Sender<Result<BusMessage, EventBusError>>;

/// Where a received message sits.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

impl Position {
    fn next(&self) -> KafkaResult<TopicPartitionList> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))?;
        Ok(list)
    }
}

/// Forward messages from `consumer` to `outlet` until the subscriber goes away.
pub(crate) async fn pump(consumer: StreamConsumer, outlet: Outlet, redelivery_delay: Duration) {
    loop {
        let (position, payload) = match consumer.recv().await {
            Ok(message) => (
                Position {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                },
                // An empty message is passed on and fails to decode downstream
                message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            ),
            Err(e) => {
                let error = EventBusError::TransportError(format!("Failed to receive message: {e}"));
                if outlet.send(Err(error)).await.is_err() {
                    break;
                }
                continue;
            },
        };

        if !deliver_until_handled(&outlet, &position.topic, &payload, redelivery_delay).await {
            break;
        }

        if let Err(e) = position
            .next()
            .and_then(|offsets| consumer.commit(&offsets, CommitMode::Async))
        {
            tracing::warn!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                error = %e,
                "Failed to commit offset, message may be delivered again"
            );
        } else {
            tracing::trace!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                "Committed handled message"
            );
        }
    }

    tracing::debug!("Subscriber gone, consumer task exiting");
}

/// Hand `payload` to the subscriber until it acks.
///
/// Returns `false` if the subscriber stopped listening first.
pub(crate) async fn deliver_until_handled(
    outlet: &Outlet,
    topic: &str,
    payload: &[u8],
    redelivery_delay: Duration,
) -> bool {
    loop {
        let (settled, handled) = oneshot::channel();
        let message = BusMessage::new(
            topic,
            payload.to_vec(),
            Box::new(move |ok| {
                let _ = settled.send(ok);
            }),
        );
        if outlet.send(Ok(message)).await.is_err() {
            return false;
        }
        if handled.await.unwrap_or(false) {
            return true;
        }

        tracing::debug!(topic, "Message not handled, delivering it again");
        tokio::time::sleep(redelivery_delay).await;
    }
}
