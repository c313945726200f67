//! In-memory event bus.
//!
//! Records every publish for assertions and delivers it to live subscribers
//! of the topic as a [`BusMessage`]. A message that is nacked or dropped
//! unsettled is queued again for the same subscriber, the way a broker
//! redelivers uncommitted offsets. Publishes can be made to fail to exercise
//! retry and outbox paths.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use syncflow_core::envelope::EventEnvelope;
use syncflow_core::event_bus::{BusMessage, EventBus, EventBusError, MessageStream};
use tokio::sync::mpsc;

type Inbox = mpsc::UnboundedSender<Result<BusMessage, EventBusError>>;

#[derive(Debug)]
struct Subscriber {
    topics: Vec<String>,
    inbox: Inbox,
}

#[derive(Debug, Default)]
struct Settlements {
    acked: AtomicUsize,
    redelivered: AtomicUsize,
}

/// In-memory [`EventBus`].
///
/// # Example
///
/// ```
/// use syncflow_testing::InMemoryEventBus;
///
/// let bus = InMemoryEventBus::new();
/// bus.fail_next_publishes(2);
/// assert!(bus.published().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventBus {
    published: Arc<Mutex<Vec<(String, EventEnvelope)>>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    failures: Arc<AtomicUsize>,
    settlements: Arc<Settlements>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful publish as `(topic, envelope)`, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, EventEnvelope)> {
        self.published.lock().unwrap().clone()
    }

    /// Successful publishes on one topic.
    #[must_use]
    pub fn published_on(&self, topic: &str) -> Vec<EventEnvelope> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Forget recorded publishes.
    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }

    /// Make the next `n` publishes fail with [`EventBusError::PublishFailed`].
    pub fn fail_next_publishes(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Deliver raw bytes to subscribers of `topic` without recording a publish.
    pub fn push_raw(&self, topic: &str, payload: &[u8]) {
        self.deliver(topic, payload);
    }

    /// Messages acked by subscribers so far.
    #[must_use]
    pub fn acked(&self) -> usize {
        self.settlements.acked.load(Ordering::SeqCst)
    }

    /// Messages redelivered after a nack so far.
    #[must_use]
    pub fn redelivered(&self) -> usize {
        self.settlements.redelivered.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` subscriptions are live.
    pub async fn wait_for_subscribers(&self, n: usize) {
        while self.subscribers.lock().unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn deliver(&self, topic: &str, payload: &[u8]) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| !s.inbox.is_closed());
        for subscriber in subscribers.iter() {
            if subscriber.topics.iter().any(|t| t == topic) {
                send(
                    &subscriber.inbox,
                    topic.to_string(),
                    payload.to_vec(),
                    Arc::clone(&self.settlements),
                );
            }
        }
    }

    fn publish_now(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), EventBusError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EventBusError::PublishFailed {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let payload = serde_json::to_vec(envelope).map_err(|e| EventBusError::PublishFailed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), envelope.clone()));
        self.deliver(topic, &payload);
        Ok(())
    }
}

/// Queue a message whose nack queues it again.
fn send(inbox: &Inbox, topic: String, payload: Vec<u8>, settlements: Arc<Settlements>) {
    let retry_inbox = inbox.clone();
    let retry_topic = topic.clone();
    let retry_payload = payload.clone();
    let message = BusMessage::new(
        topic,
        payload,
        Box::new(move |handled| {
            if handled {
                settlements.acked.fetch_add(1, Ordering::SeqCst);
            } else if !retry_inbox.is_closed() {
                settlements.redelivered.fetch_add(1, Ordering::SeqCst);
                send(&retry_inbox, retry_topic, retry_payload, settlements);
            }
        }),
    );
    let _ = inbox.send(Ok(message));
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let result = self.publish_now(topic, envelope);
        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let (inbox, mut receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(Subscriber {
            topics: topics.iter().map(ToString::to_string).collect(),
            inbox,
        });

        Box::pin(async move {
            let stream: MessageStream = Box::pin(async_stream::stream! {
                while let Some(message) = receiver.recv().await {
                    yield message;
                }
            });
            Ok(stream)
        })
    }
}
