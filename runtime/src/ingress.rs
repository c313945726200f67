//! Bus consumers that feed the work queue.
//!
//! - [`Ingress`] turns every external envelope into one job.
//! - [`FanOutConsumer`] turns every trigger event into a batch of jobs.
//!
//! Neither processes anything itself; all writes happen in workers. A message
//! is acked only once its jobs are in the queue. If enqueueing or splitting
//! fails it is nacked and the bus delivers it again. Bytes that do not decode
//! into an envelope are stored as a [`RejectedMessage`] and then acked.

use crate::metrics::IngressMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::splitter::{FanOutSplitter, SplitError, trigger_topics};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use syncflow_core::envelope::{EventEnvelope, Namespace, Topic};
use syncflow_core::event_bus::{BusMessage, EventBus, EventBusError, MessageStream};
use syncflow_core::work_queue::{Job, QueueError, RejectedMessage, WorkQueue};
use thiserror::Error;
use tokio::sync::watch;

/// Errors from handling one bus message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngressError {
    /// Jobs could not be enqueued
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The trigger could not be split
    #[error(transparent)]
    Split(#[from] SplitError),
}

/// Consumes external topics into the work queue.
#[derive(Clone)]
pub struct Ingress {
    bus: Arc<dyn EventBus>,
    queue: Arc<dyn WorkQueue>,
    retry: RetryPolicy,
}

impl Ingress {
    /// Create an ingress consumer.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, queue: Arc<dyn WorkQueue>, retry: RetryPolicy) -> Self {
        Self { bus, queue, retry }
    }

    /// Enqueue one external envelope.
    ///
    /// Returns `true` if the job was new to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::Queue`] once retries run out. The envelope must
    /// then be delivered again.
    pub async fn accept(&self, envelope: EventEnvelope) -> Result<bool, IngressError> {
        IngressMetrics::record_received(envelope.kind);
        let event_id = envelope.event_id;
        let job = Job::new(envelope);

        let enqueued = retry_with_backoff(&self.retry, || self.queue.enqueue(vec![job.clone()]))
            .await
            .inspect_err(|e| {
                tracing::error!(event_id = %event_id, error = %e, "Failed to enqueue external event");
            })?;
        Ok(enqueued == 1)
    }

    /// Consume until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the subscription cannot be established.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), EventBusError> {
        let topics = topic_names(&Topic::all(Namespace::External));
        let stream = subscribe(self.bus.as_ref(), &topics).await?;
        tracing::info!(topics = ?topics, "Ingress subscribed");

        let consumer = Consumer {
            queue: self.queue.as_ref(),
            redelivery_delay: self.retry.initial_delay,
        };
        consumer
            .consume(stream, shutdown, |envelope| async move {
                self.accept(envelope).await.map(|_| ())
            })
            .await;
        Ok(())
    }
}

/// Consumes trigger topics and enqueues the jobs they fan out to.
#[derive(Clone)]
pub struct FanOutConsumer {
    bus: Arc<dyn EventBus>,
    queue: Arc<dyn WorkQueue>,
    splitter: FanOutSplitter,
    retry: RetryPolicy,
}

impl FanOutConsumer {
    /// Create a fan-out consumer.
    #[must_use]
    pub fn new(
        bus: Arc<dyn EventBus>,
        queue: Arc<dyn WorkQueue>,
        splitter: FanOutSplitter,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bus,
            queue,
            splitter,
            retry,
        }
    }

    /// Split one trigger and enqueue the whole batch.
    ///
    /// Returns how many jobs were newly enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError`] if splitting or enqueueing still fails after
    /// retries. Nothing is enqueued in that case and the trigger must be
    /// delivered again.
    pub async fn accept(&self, trigger: &EventEnvelope) -> Result<usize, IngressError> {
        let jobs = retry_with_backoff(&self.retry, || self.splitter.split(trigger))
            .await
            .inspect_err(|e| {
                tracing::error!(
                    trigger = %trigger.topic(),
                    event_id = %trigger.event_id,
                    error = %e,
                    "Failed to split trigger"
                );
            })?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let enqueued = retry_with_backoff(&self.retry, || self.queue.enqueue(jobs.clone()))
            .await
            .inspect_err(|e| {
                tracing::error!(
                    event_id = %trigger.event_id,
                    jobs = jobs.len(),
                    error = %e,
                    "Failed to enqueue fan-out jobs"
                );
            })?;
        Ok(enqueued)
    }

    /// Consume until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the subscription cannot be established.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), EventBusError> {
        let topics = topic_names(&trigger_topics());
        let stream = subscribe(self.bus.as_ref(), &topics).await?;
        tracing::info!(topics = ?topics, "Fan-out consumer subscribed");

        let consumer = Consumer {
            queue: self.queue.as_ref(),
            redelivery_delay: self.retry.initial_delay,
        };
        consumer
            .consume(stream, shutdown, |trigger| async move {
                self.accept(&trigger).await.map(|_| ())
            })
            .await;
        Ok(())
    }
}

fn topic_names(topics: &[Topic]) -> Vec<String> {
    topics.iter().map(ToString::to_string).collect()
}

async fn subscribe(bus: &dyn EventBus, topics: &[String]) -> Result<MessageStream, EventBusError> {
    let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
    bus.subscribe(&topics).await
}

/// Drives one subscription and settles every message it yields.
struct Consumer<'a> {
    queue: &'a dyn WorkQueue,
    redelivery_delay: Duration,
}

impl Consumer<'_> {
    async fn consume<F, Fut>(&self, mut stream: MessageStream, mut shutdown: watch::Receiver<bool>, handle: F)
    where
        F: Fn(EventEnvelope) -> Fut,
        Fut: std::future::Future<Output = Result<(), IngressError>>,
    {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(message)) => self.settle(message, &handle).await,
                    Some(Err(e)) => tracing::error!(error = %e, "Event stream error"),
                    None => {
                        tracing::info!("Event stream ended");
                        break;
                    },
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
            }
        }
    }

    async fn settle<F, Fut>(&self, message: BusMessage, handle: &F)
    where
        F: Fn(EventEnvelope) -> Fut,
        Fut: std::future::Future<Output = Result<(), IngressError>>,
    {
        let envelope = match message.decode() {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reject(message, &e).await;
                return;
            },
        };

        match handle(envelope).await {
            Ok(()) => message.ack(),
            Err(e) => {
                tracing::warn!(topic = %message.topic(), error = %e, "Handling failed, message will be redelivered");
                self.redeliver(message).await;
            },
        }
    }

    async fn reject(&self, message: BusMessage, error: &EventBusError) {
        IngressMetrics::record_undecodable();
        let rejected = RejectedMessage::new(message.topic(), message.payload().to_vec(), error.to_string());

        match self.queue.reject(rejected).await {
            Ok(()) => {
                tracing::warn!(topic = %message.topic(), error = %error, "Rejected undecodable message");
                message.ack();
            },
            Err(e) => {
                tracing::error!(topic = %message.topic(), error = %e, "Failed to store undecodable message");
                self.redeliver(message).await;
            },
        }
    }

    async fn redeliver(&self, message: BusMessage) {
        IngressMetrics::record_redelivery(message.topic());
        message.nack();
        tokio::time::sleep(self.redelivery_delay).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use syncflow_core::entity::{EntityKind, Operation};
    use syncflow_testing::{InMemoryEntityStore, InMemoryEventBus, InMemoryWorkQueue, fixtures};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(1))
            .build()
    }

    fn course_trigger(id: &str) -> EventEnvelope {
        fixtures::announced(Operation::Updated, &fixtures::course_record(id))
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition should hold");
    }

    #[tokio::test]
    async fn duplicate_external_event_is_enqueued_once() {
        let bus = Arc::new(InMemoryEventBus::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let ingress = Ingress::new(bus, queue.clone(), fast_retry());
        let envelope = fixtures::course_created("course-1");

        assert!(ingress.accept(envelope.clone()).await.unwrap());
        assert!(!ingress.accept(envelope).await.unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_failure_is_reported_not_swallowed() {
        let bus = Arc::new(InMemoryEventBus::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let ingress = Ingress::new(bus, queue.clone(), fast_retry());
        queue.fail_next_enqueues(2);

        let err = ingress.accept(fixtures::course_created("course-1")).await.unwrap_err();

        assert!(matches!(err, IngressError::Queue(QueueError::Backend(_))));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn fan_out_enqueues_one_job_per_participant() {
        let bus = Arc::new(InMemoryEventBus::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let store = Arc::new(InMemoryEntityStore::new());
        fixtures::seed_course_with_participants(&store, "course-1", 4);

        let consumer = FanOutConsumer::new(
            bus,
            queue.clone(),
            FanOutSplitter::new(store),
            fast_retry(),
        );

        // Four participant refreshes plus the course's own group.
        assert_eq!(consumer.accept(&course_trigger("course-1")).await.unwrap(), 5);
        assert_eq!(queue.len(), 5);
    }

    #[tokio::test]
    async fn fan_out_store_outage_keeps_the_trigger_for_redelivery() {
        let bus = Arc::new(InMemoryEventBus::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let store = Arc::new(InMemoryEntityStore::new());
        fixtures::seed_course_with_participants(&store, "course-1", 4);
        let consumer = FanOutConsumer::new(
            bus,
            queue.clone(),
            FanOutSplitter::new(store.clone()),
            fast_retry(),
        );
        let trigger = course_trigger("course-1");

        store.fail_next_operations(5);
        assert!(consumer.accept(&trigger).await.is_err());
        assert!(queue.is_empty());

        assert!(consumer.accept(&trigger).await.is_err());
        assert_eq!(consumer.accept(&trigger).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn run_redelivers_a_trigger_until_it_is_enqueued() {
        let bus = Arc::new(InMemoryEventBus::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let store = Arc::new(InMemoryEntityStore::new());
        fixtures::seed_course_with_participants(&store, "course-1", 4);
        let consumer = FanOutConsumer::new(
            bus.clone(),
            queue.clone(),
            FanOutSplitter::new(store.clone()),
            fast_retry(),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { consumer.run(rx).await });
        bus.wait_for_subscribers(1).await;

        store.fail_next_operations(5);
        let trigger = course_trigger("course-1");
        bus.publish(&trigger.topic().to_string(), &trigger).await.unwrap();

        eventually(|| queue.len() == 5).await;
        eventually(|| bus.acked() == 1).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert!(bus.redelivered() >= 1);
    }

    #[tokio::test]
    async fn run_rejects_undecodable_bytes_and_moves_on() {
        let bus = Arc::new(InMemoryEventBus::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let ingress = Ingress::new(bus.clone(), queue.clone(), fast_retry());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { ingress.run(rx).await });
        bus.wait_for_subscribers(1).await;

        bus.push_raw("external.course.created", b"{not json");
        let envelope = fixtures::course_created("course-1");
        bus.publish(&envelope.topic().to_string(), &envelope).await.unwrap();

        eventually(|| queue.len() == 1).await;
        eventually(|| bus.acked() == 2).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let rejected = queue.rejected(10).await.unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].origin, "external.course.created");
        assert_eq!(rejected[0].payload, b"{not json".to_vec());
        assert_eq!(bus.redelivered(), 0);
    }

    #[tokio::test]
    async fn ingress_run_consumes_published_external_events() {
        let bus = Arc::new(InMemoryEventBus::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let ingress = Ingress::new(bus.clone(), queue.clone(), fast_retry());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { ingress.run(rx).await });
        bus.wait_for_subscribers(1).await;

        let envelope = fixtures::course_created("course-1");
        bus.publish(&envelope.topic().to_string(), &envelope).await.unwrap();
        bus.publish("internal.course.created", &envelope).await.unwrap();

        eventually(|| queue.len() == 1).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(queue.len(), 1);
        let jobs = queue.receive(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(jobs[0].job.envelope.kind, EntityKind::Course);
    }
}
