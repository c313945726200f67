//! In-memory work queue with visibility timeouts, a dead-letter list and a
//! list of rejected messages.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use syncflow_core::environment::{Clock, SystemClock};
use syncflow_core::work_queue::{
    DeadLetter, Delivery, Job, QueueError, Receipt, RejectedMessage, WorkQueue,
};
use tokio::time::Instant;
use uuid::Uuid;

type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'a>>;

#[derive(Debug)]
struct Entry {
    job: Job,
    visible_at: Instant,
    delivered: bool,
}

#[derive(Debug, Default)]
struct Queues {
    ready: Vec<Entry>,
    dead: Vec<DeadLetter>,
    rejected: Vec<RejectedMessage>,
}

impl Queues {
    fn position(&self, receipt: Receipt) -> Result<usize, QueueError> {
        self.ready
            .iter()
            .position(|e| {
                e.delivered && e.job.job_id == receipt.job_id && e.job.attempt == receipt.attempt
            })
            .ok_or(QueueError::StaleReceipt {
                job_id: receipt.job_id,
                attempt: receipt.attempt,
            })
    }
}

/// In-memory [`WorkQueue`].
///
/// Delivery increments a job's attempt count. A delivered job that is not
/// settled before its visibility timeout becomes receivable again, and the
/// old receipt goes stale. With a maximum receive count, a visible job that
/// already used up its deliveries is dead-lettered instead of delivered.
#[derive(Clone)]
pub struct InMemoryWorkQueue {
    queues: Arc<Mutex<Queues>>,
    clock: Arc<dyn Clock>,
    max_receive_count: Option<u32>,
    enqueue_failures: Arc<AtomicUsize>,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkQueue {
    /// Create an empty queue stamped by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty queue that stamps dead letters with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: Arc::new(Mutex::new(Queues::default())),
            clock,
            max_receive_count: None,
            enqueue_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Dead-letter jobs that were delivered `max` times without being settled.
    #[must_use]
    pub const fn with_max_receive_count(mut self, max: u32) -> Self {
        self.max_receive_count = Some(max);
        self
    }

    /// Jobs that are queued or in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.lock().unwrap().ready.len()
    }

    /// Whether no job is queued or in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `n` enqueues fail with [`QueueError::Backend`].
    pub fn fail_next_enqueues(&self, n: usize) {
        self.enqueue_failures.store(n, Ordering::SeqCst);
    }

    fn enqueue_now(&self, jobs: Vec<Job>) -> Result<usize, QueueError> {
        let failed = self
            .enqueue_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(QueueError::Backend("injected failure".to_string()));
        }
        let mut queues = self.queues.lock().unwrap();
        let now = Instant::now();
        let mut enqueued = 0;
        for job in jobs {
            if queues.ready.iter().any(|e| e.job.job_id == job.job_id) {
                continue;
            }
            queues.ready.push(Entry {
                job,
                visible_at: now,
                delivered: false,
            });
            enqueued += 1;
        }
        Ok(enqueued)
    }

    fn receive_now(&self, max: usize, visibility_timeout: Duration) -> Vec<Delivery> {
        let mut queues = self.queues.lock().unwrap();
        let now = Instant::now();
        if let Some(limit) = self.max_receive_count {
            self.redrive(&mut queues, now, limit);
        }
        queues
            .ready
            .iter_mut()
            .filter(|e| e.visible_at <= now)
            .take(max)
            .map(|entry| {
                entry.job.attempt += 1;
                entry.visible_at = now + visibility_timeout;
                entry.delivered = true;
                Delivery {
                    receipt: Receipt {
                        job_id: entry.job.job_id,
                        attempt: entry.job.attempt,
                    },
                    job: entry.job.clone(),
                }
            })
            .collect()
    }

    fn redrive(&self, queues: &mut Queues, now: Instant, limit: u32) {
        let (exhausted, ready): (Vec<_>, Vec<_>) = std::mem::take(&mut queues.ready)
            .into_iter()
            .partition(|e| e.visible_at <= now && e.job.attempt >= limit);
        queues.ready = ready;
        for entry in exhausted {
            queues.dead.push(DeadLetter {
                reason: format!("exceeded max receive count {limit}"),
                job: entry.job,
                permanent: false,
                dead_lettered_at: self.clock.now(),
            });
        }
    }

    fn settle_now(&self, receipt: Receipt, settle: Settle) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().unwrap();
        let index = queues.position(receipt)?;
        match settle {
            Settle::Ack => {
                queues.ready.remove(index);
            },
            Settle::Retry(delay) => {
                let entry = &mut queues.ready[index];
                entry.visible_at = Instant::now() + delay;
                entry.delivered = false;
            },
            Settle::DeadLetter { reason, permanent } => {
                let entry = queues.ready.remove(index);
                queues.dead.push(DeadLetter {
                    job: entry.job,
                    reason,
                    permanent,
                    dead_lettered_at: self.clock.now(),
                });
            },
        }
        Ok(())
    }

    fn replay_now(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().unwrap();
        let index = queues
            .dead
            .iter()
            .position(|d| d.job.job_id == job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        let mut job = queues.dead.remove(index).job;
        job.attempt = 0;
        queues.ready.push(Entry {
            job,
            visible_at: Instant::now(),
            delivered: false,
        });
        Ok(())
    }
}

enum Settle {
    Ack,
    Retry(Duration),
    DeadLetter { reason: String, permanent: bool },
}

impl WorkQueue for InMemoryWorkQueue {
    fn enqueue(&self, jobs: Vec<Job>) -> QueueFuture<'_, usize> {
        let result = self.enqueue_now(jobs);
        Box::pin(async move { result })
    }

    fn receive(&self, max: usize, visibility_timeout: Duration) -> QueueFuture<'_, Vec<Delivery>> {
        let batch = self.receive_now(max, visibility_timeout);
        Box::pin(async move { Ok(batch) })
    }

    fn ack(&self, receipt: Receipt) -> QueueFuture<'_, ()> {
        let result = self.settle_now(receipt, Settle::Ack);
        Box::pin(async move { result })
    }

    fn retry(&self, receipt: Receipt, delay: Duration) -> QueueFuture<'_, ()> {
        let result = self.settle_now(receipt, Settle::Retry(delay));
        Box::pin(async move { result })
    }

    fn dead_letter(&self, receipt: Receipt, reason: String, permanent: bool) -> QueueFuture<'_, ()> {
        let result = self.settle_now(receipt, Settle::DeadLetter { reason, permanent });
        Box::pin(async move { result })
    }

    fn dead_letters(&self, limit: usize) -> QueueFuture<'_, Vec<DeadLetter>> {
        let dead = self
            .queues
            .lock()
            .unwrap()
            .dead
            .iter()
            .take(limit)
            .cloned()
            .collect();
        Box::pin(async move { Ok(dead) })
    }

    fn reject(&self, message: RejectedMessage) -> QueueFuture<'_, ()> {
        self.queues.lock().unwrap().rejected.push(message);
        Box::pin(async move { Ok(()) })
    }

    fn rejected(&self, limit: usize) -> QueueFuture<'_, Vec<RejectedMessage>> {
        let rejected = self
            .queues
            .lock()
            .unwrap()
            .rejected
            .iter()
            .take(limit)
            .cloned()
            .collect();
        Box::pin(async move { Ok(rejected) })
    }

    fn replay(&self, job_id: Uuid) -> QueueFuture<'_, ()> {
        let result = self.replay_now(job_id);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fixtures, test_clock};

    fn job(id: &str) -> Job {
        Job::new(fixtures::course_created(id))
    }

    #[tokio::test]
    async fn duplicate_job_ids_are_skipped() {
        let queue = InMemoryWorkQueue::new();
        let job = job("course-1");

        assert_eq!(queue.enqueue(vec![job.clone(), job.clone()]).await.unwrap(), 1);
        assert_eq!(queue.enqueue(vec![job]).await.unwrap(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn received_job_is_hidden_until_settled() {
        let queue = InMemoryWorkQueue::new();
        queue.enqueue(vec![job("course-1")]).await.unwrap();

        let batch = queue.receive(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].receipt.attempt, 1);
        assert!(queue.receive(10, Duration::from_secs(30)).await.unwrap().is_empty());

        queue.ack(batch[0].receipt).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_visibility_redelivers_and_stales_old_receipt() {
        let queue = InMemoryWorkQueue::new();
        queue.enqueue(vec![job("course-1")]).await.unwrap();

        let first = queue.receive(1, Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let second = queue.receive(1, Duration::from_secs(1)).await.unwrap();

        assert_eq!(second[0].receipt.attempt, 2);
        assert!(matches!(
            queue.ack(first[0].receipt).await,
            Err(QueueError::StaleReceipt { .. })
        ));
        queue.ack(second[0].receipt).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delays_visibility() {
        let queue = InMemoryWorkQueue::new();
        queue.enqueue(vec![job("course-1")]).await.unwrap();

        let batch = queue.receive(1, Duration::from_secs(30)).await.unwrap();
        queue.retry(batch[0].receipt, Duration::from_secs(5)).await.unwrap();
        assert!(queue.receive(1, Duration::from_secs(30)).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(queue.receive(1, Duration::from_secs(30)).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsettled_job_is_redriven_after_max_receives() {
        let queue = InMemoryWorkQueue::with_clock(Arc::new(test_clock())).with_max_receive_count(2);
        queue.enqueue(vec![job("course-1")]).await.unwrap();

        for attempt in 1..=2 {
            let batch = queue.receive(1, Duration::from_secs(1)).await.unwrap();
            assert_eq!(batch[0].receipt.attempt, attempt);
            tokio::time::advance(Duration::from_secs(2)).await;
        }

        assert!(queue.receive(1, Duration::from_secs(1)).await.unwrap().is_empty());
        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.attempt, 2);
        assert!(!dead[0].permanent);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dead_letter_then_replay_resets_attempts() {
        let clock = test_clock();
        let queue = InMemoryWorkQueue::with_clock(Arc::new(clock.clone()));
        let job = job("course-1");
        let job_id = job.job_id;
        queue.enqueue(vec![job]).await.unwrap();

        let batch = queue.receive(1, Duration::from_secs(30)).await.unwrap();
        queue
            .dead_letter(batch[0].receipt, "bad payload".to_string(), true)
            .await
            .unwrap();

        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dead_lettered_at, clock.now());
        assert!(queue.is_empty());

        queue.replay(job_id).await.unwrap();
        assert!(queue.dead_letters(10).await.unwrap().is_empty());
        let again = queue.receive(1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(again[0].receipt.attempt, 1);

        assert_eq!(queue.replay(job_id).await, Err(QueueError::NotFound(job_id)));
    }

    #[tokio::test]
    async fn rejected_messages_are_kept_apart_from_jobs() {
        let queue = InMemoryWorkQueue::new();
        queue
            .reject(RejectedMessage::new("external.course.created", b"{".to_vec(), "EOF"))
            .await
            .unwrap();

        let rejected = queue.rejected(10).await.unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].payload, b"{".to_vec());
        assert!(queue.is_empty());
        assert!(queue.dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_enqueue_stores_nothing() {
        let queue = InMemoryWorkQueue::new();
        queue.fail_next_enqueues(1);
        let job = Job::new(fixtures::course_created("course-1"));

        assert!(queue.enqueue(vec![job.clone()]).await.is_err());
        assert!(queue.is_empty());
        assert_eq!(queue.enqueue(vec![job]).await.unwrap(), 1);
    }
}
