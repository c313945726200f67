//! Durable, at-least-once work queue with a dead-letter destination.
//!
//! The queue sits between the fan-out splitter (or ingress) and the worker pool.
//! It absorbs bursts so that worker concurrency stays bounded regardless of how
//! many jobs a single trigger produces.
//!
//! # Delivery contract
//!
//! - [`WorkQueue::receive`] hides each delivered job for a visibility timeout
//!   and increments its attempt counter
//! - A job that is not settled before the timeout becomes visible again and may
//!   be delivered to another worker
//! - A job whose next delivery would exceed the queue's maximum receive count is
//!   moved to the dead-letter destination instead (redrive)
//! - Settling uses the [`Receipt`] of the delivery; a receipt from an expired
//!   delivery is rejected with [`QueueError::StaleReceipt`]
//!
//! Bytes that never became a [`Job`] (a bus message or a stored row that does
//! not decode) are kept as [`RejectedMessage`]s next to the dead letters.

use crate::envelope::EventEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// One unit of work: an envelope plus its delivery count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Queue key. Equal to the envelope's event id, so enqueuing a duplicate is a no-op
    pub job_id: Uuid,
    /// The envelope to process
    pub envelope: EventEnvelope,
    /// How many times the job has been delivered (1 on first delivery)
    pub attempt: u32,
}

impl Job {
    /// A job that has never been delivered.
    #[must_use]
    pub fn new(envelope: EventEnvelope) -> Self {
        Self {
            job_id: envelope.event_id,
            envelope,
            attempt: 0,
        }
    }
}

/// Handle used to settle one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Receipt {
    /// The delivered job
    pub job_id: Uuid,
    /// Attempt number of the delivery
    pub attempt: u32,
}

/// A job handed to a worker.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Settlement handle
    pub receipt: Receipt,
    /// The job, with `attempt` already incremented
    pub job: Job,
}

/// A job parked for manual inspection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The job as last delivered
    pub job: Job,
    /// Why it was dead-lettered
    pub reason: String,
    /// `true` for malformed input, `false` for exhausted retries
    pub permanent: bool,
    /// When it was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

/// Raw bytes that could not be decoded into a job, kept for inspection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedMessage {
    /// Where the bytes came from: a bus topic, or `jobs` for a stored row
    pub origin: String,
    /// The bytes as received
    pub payload: Vec<u8>,
    /// Decode failure
    pub reason: String,
    /// When they were set aside
    pub rejected_at: DateTime<Utc>,
}

impl RejectedMessage {
    /// A message rejected now.
    #[must_use]
    pub fn new(origin: impl Into<String>, payload: Vec<u8>, reason: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            payload,
            reason: reason.into(),
            rejected_at: Utc::now(),
        }
    }
}

/// Errors that can occur during work queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The receipt belongs to an expired or already settled delivery
    #[error("Stale receipt for job {job_id} (attempt {attempt})")]
    StaleReceipt {
        /// Job named by the receipt
        job_id: Uuid,
        /// Attempt named by the receipt
        attempt: u32,
    },

    /// No dead letter with this job id
    #[error("Job {0} not found")]
    NotFound(Uuid),

    /// Backend (database, network) failure
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// A stored job could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Trait for work queue implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn WorkQueue>`).
pub trait WorkQueue: Send + Sync {
    /// Enqueue a batch of jobs. Jobs whose id is already queued are skipped.
    ///
    /// Returns how many jobs were newly enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the batch could not be stored. No job of
    /// a failed batch is visible to workers.
    fn enqueue(
        &self,
        jobs: Vec<Job>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, QueueError>> + Send + '_>>;

    /// Receive up to `max` visible jobs, hiding them for `visibility_timeout`.
    ///
    /// Returns an empty batch when nothing is ready.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] on failure.
    fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>, QueueError>> + Send + '_>>;

    /// Remove a successfully processed job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::StaleReceipt`] if the delivery already expired.
    fn ack(
        &self,
        receipt: Receipt,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Make a job visible again after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::StaleReceipt`] if the delivery already expired.
    fn retry(
        &self,
        receipt: Receipt,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Move a job to the dead-letter destination.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::StaleReceipt`] if the delivery already expired.
    fn dead_letter(
        &self,
        receipt: Receipt,
        reason: String,
        permanent: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// List dead-lettered jobs, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] on failure.
    fn dead_letters(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, QueueError>> + Send + '_>>;

    /// Keep bytes that could not be decoded into a job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the message could not be stored.
    fn reject(
        &self,
        message: RejectedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// List rejected messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] on failure.
    fn rejected(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RejectedMessage>, QueueError>> + Send + '_>>;

    /// Move a dead-lettered job back to the ready queue with its attempt count reset.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if no dead letter has this id.
    fn replay(
        &self,
        job_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKind, Operation};
    use serde_json::Map;

    #[test]
    fn new_job_is_keyed_by_event_id() {
        let envelope = EventEnvelope::external(
            EntityKind::Member,
            Operation::Updated,
            "member-1",
            Map::new(),
            Utc::now(),
        );
        let job = Job::new(envelope.clone());

        assert_eq!(job.job_id, envelope.event_id);
        assert_eq!(job.attempt, 0);
    }
}
