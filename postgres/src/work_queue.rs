//! `PostgreSQL` work queue.
//!
//! Jobs live in the `jobs` table. Receiving claims visible rows with
//! `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the same table
//! without handing one job to two of them at once. A claimed job is hidden by
//! pushing its `visible_at` forward; if the worker never settles it, it simply
//! becomes visible again.
//!
//! With a maximum receive count, each receive first moves visible jobs that
//! already used up their deliveries into `dead_letters` (redrive).
//!
//! A claimed row whose envelope no longer decodes is moved into
//! `rejected_messages` in the same transaction as the claim, and the rest of
//! the batch is delivered as usual.
//!
//! Receipts carry the attempt number. Every settling statement matches on
//! `(job_id, attempt)`, so a worker whose delivery timed out and was handed to
//! someone else gets [`QueueError::StaleReceipt`].

use crate::dead_letter_queue::{DeadLetterQueue, backend, from_db_attempt, to_db_attempt};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use syncflow_core::envelope::EventEnvelope;
use syncflow_core::work_queue::{
    DeadLetter, Delivery, Job, QueueError, Receipt, RejectedMessage, WorkQueue,
};
use uuid::Uuid;

type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'a>>;

/// Origin recorded for stored jobs that no longer decode.
pub const JOBS_ORIGIN: &str = "jobs";

/// [`WorkQueue`] backed by the `jobs`, `dead_letters` and `rejected_messages` tables.
#[derive(Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
    dead_letters: DeadLetterQueue,
    max_receive_count: Option<u32>,
}

impl PostgresWorkQueue {
    /// Create a queue over an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            dead_letters: DeadLetterQueue::new(pool.clone()),
            pool,
            max_receive_count: None,
        }
    }

    /// Dead-letter jobs that were delivered `max` times without being settled.
    #[must_use]
    pub const fn with_max_receive_count(mut self, max: u32) -> Self {
        self.max_receive_count = Some(max);
        self
    }

    /// Operator access to the dead-letter table.
    #[must_use]
    pub const fn dead_letter_queue(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Number of jobs queued or in flight.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the query fails.
    pub async fn depth(&self) -> Result<i64, QueueError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)
    }

    async fn enqueue_jobs(&self, jobs: Vec<Job>) -> Result<usize, QueueError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut enqueued = 0;

        for job in &jobs {
            let envelope = serde_json::to_value(&job.envelope)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            let result = sqlx::query(
                r"
                INSERT INTO jobs (job_id, envelope, attempt)
                VALUES ($1, $2, $3)
                ON CONFLICT (job_id) DO NOTHING
                ",
            )
            .bind(job.job_id)
            .bind(&envelope)
            .bind(to_db_attempt(job.attempt)?)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            if result.rows_affected() == 1 {
                enqueued += 1;
            }
        }

        tx.commit().await.map_err(backend)?;

        tracing::debug!(requested = jobs.len(), enqueued, "Enqueued jobs");
        Ok(enqueued)
    }

    async fn redrive(&self, max_receive_count: u32) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r"
            WITH exhausted AS (
                DELETE FROM jobs
                WHERE job_id IN (
                    SELECT job_id
                    FROM jobs
                    WHERE visible_at <= NOW() AND attempt >= $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING job_id, envelope, attempt
            )
            INSERT INTO dead_letters (job_id, envelope, attempt, reason, permanent)
            SELECT job_id, envelope, attempt, $2, FALSE
            FROM exhausted
            ",
        )
        .bind(to_db_attempt(max_receive_count)?)
        .bind(format!("exceeded max receive count {max_receive_count}"))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let redriven = result.rows_affected();
        if redriven > 0 {
            tracing::warn!(redriven, max_receive_count, "Redrove exhausted jobs to dead letters");
            metrics::counter!("work_queue.dlq.redriven").increment(redriven);
        }
        Ok(redriven)
    }

    async fn receive_jobs(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        if let Some(max_receive_count) = self.max_receive_count {
            self.redrive(max_receive_count).await?;
        }

        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let rows = sqlx::query(
            r"
            UPDATE jobs
            SET attempt = attempt + 1,
                visible_at = NOW() + make_interval(secs => $2)
            WHERE job_id IN (
                SELECT job_id
                FROM jobs
                WHERE visible_at <= NOW()
                ORDER BY visible_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING job_id, envelope, attempt
            ",
        )
        .bind(limit)
        .bind(visibility_timeout.as_secs_f64())
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in &rows {
            let job_id: Uuid = row.try_get("job_id").map_err(backend)?;
            let attempt = from_db_attempt(row.try_get("attempt").map_err(backend)?)?;
            let body: serde_json::Value = row.try_get("envelope").map_err(backend)?;

            match serde_json::from_value::<EventEnvelope>(body.clone()) {
                Ok(envelope) => deliveries.push(Delivery {
                    receipt: Receipt { job_id, attempt },
                    job: Job {
                        job_id,
                        envelope,
                        attempt,
                    },
                }),
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Stored job does not decode, rejecting it");
                    sqlx::query("DELETE FROM jobs WHERE job_id = $1")
                        .bind(job_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(backend)?;
                    insert_rejected(
                        &mut tx,
                        &RejectedMessage::new(
                            JOBS_ORIGIN,
                            body.to_string().into_bytes(),
                            format!("job {job_id}: {e}"),
                        ),
                    )
                    .await?;
                    metrics::counter!("work_queue.rejected.total", "origin" => JOBS_ORIGIN)
                        .increment(1);
                },
            }
        }

        tx.commit().await.map_err(backend)?;
        Ok(deliveries)
    }

    async fn reject_message(&self, message: RejectedMessage) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        insert_rejected(&mut conn, &message).await?;
        tracing::warn!(origin = %message.origin, reason = %message.reason, "Rejected message");
        metrics::counter!("work_queue.rejected.total", "origin" => message.origin).increment(1);
        Ok(())
    }

    async fn list_rejected(&self, limit: usize) -> Result<Vec<RejectedMessage>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT origin, payload, reason, rejected_at
            FROM rejected_messages
            ORDER BY id
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| {
                let rejected_at: DateTime<Utc> = row.try_get("rejected_at").map_err(backend)?;
                Ok(RejectedMessage {
                    origin: row.try_get("origin").map_err(backend)?,
                    payload: row.try_get("payload").map_err(backend)?,
                    reason: row.try_get("reason").map_err(backend)?,
                    rejected_at,
                })
            })
            .collect()
    }

    async fn ack_job(&self, receipt: Receipt) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = $1 AND attempt = $2")
            .bind(receipt.job_id)
            .bind(to_db_attempt(receipt.attempt)?)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        ensure_settled(result.rows_affected(), receipt)
    }

    async fn retry_job(&self, receipt: Receipt, delay: Duration) -> Result<(), QueueError> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET visible_at = NOW() + make_interval(secs => $3)
            WHERE job_id = $1 AND attempt = $2
            ",
        )
        .bind(receipt.job_id)
        .bind(to_db_attempt(receipt.attempt)?)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        ensure_settled(result.rows_affected(), receipt)
    }

    async fn dead_letter_job(
        &self,
        receipt: Receipt,
        reason: String,
        permanent: bool,
    ) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let envelope: Option<serde_json::Value> = sqlx::query_scalar(
            "DELETE FROM jobs WHERE job_id = $1 AND attempt = $2 RETURNING envelope",
        )
        .bind(receipt.job_id)
        .bind(to_db_attempt(receipt.attempt)?)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let Some(envelope) = envelope else {
            return Err(stale(receipt));
        };
        let job = Job {
            job_id: receipt.job_id,
            envelope: serde_json::from_value(envelope)
                .map_err(|e| QueueError::Serialization(e.to_string()))?,
            attempt: receipt.attempt,
        };

        DeadLetterQueue::add_entry(&mut tx, &job, &reason, permanent).await?;
        tx.commit().await.map_err(backend)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let failed = self.dead_letters.list_pending(limit).await?;
        Ok(failed.into_iter().map(DeadLetter::from).collect())
    }
}

impl WorkQueue for PostgresWorkQueue {
    fn enqueue(&self, jobs: Vec<Job>) -> QueueFuture<'_, usize> {
        Box::pin(self.enqueue_jobs(jobs))
    }

    fn receive(&self, max: usize, visibility_timeout: Duration) -> QueueFuture<'_, Vec<Delivery>> {
        Box::pin(self.receive_jobs(max, visibility_timeout))
    }

    fn ack(&self, receipt: Receipt) -> QueueFuture<'_, ()> {
        Box::pin(self.ack_job(receipt))
    }

    fn retry(&self, receipt: Receipt, delay: Duration) -> QueueFuture<'_, ()> {
        Box::pin(self.retry_job(receipt, delay))
    }

    fn dead_letter(&self, receipt: Receipt, reason: String, permanent: bool) -> QueueFuture<'_, ()> {
        Box::pin(self.dead_letter_job(receipt, reason, permanent))
    }

    fn dead_letters(&self, limit: usize) -> QueueFuture<'_, Vec<DeadLetter>> {
        Box::pin(self.list_dead_letters(limit))
    }

    fn reject(&self, message: RejectedMessage) -> QueueFuture<'_, ()> {
        Box::pin(self.reject_message(message))
    }

    fn rejected(&self, limit: usize) -> QueueFuture<'_, Vec<RejectedMessage>> {
        Box::pin(self.list_rejected(limit))
    }

    fn replay(&self, job_id: Uuid) -> QueueFuture<'_, ()> {
        Box::pin(self.dead_letters.replay(job_id))
    }
}

async fn insert_rejected(
    conn: &mut sqlx::PgConnection,
    message: &RejectedMessage,
) -> Result<(), QueueError> {
    sqlx::query(
        r"
        INSERT INTO rejected_messages (origin, payload, reason, rejected_at)
        VALUES ($1, $2, $3, $4)
        ",
    )
    .bind(&message.origin)
    .bind(&message.payload)
    .bind(&message.reason)
    .bind(message.rejected_at)
    .execute(conn)
    .await
    .map_err(backend)?;
    Ok(())
}

const fn stale(receipt: Receipt) -> QueueError {
    QueueError::StaleReceipt {
        job_id: receipt.job_id,
        attempt: receipt.attempt,
    }
}

const fn ensure_settled(rows: u64, receipt: Receipt) -> Result<(), QueueError> {
    if rows == 0 {
        Err(stale(receipt))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsettled_receipt_is_stale() {
        let receipt = Receipt {
            job_id: Uuid::new_v4(),
            attempt: 2,
        };

        assert_eq!(ensure_settled(1, receipt), Ok(()));
        assert_eq!(
            ensure_settled(0, receipt),
            Err(QueueError::StaleReceipt {
                job_id: receipt.job_id,
                attempt: 2,
            })
        );
    }
}
