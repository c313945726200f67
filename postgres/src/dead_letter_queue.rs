//! Dead-letter destination for jobs that cannot be processed.
//!
//! Rows are never deleted. Operators inspect pending entries, then either
//! replay them onto the work queue or discard them with a note. Both outcomes
//! stay in the table for audit.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use syncflow_core::envelope::EventEnvelope;
use syncflow_core::work_queue::{DeadLetter, Job, QueueError};
use uuid::Uuid;

/// Status of a dead-lettered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for an operator
    Pending,
    /// Moved back onto the work queue
    Replayed,
    /// Given up on
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Replayed => "replayed",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "pending" => Ok(Self::Pending),
            "replayed" => Ok(Self::Replayed),
            "discarded" => Ok(Self::Discarded),
            _ => Err(QueueError::Serialization(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the dead-letter table.
#[derive(Debug, Clone)]
pub struct FailedJob {
    /// Row id
    pub id: i64,
    /// The job as last delivered
    pub job: Job,
    /// Why it was dead-lettered
    pub reason: String,
    /// Whether the failure was permanent (malformed input)
    pub permanent: bool,
    /// Current status
    pub status: DLQStatus,
    /// When it was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
    /// When it was replayed or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes
    pub resolution_notes: Option<String>,
}

impl From<FailedJob> for DeadLetter {
    fn from(failed: FailedJob) -> Self {
        Self {
            job: failed.job,
            reason: failed.reason,
            permanent: failed.permanent,
            dead_lettered_at: failed.dead_lettered_at,
        }
    }
}

/// `PostgreSQL`-based dead-letter table.
///
/// # Example
///
/// ```no_run
/// use syncflow_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// dlq.mark_discarded(pending[0].id, "source record was deleted").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new dead-letter queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a dead letter on `conn`, usually inside the transaction that
    /// removes the job from the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the insert fails.
    pub async fn add_entry(
        conn: &mut PgConnection,
        job: &Job,
        reason: &str,
        permanent: bool,
    ) -> Result<i64, QueueError> {
        let envelope = serde_json::to_value(&job.envelope)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_letters (job_id, envelope, attempt, reason, permanent)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(job.job_id)
        .bind(&envelope)
        .bind(to_db_attempt(job.attempt)?)
        .bind(reason)
        .bind(permanent)
        .fetch_one(conn)
        .await
        .map_err(backend)?;

        tracing::warn!(
            dlq_id = id,
            job_id = %job.job_id,
            kind = %job.envelope.kind,
            attempt = job.attempt,
            permanent,
            reason,
            "Job added to dead-letter table"
        );

        metrics::counter!(
            "work_queue.dlq.added",
            "kind" => job.envelope.kind.as_str(),
            "permanent" => if permanent { "true" } else { "false" }
        )
        .increment(1);

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedJob>, QueueError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedJob>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT
                id, job_id, envelope, attempt, reason, permanent, status,
                dead_lettered_at, resolved_at, resolution_notes
            FROM dead_letters
            WHERE status = $1
            ORDER BY dead_lettered_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(Self::row_to_failed_job).collect()
    }

    /// Get one entry by row id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the query fails or the entry does not exist.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedJob, QueueError> {
        let row = sqlx::query(
            r"
            SELECT
                id, job_id, envelope, attempt, reason, permanent, status,
                dead_lettered_at, resolved_at, resolution_notes
            FROM dead_letters
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Self::row_to_failed_job(&row)
    }

    /// Move the pending entry for `job_id` back onto the work queue with its
    /// attempt count reset.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if no pending entry has this job id.
    pub async fn replay(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let envelope: Option<serde_json::Value> = sqlx::query_scalar(
            r"
            UPDATE dead_letters
            SET status = 'replayed', resolved_at = NOW()
            WHERE job_id = $1 AND status = 'pending'
            RETURNING envelope
            ",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let Some(envelope) = envelope else {
            return Err(QueueError::NotFound(job_id));
        };

        sqlx::query(
            r"
            INSERT INTO jobs (job_id, envelope, attempt, visible_at)
            VALUES ($1, $2, 0, NOW())
            ON CONFLICT (job_id) DO UPDATE SET attempt = 0, visible_at = NOW()
            ",
        )
        .bind(job_id)
        .bind(&envelope)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        tracing::info!(job_id = %job_id, "Dead-lettered job replayed");
        metrics::counter!("work_queue.dlq.replayed").increment(1);
        Ok(())
    }

    /// Mark an entry as discarded.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), QueueError> {
        sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");

        metrics::counter!("work_queue.dlq.discarded").increment(1);

        Ok(())
    }

    /// Count of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, QueueError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;

        Ok(count)
    }

    fn row_to_failed_job(row: &sqlx::postgres::PgRow) -> Result<FailedJob, QueueError> {
        let envelope: serde_json::Value = row.try_get("envelope").map_err(backend)?;
        let envelope: EventEnvelope = serde_json::from_value(envelope)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let attempt: i32 = row.try_get("attempt").map_err(backend)?;
        let status: String = row.try_get("status").map_err(backend)?;

        Ok(FailedJob {
            id: row.try_get("id").map_err(backend)?,
            job: Job {
                job_id: row.try_get("job_id").map_err(backend)?,
                envelope,
                attempt: from_db_attempt(attempt)?,
            },
            reason: row.try_get("reason").map_err(backend)?,
            permanent: row.try_get("permanent").map_err(backend)?,
            status: DLQStatus::parse(&status)?,
            dead_lettered_at: row.try_get("dead_lettered_at").map_err(backend)?,
            resolved_at: row.try_get("resolved_at").map_err(backend)?,
            resolution_notes: row.try_get("resolution_notes").map_err(backend)?,
        })
    }
}

pub(crate) fn to_db_attempt(attempt: u32) -> Result<i32, QueueError> {
    i32::try_from(attempt)
        .map_err(|_| QueueError::Serialization(format!("attempt {attempt} exceeds INTEGER")))
}

pub(crate) fn from_db_attempt(attempt: i32) -> Result<u32, QueueError> {
    u32::try_from(attempt)
        .map_err(|_| QueueError::Serialization(format!("negative attempt {attempt}")))
}

#[allow(clippy::needless_pass_by_value)] // Used as a map_err adapter
pub(crate) fn backend(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}
