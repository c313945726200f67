//! `PostgreSQL` entity store.
//!
//! Conditional writes map onto single-statement preconditions:
//!
//! - create: `INSERT ... ON CONFLICT DO NOTHING`, zero rows means the key is taken
//! - update: `UPDATE ... WHERE version = $expected`, zero rows means a lost race
//!
//! Source references are indexed in `entity_sources` and the events announcing
//! the write are appended to `outbox` inside the same transaction, so a record,
//! its references and its events become visible together.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use syncflow_core::entity::{Entity, EntityKind};
use syncflow_core::entity_store::{EntityRecord, EntityStore, Relation, StoreError};
use syncflow_core::envelope::EventEnvelope;
use syncflow_core::ids::{EntityId, SourceRef, Version};
use syncflow_core::outbox::Outbox;
use uuid::Uuid;

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// [`EntityStore`] and [`Outbox`] backed by the `entities`, `entity_sources`
/// and `outbox` tables.
#[derive(Clone)]
pub struct PostgresEntityStore {
    pool: PgPool,
}

impl PostgresEntityStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn get_record(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT version, occurred_at, last_event_id, body
            FROM entities
            WHERE kind = $1 AND id = $2
            ",
        )
        .bind(kind.as_str())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn find_record(
        &self,
        kind: EntityKind,
        source: SourceRef,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT e.version, e.occurred_at, e.last_event_id, e.body
            FROM entity_sources s
            JOIN entities e ON e.kind = s.kind AND e.id = s.entity_id
            WHERE s.kind = $1 AND s.source_ref = $2
            ",
        )
        .bind(kind.as_str())
        .bind(source.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn create_record(
        &self,
        record: EntityRecord,
        events: Vec<EventEnvelope>,
    ) -> Result<(), StoreError> {
        let row = Columns::of(&record)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let inserted = sqlx::query(
            r"
            INSERT INTO entities (
                kind, id, version, occurred_at, last_event_id, parent_id, member_id, body
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (kind, id) DO NOTHING
            ",
        )
        .bind(row.kind)
        .bind(row.id)
        .bind(row.version)
        .bind(record.occurred_at)
        .bind(record.last_event_id)
        .bind(row.parent_id)
        .bind(row.member_id)
        .bind(&row.body)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                kind: record.kind(),
                id: record.id().clone(),
            });
        }

        index_sources(&mut tx, &record).await?;
        append_outbox(&mut tx, &events).await?;
        tx.commit().await.map_err(backend)?;

        metrics::counter!("entity_store.writes.total", "kind" => row.kind, "operation" => "create")
            .increment(1);
        Ok(())
    }

    async fn update_record(
        &self,
        record: EntityRecord,
        expected: Version,
        events: Vec<EventEnvelope>,
    ) -> Result<(), StoreError> {
        let row = Columns::of(&record)?;
        let expected_value = to_db_version(expected)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let updated = sqlx::query(
            r"
            UPDATE entities
            SET version = $3,
                occurred_at = $4,
                last_event_id = $5,
                parent_id = $6,
                member_id = $7,
                body = $8,
                updated_at = now()
            WHERE kind = $1 AND id = $2 AND version = $9
            ",
        )
        .bind(row.kind)
        .bind(row.id)
        .bind(row.version)
        .bind(record.occurred_at)
        .bind(record.last_event_id)
        .bind(row.parent_id)
        .bind(row.member_id)
        .bind(&row.body)
        .bind(expected_value)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM entities WHERE kind = $1 AND id = $2")
                    .bind(row.kind)
                    .bind(row.id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(backend)?;
            return Err(StoreError::VersionConflict {
                kind: record.kind(),
                id: record.id().clone(),
                expected,
                actual: actual.map(from_db_version).transpose()?,
            });
        }

        index_sources(&mut tx, &record).await?;
        append_outbox(&mut tx, &events).await?;
        tx.commit().await.map_err(backend)?;

        metrics::counter!("entity_store.writes.total", "kind" => row.kind, "operation" => "update")
            .increment(1);
        Ok(())
    }

    async fn list_children(
        &self,
        relation: Relation,
        parent: EntityId,
    ) -> Result<Vec<EntityId>, StoreError> {
        let query = match relation {
            Relation::ParticipantsOfCourse | Relation::GroupMembersOfGroup => {
                "SELECT id FROM entities WHERE kind = $1 AND parent_id = $2 ORDER BY id"
            },
            Relation::ParticipantsOfMember | Relation::GroupMembersOfMember => {
                "SELECT id FROM entities WHERE kind = $1 AND member_id = $2 ORDER BY id"
            },
        };

        let ids: Vec<String> = sqlx::query_scalar(query)
            .bind(relation.child_kind().as_str())
            .bind(parent.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        Ok(ids.into_iter().map(EntityId::new).collect())
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<EventEnvelope>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let bodies: Vec<serde_json::Value> = sqlx::query_scalar(
            r"
            SELECT envelope
            FROM outbox
            WHERE published_at IS NULL
            ORDER BY seq
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        bodies
            .into_iter()
            .map(|body| {
                serde_json::from_value(body).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn mark_event_published(&self, event_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox SET published_at = now() WHERE event_id = $1 AND published_at IS NULL",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        metrics::counter!("entity_store.outbox.published.total").increment(1);
        Ok(())
    }

    async fn count_pending(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE published_at IS NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        usize::try_from(count)
            .map_err(|_| StoreError::Serialization(format!("negative outbox count {count}")))
    }
}

impl EntityStore for PostgresEntityStore {
    fn get(&self, kind: EntityKind, id: EntityId) -> StoreFuture<'_, Option<EntityRecord>> {
        Box::pin(self.get_record(kind, id))
    }

    fn find_by_source(
        &self,
        kind: EntityKind,
        source: SourceRef,
    ) -> StoreFuture<'_, Option<EntityRecord>> {
        Box::pin(self.find_record(kind, source))
    }

    fn create(&self, record: EntityRecord, events: Vec<EventEnvelope>) -> StoreFuture<'_, ()> {
        Box::pin(self.create_record(record, events))
    }

    fn update(
        &self,
        record: EntityRecord,
        expected: Version,
        events: Vec<EventEnvelope>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(self.update_record(record, expected, events))
    }

    fn list_related(&self, relation: Relation, parent: EntityId) -> StoreFuture<'_, Vec<EntityId>> {
        Box::pin(self.list_children(relation, parent))
    }
}

impl Outbox for PostgresEntityStore {
    fn pending(&self, limit: usize) -> StoreFuture<'_, Vec<EventEnvelope>> {
        Box::pin(self.pending_events(limit))
    }

    fn mark_published(&self, event_id: Uuid) -> StoreFuture<'_, ()> {
        Box::pin(self.mark_event_published(event_id))
    }

    fn pending_count(&self) -> StoreFuture<'_, usize> {
        Box::pin(self.count_pending())
    }
}

/// Column values derived from a record.
struct Columns<'a> {
    kind: &'static str,
    id: &'a str,
    version: i64,
    parent_id: Option<&'a str>,
    member_id: Option<&'a str>,
    body: serde_json::Value,
}

impl<'a> Columns<'a> {
    fn of(record: &'a EntityRecord) -> Result<Self, StoreError> {
        Ok(Self {
            kind: record.kind().as_str(),
            id: record.id().as_str(),
            version: to_db_version(record.version)?,
            parent_id: record.entity.parent_id().map(EntityId::as_str),
            member_id: record.entity.member_id().map(EntityId::as_str),
            body: serde_json::to_value(&record.entity)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        })
    }
}

/// Link every source reference of `record` to it, failing if one belongs elsewhere.
///
/// References the record no longer carries are unlinked first.
async fn index_sources(conn: &mut PgConnection, record: &EntityRecord) -> Result<(), StoreError> {
    let kind = record.kind();
    let current: Vec<String> = record
        .entity
        .source_ids()
        .iter()
        .map(ToString::to_string)
        .collect();
    sqlx::query(
        r"
        DELETE FROM entity_sources
        WHERE kind = $1 AND entity_id = $2 AND NOT (source_ref = ANY($3))
        ",
    )
    .bind(kind.as_str())
    .bind(record.id().as_str())
    .bind(&current)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;

    for source in record.entity.source_ids() {
        let owner: String = sqlx::query_scalar(
            r"
            INSERT INTO entity_sources (kind, source_ref, entity_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind, source_ref) DO UPDATE SET source_ref = EXCLUDED.source_ref
            RETURNING entity_id
            ",
        )
        .bind(kind.as_str())
        .bind(source.to_string())
        .bind(record.id().as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(backend)?;

        if owner != record.id().as_str() {
            return Err(StoreError::SourceTaken {
                kind,
                source_ref: source.clone(),
                owner: EntityId::new(owner),
            });
        }
    }
    Ok(())
}

/// Append events to the outbox. An event id already present is skipped.
async fn append_outbox(conn: &mut PgConnection, events: &[EventEnvelope]) -> Result<(), StoreError> {
    for event in events {
        let body =
            serde_json::to_value(event).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r"
            INSERT INTO outbox (event_id, topic, envelope)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            ",
        )
        .bind(event.event_id)
        .bind(event.topic().to_string())
        .bind(&body)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    }
    Ok(())
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<EntityRecord, StoreError> {
    let body: serde_json::Value = row.try_get("body").map_err(backend)?;
    let entity: Entity =
        serde_json::from_value(body).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let version: i64 = row.try_get("version").map_err(backend)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(backend)?;
    let last_event_id: Uuid = row.try_get("last_event_id").map_err(backend)?;

    Ok(EntityRecord {
        entity,
        version: from_db_version(version)?,
        occurred_at,
        last_event_id,
    })
}

fn to_db_version(version: Version) -> Result<i64, StoreError> {
    i64::try_from(version.value())
        .map_err(|_| StoreError::Serialization(format!("version {version} exceeds BIGINT")))
}

fn from_db_version(value: i64) -> Result<Version, StoreError> {
    u64::try_from(value)
        .map(Version::new)
        .map_err(|_| StoreError::Serialization(format!("negative version {value}")))
}

#[allow(clippy::needless_pass_by_value)] // Used as a map_err adapter
fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}
