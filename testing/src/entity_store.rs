//! In-memory entity store for fast, deterministic tests.
//!
//! Enforces the same write preconditions as the Postgres store: duplicate
//! creates, stale versions and contested source references are rejected.
//! Events passed with a write land in the outbox under the same lock as the
//! record, so a failed write leaves no event behind.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use syncflow_core::entity::EntityKind;
use syncflow_core::entity_store::{EntityRecord, EntityStore, Relation, StoreError};
use syncflow_core::envelope::EventEnvelope;
use syncflow_core::ids::{EntityId, SourceRef, Version};
use syncflow_core::outbox::Outbox;
use uuid::Uuid;

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<(EntityKind, EntityId), EntityRecord>,
    sources: HashMap<(EntityKind, SourceRef), EntityId>,
    outbox: Vec<OutboxRow>,
}

#[derive(Debug)]
struct OutboxRow {
    envelope: EventEnvelope,
    published: bool,
}

impl Tables {
    fn check_sources(&self, record: &EntityRecord) -> Result<(), StoreError> {
        for source in record.entity.source_ids() {
            if let Some(owner) = self.sources.get(&(record.kind(), source.clone())) {
                if owner != record.id() {
                    return Err(StoreError::SourceTaken {
                        kind: record.kind(),
                        source_ref: source.clone(),
                        owner: owner.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn put(&mut self, record: EntityRecord) {
        let kind = record.kind();
        self.sources.retain(|(k, source), owner| {
            *k != kind || owner != record.id() || record.entity.source_ids().contains(source)
        });
        for source in record.entity.source_ids() {
            self.sources
                .insert((record.kind(), source.clone()), record.id().clone());
        }
        self.records
            .insert((record.kind(), record.id().clone()), record);
    }

    fn append(&mut self, events: Vec<EventEnvelope>) {
        for envelope in events {
            if self.outbox.iter().any(|row| row.envelope.event_id == envelope.event_id) {
                continue;
            }
            self.outbox.push(OutboxRow {
                envelope,
                published: false,
            });
        }
    }
}

/// In-memory [`EntityStore`].
///
/// # Example
///
/// ```
/// use syncflow_testing::InMemoryEntityStore;
///
/// let store = InMemoryEntityStore::new();
/// store.fail_next_operations(1); // next call returns StoreError::Backend
/// assert_eq!(store.writes(), 0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEntityStore {
    tables: Arc<RwLock<Tables>>,
    writes: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl InMemoryEntityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly, bypassing preconditions and the write counter.
    pub fn seed(&self, record: EntityRecord) {
        self.tables.write().unwrap().put(record);
    }

    /// Every record of a kind, sorted by id.
    #[must_use]
    pub fn snapshot(&self, kind: EntityKind) -> Vec<EntityRecord> {
        let tables = self.tables.read().unwrap();
        let mut records: Vec<_> = tables
            .records
            .values()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    /// Number of records of a kind.
    #[must_use]
    pub fn count(&self, kind: EntityKind) -> usize {
        self.snapshot(kind).len()
    }

    /// Successful creates and updates so far.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Outbox events not yet marked published, oldest first.
    #[must_use]
    pub fn unpublished(&self) -> Vec<EventEnvelope> {
        self.tables
            .read()
            .unwrap()
            .outbox
            .iter()
            .filter(|row| !row.published)
            .map(|row| row.envelope.clone())
            .collect()
    }

    /// Make the next `n` entity operations fail with [`StoreError::Backend`].
    ///
    /// Outbox reads and marks are never failed.
    pub fn fail_next_operations(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        let taken = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Backend("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn get_now(&self, kind: EntityKind, id: &EntityId) -> Result<Option<EntityRecord>, StoreError> {
        self.injected_failure()?;
        let tables = self.tables.read().unwrap();
        Ok(tables.records.get(&(kind, id.clone())).cloned())
    }

    fn find_now(
        &self,
        kind: EntityKind,
        source: &SourceRef,
    ) -> Result<Option<EntityRecord>, StoreError> {
        self.injected_failure()?;
        let tables = self.tables.read().unwrap();
        Ok(tables
            .sources
            .get(&(kind, source.clone()))
            .and_then(|id| tables.records.get(&(kind, id.clone())))
            .cloned())
    }

    fn create_now(&self, record: EntityRecord, events: Vec<EventEnvelope>) -> Result<(), StoreError> {
        self.injected_failure()?;
        let mut tables = self.tables.write().unwrap();
        if tables
            .records
            .contains_key(&(record.kind(), record.id().clone()))
        {
            return Err(StoreError::AlreadyExists {
                kind: record.kind(),
                id: record.id().clone(),
            });
        }
        tables.check_sources(&record)?;
        tables.put(record);
        tables.append(events);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update_now(
        &self,
        record: EntityRecord,
        expected: Version,
        events: Vec<EventEnvelope>,
    ) -> Result<(), StoreError> {
        self.injected_failure()?;
        let mut tables = self.tables.write().unwrap();
        let actual = tables
            .records
            .get(&(record.kind(), record.id().clone()))
            .map(|r| r.version);
        if actual != Some(expected) {
            return Err(StoreError::VersionConflict {
                kind: record.kind(),
                id: record.id().clone(),
                expected,
                actual,
            });
        }
        tables.check_sources(&record)?;
        tables.put(record);
        tables.append(events);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_now(&self, relation: Relation, parent: &EntityId) -> Result<Vec<EntityId>, StoreError> {
        self.injected_failure()?;
        let tables = self.tables.read().unwrap();
        let mut ids: Vec<_> = tables
            .records
            .values()
            .filter(|r| r.kind() == relation.child_kind() && relation.links(&r.entity, parent))
            .map(|r| r.id().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl EntityStore for InMemoryEntityStore {
    fn get(&self, kind: EntityKind, id: EntityId) -> StoreFuture<'_, Option<EntityRecord>> {
        let result = self.get_now(kind, &id);
        Box::pin(async move {
            tokio::task::yield_now().await;
            result
        })
    }

    fn find_by_source(
        &self,
        kind: EntityKind,
        source: SourceRef,
    ) -> StoreFuture<'_, Option<EntityRecord>> {
        let result = self.find_now(kind, &source);
        Box::pin(async move {
            tokio::task::yield_now().await;
            result
        })
    }

    fn create(&self, record: EntityRecord, events: Vec<EventEnvelope>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.create_now(record, events)
        })
    }

    fn update(
        &self,
        record: EntityRecord,
        expected: Version,
        events: Vec<EventEnvelope>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.update_now(record, expected, events)
        })
    }

    fn list_related(&self, relation: Relation, parent: EntityId) -> StoreFuture<'_, Vec<EntityId>> {
        let result = self.list_now(relation, &parent);
        Box::pin(async move { result })
    }
}

impl Outbox for InMemoryEntityStore {
    fn pending(&self, limit: usize) -> StoreFuture<'_, Vec<EventEnvelope>> {
        let mut pending = self.unpublished();
        pending.truncate(limit);
        Box::pin(async move { Ok(pending) })
    }

    fn mark_published(&self, event_id: Uuid) -> StoreFuture<'_, ()> {
        let mut tables = self.tables.write().unwrap();
        if let Some(row) = tables
            .outbox
            .iter_mut()
            .find(|row| row.envelope.event_id == event_id)
        {
            row.published = true;
        }
        Box::pin(async move { Ok(()) })
    }

    fn pending_count(&self) -> StoreFuture<'_, usize> {
        let count = self.unpublished().len();
        Box::pin(async move { Ok(count) })
    }
}
