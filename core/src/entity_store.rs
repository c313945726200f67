//! Entity store abstraction with conditional writes.
//!
//! The store keeps one [`EntityRecord`] per `(kind, id)` plus an index from
//! source references to records. Every write is conditional:
//!
//! - [`EntityStore::create`] fails with [`StoreError::AlreadyExists`] if the key is taken
//! - [`EntityStore::update`] fails with [`StoreError::VersionConflict`] unless the
//!   stored version equals the expected one
//!
//! These two preconditions are the only concurrency control in the system.
//! Writers race on them and the loser re-resolves.
//!
//! Each write also carries the internal events announcing it. They are appended
//! to the store's [`Outbox`](crate::outbox::Outbox) atomically with the record,
//! so a committed change is never left without its announcement.
//!
//! # Implementations
//!
//! - `InMemoryEntityStore` (syncflow-testing) - For tests
//! - `PostgresEntityStore` (syncflow-postgres) - For production

use crate::entity::{Entity, EntityKind};
use crate::envelope::EventEnvelope;
use crate::ids::{EntityId, SourceRef, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// A stored entity plus its concurrency metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// The entity itself
    pub entity: Entity,
    /// Optimistic-concurrency version (1 on create, +1 per update)
    pub version: Version,
    /// Source timestamp of the last applied change (last-writer-wins key)
    pub occurred_at: DateTime<Utc>,
    /// Event that produced the current state
    pub last_event_id: Uuid,
}

impl EntityRecord {
    /// A record about to be created.
    #[must_use]
    pub fn new(entity: Entity, occurred_at: DateTime<Utc>, event_id: Uuid) -> Self {
        Self {
            entity,
            version: Version::FIRST,
            occurred_at,
            last_event_id: event_id,
        }
    }

    /// Kind of the stored entity.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.entity.kind()
    }

    /// Identifier of the stored entity.
    #[must_use]
    pub const fn id(&self) -> &EntityId {
        self.entity.id()
    }
}

/// Errors that can occur during entity store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Conditional create found the key already taken
    #[error("{kind} '{id}' already exists")]
    AlreadyExists {
        /// Kind of the entity
        kind: EntityKind,
        /// Identifier of the entity
        id: EntityId,
    },

    /// Conditional update found a different version
    #[error("Version conflict on {kind} '{id}': expected {expected}, found {actual:?}")]
    VersionConflict {
        /// Kind of the entity
        kind: EntityKind,
        /// Identifier of the entity
        id: EntityId,
        /// Version the write was decided against
        expected: Version,
        /// Version actually stored (`None` if the record vanished)
        actual: Option<Version>,
    },

    /// A source reference is already linked to a different record
    #[error("Source reference '{source_ref}' already belongs to {kind} '{owner}'")]
    SourceTaken {
        /// Kind of the entity
        kind: EntityKind,
        /// The contested reference
        source_ref: SourceRef,
        /// Record that owns it
        owner: EntityId,
    },

    /// Backend (database, network) failure
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the error is a lost race on a write precondition.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. } | Self::VersionConflict { .. } | Self::SourceTaken { .. }
        )
    }

    /// Whether retrying later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

/// A parent-to-children relation the fan-out splitter enumerates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Relation {
    /// Participants enrolled on a course
    ParticipantsOfCourse,
    /// Participations of a member
    ParticipantsOfMember,
    /// Members of a group
    GroupMembersOfGroup,
    /// Group memberships of a member
    GroupMembersOfMember,
}

impl Relation {
    /// Kind of the records being listed.
    #[must_use]
    pub const fn child_kind(self) -> EntityKind {
        match self {
            Self::ParticipantsOfCourse | Self::ParticipantsOfMember => EntityKind::Participant,
            Self::GroupMembersOfGroup | Self::GroupMembersOfMember => EntityKind::GroupMember,
        }
    }

    /// Whether a child entity belongs to `parent` under this relation.
    #[must_use]
    pub fn links(self, child: &Entity, parent: &EntityId) -> bool {
        match (self, child) {
            (Self::ParticipantsOfCourse, Entity::Participant(p)) => &p.course_id == parent,
            (Self::ParticipantsOfMember, Entity::Participant(p)) => &p.member_id == parent,
            (Self::GroupMembersOfGroup, Entity::GroupMember(g)) => &g.group_id == parent,
            (Self::GroupMembersOfMember, Entity::GroupMember(g)) => &g.member_id == parent,
            _ => false,
        }
    }
}

/// Trait for entity store implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EntityStore>`), which the effects of
/// the orchestrator capture.
pub trait EntityStore: Send + Sync {
    /// Load a record by kind and id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] or [`StoreError::Serialization`] on failure.
    /// A missing record is `Ok(None)`, not an error.
    fn get(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EntityRecord>, StoreError>> + Send + '_>>;

    /// Load the record linked to an external source reference.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] or [`StoreError::Serialization`] on failure.
    fn find_by_source(
        &self,
        kind: EntityKind,
        source: SourceRef,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EntityRecord>, StoreError>> + Send + '_>>;

    /// Create a record, failing if the key is already taken.
    ///
    /// Source references of the entity are indexed and `events` are appended to
    /// the outbox in the same write. Nothing is stored if the write fails.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if `(kind, id)` exists, or
    /// [`StoreError::SourceTaken`] if one of its source references is linked elsewhere.
    fn create(
        &self,
        record: EntityRecord,
        events: Vec<EventEnvelope>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Replace a record if its stored version equals `expected`, appending
    /// `events` to the outbox in the same write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] if the stored version differs or the
    /// record is gone.
    fn update(
        &self,
        record: EntityRecord,
        expected: Version,
        events: Vec<EventEnvelope>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Identifiers of every child linked to `parent` under `relation`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on failure.
    fn list_related(
        &self,
        relation: Relation,
        parent: EntityId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EntityId>, StoreError>> + Send + '_>>;
}
