//! Read-only resolution of the entities a job refers to.
//!
//! The resolver never writes. A `None` result means "not visible yet": the
//! store is only eventually consistent with the bus, so callers requeue rather
//! than fail when something they need is missing.

use std::sync::Arc;
use syncflow_core::entity::EntityKind;
use syncflow_core::entity_store::{EntityRecord, EntityStore, StoreError};
use syncflow_core::envelope::{EnvelopeError, EventEnvelope};
use syncflow_core::ids::{EntityId, SourceRef};
use thiserror::Error;

/// Payload key naming the member of a composite by source reference.
pub const MEMBER_SOURCE_REF: &str = "member_source_ref";
/// Payload key naming the member of a composite by id.
pub const MEMBER_ID: &str = "member_id";

/// Errors from resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The envelope itself is malformed
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// A reference in the payload is missing or malformed
    #[error("Invalid reference '{field}': {reason}")]
    InvalidReference {
        /// Payload key
        field: String,
        /// What is wrong
        reason: String,
    },
}

impl ResolveError {
    /// Whether retrying later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Envelope(_) | Self::InvalidReference { .. } => false,
        }
    }
}

/// Records a composite entity depends on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Related {
    /// Course (participant) or group (group member)
    pub parent: Option<EntityRecord>,
    /// The member
    pub member: Option<EntityRecord>,
    /// Source reference the member was looked up by, used for find-or-create
    pub member_source: Option<SourceRef>,
}

/// Loads primary and related entities from the store.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn EntityStore>,
}

impl Resolver {
    /// Create a resolver over a store.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Load an entity by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails.
    pub async fn resolve(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<EntityRecord>, StoreError> {
        self.store.get(kind, id.clone()).await
    }

    /// Load an entity by external source reference.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails.
    pub async fn resolve_by_source(
        &self,
        kind: EntityKind,
        source: &SourceRef,
    ) -> Result<Option<EntityRecord>, StoreError> {
        self.store.find_by_source(kind, source.clone()).await
    }

    /// Load the entity an envelope is about: by id first, then by source reference.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Envelope`] if the envelope is malformed, or
    /// [`ResolveError::Store`] if the store fails.
    pub async fn resolve_primary(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<Option<EntityRecord>, ResolveError> {
        let id = envelope.entity_id()?;
        if let Some(record) = self.resolve(envelope.kind, &id).await? {
            return Ok(Some(record));
        }
        match envelope.source_ref()? {
            Some(source) => Ok(self.resolve_by_source(envelope.kind, &source).await?),
            None => Ok(None),
        }
    }

    /// Load the parent and member of a composite entity.
    ///
    /// An existing composite keeps its links, so they are read from `primary`.
    /// A new one is linked through the payload: `<parent>_id` or
    /// `<parent>_source_ref`, and `member_id` or `member_source_ref`.
    /// Non-composite kinds resolve to an empty [`Related`].
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InvalidReference`] if a new composite does not name
    /// its parent or member, or [`ResolveError::Store`] if the store fails.
    pub async fn resolve_related(
        &self,
        envelope: &EventEnvelope,
        primary: Option<&EntityRecord>,
    ) -> Result<Related, ResolveError> {
        let Some(parent_kind) = envelope.kind.parent_kind() else {
            return Ok(Related::default());
        };

        if let Some(record) = primary {
            let parent = match record.entity.parent_id() {
                Some(id) => self.resolve(parent_kind, id).await?,
                None => None,
            };
            let member = match record.entity.member_id() {
                Some(id) => self.resolve(EntityKind::Member, id).await?,
                None => None,
            };
            return Ok(Related {
                parent,
                member,
                member_source: None,
            });
        }

        let parent_id_key = format!("{}_id", parent_kind.as_str());
        let parent_source_key = format!("{}_source_ref", parent_kind.as_str());
        let parent = self
            .resolve_reference(envelope, parent_kind, &parent_id_key, &parent_source_key)
            .await?;

        let member_source = parse_source(envelope, MEMBER_SOURCE_REF)?;
        let member = self
            .resolve_reference(envelope, EntityKind::Member, MEMBER_ID, MEMBER_SOURCE_REF)
            .await?;

        Ok(Related {
            parent,
            member,
            member_source,
        })
    }

    async fn resolve_reference(
        &self,
        envelope: &EventEnvelope,
        kind: EntityKind,
        id_key: &str,
        source_key: &str,
    ) -> Result<Option<EntityRecord>, ResolveError> {
        if let Some(id) = envelope.payload_str(id_key) {
            let id: EntityId = id.parse().map_err(|e: syncflow_core::ids::ParseEntityIdError| {
                ResolveError::InvalidReference {
                    field: id_key.to_string(),
                    reason: e.to_string(),
                }
            })?;
            if let Some(record) = self.resolve(kind, &id).await? {
                return Ok(Some(record));
            }
        }

        match parse_source(envelope, source_key)? {
            Some(source) => Ok(self.resolve_by_source(kind, &source).await?),
            None if envelope.payload.contains_key(id_key) => Ok(None),
            None => Err(ResolveError::InvalidReference {
                field: source_key.to_string(),
                reason: format!("a new {} must name it by {id_key} or {source_key}", envelope.kind),
            }),
        }
    }
}

fn parse_source(envelope: &EventEnvelope, key: &str) -> Result<Option<SourceRef>, ResolveError> {
    envelope
        .payload_str(key)
        .map(str::parse)
        .transpose()
        .map_err(|e: syncflow_core::ids::ParseSourceRefError| ResolveError::InvalidReference {
            field: key.to_string(),
            reason: e.to_string(),
        })
}
