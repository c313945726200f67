//! The bus message and its topic naming.
//!
//! Every message on the bus is an [`EventEnvelope`] serialized as JSON. Topics
//! are split into two namespaces:
//!
//! - `external.<kind>.<operation>` - raw changes stamped by the ingress API
//! - `internal.<kind>.<operation>` - normalized events published after a write
//!
//! Downstream consumers only subscribe to internal topics. The orchestrator's
//! own ingress is the only consumer of external topics.
//!
//! A third namespace, `derived`, names jobs syncflow builds itself from an
//! internal event (a course's group, a participant's group membership). Derived
//! jobs go straight to the work queue and never appear on the bus.

use crate::entity::{EntityKind, FieldsError, Operation, ParseNameError};
use crate::entity_store::EntityRecord;
use crate::ids::{EntityId, SYNCFLOW_NAMESPACE, SourceRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Which side of the orchestrator an event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Raw event from a source-of-truth system
    External,
    /// Normalized event published by syncflow
    Internal,
    /// Upsert job built by syncflow from another entity's internal event
    Derived,
}

impl Namespace {
    /// Wire name of the namespace.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Internal => "internal",
            Self::Derived => "derived",
        }
    }
}

impl FromStr for Namespace {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external" => Ok(Self::External),
            "internal" => Ok(Self::Internal),
            "derived" => Ok(Self::Derived),
            _ => Err(ParseNameError::new("namespace", s)),
        }
    }
}

/// A bus topic: namespace, entity kind and operation.
///
/// # Examples
///
/// ```
/// use syncflow_core::entity::{EntityKind, Operation};
/// use syncflow_core::envelope::{Namespace, Topic};
///
/// let topic = Topic::internal(EntityKind::Course, Operation::Updated);
/// assert_eq!(topic.to_string(), "internal.course.updated");
/// assert_eq!("internal.course.updated".parse::<Topic>().unwrap(), topic);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Topic {
    /// Namespace
    pub namespace: Namespace,
    /// Entity kind
    pub kind: EntityKind,
    /// Operation
    pub operation: Operation,
}

impl Topic {
    /// Create a topic.
    #[must_use]
    pub const fn new(namespace: Namespace, kind: EntityKind, operation: Operation) -> Self {
        Self {
            namespace,
            kind,
            operation,
        }
    }

    /// An external topic.
    #[must_use]
    pub const fn external(kind: EntityKind, operation: Operation) -> Self {
        Self::new(Namespace::External, kind, operation)
    }

    /// An internal topic.
    #[must_use]
    pub const fn internal(kind: EntityKind, operation: Operation) -> Self {
        Self::new(Namespace::Internal, kind, operation)
    }

    /// Every topic of a namespace.
    #[must_use]
    pub fn all(namespace: Namespace) -> Vec<Self> {
        EntityKind::ALL
            .into_iter()
            .flat_map(|kind| {
                [Operation::Created, Operation::Updated]
                    .into_iter()
                    .map(move |operation| Self::new(namespace, kind, operation))
            })
            .collect()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.namespace.as_str(),
            self.kind.as_str(),
            self.operation.as_str()
        )
    }
}

impl FromStr for Topic {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(kind), Some(operation)) => Ok(Self::new(
                namespace.parse()?,
                kind.parse()?,
                operation.parse()?,
            )),
            _ => Err(ParseNameError::new("topic", s)),
        }
    }
}

/// Reasons an envelope is rejected before any resolution happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// `entity_id` is missing or blank
    #[error("Envelope {event_id} has no entity_id")]
    MissingEntityId {
        /// The offending event
        event_id: Uuid,
    },

    /// `event_id` is the nil UUID
    #[error("Envelope for {kind} '{entity_id}' has a nil event_id")]
    NilEventId {
        /// Kind named by the envelope
        kind: EntityKind,
        /// Entity named by the envelope
        entity_id: String,
    },

    /// `source_ref` is present but not `SOURCE#id`
    #[error("Envelope {event_id} has an invalid source_ref: {reason}")]
    InvalidSourceRef {
        /// The offending event
        event_id: Uuid,
        /// Parse failure
        reason: String,
    },

    /// The record to publish could not be encoded
    #[error(transparent)]
    Payload(#[from] FieldsError),
}

/// An "entity changed" message.
///
/// `entity_id` and `payload` default when absent on the wire so that an
/// incomplete message still decodes and can be rejected by [`validate`](Self::validate)
/// instead of being lost in transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique id of this message (causal metadata)
    pub event_id: Uuid,
    /// External or internal
    pub namespace: Namespace,
    /// Entity kind
    pub kind: EntityKind,
    /// Created or updated
    pub operation: Operation,
    /// Identifier of the primary entity
    #[serde(default)]
    pub entity_id: String,
    /// External reference of the primary entity, as `SOURCE#id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    /// Desired field values (external) or the normalized entity (internal)
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Source timestamp of the change
    pub occurred_at: DateTime<Utc>,
    /// Event that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
}

impl EventEnvelope {
    /// A raw change from a source-of-truth system.
    #[must_use]
    pub fn external(
        kind: EntityKind,
        operation: Operation,
        entity_id: impl Into<String>,
        payload: Map<String, Value>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            namespace: Namespace::External,
            kind,
            operation,
            entity_id: entity_id.into(),
            source_ref: None,
            payload,
            occurred_at,
            causation_id: None,
        }
    }

    /// The normalized event announcing a committed write.
    ///
    /// The event id is derived from the causing event, the entity and the
    /// operation, so re-publishing the same change yields the same id.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Payload`] if the entity cannot be encoded.
    pub fn internal(
        operation: Operation,
        record: &EntityRecord,
        causation_id: Uuid,
    ) -> Result<Self, EnvelopeError> {
        let kind = record.kind();
        let name = format!("{causation_id}:{kind}:{}:{operation}", record.id());
        Ok(Self {
            event_id: Uuid::new_v5(&SYNCFLOW_NAMESPACE, name.as_bytes()),
            namespace: Namespace::Internal,
            kind,
            operation,
            entity_id: record.id().to_string(),
            source_ref: record.entity.source_ids().first().map(ToString::to_string),
            payload: record.entity.to_payload()?,
            occurred_at: record.occurred_at,
            causation_id: Some(causation_id),
        })
    }

    /// An upsert job for an entity whose state follows from `trigger`.
    ///
    /// `payload` is the complete desired state, as in an external envelope.
    /// The id is derived from the trigger and the target, so deriving twice
    /// from the same trigger yields the same job.
    #[must_use]
    pub fn derived(
        kind: EntityKind,
        entity_id: &EntityId,
        source_ref: &SourceRef,
        payload: Map<String, Value>,
        trigger: &Self,
    ) -> Self {
        let name = format!("derived:{}:{kind}:{entity_id}", trigger.event_id);
        Self {
            event_id: Uuid::new_v5(&SYNCFLOW_NAMESPACE, name.as_bytes()),
            namespace: Namespace::Derived,
            kind,
            operation: trigger.operation,
            entity_id: entity_id.to_string(),
            source_ref: Some(source_ref.to_string()),
            payload,
            occurred_at: trigger.occurred_at,
            causation_id: Some(trigger.event_id),
        }
    }

    /// A refresh job for one entity affected by `trigger`.
    ///
    /// Refresh jobs carry no payload: the orchestrator re-reads the entity and
    /// its related records and writes only if something changed. The id is
    /// derived from the trigger and the entity, so splitting the same trigger
    /// twice yields the same jobs.
    #[must_use]
    pub fn refresh(kind: EntityKind, entity_id: &EntityId, trigger: &Self) -> Self {
        let name = format!("refresh:{}:{kind}:{entity_id}", trigger.event_id);
        Self {
            event_id: Uuid::new_v5(&SYNCFLOW_NAMESPACE, name.as_bytes()),
            namespace: Namespace::Internal,
            kind,
            operation: Operation::Updated,
            entity_id: entity_id.to_string(),
            source_ref: None,
            payload: Map::new(),
            occurred_at: trigger.occurred_at,
            causation_id: Some(trigger.event_id),
        }
    }

    /// Attach a source reference.
    #[must_use]
    pub fn with_source_ref(mut self, source_ref: &SourceRef) -> Self {
        self.source_ref = Some(source_ref.to_string());
        self
    }

    /// Override the event id.
    #[must_use]
    pub const fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// The topic this envelope is published on.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        Topic::new(self.namespace, self.kind, self.operation)
    }

    /// Whether the envelope comes from a source-of-truth system.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.namespace == Namespace::External
    }

    /// Whether the payload is the complete desired state of the entity.
    ///
    /// True for external and derived envelopes. Such envelopes may create the
    /// entity and compete on `occurred_at`; refresh jobs do neither.
    #[must_use]
    pub const fn carries_state(&self) -> bool {
        matches!(self.namespace, Namespace::External | Namespace::Derived)
    }

    /// Parsed primary entity id.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MissingEntityId`] if the id is missing or blank.
    pub fn entity_id(&self) -> Result<EntityId, EnvelopeError> {
        self.entity_id
            .parse()
            .map_err(|_| EnvelopeError::MissingEntityId {
                event_id: self.event_id,
            })
    }

    /// Parsed primary source reference, if any.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidSourceRef`] if present but malformed.
    pub fn source_ref(&self) -> Result<Option<SourceRef>, EnvelopeError> {
        self.source_ref
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: crate::ids::ParseSourceRefError| EnvelopeError::InvalidSourceRef {
                event_id: self.event_id,
                reason: e.to_string(),
            })
    }

    /// Check the envelope is well-formed.
    ///
    /// # Errors
    ///
    /// Returns the first [`EnvelopeError`] found. These are never retried.
    pub fn validate(&self) -> Result<EntityId, EnvelopeError> {
        if self.event_id.is_nil() {
            return Err(EnvelopeError::NilEventId {
                kind: self.kind,
                entity_id: self.entity_id.clone(),
            });
        }
        let entity_id = self.entity_id()?;
        self.source_ref()?;
        Ok(entity_id)
    }

    /// A string payload value, if present.
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
