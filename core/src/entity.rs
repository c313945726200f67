//! Entity kinds, their mutable field sets and payload merge rules.
//!
//! Five kinds of entity are kept in sync:
//!
//! - **Course** and **Group**: standalone records with a lifecycle status
//! - **Member**: a person, linked to one source reference per external platform
//! - **Participant**: a Member enrolled on a Course
//! - **GroupMember**: a Member belonging to a Group
//!
//! The two composite kinds carry a denormalized snapshot of the records they
//! point at, so a change to a Course or Member propagates to them as an update.

use crate::ids::{EntityId, SourceRef};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for parsing kinds, operations and namespaces from strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {what}: '{value}'")]
pub struct ParseNameError {
    what: &'static str,
    value: String,
}

impl ParseNameError {
    pub(crate) fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// The kind of entity an event or record refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A course that members enroll on
    Course,
    /// Enrollment of a member on a course
    Participant,
    /// A person known to one or more external platforms
    Member,
    /// A community group
    Group,
    /// Membership of a member in a group
    GroupMember,
}

impl EntityKind {
    /// Every kind, in a stable order.
    pub const ALL: [Self; 5] = [
        Self::Course,
        Self::Participant,
        Self::Member,
        Self::Group,
        Self::GroupMember,
    ];

    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Course => "course",
            Self::Participant => "participant",
            Self::Member => "member",
            Self::Group => "group",
            Self::GroupMember => "group_member",
        }
    }

    /// Whether the kind links a parent record and a member.
    #[must_use]
    pub const fn is_composite(self) -> bool {
        matches!(self, Self::Participant | Self::GroupMember)
    }

    /// The parent kind of a composite (`Course` for participants, `Group` for group members).
    #[must_use]
    pub const fn parent_kind(self) -> Option<Self> {
        match self {
            Self::Participant => Some(Self::Course),
            Self::GroupMember => Some(Self::Group),
            Self::Course | Self::Member | Self::Group => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseNameError::new("entity kind", s))
    }
}

/// What happened to an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// The entity came into existence
    Created,
    /// An existing entity changed
    Updated,
}

impl Operation {
    /// Wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            _ => Err(ParseNameError::new("operation", s)),
        }
    }
}

/// Lifecycle of a course or group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    /// Announced but not yet open
    #[default]
    Pending,
    /// Accepting activity
    Open,
    /// Finished
    Closed,
}

/// Status of a member or of a membership (participant, group member).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    /// Known but not yet activated
    #[default]
    Pending,
    /// Active
    Active,
    /// Switched off in the source system
    Disabled,
}

/// Mutable fields of a course.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseFields {
    /// URL-safe short name
    pub slug: String,
    /// Display name
    pub name: String,
    /// Lifecycle status
    pub status: LifecycleStatus,
    /// When enrollment opens
    #[serde(default)]
    pub date_open: Option<DateTime<Utc>>,
    /// When enrollment closes
    #[serde(default)]
    pub date_closed: Option<DateTime<Utc>>,
    /// Account that owns the course
    pub account_owner: String,
}

/// Mutable fields of a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFields {
    /// URL-safe short name
    pub slug: String,
    /// Display name
    pub name: String,
    /// Lifecycle status
    pub status: LifecycleStatus,
    /// Account that owns the group
    pub account_owner: String,
}

/// Mutable fields of a member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberFields {
    /// Full name
    pub name: String,
    /// Contact email
    pub email: String,
    /// Employer or organisation, when known
    #[serde(default)]
    pub organisation_name: Option<String>,
    /// Member status
    pub status: MembershipStatus,
    /// Account that owns the member
    pub account_owner: String,
}

/// Mutable fields of a participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantFields {
    /// Enrollment status
    pub status: MembershipStatus,
    /// Account that owns the enrollment
    pub account_owner: String,
}

/// Mutable fields of a group membership.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMemberFields {
    /// Membership status
    pub status: MembershipStatus,
    /// Account that owns the membership
    pub account_owner: String,
}

/// A course record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    /// Identifier
    pub id: EntityId,
    /// External references
    pub source_ids: Vec<SourceRef>,
    /// Mutable fields
    pub fields: CourseFields,
}

/// A group record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Identifier
    pub id: EntityId,
    /// External references
    pub source_ids: Vec<SourceRef>,
    /// Mutable fields
    pub fields: GroupFields,
}

/// A member record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Identifier
    pub id: EntityId,
    /// External references, one per platform
    pub source_ids: Vec<SourceRef>,
    /// Mutable fields
    pub fields: MemberFields,
}

/// A participant record: a member enrolled on a course.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Identifier
    pub id: EntityId,
    /// External references
    pub source_ids: Vec<SourceRef>,
    /// The course enrolled on
    pub course_id: EntityId,
    /// The enrolled member
    pub member_id: EntityId,
    /// Mutable fields
    pub fields: ParticipantFields,
    /// Snapshot of the course at the last refresh
    pub course: CourseFields,
    /// Snapshot of the member at the last refresh
    pub member: MemberFields,
}

/// A group membership record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Identifier
    pub id: EntityId,
    /// External references
    pub source_ids: Vec<SourceRef>,
    /// The group
    pub group_id: EntityId,
    /// The member
    pub member_id: EntityId,
    /// Mutable fields
    pub fields: GroupMemberFields,
    /// Snapshot of the member at the last refresh
    pub member: MemberFields,
}

/// Any entity, tagged by kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    /// A course
    Course(Course),
    /// A participant
    Participant(Participant),
    /// A member
    Member(Member),
    /// A group
    Group(Group),
    /// A group membership
    GroupMember(GroupMember),
}

impl Entity {
    /// The kind of this entity.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Course(_) => EntityKind::Course,
            Self::Participant(_) => EntityKind::Participant,
            Self::Member(_) => EntityKind::Member,
            Self::Group(_) => EntityKind::Group,
            Self::GroupMember(_) => EntityKind::GroupMember,
        }
    }

    /// The identifier of this entity.
    #[must_use]
    pub const fn id(&self) -> &EntityId {
        match self {
            Self::Course(e) => &e.id,
            Self::Participant(e) => &e.id,
            Self::Member(e) => &e.id,
            Self::Group(e) => &e.id,
            Self::GroupMember(e) => &e.id,
        }
    }

    /// External references of this entity.
    #[must_use]
    pub fn source_ids(&self) -> &[SourceRef] {
        match self {
            Self::Course(e) => &e.source_ids,
            Self::Participant(e) => &e.source_ids,
            Self::Member(e) => &e.source_ids,
            Self::Group(e) => &e.source_ids,
            Self::GroupMember(e) => &e.source_ids,
        }
    }

    /// Link a source reference, replacing any earlier reference from the same
    /// platform. Returns `false` when it was already linked.
    pub fn add_source(&mut self, source: SourceRef) -> bool {
        let source_ids = match self {
            Self::Course(e) => &mut e.source_ids,
            Self::Participant(e) => &mut e.source_ids,
            Self::Member(e) => &mut e.source_ids,
            Self::Group(e) => &mut e.source_ids,
            Self::GroupMember(e) => &mut e.source_ids,
        };
        match source_ids.iter_mut().find(|s| s.source() == source.source()) {
            Some(existing) if *existing == source => false,
            Some(existing) => {
                *existing = source;
                true
            },
            None => {
                source_ids.push(source);
                true
            },
        }
    }

    /// The parent record of a composite (course or group id).
    #[must_use]
    pub const fn parent_id(&self) -> Option<&EntityId> {
        match self {
            Self::Participant(e) => Some(&e.course_id),
            Self::GroupMember(e) => Some(&e.group_id),
            Self::Course(_) | Self::Member(_) | Self::Group(_) => None,
        }
    }

    /// The member a composite points at.
    #[must_use]
    pub const fn member_id(&self) -> Option<&EntityId> {
        match self {
            Self::Participant(e) => Some(&e.member_id),
            Self::GroupMember(e) => Some(&e.member_id),
            Self::Course(_) | Self::Member(_) | Self::Group(_) => None,
        }
    }

    /// The entity as a JSON object, used as the payload of internal events.
    ///
    /// # Errors
    ///
    /// Returns [`FieldsError::Encode`] if serialization fails.
    pub fn to_payload(&self) -> Result<Map<String, Value>, FieldsError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(FieldsError::Encode {
                kind: self.kind(),
                reason: "entity did not serialize to an object".to_string(),
            }),
            Err(e) => Err(FieldsError::Encode {
                kind: self.kind(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Errors from applying a payload to a field set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldsError {
    /// The merged payload does not describe a valid field set
    #[error("Invalid {kind} payload: {reason}")]
    Invalid {
        /// Kind being merged
        kind: EntityKind,
        /// What is wrong
        reason: String,
    },

    /// The current fields could not be encoded
    #[error("Failed to encode {kind} fields: {reason}")]
    Encode {
        /// Kind being encoded
        kind: EntityKind,
        /// What went wrong
        reason: String,
    },
}

/// Overlay an event payload onto a field set.
///
/// Keys present in `patch` replace the current value, absent keys keep it. With
/// no current fields (a create) every required field must be in the payload.
/// Keys that are not fields of `F` are ignored.
///
/// # Errors
///
/// Returns [`FieldsError::Invalid`] if the merged object does not deserialize
/// into `F`, and [`FieldsError::Encode`] if `current` cannot be serialized.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use syncflow_core::entity::{merge_fields, EntityKind, ParticipantFields, MembershipStatus};
///
/// let patch = json!({ "status": "active", "account_owner": "acme" });
/// let fields: ParticipantFields =
///     merge_fields(EntityKind::Participant, None, patch.as_object().unwrap()).unwrap();
/// assert_eq!(fields.status, MembershipStatus::Active);
/// ```
pub fn merge_fields<F>(
    kind: EntityKind,
    current: Option<&F>,
    patch: &Map<String, Value>,
) -> Result<F, FieldsError>
where
    F: Serialize + DeserializeOwned,
{
    let mut merged = match current {
        Some(fields) => match serde_json::to_value(fields) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(FieldsError::Encode {
                    kind,
                    reason: "fields did not serialize to an object".to_string(),
                });
            },
            Err(e) => {
                return Err(FieldsError::Encode {
                    kind,
                    reason: e.to_string(),
                });
            },
        },
        None => Map::new(),
    };

    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }

    serde_json::from_value(Value::Object(merged)).map_err(|e| FieldsError::Invalid {
        kind,
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn course_fields() -> CourseFields {
        CourseFields {
            slug: "rust-101".to_string(),
            name: "Rust 101".to_string(),
            status: LifecycleStatus::Open,
            date_open: None,
            date_closed: None,
            account_owner: "acme".to_string(),
        }
    }

    #[test]
    fn kind_names_roundtrip_through_from_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("lesson".parse::<EntityKind>().is_err());
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&EntityKind::GroupMember).unwrap(),
            "\"group_member\""
        );
    }

    #[test]
    fn composite_kinds_name_their_parent() {
        assert_eq!(EntityKind::Participant.parent_kind(), Some(EntityKind::Course));
        assert_eq!(EntityKind::GroupMember.parent_kind(), Some(EntityKind::Group));
        assert_eq!(EntityKind::Member.parent_kind(), None);
        assert!(!EntityKind::Course.is_composite());
    }

    #[test]
    fn merge_keeps_absent_keys_and_replaces_present_ones() {
        let current = course_fields();
        let patch = json!({ "name": "Rust 102", "unrelated": 3 });

        let merged: CourseFields =
            merge_fields(EntityKind::Course, Some(&current), patch.as_object().unwrap())
                .expect("merge should succeed");

        assert_eq!(merged.name, "Rust 102");
        assert_eq!(merged.slug, "rust-101");
        assert_eq!(merged.status, LifecycleStatus::Open);
    }

    #[test]
    fn merge_without_current_requires_every_field() {
        let patch = json!({ "name": "Rust 101" });
        let result: Result<CourseFields, _> =
            merge_fields(EntityKind::Course, None, patch.as_object().unwrap());

        assert!(matches!(result, Err(FieldsError::Invalid { kind: EntityKind::Course, .. })));
    }

    #[test]
    fn merge_null_clears_optional_field() {
        let mut current = course_fields();
        current.date_open = Some(Utc::now());
        let patch = json!({ "date_open": null });

        let merged: CourseFields =
            merge_fields(EntityKind::Course, Some(&current), patch.as_object().unwrap()).unwrap();

        assert_eq!(merged.date_open, None);
    }

    #[test]
    fn add_source_is_idempotent() {
        let mut entity = Entity::Course(Course {
            id: EntityId::new("c-1"),
            source_ids: vec![],
            fields: course_fields(),
        });

        assert!(entity.add_source(SourceRef::new("KAJABI", "1")));
        assert!(!entity.add_source(SourceRef::new("KAJABI", "1")));
        assert_eq!(entity.source_ids().len(), 1);
    }

    #[test]
    fn add_source_replaces_reference_for_same_platform() {
        let mut entity = Entity::Course(Course {
            id: EntityId::new("c-1"),
            source_ids: vec![SourceRef::new("KAJABI", "1"), SourceRef::new("CIRCLE", "9")],
            fields: course_fields(),
        });

        assert!(entity.add_source(SourceRef::new("KAJABI", "2")));

        assert_eq!(
            entity.source_ids(),
            [SourceRef::new("KAJABI", "2"), SourceRef::new("CIRCLE", "9")]
        );
    }

    #[test]
    fn entity_payload_is_tagged_with_kind() {
        let entity = Entity::Course(Course {
            id: EntityId::new("c-1"),
            source_ids: vec![SourceRef::new("KAJABI", "1")],
            fields: course_fields(),
        });

        let payload = entity.to_payload().unwrap();
        assert_eq!(payload["kind"], json!("course"));
        assert_eq!(payload["source_ids"], json!(["KAJABI#1"]));

        let back: Entity = serde_json::from_value(Value::Object(payload)).unwrap();
        assert_eq!(back, entity);
    }
}
