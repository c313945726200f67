//! The `Deciding` step: turn a resolved job into a write, or into nothing.
//!
//! Pure over its inputs. Given the envelope, the current record (if any) and
//! the related records of a composite, [`decide`] computes the desired entity
//! and compares it with what is stored.
//!
//! External and derived envelopes carry the complete field set of the entity
//! and replace the stored fields outright, so the newest envelope alone decides
//! the result whatever order envelopes arrive in. A payload missing a required
//! field is rejected. Refresh jobs carry no fields and keep the stored ones.

use crate::resolver::Related;
use syncflow_core::entity::{
    Course, CourseFields, Entity, EntityKind, FieldsError, Group, GroupMember, Member,
    MemberFields, Participant, merge_fields,
};
use syncflow_core::entity_store::EntityRecord;
use syncflow_core::envelope::EventEnvelope;
use syncflow_core::ids::{EntityId, SourceRef, Version};
use thiserror::Error;

/// What the orchestrator should write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Create a record that does not exist yet
    Create(EntityRecord),
    /// Replace a record, conditional on its version
    Update {
        /// The desired record, already at the next version
        record: EntityRecord,
        /// Version the decision was made against
        expected: Version,
    },
    /// The desired state equals the stored state
    NoOp,
    /// The envelope is older than the stored state
    Stale,
}

/// Reasons a decision cannot be made. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecisionError {
    /// The payload does not produce a valid entity
    #[error(transparent)]
    Fields(#[from] FieldsError),

    /// A composite was decided without one of its related records
    #[error("{kind} requires a resolved {missing}")]
    Unresolved {
        /// Kind being decided
        kind: EntityKind,
        /// Related kind that is missing
        missing: EntityKind,
    },

    /// The stored record is of a different kind than the envelope
    #[error("Stored record for '{id}' is a {found}, expected {expected}")]
    KindMismatch {
        /// Record id
        id: EntityId,
        /// Kind named by the envelope
        expected: EntityKind,
        /// Kind actually stored
        found: EntityKind,
    },
}

/// Decide the write for one job.
///
/// State-carrying envelopes older than the stored record are [`Decision::Stale`]
/// (last writer wins on `occurred_at`, ties apply). Internal refresh jobs are
/// never stale and only refresh denormalized snapshots.
///
/// # Errors
///
/// Returns [`DecisionError`] if the payload is invalid or the inputs are inconsistent.
pub fn decide(
    envelope: &EventEnvelope,
    entity_id: &EntityId,
    primary: Option<&EntityRecord>,
    related: &Related,
) -> Result<Decision, DecisionError> {
    let source = envelope.source_ref().ok().flatten();

    let Some(current) = primary else {
        let mut entity = desired(envelope, entity_id, None, related)?;
        if let Some(source) = source {
            entity.add_source(source);
        }
        return Ok(Decision::Create(EntityRecord::new(
            entity,
            envelope.occurred_at,
            envelope.event_id,
        )));
    };

    if envelope.carries_state() && envelope.occurred_at < current.occurred_at {
        return Ok(Decision::Stale);
    }

    let mut entity = desired(envelope, current.id(), Some(&current.entity), related)?;
    if let Some(source) = source {
        entity.add_source(source);
    }

    if entity == current.entity {
        return Ok(Decision::NoOp);
    }

    Ok(Decision::Update {
        record: EntityRecord {
            entity,
            version: current.version.next(),
            occurred_at: current.occurred_at.max(envelope.occurred_at),
            last_event_id: envelope.event_id,
        },
        expected: current.version,
    })
}

/// Build a member from the `member` object of a composite payload.
///
/// # Errors
///
/// Returns [`FieldsError::Invalid`] if the object is missing or incomplete.
pub fn synthesize_member(
    envelope: &EventEnvelope,
    source: &SourceRef,
) -> Result<EntityRecord, FieldsError> {
    let fields = envelope
        .payload
        .get("member")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| FieldsError::Invalid {
            kind: EntityKind::Member,
            reason: format!("member '{source}' not found and payload has no member fields"),
        })?;
    let fields: MemberFields = merge_fields(EntityKind::Member, None, fields)?;

    let member = Member {
        id: EntityId::derive(EntityKind::Member, source),
        source_ids: vec![source.clone()],
        fields,
    };
    Ok(EntityRecord::new(
        Entity::Member(member),
        envelope.occurred_at,
        envelope.event_id,
    ))
}

fn desired(
    envelope: &EventEnvelope,
    id: &EntityId,
    current: Option<&Entity>,
    related: &Related,
) -> Result<Entity, DecisionError> {
    let kind = envelope.kind;
    let patch = &envelope.payload;
    let replace = envelope.carries_state();
    if let Some(current) = current {
        if current.kind() != kind {
            return Err(DecisionError::KindMismatch {
                id: id.clone(),
                expected: kind,
                found: current.kind(),
            });
        }
    }
    let source_ids = current.map(|e| e.source_ids().to_vec()).unwrap_or_default();

    let entity = match kind {
        EntityKind::Course => {
            let fields = match current {
                Some(Entity::Course(c)) if !replace => Some(&c.fields),
                _ => None,
            };
            Entity::Course(Course {
                id: id.clone(),
                source_ids,
                fields: merge_fields(kind, fields, patch)?,
            })
        },
        EntityKind::Group => {
            let fields = match current {
                Some(Entity::Group(g)) if !replace => Some(&g.fields),
                _ => None,
            };
            Entity::Group(Group {
                id: id.clone(),
                source_ids,
                fields: merge_fields(kind, fields, patch)?,
            })
        },
        EntityKind::Member => {
            let fields = match current {
                Some(Entity::Member(m)) if !replace => Some(&m.fields),
                _ => None,
            };
            Entity::Member(Member {
                id: id.clone(),
                source_ids,
                fields: merge_fields(kind, fields, patch)?,
            })
        },
        EntityKind::Participant => {
            let fields = match current {
                Some(Entity::Participant(p)) if !replace => Some(&p.fields),
                _ => None,
            };
            let (course_id, course) = course_snapshot(kind, related)?;
            let (member_id, member) = member_snapshot(kind, related)?;
            Entity::Participant(Participant {
                id: id.clone(),
                source_ids,
                course_id,
                member_id,
                fields: merge_fields(kind, fields, patch)?,
                course,
                member,
            })
        },
        EntityKind::GroupMember => {
            let fields = match current {
                Some(Entity::GroupMember(g)) if !replace => Some(&g.fields),
                _ => None,
            };
            let group_id = match related.parent.as_ref().map(|r| &r.entity) {
                Some(Entity::Group(group)) => group.id.clone(),
                _ => {
                    return Err(DecisionError::Unresolved {
                        kind,
                        missing: EntityKind::Group,
                    });
                },
            };
            let (member_id, member) = member_snapshot(kind, related)?;
            Entity::GroupMember(GroupMember {
                id: id.clone(),
                source_ids,
                group_id,
                member_id,
                fields: merge_fields(kind, fields, patch)?,
                member,
            })
        },
    };
    Ok(entity)
}

fn course_snapshot(
    kind: EntityKind,
    related: &Related,
) -> Result<(EntityId, CourseFields), DecisionError> {
    match related.parent.as_ref().map(|r| &r.entity) {
        Some(Entity::Course(course)) => Ok((course.id.clone(), course.fields.clone())),
        _ => Err(DecisionError::Unresolved {
            kind,
            missing: EntityKind::Course,
        }),
    }
}

fn member_snapshot(
    kind: EntityKind,
    related: &Related,
) -> Result<(EntityId, MemberFields), DecisionError> {
    match related.member.as_ref().map(|r| &r.entity) {
        Some(Entity::Member(member)) => Ok((member.id.clone(), member.fields.clone())),
        _ => Err(DecisionError::Unresolved {
            kind,
            missing: EntityKind::Member,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::{Map, Value, json};
    use syncflow_core::entity::{LifecycleStatus, Operation};

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn course_event(payload: Value, seconds: i64) -> EventEnvelope {
        EventEnvelope::external(
            EntityKind::Course,
            Operation::Updated,
            "course-1",
            object(payload),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(seconds),
        )
    }

    fn full_course() -> Value {
        json!({
            "slug": "rust-101",
            "name": "Rust 101",
            "status": "open",
            "account_owner": "acme"
        })
    }

    fn course_with(changes: Value) -> Value {
        let mut course = full_course();
        if let (Some(course), Some(changes)) = (course.as_object_mut(), changes.as_object()) {
            course.extend(changes.clone());
        }
        course
    }

    fn apply(record: EntityRecord, envelope: &EventEnvelope) -> EntityRecord {
        match decide(envelope, record.id(), Some(&record), &Related::default()).unwrap() {
            Decision::Update { record, .. } => record,
            Decision::NoOp | Decision::Stale => record,
            Decision::Create(_) => panic!("existing record cannot be created"),
        }
    }

    fn stored(envelope: &EventEnvelope) -> EntityRecord {
        match decide(envelope, &EntityId::new("course-1"), None, &Related::default()).unwrap() {
            Decision::Create(record) => record,
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn absent_primary_is_created_at_first_version() {
        let envelope = course_event(full_course(), 0)
            .with_source_ref(&SourceRef::new("KAJABI", "1"));
        let record = stored(&envelope);

        assert_eq!(record.version, Version::FIRST);
        assert_eq!(record.entity.source_ids(), &[SourceRef::new("KAJABI", "1")]);
        assert_eq!(record.last_event_id, envelope.event_id);
    }

    #[test]
    fn identical_payload_is_a_no_op() {
        let first = course_event(full_course(), 0);
        let record = stored(&first);

        let replay = course_event(full_course(), 10);
        let decision =
            decide(&replay, record.id(), Some(&record), &Related::default()).unwrap();
        assert_eq!(decision, Decision::NoOp);
    }

    #[test]
    fn changed_field_bumps_version() {
        let record = stored(&course_event(full_course(), 0));
        let change = course_event(course_with(json!({ "status": "closed" })), 10);

        match decide(&change, record.id(), Some(&record), &Related::default()).unwrap() {
            Decision::Update { record: next, expected } => {
                assert_eq!(expected, Version::FIRST);
                assert_eq!(next.version, Version::new(2));
                assert_eq!(next.occurred_at, change.occurred_at);
                match next.entity {
                    Entity::Course(course) => {
                        assert_eq!(course.fields.status, LifecycleStatus::Closed);
                        assert_eq!(course.fields.name, "Rust 101");
                    },
                    other => panic!("expected course, got {other:?}"),
                }
            },
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn older_external_event_is_stale_but_tie_applies() {
        let record = stored(&course_event(full_course(), 10));

        let older = course_event(course_with(json!({ "name": "Old" })), 5);
        assert_eq!(
            decide(&older, record.id(), Some(&record), &Related::default()).unwrap(),
            Decision::Stale
        );

        let tie = course_event(course_with(json!({ "name": "Tie" })), 10);
        assert!(matches!(
            decide(&tie, record.id(), Some(&record), &Related::default()).unwrap(),
            Decision::Update { .. }
        ));
    }

    #[test]
    fn refresh_keeps_newest_timestamp() {
        let record = stored(&course_event(full_course(), 10));
        let mut rename = course_event(json!({ "name": "Renamed" }), 0);
        rename.namespace = syncflow_core::envelope::Namespace::Internal;

        match decide(&rename, record.id(), Some(&record), &Related::default()).unwrap() {
            Decision::Update { record: next, .. } => {
                assert_eq!(next.occurred_at, record.occurred_at);
            },
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn partial_update_is_rejected_instead_of_merged() {
        let record = stored(&course_event(full_course(), 0));
        let partial = course_event(json!({ "status": "closed" }), 10);

        let result = decide(&partial, record.id(), Some(&record), &Related::default());
        assert!(matches!(result, Err(DecisionError::Fields(_))));
    }

    #[test]
    fn updates_touching_different_fields_converge_in_either_order() {
        let base = stored(&course_event(full_course(), 0));
        let renamed = course_event(course_with(json!({ "name": "A" })), 10);
        let closed = course_event(course_with(json!({ "status": "closed" })), 20);

        let in_order = apply(apply(base.clone(), &renamed), &closed);
        let reversed = apply(apply(base, &closed), &renamed);

        assert_eq!(in_order.entity, reversed.entity);
        match in_order.entity {
            Entity::Course(course) => {
                assert_eq!(course.fields.name, "Rust 101");
                assert_eq!(course.fields.status, LifecycleStatus::Closed);
            },
            other => panic!("expected course, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_create_is_rejected() {
        let envelope = course_event(json!({ "name": "Only a name" }), 0);
        let result = decide(&envelope, &EntityId::new("course-1"), None, &Related::default());
        assert!(matches!(result, Err(DecisionError::Fields(_))));
    }

    #[test]
    fn participant_without_parent_is_unresolved() {
        let envelope = EventEnvelope::external(
            EntityKind::Participant,
            Operation::Created,
            "p-1",
            object(json!({ "status": "active", "account_owner": "acme" })),
            Utc::now(),
        );
        let result = decide(&envelope, &EntityId::new("p-1"), None, &Related::default());
        assert_eq!(
            result,
            Err(DecisionError::Unresolved {
                kind: EntityKind::Participant,
                missing: EntityKind::Course,
            })
        );
    }

    #[test]
    fn synthesized_member_id_is_derived_from_source() {
        let source = SourceRef::new("CIRCLE", "m-9");
        let envelope = EventEnvelope::external(
            EntityKind::Participant,
            Operation::Created,
            "p-1",
            object(json!({
                "member_source_ref": "CIRCLE#m-9",
                "member": {
                    "name": "Ada",
                    "email": "ada@example.com",
                    "status": "active",
                    "account_owner": "acme"
                }
            })),
            Utc::now(),
        );

        let record = synthesize_member(&envelope, &source).unwrap();
        assert_eq!(record.id(), &EntityId::derive(EntityKind::Member, &source));
        assert_eq!(record.entity.source_ids(), &[source]);
    }

    #[test]
    fn synthesizing_without_member_fields_fails() {
        let envelope = EventEnvelope::external(
            EntityKind::Participant,
            Operation::Created,
            "p-1",
            Map::new(),
            Utc::now(),
        );
        assert!(synthesize_member(&envelope, &SourceRef::new("CIRCLE", "1")).is_err());
    }
}
