//! Groups that follow courses.
//!
//! Every course has a group with the course's slug, name, status and owner,
//! and every participant of the course is a member of that group. Both are
//! derived from internal course and participant events as complete-state
//! jobs. The group is keyed by `COURSE#<course id>` and the membership by
//! `PARTICIPANT#<participant id>`, so the same course always maps to the same
//! group no matter how often it changes.

use serde_json::{Map, Value, json};
use syncflow_core::entity::{Entity, EntityKind, FieldsError};
use syncflow_core::envelope::{EnvelopeError, EventEnvelope, Namespace};
use syncflow_core::ids::{EntityId, SourceRef};

/// Source platform naming the course a group follows.
pub const COURSE_SOURCE: &str = "COURSE";
/// Source platform naming the participant a group membership follows.
pub const PARTICIPANT_SOURCE: &str = "PARTICIPANT";

/// Id of the group that follows `course_id`.
#[must_use]
pub fn course_group_id(course_id: &EntityId) -> EntityId {
    EntityId::derive(EntityKind::Group, &SourceRef::new(COURSE_SOURCE, course_id.as_str()))
}

/// Id of the group membership that follows `participant_id`.
#[must_use]
pub fn course_group_member_id(participant_id: &EntityId) -> EntityId {
    EntityId::derive(
        EntityKind::GroupMember,
        &SourceRef::new(PARTICIPANT_SOURCE, participant_id.as_str()),
    )
}

/// Upsert jobs derived from an internal course or participant event.
///
/// Other events derive nothing.
///
/// # Errors
///
/// Returns [`EnvelopeError::Payload`] if the trigger does not carry the
/// entity it announces.
pub fn derive_jobs(trigger: &EventEnvelope) -> Result<Vec<EventEnvelope>, EnvelopeError> {
    if trigger.namespace != Namespace::Internal || trigger.payload.is_empty() {
        return Ok(Vec::new());
    }

    let job = match (trigger.kind, announced(trigger)?) {
        (EntityKind::Course, Entity::Course(course)) => EventEnvelope::derived(
            EntityKind::Group,
            &course_group_id(&course.id),
            &SourceRef::new(COURSE_SOURCE, course.id.as_str()),
            object(json!({
                "slug": course.fields.slug,
                "name": course.fields.name,
                "status": course.fields.status,
                "account_owner": course.fields.account_owner,
            })),
            trigger,
        ),
        (EntityKind::Participant, Entity::Participant(participant)) => EventEnvelope::derived(
            EntityKind::GroupMember,
            &course_group_member_id(&participant.id),
            &SourceRef::new(PARTICIPANT_SOURCE, participant.id.as_str()),
            object(json!({
                "status": participant.fields.status,
                "account_owner": participant.fields.account_owner,
                "group_id": course_group_id(&participant.course_id).as_str(),
                "member_id": participant.member_id.as_str(),
            })),
            trigger,
        ),
        _ => return Ok(Vec::new()),
    };
    Ok(vec![job])
}

fn announced(trigger: &EventEnvelope) -> Result<Entity, EnvelopeError> {
    serde_json::from_value(Value::Object(trigger.payload.clone())).map_err(|e| {
        EnvelopeError::Payload(FieldsError::Invalid {
            kind: trigger.kind,
            reason: e.to_string(),
        })
    })
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
