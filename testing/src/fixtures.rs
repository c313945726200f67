//! Envelope and record builders shared by tests.
//!
//! Every timestamp is anchored on [`base_time`] so ordering assertions are
//! deterministic. External envelopes carry a `KAJABI#<id>` source reference
//! for courses and groups and name members by `CIRCLE#...` references.

use crate::test_clock;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use syncflow_core::entity::{
    Course, CourseFields, Entity, EntityKind, Group, GroupFields, LifecycleStatus, Member,
    MemberFields, MembershipStatus, Operation, Participant, ParticipantFields,
};
use syncflow_core::entity_store::EntityRecord;
use syncflow_core::environment::Clock;
use syncflow_core::envelope::EventEnvelope;
use syncflow_core::ids::{EntityId, SourceRef};
use uuid::Uuid;

use crate::InMemoryEntityStore;

/// The instant every fixture is stamped with (2025-01-01 00:00:00 UTC).
#[must_use]
pub fn base_time() -> DateTime<Utc> {
    test_clock().now()
}

/// A JSON object literal as a payload map.
#[must_use]
pub fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// `base` as a payload with the keys of `changes` replaced.
#[must_use]
pub fn overlay(base: Value, changes: Value) -> Map<String, Value> {
    let mut payload = object(base);
    payload.extend(object(changes));
    payload
}

/// Complete course payload.
#[must_use]
pub fn course_payload() -> Value {
    json!({
        "slug": "rust-101",
        "name": "Rust 101",
        "status": "open",
        "account_owner": "acme"
    })
}

/// Complete member payload.
#[must_use]
pub fn member_payload(name: &str) -> Value {
    json!({
        "name": name,
        "email": format!("{}@example.com", name.to_lowercase()),
        "status": "active",
        "account_owner": "acme"
    })
}

/// `external.course.created` with a complete payload.
#[must_use]
pub fn course_created(id: &str) -> EventEnvelope {
    EventEnvelope::external(
        EntityKind::Course,
        Operation::Created,
        id,
        object(course_payload()),
        base_time(),
    )
    .with_source_ref(&SourceRef::new("KAJABI", id))
}

/// `external.course.updated` carrying [`course_payload`] with `changes` applied.
#[must_use]
pub fn course_updated(id: &str, changes: Value, occurred_at: DateTime<Utc>) -> EventEnvelope {
    EventEnvelope::external(
        EntityKind::Course,
        Operation::Updated,
        id,
        overlay(course_payload(), changes),
        occurred_at,
    )
}

/// `external.group.created` with a complete payload.
#[must_use]
pub fn group_created(id: &str) -> EventEnvelope {
    EventEnvelope::external(
        EntityKind::Group,
        Operation::Created,
        id,
        object(json!({
            "slug": "rustaceans",
            "name": "Rustaceans",
            "status": "open",
            "account_owner": "acme"
        })),
        base_time(),
    )
    .with_source_ref(&SourceRef::new("KAJABI", id))
}

/// `external.member.created` for a member known by `source_ref`.
#[must_use]
pub fn member_created(id: &str, source_ref: &str, name: &str) -> EventEnvelope {
    let mut envelope = EventEnvelope::external(
        EntityKind::Member,
        Operation::Created,
        id,
        object(member_payload(name)),
        base_time(),
    );
    envelope.source_ref = Some(source_ref.to_string());
    envelope
}

/// `external.member.updated` carrying `member_payload("Ada")` with `changes` applied.
#[must_use]
pub fn member_updated(id: &str, changes: Value, occurred_at: DateTime<Utc>) -> EventEnvelope {
    EventEnvelope::external(
        EntityKind::Member,
        Operation::Updated,
        id,
        overlay(member_payload("Ada"), changes),
        occurred_at,
    )
}

/// `external.participant.created` enrolling the member `member_source_ref` on `course_id`.
///
/// The payload embeds the member's fields so the member can be created on first sight.
#[must_use]
pub fn participant_created(id: &str, course_id: &str, member_source_ref: &str) -> EventEnvelope {
    EventEnvelope::external(
        EntityKind::Participant,
        Operation::Created,
        id,
        object(json!({
            "status": "active",
            "account_owner": "acme",
            "course_id": course_id,
            "member_source_ref": member_source_ref,
            "member": member_payload("Ada")
        })),
        base_time(),
    )
}

/// `external.group_member.created` adding the member `member_source_ref` to `group_id`.
#[must_use]
pub fn group_member_created(id: &str, group_id: &str, member_source_ref: &str) -> EventEnvelope {
    EventEnvelope::external(
        EntityKind::GroupMember,
        Operation::Created,
        id,
        object(json!({
            "status": "active",
            "account_owner": "acme",
            "group_id": group_id,
            "member_source_ref": member_source_ref,
            "member": member_payload("Grace")
        })),
        base_time(),
    )
}

/// Course fields matching [`course_payload`].
#[must_use]
pub fn course_fields() -> CourseFields {
    CourseFields {
        slug: "rust-101".to_string(),
        name: "Rust 101".to_string(),
        status: LifecycleStatus::Open,
        date_open: None,
        date_closed: None,
        account_owner: "acme".to_string(),
    }
}

/// Member fields matching [`member_payload`].
#[must_use]
pub fn member_fields(name: &str) -> MemberFields {
    MemberFields {
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        organisation_name: None,
        status: MembershipStatus::Active,
        account_owner: "acme".to_string(),
    }
}

/// The internal event announcing `record`, as the publisher emits it after a write.
#[must_use]
#[allow(clippy::unwrap_used, clippy::missing_panics_doc)]
pub fn announced(operation: Operation, record: &EntityRecord) -> EventEnvelope {
    EventEnvelope::internal(operation, record, Uuid::new_v4()).unwrap()
}

/// A stored course at version 1.
#[must_use]
pub fn course_record(id: &str) -> EntityRecord {
    EntityRecord::new(
        Entity::Course(Course {
            id: EntityId::new(id),
            source_ids: vec![SourceRef::new("KAJABI", id)],
            fields: course_fields(),
        }),
        base_time(),
        Uuid::new_v4(),
    )
}

/// A stored group at version 1.
#[must_use]
pub fn group_record(id: &str) -> EntityRecord {
    EntityRecord::new(
        Entity::Group(Group {
            id: EntityId::new(id),
            source_ids: vec![SourceRef::new("KAJABI", id)],
            fields: GroupFields {
                slug: "rustaceans".to_string(),
                name: "Rustaceans".to_string(),
                status: LifecycleStatus::Open,
                account_owner: "acme".to_string(),
            },
        }),
        base_time(),
        Uuid::new_v4(),
    )
}

/// A stored member at version 1.
#[must_use]
pub fn member_record(id: &str, source: &SourceRef) -> EntityRecord {
    EntityRecord::new(
        Entity::Member(Member {
            id: EntityId::new(id),
            source_ids: vec![source.clone()],
            fields: member_fields("Ada"),
        }),
        base_time(),
        Uuid::new_v4(),
    )
}

/// A stored participant at version 1 with snapshots taken from the fixtures.
#[must_use]
pub fn participant_record(id: &str, course_id: &str, member_id: &str) -> EntityRecord {
    EntityRecord::new(
        Entity::Participant(Participant {
            id: EntityId::new(id),
            source_ids: vec![],
            course_id: EntityId::new(course_id),
            member_id: EntityId::new(member_id),
            fields: ParticipantFields {
                status: MembershipStatus::Active,
                account_owner: "acme".to_string(),
            },
            course: course_fields(),
            member: member_fields("Ada"),
        }),
        base_time(),
        Uuid::new_v4(),
    )
}

/// Seed a course with `n` enrolled members. Returns the participant ids, sorted.
pub fn seed_course_with_participants(
    store: &InMemoryEntityStore,
    course_id: &str,
    n: usize,
) -> Vec<EntityId> {
    store.seed(course_record(course_id));
    let mut ids: Vec<_> = (0..n)
        .map(|i| {
            let member_id = format!("{course_id}-member-{i}");
            let participant_id = format!("{course_id}-participant-{i}");
            store.seed(member_record(
                &member_id,
                &SourceRef::new("CIRCLE", member_id.clone()),
            ));
            store.seed(participant_record(&participant_id, course_id, &member_id));
            EntityId::new(participant_id)
        })
        .collect();
    ids.sort();
    ids
}
