//! Fan-out splitter: turns one internal event into jobs for every entity
//! whose state depends on the changed one.
//!
//! | Trigger | Jobs |
//! |---------|------|
//! | `internal.course.created`, `internal.course.updated` | one refresh per participant of the course, and the course's group |
//! | `internal.participant.created`, `internal.participant.updated` | the participant's membership of the course group |
//! | `internal.member.updated` | one refresh per participation and one per group membership |
//! | `internal.group.updated` | one refresh per member of the group |
//!
//! Refresh jobs come from reading the store; course group jobs are derived
//! from the trigger itself (see [`course_groups`](crate::course_groups)). The
//! batch is returned whole so the caller enqueues it in one call; a failure
//! while listing yields no jobs at all.

use crate::course_groups;
use crate::metrics::SplitterMetrics;
use std::sync::Arc;
use syncflow_core::entity::{EntityKind, Operation};
use syncflow_core::entity_store::{EntityStore, Relation, StoreError};
use syncflow_core::envelope::{EnvelopeError, EventEnvelope, Namespace, Topic};
use syncflow_core::work_queue::Job;
use thiserror::Error;

/// Errors from splitting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SplitError {
    /// The trigger does not name an entity
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Listing related records failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Topics the splitter consumes.
#[must_use]
pub fn trigger_topics() -> Vec<Topic> {
    vec![
        Topic::internal(EntityKind::Course, Operation::Created),
        Topic::internal(EntityKind::Course, Operation::Updated),
        Topic::internal(EntityKind::Participant, Operation::Created),
        Topic::internal(EntityKind::Participant, Operation::Updated),
        Topic::internal(EntityKind::Member, Operation::Updated),
        Topic::internal(EntityKind::Group, Operation::Updated),
    ]
}

/// Relations to enumerate for a trigger topic.
#[must_use]
pub fn relations_for(topic: Topic) -> &'static [Relation] {
    match (topic.namespace, topic.kind, topic.operation) {
        (Namespace::Internal, EntityKind::Course, _) => &[Relation::ParticipantsOfCourse],
        (Namespace::Internal, EntityKind::Member, Operation::Updated) => &[
            Relation::ParticipantsOfMember,
            Relation::GroupMembersOfMember,
        ],
        (Namespace::Internal, EntityKind::Group, Operation::Updated) => {
            &[Relation::GroupMembersOfGroup]
        },
        _ => &[],
    }
}

/// Enumerates affected composites.
#[derive(Clone)]
pub struct FanOutSplitter {
    store: Arc<dyn EntityStore>,
}

impl FanOutSplitter {
    /// Create a splitter over a store.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// One refresh job per affected composite, then any derived course group jobs.
    ///
    /// Splitting the same trigger twice yields jobs with the same ids.
    ///
    /// # Errors
    ///
    /// Returns [`SplitError`] if the trigger is malformed or listing fails.
    pub async fn split(&self, trigger: &EventEnvelope) -> Result<Vec<Job>, SplitError> {
        let relations = relations_for(trigger.topic());
        let mut jobs = Vec::new();
        if !relations.is_empty() {
            let parent = trigger.entity_id()?;
            for relation in relations {
                let children = self.store.list_related(*relation, parent.clone()).await?;
                jobs.extend(children.iter().map(|child| {
                    Job::new(EventEnvelope::refresh(relation.child_kind(), child, trigger))
                }));
            }
        }
        jobs.extend(course_groups::derive_jobs(trigger)?.into_iter().map(Job::new));

        tracing::debug!(
            trigger = %trigger.topic(),
            entity_id = %trigger.entity_id,
            jobs = jobs.len(),
            "Split trigger"
        );
        SplitterMetrics::record_jobs(trigger.kind, jobs.len());
        Ok(jobs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use syncflow_core::ids::EntityId;
    use syncflow_testing::{InMemoryEntityStore, fixtures};

    fn course_trigger(operation: Operation, id: &str) -> EventEnvelope {
        fixtures::announced(operation, &fixtures::course_record(id))
    }

    fn refreshes(jobs: &[Job]) -> Vec<&Job> {
        jobs.iter().filter(|j| j.envelope.payload.is_empty()).collect()
    }

    #[test]
    fn every_topic_with_relations_is_a_trigger() {
        for topic in Topic::all(Namespace::Internal) {
            if !relations_for(topic).is_empty() {
                assert!(trigger_topics().contains(&topic), "{topic}");
            }
        }
        for topic in Topic::all(Namespace::External) {
            assert!(relations_for(topic).is_empty());
        }
        assert!(trigger_topics().contains(&Topic::internal(EntityKind::Participant, Operation::Updated)));
    }

    #[tokio::test]
    async fn course_update_yields_one_job_per_participant() {
        let store = Arc::new(InMemoryEntityStore::new());
        fixtures::seed_course_with_participants(&store, "course-1", 3);
        let splitter = FanOutSplitter::new(store);

        let trigger = course_trigger(Operation::Updated, "course-1");
        let jobs = splitter.split(&trigger).await.unwrap();

        assert_eq!(refreshes(&jobs).len(), 3);
        for job in refreshes(&jobs) {
            assert_eq!(job.envelope.kind, EntityKind::Participant);
            assert_eq!(job.envelope.causation_id, Some(trigger.event_id));
            assert!(job.envelope.payload.is_empty());
        }

        let again = splitter.split(&trigger).await.unwrap();
        let ids = |jobs: &[Job]| jobs.iter().map(|j| j.job_id).collect::<Vec<_>>();
        assert_eq!(ids(&jobs), ids(&again));
    }

    #[tokio::test]
    async fn course_without_participants_yields_only_its_group() {
        let store = Arc::new(InMemoryEntityStore::new());
        let splitter = FanOutSplitter::new(store);

        let trigger = course_trigger(Operation::Created, "course-1");
        let jobs = splitter.split(&trigger).await.unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].envelope.kind, EntityKind::Group);
        assert_eq!(jobs[0].envelope.namespace, Namespace::Derived);
        assert_eq!(
            jobs[0].envelope.entity_id,
            course_groups::course_group_id(&EntityId::new("course-1")).as_str()
        );
    }

    #[tokio::test]
    async fn participant_trigger_yields_its_group_membership() {
        let store = Arc::new(InMemoryEntityStore::new());
        let splitter = FanOutSplitter::new(store);
        let trigger = fixtures::announced(
            Operation::Updated,
            &fixtures::participant_record("p-1", "course-1", "m-1"),
        );

        let jobs = splitter.split(&trigger).await.unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].envelope.kind, EntityKind::GroupMember);
        assert_eq!(jobs[0].envelope.source_ref.as_deref(), Some("PARTICIPANT#p-1"));
    }

    #[tokio::test]
    async fn listing_failure_yields_no_partial_batch() {
        let store = Arc::new(InMemoryEntityStore::new());
        fixtures::seed_course_with_participants(&store, "course-1", 2);
        store.fail_next_operations(1);
        let splitter = FanOutSplitter::new(store);

        let trigger = course_trigger(Operation::Updated, "course-1");
        assert!(matches!(
            splitter.split(&trigger).await,
            Err(SplitError::Store(StoreError::Backend(_)))
        ));
    }

    #[tokio::test]
    async fn member_created_is_not_a_trigger() {
        let store = Arc::new(InMemoryEntityStore::new());
        let splitter = FanOutSplitter::new(store);
        let trigger = fixtures::announced(
            Operation::Created,
            &fixtures::member_record("m-1", &syncflow_core::ids::SourceRef::new("CIRCLE", "m-1")),
        );

        assert!(splitter.split(&trigger).await.unwrap().is_empty());
    }
}
