//! Upsert orchestrator: the per-job state machine.
//!
//! One [`UpsertState`] is created per job and driven by [`UpsertReducer`]:
//!
//! ```text
//! Received → ResolvingPrimary → ResolvingRelated → Deciding → Writing → Publishing → Done
//!                    ↑                  │ (find-or-create member)       │
//!                    └──── lost write race (bounded) ──────────────────┘
//! ```
//!
//! `Failed` is reachable from every phase. Resolution gaps (a related record
//! not visible yet) end the run with [`UpsertOutcome::Requeue`] so the work
//! queue redelivers the job with backoff.
//!
//! The reducer holds all decisions. Store reads, conditional writes and
//! publishes are returned as effects and executed by
//! [`run_to_completion`](crate::executor::run_to_completion).
//!
//! The internal event announcing a write is built before the write and stored
//! with it in the outbox. `Publishing` only hands committed events to the
//! [`EventPublisher`] for immediate delivery; whatever it cannot deliver stays
//! in the outbox for the relay.

use crate::config::OrchestratorConfig;
use crate::decision::{self, Decision};
use crate::executor::run_to_completion;
use crate::metrics::OrchestratorMetrics;
use crate::publisher::EventPublisher;
use crate::resolver::{Related, ResolveError, Resolver};
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;
use std::time::Instant;
use syncflow_core::effect::Effect;
use syncflow_core::entity::{EntityKind, Operation};
use syncflow_core::entity_store::{EntityRecord, EntityStore, StoreError};
use syncflow_core::envelope::EventEnvelope;
use syncflow_core::ids::{EntityId, Version};
use syncflow_core::reducer::Reducer;
use tracing::Instrument;

/// Where a job is in the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Not started
    Received,
    /// Loading the primary entity
    ResolvingPrimary,
    /// Loading the parent and member of a composite, or creating the member
    ResolvingRelated,
    /// Computing the write
    Deciding,
    /// Waiting for a conditional write
    Writing,
    /// Announcing committed writes
    Publishing,
    /// Finished with an outcome other than `Failed`
    Done,
    /// Finished with `Failed`
    Failed,
}

/// A write the store accepted, with the event stored alongside it.
#[derive(Clone, Debug)]
pub struct Committed {
    /// Created or updated
    pub operation: Operation,
    /// Record as written
    pub record: EntityRecord,
    /// Internal event announcing the write
    pub event: EventEnvelope,
}

/// One committed write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    /// Kind written
    pub kind: EntityKind,
    /// Record written
    pub entity_id: EntityId,
    /// Created or updated
    pub operation: Operation,
    /// Version after the write
    pub version: Version,
}

impl Mutation {
    fn of(operation: Operation, record: &EntityRecord) -> Self {
        Self {
            kind: record.kind(),
            entity_id: record.id().clone(),
            operation,
            version: record.version,
        }
    }
}

/// Result of running one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// At least one write was committed and announced
    Applied {
        /// Writes in commit order
        mutations: Vec<Mutation>,
    },
    /// The desired state was already stored
    Unchanged,
    /// The envelope was older than the stored state and was discarded
    Stale,
    /// Something needed is not visible yet; redeliver later
    Requeue {
        /// What was missing
        reason: String,
    },
    /// The job cannot be completed
    Failed {
        /// What went wrong
        reason: String,
        /// Whether retrying can never help
        permanent: bool,
    },
}

impl UpsertOutcome {
    /// Metric label for the outcome.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Unchanged => "unchanged",
            Self::Stale => "stale",
            Self::Requeue { .. } => "requeue",
            Self::Failed {
                permanent: true, ..
            } => "failed_permanent",
            Self::Failed { .. } => "failed_transient",
        }
    }

    /// Whether the job is finished and can be acknowledged.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Applied { .. } | Self::Unchanged | Self::Stale)
    }
}

/// Per-job state.
#[derive(Clone, Debug)]
pub struct UpsertState {
    /// Current phase
    pub phase: Phase,
    /// The job being processed
    pub envelope: EventEnvelope,
    /// Validated primary id
    pub entity_id: Option<EntityId>,
    /// Primary record as last resolved
    pub primary: Option<EntityRecord>,
    /// Related records as last resolved
    pub related: Related,
    /// Lost write races so far
    pub conflicts: u32,
    /// Writes committed so far
    pub mutations: Vec<Mutation>,
    /// Events of committed writes not yet handed to the publisher
    pub unpublished: Vec<EventEnvelope>,
    /// Final outcome, once known
    pub outcome: Option<UpsertOutcome>,
}

impl UpsertState {
    /// Fresh state for a job.
    #[must_use]
    pub fn new(envelope: EventEnvelope) -> Self {
        Self {
            phase: Phase::Received,
            envelope,
            entity_id: None,
            primary: None,
            related: Related::default(),
            conflicts: 0,
            mutations: Vec::new(),
            unpublished: Vec::new(),
            outcome: None,
        }
    }
}

/// Inputs to the state machine.
#[derive(Clone, Debug)]
pub enum UpsertAction {
    /// Start processing
    Receive,
    /// Primary lookup finished
    PrimaryResolved(Result<Option<EntityRecord>, ResolveError>),
    /// Related lookup finished
    RelatedResolved(Result<Related, ResolveError>),
    /// Find-or-create member write finished
    MemberCreated(Result<Committed, StoreError>),
    /// Primary write finished
    Written(Result<Committed, StoreError>),
    /// Committed events were handed to the publisher
    Published,
}

/// Collaborators of the orchestrator.
#[derive(Clone)]
pub struct OrchestratorEnvironment {
    /// Entity store for conditional writes
    pub store: Arc<dyn EntityStore>,
    /// Read side
    pub resolver: Resolver,
    /// Delivers committed events
    pub publisher: Arc<EventPublisher>,
    /// Tunables
    pub config: OrchestratorConfig,
}

impl OrchestratorEnvironment {
    /// Build an environment over a store and publisher.
    #[must_use]
    pub fn new(
        store: Arc<dyn EntityStore>,
        publisher: Arc<EventPublisher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            resolver: Resolver::new(Arc::clone(&store)),
            store,
            publisher,
            config,
        }
    }
}

/// The upsert state machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpsertReducer;

type Effects = SmallVec<[Effect<UpsertAction>; 4]>;

impl Reducer for UpsertReducer {
    type State = UpsertState;
    type Action = UpsertAction;
    type Environment = OrchestratorEnvironment;

    fn reduce(
        &self,
        state: &mut UpsertState,
        action: UpsertAction,
        env: &OrchestratorEnvironment,
    ) -> Effects {
        match action {
            UpsertAction::Receive => match state.envelope.validate() {
                Ok(entity_id) => {
                    state.entity_id = Some(entity_id);
                    resolve_primary(state, env)
                },
                Err(e) => fail(state, env, e.to_string(), true),
            },

            UpsertAction::PrimaryResolved(Err(e)) => resolve_failed(state, env, &e),
            UpsertAction::PrimaryResolved(Ok(None)) if !state.envelope.carries_state() => {
                let reason = format!(
                    "{} '{}' is not visible yet",
                    state.envelope.kind, state.envelope.entity_id
                );
                finish(state, env, UpsertOutcome::Requeue { reason })
            },
            UpsertAction::PrimaryResolved(Ok(primary)) => {
                state.primary = primary;
                if state.envelope.kind.is_composite() {
                    resolve_related(state, env)
                } else {
                    decide(state, env)
                }
            },

            UpsertAction::RelatedResolved(Err(e)) => resolve_failed(state, env, &e),
            UpsertAction::RelatedResolved(Ok(related)) => on_related(state, env, related),

            UpsertAction::MemberCreated(Ok(member)) => {
                tracing::info!(member_id = %member.record.id(), "Created member on first sight");
                let record = commit(state, member);
                state.related.member = Some(record);
                decide(state, env)
            },
            UpsertAction::MemberCreated(Err(e)) if e.is_conflict() => {
                // Another worker created the member first; pick theirs up.
                lost_race(state, env, &e, resolve_related)
            },
            UpsertAction::MemberCreated(Err(e)) => store_failed(state, env, &e),

            UpsertAction::Written(Ok(committed)) => {
                commit(state, committed);
                let mutations = state.mutations.clone();
                finish(state, env, UpsertOutcome::Applied { mutations })
            },
            UpsertAction::Written(Err(e)) if e.is_conflict() => {
                lost_race(state, env, &e, resolve_primary)
            },
            UpsertAction::Written(Err(e)) => store_failed(state, env, &e),

            UpsertAction::Published => {
                state.phase = match state.outcome {
                    Some(UpsertOutcome::Failed { .. }) => Phase::Failed,
                    _ => Phase::Done,
                };
                smallvec![Effect::None]
            },
        }
    }
}

fn resolve_primary(state: &mut UpsertState, env: &OrchestratorEnvironment) -> Effects {
    state.phase = Phase::ResolvingPrimary;
    state.primary = None;
    state.related = Related::default();

    let resolver = env.resolver.clone();
    let envelope = state.envelope.clone();
    smallvec![Effect::future(async move {
        UpsertAction::PrimaryResolved(resolver.resolve_primary(&envelope).await)
    })]
}

fn resolve_related(state: &mut UpsertState, env: &OrchestratorEnvironment) -> Effects {
    state.phase = Phase::ResolvingRelated;

    let resolver = env.resolver.clone();
    let envelope = state.envelope.clone();
    let primary = state.primary.clone();
    smallvec![Effect::future(async move {
        UpsertAction::RelatedResolved(
            resolver.resolve_related(&envelope, primary.as_ref()).await,
        )
    })]
}

fn on_related(state: &mut UpsertState, env: &OrchestratorEnvironment, related: Related) -> Effects {
    let kind = state.envelope.kind;

    if related.parent.is_none() {
        let parent = kind.parent_kind().unwrap_or(kind);
        let reason = format!("{parent} of {kind} '{}' is not visible yet", state.envelope.entity_id);
        return finish(state, env, UpsertOutcome::Requeue { reason });
    }

    if related.member.is_some() {
        state.related = related;
        return decide(state, env);
    }

    let source = match (&state.primary, &related.member_source) {
        (None, Some(source)) => source.clone(),
        _ => {
            let reason = format!(
                "member of {kind} '{}' is not visible yet",
                state.envelope.entity_id
            );
            return finish(state, env, UpsertOutcome::Requeue { reason });
        },
    };

    let member = match decision::synthesize_member(&state.envelope, &source) {
        Ok(member) => member,
        Err(e) => return fail(state, env, e.to_string(), true),
    };
    let event = match EventEnvelope::internal(Operation::Created, &member, state.envelope.event_id)
    {
        Ok(event) => event,
        Err(e) => return fail(state, env, e.to_string(), true),
    };

    state.related = related;
    let store = Arc::clone(&env.store);
    smallvec![Effect::future(async move {
        let result = store.create(member.clone(), vec![event.clone()]).await;
        UpsertAction::MemberCreated(result.map(|()| Committed {
            operation: Operation::Created,
            record: member,
            event,
        }))
    })]
}

fn decide(state: &mut UpsertState, env: &OrchestratorEnvironment) -> Effects {
    state.phase = Phase::Deciding;

    let Some(entity_id) = state.entity_id.clone() else {
        return fail(state, env, "job was decided before validation".to_string(), true);
    };

    match decision::decide(
        &state.envelope,
        &entity_id,
        state.primary.as_ref(),
        &state.related,
    ) {
        Ok(Decision::Create(record)) => {
            write(state, env, Operation::Created, record, None)
        },
        Ok(Decision::Update { record, expected }) => {
            write(state, env, Operation::Updated, record, Some(expected))
        },
        Ok(Decision::NoOp) => finish(state, env, UpsertOutcome::Unchanged),
        Ok(Decision::Stale) => {
            tracing::debug!(
                occurred_at = %state.envelope.occurred_at,
                "Discarding event older than stored state"
            );
            finish(state, env, UpsertOutcome::Stale)
        },
        Err(e) => fail(state, env, e.to_string(), true),
    }
}

fn write(
    state: &mut UpsertState,
    env: &OrchestratorEnvironment,
    operation: Operation,
    record: EntityRecord,
    expected: Option<Version>,
) -> Effects {
    state.phase = Phase::Writing;

    let event = match EventEnvelope::internal(operation, &record, state.envelope.event_id) {
        Ok(event) => event,
        Err(e) => return fail(state, env, e.to_string(), true),
    };
    let store = Arc::clone(&env.store);
    smallvec![Effect::future(async move {
        let events = vec![event.clone()];
        let result = match expected {
            Some(expected) => store.update(record.clone(), expected, events).await,
            None => store.create(record.clone(), events).await,
        };
        UpsertAction::Written(result.map(|()| Committed {
            operation,
            record,
            event,
        }))
    })]
}

fn commit(state: &mut UpsertState, committed: Committed) -> EntityRecord {
    let Committed {
        operation,
        record,
        event,
    } = committed;
    OrchestratorMetrics::record_mutation(record.kind(), operation.as_str());
    state.mutations.push(Mutation::of(operation, &record));
    state.unpublished.push(event);
    record
}

fn lost_race(
    state: &mut UpsertState,
    env: &OrchestratorEnvironment,
    error: &StoreError,
    retry: fn(&mut UpsertState, &OrchestratorEnvironment) -> Effects,
) -> Effects {
    state.conflicts += 1;
    OrchestratorMetrics::record_write_conflict(state.envelope.kind);

    if state.conflicts > env.config.max_write_conflicts {
        let reason = format!(
            "write conflict persisted after {} attempts: {error}",
            state.conflicts
        );
        return finish(state, env, UpsertOutcome::Requeue { reason });
    }

    tracing::debug!(conflicts = state.conflicts, error = %error, "Lost write race, re-resolving");
    retry(state, env)
}

fn resolve_failed(
    state: &mut UpsertState,
    env: &OrchestratorEnvironment,
    error: &ResolveError,
) -> Effects {
    fail(state, env, error.to_string(), !error.is_transient())
}

fn store_failed(state: &mut UpsertState, env: &OrchestratorEnvironment, error: &StoreError) -> Effects {
    fail(state, env, error.to_string(), !error.is_transient())
}

fn fail(
    state: &mut UpsertState,
    env: &OrchestratorEnvironment,
    reason: String,
    permanent: bool,
) -> Effects {
    if permanent {
        tracing::warn!(reason = %reason, "Job failed permanently");
    } else {
        tracing::warn!(reason = %reason, "Job failed, will be retried");
    }
    finish(state, env, UpsertOutcome::Failed { reason, permanent })
}

/// Record the outcome and hand anything committed on the way to the publisher.
///
/// A member created by find-or-create is announced even if the job itself
/// ends without writing its primary.
fn finish(state: &mut UpsertState, env: &OrchestratorEnvironment, outcome: UpsertOutcome) -> Effects {
    let outcome = match outcome {
        UpsertOutcome::Unchanged | UpsertOutcome::Stale if !state.mutations.is_empty() => {
            UpsertOutcome::Applied {
                mutations: state.mutations.clone(),
            }
        },
        other => other,
    };
    let failed = matches!(outcome, UpsertOutcome::Failed { .. });
    state.outcome = Some(outcome);

    if state.unpublished.is_empty() {
        state.phase = if failed { Phase::Failed } else { Phase::Done };
        return smallvec![Effect::None];
    }

    state.phase = Phase::Publishing;
    let events = std::mem::take(&mut state.unpublished);
    let publisher = Arc::clone(&env.publisher);
    smallvec![Effect::future(async move {
        publisher.publish_committed(events).await;
        UpsertAction::Published
    })]
}

/// Runs jobs through [`UpsertReducer`].
#[derive(Clone)]
pub struct Orchestrator {
    env: OrchestratorEnvironment,
}

impl Orchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub const fn new(env: OrchestratorEnvironment) -> Self {
        Self { env }
    }

    /// Process one job to its outcome.
    pub async fn process(&self, envelope: EventEnvelope) -> UpsertOutcome {
        let started = Instant::now();
        let kind = envelope.kind;
        let span = tracing::info_span!(
            "upsert",
            event_id = %envelope.event_id,
            kind = %kind,
            entity_id = %envelope.entity_id,
        );

        async move {
            let mut state = UpsertState::new(envelope);
            run_to_completion(&UpsertReducer, &mut state, UpsertAction::Receive, &self.env).await;

            let outcome = state.outcome.unwrap_or_else(|| UpsertOutcome::Failed {
                reason: format!("run stopped in phase {:?} without an outcome", state.phase),
                permanent: false,
            });
            OrchestratorMetrics::record_outcome(kind, outcome.label(), started.elapsed());
            tracing::debug!(outcome = outcome.label(), conflicts = state.conflicts, "Job finished");
            outcome
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::PublisherConfig;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;
    use syncflow_core::ids::SourceRef;
    use syncflow_testing::{InMemoryEntityStore, InMemoryEventBus, fixtures};

    struct Harness {
        store: Arc<InMemoryEntityStore>,
        bus: Arc<InMemoryEventBus>,
        orchestrator: Orchestrator,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryEntityStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let config = PublisherConfig::default().with_retry(
            RetryPolicy::builder()
                .max_retries(1)
                .initial_delay(Duration::from_millis(1))
                .build(),
        );
        let publisher = Arc::new(EventPublisher::new(bus.clone(), store.clone(), config));
        let env = OrchestratorEnvironment::new(
            store.clone(),
            publisher,
            OrchestratorConfig::default(),
        );
        Harness {
            store,
            bus,
            orchestrator: Orchestrator::new(env),
        }
    }

    fn env_without_effects() -> OrchestratorEnvironment {
        let h = harness();
        h.orchestrator.env
    }

    #[test]
    fn invalid_envelope_fails_permanently_without_effects() {
        let env = env_without_effects();
        let mut envelope = fixtures::course_created("course-1");
        envelope.entity_id = String::new();
        let mut state = UpsertState::new(envelope);

        let effects = UpsertReducer.reduce(&mut state, UpsertAction::Receive, &env);

        assert!(matches!(effects[0], Effect::None));
        assert_eq!(state.phase, Phase::Failed);
        assert!(matches!(
            state.outcome,
            Some(UpsertOutcome::Failed {
                permanent: true,
                ..
            })
        ));
    }

    #[test]
    fn receive_validates_then_resolves_primary() {
        let env = env_without_effects();
        let mut state = UpsertState::new(fixtures::course_created("course-1"));

        let effects = UpsertReducer.reduce(&mut state, UpsertAction::Receive, &env);

        assert_eq!(state.phase, Phase::ResolvingPrimary);
        assert_eq!(state.entity_id, Some(EntityId::new("course-1")));
        assert_eq!(effects.len(), 1);
        assert!(effects[0].is_future());
    }

    #[test]
    fn member_visible_goes_straight_to_deciding() {
        let course = fixtures::course_record("course-1");
        let member = fixtures::member_record("m-1", &SourceRef::new("CIRCLE", "m-1"));
        let mut state =
            UpsertState::new(fixtures::participant_created("p-1", "course-1", "CIRCLE#m-1"));
        state.entity_id = Some(EntityId::new("p-1"));

        let effects = UpsertReducer.reduce(
            &mut state,
            UpsertAction::RelatedResolved(Ok(Related {
                parent: Some(course),
                member: Some(member),
                member_source: None,
            })),
            &env_without_effects(),
        );

        assert_eq!(state.phase, Phase::Writing);
        assert!(state.related.member.is_some());
        assert_eq!(effects.len(), 1);
        assert!(effects[0].is_future());
    }

    #[test]
    fn internal_job_for_absent_primary_requeues() {
        let env = env_without_effects();
        let trigger = fixtures::course_created("course-1");
        let refresh = EventEnvelope::refresh(
            EntityKind::Participant,
            &EntityId::new("p-1"),
            &trigger,
        );
        let mut state = UpsertState::new(refresh);
        state.entity_id = Some(EntityId::new("p-1"));

        UpsertReducer.reduce(&mut state, UpsertAction::PrimaryResolved(Ok(None)), &env);

        assert_eq!(state.phase, Phase::Done);
        assert!(matches!(state.outcome, Some(UpsertOutcome::Requeue { .. })));
    }

    #[test]
    fn conflict_budget_is_bounded() {
        let env = env_without_effects();
        let mut state = UpsertState::new(fixtures::course_created("course-1"));
        state.entity_id = Some(EntityId::new("course-1"));
        let conflict = StoreError::AlreadyExists {
            kind: EntityKind::Course,
            id: EntityId::new("course-1"),
        };

        for _ in 0..env.config.max_write_conflicts {
            UpsertReducer.reduce(&mut state, UpsertAction::Written(Err(conflict.clone())), &env);
            assert_eq!(state.phase, Phase::ResolvingPrimary);
        }
        UpsertReducer.reduce(&mut state, UpsertAction::Written(Err(conflict)), &env);

        assert_eq!(state.phase, Phase::Done);
        assert!(matches!(state.outcome, Some(UpsertOutcome::Requeue { .. })));
    }

    #[tokio::test]
    async fn creates_then_ignores_replay() {
        let h = harness();
        let envelope = fixtures::course_created("course-1");

        let first = h.orchestrator.process(envelope.clone()).await;
        let UpsertOutcome::Applied { mutations } = first else {
            panic!("expected applied, got {first:?}");
        };
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].operation, Operation::Created);

        let replay = h.orchestrator.process(envelope).await;
        assert_eq!(replay, UpsertOutcome::Unchanged);
        assert_eq!(h.bus.published().len(), 1);
        assert_eq!(h.store.writes(), 1);
        assert!(h.store.unpublished().is_empty());
    }

    #[tokio::test]
    async fn write_commits_its_event_even_when_the_bus_is_down() {
        let h = harness();
        h.bus.fail_next_publishes(2);

        let outcome = h.orchestrator.process(fixtures::course_created("course-1")).await;

        assert!(matches!(outcome, UpsertOutcome::Applied { .. }));
        assert!(h.bus.published().is_empty());
        let pending = h.store.unpublished();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].topic().to_string(), "internal.course.created");
    }

    #[tokio::test]
    async fn derived_job_creates_its_absent_primary() {
        let h = harness();
        let trigger = fixtures::course_created("course-1");
        let job = EventEnvelope::derived(
            EntityKind::Group,
            &EntityId::new("group-1"),
            &SourceRef::new("COURSE", "course-1"),
            fixtures::object(json!({
                "slug": "rust-101",
                "name": "Rust 101",
                "status": "open",
                "account_owner": "acme"
            })),
            &trigger,
        );

        let outcome = h.orchestrator.process(job).await;

        assert!(matches!(outcome, UpsertOutcome::Applied { .. }));
        assert_eq!(h.store.count(EntityKind::Group), 1);
        assert_eq!(h.bus.published_on("internal.group.created").len(), 1);
    }

    #[tokio::test]
    async fn participant_creates_missing_member() {
        let h = harness();
        h.orchestrator.process(fixtures::course_created("course-1")).await;
        h.bus.clear();

        let outcome = h
            .orchestrator
            .process(fixtures::participant_created("p-1", "course-1", "CIRCLE#m-1"))
            .await;

        let UpsertOutcome::Applied { mutations } = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        let kinds: Vec<_> = mutations.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![EntityKind::Member, EntityKind::Participant]);

        let topics: Vec<_> = h.bus.published().into_iter().map(|(t, _)| t).collect();
        assert_eq!(topics, vec!["internal.member.created", "internal.participant.created"]);

        let member = h
            .store
            .snapshot(EntityKind::Member)
            .into_iter()
            .next()
            .expect("member stored");
        assert_eq!(member.entity.source_ids(), &[SourceRef::new("CIRCLE", "m-1")]);
    }

    #[tokio::test]
    async fn participant_without_member_fields_fails_permanently() {
        let h = harness();
        h.orchestrator.process(fixtures::course_created("course-1")).await;

        let mut envelope = fixtures::participant_created("p-1", "course-1", "CIRCLE#m-1");
        envelope.payload.remove("member");

        let outcome = h.orchestrator.process(envelope).await;
        assert!(matches!(
            outcome,
            UpsertOutcome::Failed {
                permanent: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn participant_before_course_requeues() {
        let h = harness();
        let outcome = h
            .orchestrator
            .process(fixtures::participant_created("p-1", "course-1", "CIRCLE#m-1"))
            .await;

        assert!(matches!(outcome, UpsertOutcome::Requeue { .. }));
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn transient_store_failure_is_not_permanent() {
        let h = harness();
        h.store.fail_next_operations(1);

        let outcome = h.orchestrator.process(fixtures::course_created("course-1")).await;
        assert!(matches!(
            outcome,
            UpsertOutcome::Failed {
                permanent: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stale_update_is_discarded() {
        let h = harness();
        let created = fixtures::course_created("course-1");
        h.orchestrator.process(created.clone()).await;

        let older = fixtures::course_updated(
            "course-1",
            json!({ "name": "Old name" }),
            created.occurred_at - chrono::Duration::seconds(30),
        );
        assert_eq!(h.orchestrator.process(older).await, UpsertOutcome::Stale);
    }
}
