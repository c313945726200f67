//! # Syncflow Core
//!
//! Domain types and collaborator traits for the syncflow upsert orchestrator.
//!
//! Syncflow turns at-least-once "entity changed" events (courses, participants,
//! members, groups and group memberships) into effectively-once entity state
//! transitions. This crate holds everything that does not perform I/O:
//!
//! - **Entities**: [`entity`] - the five entity kinds, their mutable field sets
//!   and the merge rules used when applying an event payload
//! - **Identifiers**: [`ids`] - `EntityId`, `Version` and `SourceRef`
//! - **Envelope**: [`envelope`] - the bus message and its topic naming
//! - **Collaborators**: [`entity_store::EntityStore`], [`outbox::Outbox`],
//!   [`event_bus::EventBus`] and [`work_queue::WorkQueue`], injected into the
//!   runtime as trait objects
//! - **Reducer / Effect**: the functional core the orchestrator state machine is
//!   written against
//!
//! ## Architecture Principles
//!
//! - Functional Core, Imperative Shell
//! - Explicit Effects (no hidden I/O)
//! - Dependency Injection via Environment
//!
//! ## Example
//!
//! ```ignore
//! use syncflow_core::*;
//!
//! impl Reducer for UpsertReducer {
//!     type State = UpsertState;
//!     type Action = UpsertAction;
//!     type Environment = UpsertEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut UpsertState,
//!         action: UpsertAction,
//!         env: &UpsertEnvironment,
//!     ) -> SmallVec<[Effect<UpsertAction>; 4]> {
//!         // Decide the next phase here
//!         smallvec![Effect::None]
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

pub mod entity;
pub mod entity_store;
pub mod envelope;
pub mod event_bus;
pub mod ids;
pub mod outbox;
pub mod work_queue;

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`
///
/// They contain all decision logic and are deterministic and testable.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        ///
        /// Most reducers return 0-3 effects, so a `SmallVec` keeps them inline.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects describe work for the runtime to perform. Each job's state machine
/// needs exactly one step at a time, so an effect is either nothing or one
/// future whose result is fed back into the reducer.
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;

    /// Effect type - describes a side effect to be executed
    ///
    /// Effects are NOT executed immediately. They are returned from reducers and
    /// executed by the runtime.
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    impl<Action> std::fmt::Debug for Effect<Action> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Wrap an async computation that feeds exactly one action back
        pub fn future<F>(fut: F) -> Effect<Action>
        where
            F: Future<Output = Action> + Send + 'static,
        {
            Effect::Future(Box::pin(async move { Some(fut.await) }))
        }

        /// Whether the effect has work to run.
        #[must_use]
        pub const fn is_future(&self) -> bool {
            matches!(self, Effect::Future(_))
        }
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;

    #[test]
    fn effect_debug_hides_futures() {
        let effect: Effect<u8> = Effect::future(async { 1 });
        assert_eq!(format!("{effect:?}"), "Effect::Future(<future>)");
    }

    #[test]
    fn none_has_no_work() {
        let effect: Effect<u8> = Effect::None;
        assert!(!effect.is_future());
        assert_eq!(format!("{effect:?}"), "Effect::None");
    }

    #[test]
    fn future_effect_yields_its_action() {
        let Effect::Future(fut) = Effect::<u8>::future(async { 7 }) else {
            unreachable!("Effect::future builds a Future variant");
        };
        assert_eq!(tokio_test::block_on(fut), Some(7));
    }
}
