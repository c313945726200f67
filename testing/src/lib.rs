//! # Syncflow Testing
//!
//! Testing utilities for the syncflow upsert pipeline.
//!
//! This crate provides:
//! - In-memory implementations of the collaborator traits
//!   ([`InMemoryEntityStore`], [`InMemoryEventBus`], [`InMemoryWorkQueue`])
//! - Envelope and record [`fixtures`]
//! - proptest strategies for domain types
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use syncflow_testing::{InMemoryEntityStore, InMemoryEventBus, fixtures};
//!
//! #[tokio::test]
//! async fn creates_course() {
//!     let store = Arc::new(InMemoryEntityStore::new());
//!     let bus = Arc::new(InMemoryEventBus::new());
//!     let orchestrator = orchestrator(store.clone(), bus.clone());
//!
//!     orchestrator.process(fixtures::course_created("course-1")).await;
//!
//!     assert_eq!(store.count(EntityKind::Course), 1);
//!     assert_eq!(bus.published().len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use syncflow_core::environment::Clock;

/// In-memory entity store
pub mod entity_store;

/// In-memory event bus
pub mod event_bus;

/// Envelope and record builders
pub mod fixtures;

/// In-memory work queue
pub mod work_queue;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use syncflow_testing::mocks::FixedClock;
    /// use syncflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::{Map, Value};
    use syncflow_core::entity::{EntityKind, Operation};

    /// Any entity kind.
    pub fn entity_kind() -> impl Strategy<Value = EntityKind> {
        prop::sample::select(EntityKind::ALL.to_vec())
    }

    /// `created` or `updated`.
    pub fn upsert_operation() -> impl Strategy<Value = Operation> {
        prop_oneof![Just(Operation::Created), Just(Operation::Updated)]
    }

    /// A non-empty set of course field changes, for overlaying onto a full payload.
    pub fn course_patch() -> impl Strategy<Value = Map<String, Value>> {
        (
            proptest::option::of("[a-z]{3,12}"),
            proptest::option::of("[A-Z][a-z]{2,10}( [A-Z][a-z]{2,10})?"),
            proptest::option::of(prop::sample::select(vec!["pending", "open", "closed"])),
        )
            .prop_filter("at least one field", |(slug, name, status)| {
                slug.is_some() || name.is_some() || status.is_some()
            })
            .prop_map(|(slug, name, status)| {
                let mut patch = Map::new();
                if let Some(slug) = slug {
                    patch.insert("slug".to_string(), Value::String(slug));
                }
                if let Some(name) = name {
                    patch.insert("name".to_string(), Value::String(name));
                }
                if let Some(status) = status {
                    patch.insert("status".to_string(), Value::String(status.to_string()));
                }
                patch
            })
    }

    /// An offset from [`base_time`](crate::fixtures::base_time) within one day.
    pub fn offset() -> impl Strategy<Value = Duration> {
        (0i64..86_400).prop_map(Duration::seconds)
    }
}

/// Route `tracing` output to the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub use entity_store::InMemoryEntityStore;
pub use event_bus::InMemoryEventBus;
pub use mocks::{FixedClock, test_clock};
pub use work_queue::InMemoryWorkQueue;
