//! # Syncflow Runtime
//!
//! The moving parts of the upsert pipeline, built on the abstractions in
//! `syncflow-core`.
//!
//! ## Core Components
//!
//! - **Resolver**: read-only lookups of primary and related entities
//! - **Orchestrator**: the per-job state machine (a reducer plus its effects)
//! - **Fan-out Splitter**: one refresh job per composite affected by a change
//! - **Course Groups**: the group and memberships that follow each course
//! - **Event Publisher**: relays committed events from the store's outbox
//! - **Worker**: receives jobs and settles them (ack, retry, dead-letter)
//! - **Ingress**: bus consumers that feed the work queue
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use syncflow_runtime::{
//!     EventPublisher, Orchestrator, OrchestratorEnvironment, SyncConfig, Worker,
//! };
//!
//! let config = SyncConfig::from_env()?;
//! let publisher = Arc::new(EventPublisher::new(bus, outbox, config.publisher.clone()));
//! let orchestrator = Orchestrator::new(OrchestratorEnvironment::new(
//!     store,
//!     Arc::clone(&publisher),
//!     config.orchestrator,
//! ));
//!
//! let worker = Worker::new(queue, orchestrator, publisher, config.worker.clone());
//! worker.run(shutdown).await;
//! ```

/// Operational configuration
pub mod config;

/// The `Deciding` step of the orchestrator
pub mod decision;

/// Course groups and their memberships
pub mod course_groups;

/// Reducer effect executor
pub mod executor;

/// Bus consumers feeding the work queue
pub mod ingress;

/// Prometheus metrics for observability
pub mod metrics;

/// The upsert state machine
pub mod orchestrator;

/// Internal event publisher
pub mod publisher;

/// Read-only entity resolution
pub mod resolver;

/// Retry logic with exponential backoff
pub mod retry;

/// Fan-out splitter
pub mod splitter;

/// Worker pool
pub mod worker;

pub use config::{ConfigError, OrchestratorConfig, PublisherConfig, SyncConfig, WorkerConfig};
pub use ingress::{FanOutConsumer, Ingress, IngressError};
pub use orchestrator::{Orchestrator, OrchestratorEnvironment, UpsertOutcome};
pub use publisher::{EventPublisher, PublishError};
pub use resolver::Resolver;
pub use retry::RetryPolicy;
pub use splitter::FanOutSplitter;
pub use worker::Worker;
