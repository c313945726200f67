//! `PostgreSQL` backends for syncflow.
//!
//! This crate provides:
//!
//! - [`PostgresEntityStore`]: the [`EntityStore`](syncflow_core::entity_store::EntityStore)
//!   with conditional create/update and a source-reference index, and the
//!   [`Outbox`](syncflow_core::outbox::Outbox) its writes append events to
//! - [`PostgresWorkQueue`]: the [`WorkQueue`](syncflow_core::work_queue::WorkQueue)
//!   using `FOR UPDATE SKIP LOCKED` claims and visibility timeouts, with a
//!   table of rejected messages that never decoded
//! - [`DeadLetterQueue`]: operator tooling over dead-lettered jobs
//!
//! Schema lives in `migrations/` and is applied with [`migrate`].
//!
//! # Example
//!
//! ```ignore
//! use syncflow_postgres::{PostgresEntityStore, PostgresWorkQueue, connect, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/syncflow", 10).await?;
//!     migrate(&pool).await?;
//!
//!     let store = PostgresEntityStore::from_pool(pool.clone());
//!     let queue = PostgresWorkQueue::from_pool(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter_queue;
mod entity_store;
mod work_queue;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedJob};
pub use entity_store::PostgresEntityStore;
pub use work_queue::{JOBS_ORIGIN, PostgresWorkQueue};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`sqlx::Error`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Apply pending schema migrations.
///
/// # Errors
///
/// Returns [`sqlx::migrate::MigrateError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
