//! Transactional outbox of internal events.
//!
//! [`EntityStore::create`](crate::entity_store::EntityStore::create) and
//! [`EntityStore::update`](crate::entity_store::EntityStore::update) append the
//! events announcing a write in the same transaction as the write. A relay then
//! reads [`Outbox::pending`], publishes each event and marks it published.
//!
//! Entries are only ever removed by [`Outbox::mark_published`]. A crash between
//! publish and mark publishes the event again on the next relay; internal event
//! ids are deterministic, so consumers see the same id twice.

use crate::entity_store::StoreError;
use crate::envelope::EventEnvelope;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Trait for outbox implementations, usually the entity store itself.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn Outbox>`).
pub trait Outbox: Send + Sync {
    /// Up to `limit` unpublished events, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] or [`StoreError::Serialization`] on failure.
    fn pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventEnvelope>, StoreError>> + Send + '_>>;

    /// Mark an event as delivered. Unknown or already published ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on failure.
    fn mark_published(
        &self,
        event_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Number of unpublished events.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on failure.
    fn pending_count(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<usize, StoreError>> + Send + '_>>;
}
