//! Core traits for attache's pluggable backends.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// CONTENT STORE
// =============================================================================

/// Byte storage addressed by opaque storage keys.
///
/// Implementations own their own retry policy. `delete` must be idempotent.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` under `key`, replacing anything already there.
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Read the bytes stored under `key`.
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Check whether bytes exist under `key`.
    async fn exist(&self, key: &str) -> Result<bool>;

    /// Delete the bytes under `key`. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

// =============================================================================
// BLOB REPOSITORY
// =============================================================================

/// Durable storage for blob records.
#[async_trait]
pub trait BlobRepository: Send + Sync {
    /// Insert a new blob row.
    async fn insert(&self, blob: &Blob) -> Result<()>;

    /// Fetch a blob by id.
    async fn get(&self, id: Uuid) -> Result<Option<Blob>>;

    /// Delete a blob row. Returns `true` if a row was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// List blobs created strictly before `cutoff`, ordered by
    /// `(created_at, id)`.
    ///
    /// `after` is a keyset cursor: only blobs sorting after that
    /// `(created_at, id)` pair are returned.
    async fn list_created_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<Blob>>;
}

// =============================================================================
// SLOT REPOSITORY
// =============================================================================

/// Durable storage for slot bindings.
#[async_trait]
pub trait SlotRepository: Send + Sync {
    /// Fetch the binding for a slot, if bound.
    async fn get(&self, key: &SlotKey) -> Result<Option<AttachmentSlot>>;

    /// All bindings held by one owner.
    async fn list_for_owner(&self, owner_type: &str, owner_id: Uuid)
        -> Result<Vec<AttachmentSlot>>;

    /// Apply all writes for one owner atomically.
    ///
    /// Returns one transition per write describing the binding that was
    /// actually replaced, in write order.
    async fn apply(
        &self,
        owner_type: &str,
        owner_id: Uuid,
        writes: &[SlotWrite],
    ) -> Result<Vec<SlotTransition>>;

    /// Apply writes like [`apply`](Self::apply) and, in the same
    /// transaction, delete the registry row of every blob released by a slot
    /// named in `unregister_slots` that no slot references any more.
    ///
    /// A released blob still bound elsewhere keeps its row. Bytes of removed
    /// blobs are left for the caller to delete after commit.
    async fn apply_and_unregister(
        &self,
        owner_type: &str,
        owner_id: Uuid,
        writes: &[SlotWrite],
        unregister_slots: &[String],
    ) -> Result<SlotCommit>;

    /// Delete every binding held by one owner, returning the removed rows.
    async fn delete_for_owner(&self, owner_type: &str, owner_id: Uuid)
        -> Result<Vec<AttachmentSlot>>;

    /// Number of slots, across all owners, bound to `blob_id`.
    async fn reference_count(&self, blob_id: Uuid) -> Result<i64>;
}

// =============================================================================
// DEFERRED TASK QUEUE
// =============================================================================

/// At-least-once queue of deferred purge tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a purge task, returning its id.
    async fn enqueue(&self, task: PurgeTask) -> Result<Uuid>;

    /// Claim the oldest pending task, marking it running.
    async fn claim_next(&self) -> Result<Option<QueuedTask>>;

    /// Mark a running task completed.
    async fn complete(&self, task_id: Uuid) -> Result<()>;

    /// Record a failed attempt; the task is retried until `max_attempts`.
    async fn fail(&self, task_id: Uuid, error: &str) -> Result<()>;

    /// Number of tasks waiting to be claimed.
    async fn pending_count(&self) -> Result<i64>;

    /// Hand back tasks left `running` for longer than `older_than`.
    ///
    /// A worker that dies mid-task never completes or fails it. Such tasks
    /// return to pending, or are marked failed when out of attempts. Returns
    /// the number of tasks touched.
    async fn requeue_stale(&self, older_than: std::time::Duration) -> Result<u64>;
}
