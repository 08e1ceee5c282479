//! Storage seam for the queue. A single async trait in the queue's own
//! vocabulary, so backends can map it onto whatever primitives they have.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::task::{TaskPriority, TaskStatus};

/// Most scheduled ids a single `take_due` call returns. Keeps the batch
/// well under Lua's unpack stack limit on the Redis side; callers drain
/// larger backlogs across successive calls.
pub const TAKE_DUE_BATCH: usize = 1000;

/// Backend-agnostic storage trait covering task blobs, priority queues,
/// status sets, claim markers, scheduling and the worker registry.
///
/// The compound operations (`enqueue`, `claim`, `move_status`, `take_due`,
/// `requeue`) must each be atomic: concurrent callers never observe a task
/// id partially moved.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Round-trip liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    // ── Task and result blobs ───────────────────────────────────────

    /// Write a task blob with a TTL.
    async fn put_task(&self, id: &str, blob: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Read a task blob. Expired blobs read as absent.
    async fn get_task(&self, id: &str) -> Result<Option<String>, StoreError>;

    /// Delete a task blob.
    async fn delete_task(&self, id: &str) -> Result<(), StoreError>;

    /// Write a result blob with a TTL.
    async fn put_result(&self, id: &str, blob: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Read a result blob. Expired blobs read as absent.
    async fn get_result(&self, id: &str) -> Result<Option<String>, StoreError>;

    // ── Priority queues ─────────────────────────────────────────────

    /// Push an id onto the tail of its priority queue and move it into the
    /// pending status set, clearing any stale retry membership. Atomic.
    async fn enqueue(&self, id: &str, priority: TaskPriority) -> Result<(), StoreError>;

    /// Pop the head of the highest non-empty priority queue, move the id
    /// into the claimed status set and write its claim marker. Atomic.
    /// Returns the id, or `None` when every queue is empty.
    async fn claim(&self, claim_ttl: Duration) -> Result<Option<String>, StoreError>;

    /// Remove every occurrence of an id from one priority queue.
    /// Returns how many entries were removed.
    async fn remove_queued(&self, id: &str, priority: TaskPriority) -> Result<u64, StoreError>;

    /// Length of one priority queue.
    async fn queue_len(&self, priority: TaskPriority) -> Result<u64, StoreError>;

    // ── Status sets ─────────────────────────────────────────────────

    /// Move an id between status sets and rewrite its blob with a fresh
    /// TTL, in one atomic step. Leaving `Claimed` also drops the claim
    /// marker.
    async fn move_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        blob: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Ids currently in a status set.
    async fn status_members(&self, status: TaskStatus) -> Result<Vec<String>, StoreError>;

    /// Cardinality of a status set.
    async fn status_len(&self, status: TaskStatus) -> Result<u64, StoreError>;

    // ── Claim markers ───────────────────────────────────────────────

    /// Whether an id's claim marker is still live.
    async fn claim_alive(&self, id: &str) -> Result<bool, StoreError>;

    /// Move a lapsed claim back to pending and re-push it onto its
    /// priority queue, rewriting the blob in place (TTL preserved).
    /// Guarded: returns `false` when another sweeper already took it or
    /// the task blob is gone. Atomic.
    async fn requeue(
        &self,
        id: &str,
        priority: TaskPriority,
        blob: &str,
    ) -> Result<bool, StoreError>;

    /// Drop an id from the claimed set and delete its claim marker,
    /// without re-queueing. Used when the task blob has expired.
    async fn drop_claimed(&self, id: &str) -> Result<(), StoreError>;

    // ── Scheduling ──────────────────────────────────────────────────

    /// Record an id as scheduled, scored by its due unix timestamp.
    async fn schedule(&self, id: &str, due_epoch: f64) -> Result<(), StoreError>;

    /// Remove and return scheduled ids with a due timestamp at or before
    /// `now_epoch`, oldest first, at most [`TAKE_DUE_BATCH`] per call.
    /// Atomic: concurrent callers never receive the same id.
    async fn take_due(&self, now_epoch: f64) -> Result<Vec<String>, StoreError>;

    /// Remove one id from the schedule. Returns whether it was present.
    async fn unschedule(&self, id: &str) -> Result<bool, StoreError>;

    /// Number of scheduled ids.
    async fn scheduled_len(&self) -> Result<u64, StoreError>;

    // ── Worker registry ─────────────────────────────────────────────

    /// Add a worker id to the registered set.
    async fn add_worker(&self, id: &str) -> Result<(), StoreError>;

    /// Remove a worker id from the registered set.
    async fn remove_worker(&self, id: &str) -> Result<(), StoreError>;

    /// All registered worker ids.
    async fn worker_members(&self) -> Result<Vec<String>, StoreError>;

    /// Number of registered workers.
    async fn worker_len(&self) -> Result<u64, StoreError>;

    /// Rewrite a worker's heartbeat marker with a TTL.
    async fn touch_heartbeat(&self, id: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Whether a worker's heartbeat marker is still live.
    async fn heartbeat_alive(&self, id: &str) -> Result<bool, StoreError>;

    /// Delete a worker's heartbeat marker.
    async fn delete_heartbeat(&self, id: &str) -> Result<(), StoreError>;

    // ── Events ──────────────────────────────────────────────────────

    /// Publish a raw event frame to the shared channel.
    async fn publish(&self, frame: &str) -> Result<(), StoreError>;

    /// Subscribe to raw event frames.
    fn subscribe(&self) -> broadcast::Receiver<String>;

    // ── Administration ──────────────────────────────────────────────

    /// Drain every priority queue and status set. Returns how many queued
    /// ids were dropped.
    async fn clear(&self) -> Result<u64, StoreError>;

    /// Release background resources. Safe to call more than once.
    async fn close(&self);
}
