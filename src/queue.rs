//! The queue coordinator. Owns the storage backend and TTL policy, is the
//! single enforcement point for the task status machine, and publishes
//! queue events. Degrades to a fail-safe empty mode when the store is
//! unreachable instead of failing callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, StoreError};
use crate::events::{EVENT_CHANNEL_CAPACITY, QueueEvent};
use crate::store::{QueueBackend, RedisStore};
use crate::task::{QueueStats, Task, TaskResult, TaskStatus};

/// Pause between claim scans while waiting out the claim timeout.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

const DEFAULT_LIST_LIMIT: usize = 100;

/// Priority task queue over a pluggable storage backend.
///
/// All status changes funnel through [`TaskQueue::transition`]; nothing
/// else rewrites a task's status, so the transition table in
/// [`TaskStatus::can_transition_to`] is authoritative.
pub struct TaskQueue {
    store: Option<Arc<dyn QueueBackend>>,
    config: QueueConfig,
    available: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
    decoder: Option<JoinHandle<()>>,
}

impl TaskQueue {
    /// Build a queue over an injected backend.
    pub fn new(store: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let decoder = spawn_event_decoder(store.subscribe(), events.clone());
        Self {
            store: Some(store),
            config,
            available: AtomicBool::new(true),
            events,
            decoder: Some(decoder),
        }
    }

    /// Connect to the configured Redis store. Never fails: a disabled
    /// queue or an unreachable store yields a queue in unavailable mode.
    pub async fn connect(config: QueueConfig) -> Self {
        if !config.enabled {
            info!("Task queue disabled by configuration");
            return Self::detached(config);
        }
        match RedisStore::connect(&config.redis_url, &config.namespace).await {
            Ok(store) => {
                info!(namespace = %config.namespace, "Task queue connected");
                Self::new(Arc::new(store), config)
            }
            Err(e) => {
                warn!(error = %e, "Task queue store unreachable; starting unavailable");
                Self::detached(config)
            }
        }
    }

    /// A queue with no backing store, permanently unavailable.
    pub fn detached(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store: None,
            config,
            available: AtomicBool::new(false),
            events,
            decoder: None,
        }
    }

    /// Whether queue operations currently reach a live store.
    pub fn is_available(&self) -> bool {
        self.store.is_some() && self.available.load(Ordering::Relaxed)
    }

    /// Active round-trip health check.
    pub async fn ping(&self) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        match store.ping().await {
            Ok(()) => true,
            Err(e) => {
                self.note_store_error(&e);
                false
            }
        }
    }

    /// Stop the event decoder and release the backend.
    pub async fn close(&self) {
        self.available.store(false, Ordering::Relaxed);
        if let Some(decoder) = &self.decoder {
            decoder.abort();
        }
        if let Some(store) = &self.store {
            store.close().await;
        }
        info!("Task queue closed");
    }

    fn store(&self) -> Option<&Arc<dyn QueueBackend>> {
        if self.available.load(Ordering::Relaxed) {
            self.store.as_ref()
        } else {
            None
        }
    }

    /// Flip to unavailable on connection-class errors. Returns whether the
    /// error was connection-class.
    fn note_store_error(&self, err: &StoreError) -> bool {
        if !matches!(err, StoreError::Connection(_)) {
            return false;
        }
        if self.available.swap(false, Ordering::Relaxed) {
            warn!(error = %err, "Store connection lost; queue now unavailable");
        }
        true
    }

    /// Reads and bookkeeping writes fall back to an empty answer when the
    /// connection is gone; command errors still surface.
    fn degrade<T>(&self, err: StoreError, fallback: T) -> Result<T, QueueError> {
        if self.note_store_error(&err) {
            Ok(fallback)
        } else {
            Err(QueueError::Store(err))
        }
    }

    /// Work-accepting writes must not pretend to succeed; a lost
    /// connection becomes the typed unavailable error.
    fn reject<T>(&self, err: StoreError) -> Result<T, QueueError> {
        if self.note_store_error(&err) {
            Err(QueueError::Unavailable)
        } else {
            Err(QueueError::Store(err))
        }
    }

    // ── Submission and claiming ─────────────────────────────────────

    /// Validate and enqueue a task. Returns the task id.
    pub async fn submit(&self, mut task: Task) -> Result<String, QueueError> {
        task.validate()?;
        let Some(store) = self.store() else {
            return Err(QueueError::Unavailable);
        };
        task.status = TaskStatus::Pending;
        let blob = serde_json::to_string(&task)?;
        if let Err(e) = store.put_task(&task.id, &blob, self.config.task_ttl).await {
            return self.reject(e);
        }
        if let Err(e) = store.enqueue(&task.id, task.priority).await {
            return self.reject(e);
        }
        self.publish_event(QueueEvent::submitted(&task)).await;
        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            "Task submitted"
        );
        Ok(task.id)
    }

    /// Claim the next task, highest priority first. Waits up to the claim
    /// timeout for work, then returns `None`. The returned task is in
    /// `Claimed` status with the caller recorded as its worker.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.config.claim_timeout;
        loop {
            let Some(store) = self.store() else {
                return Ok(None);
            };
            match store.claim(self.config.claim_ttl).await {
                Ok(Some(id)) => {
                    if let Some(task) = self.finish_claim(&id, worker_id).await? {
                        return Ok(Some(task));
                    }
                    // Popped id had no live blob; keep scanning.
                    continue;
                }
                Ok(None) => {}
                Err(e) => return self.degrade(e, None),
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Final scan lands exactly on the deadline.
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn finish_claim(&self, id: &str, worker_id: &str) -> Result<Option<Task>, QueueError> {
        match self.transition(id, TaskStatus::Claimed, Some(worker_id)).await {
            Ok(task) => Ok(Some(task)),
            Err(QueueError::TaskNotFound { .. }) => {
                warn!(task_id = %id, "Claimed id had no task blob; dropped");
                if let Some(store) = self.store() {
                    if let Err(e) = store.drop_claimed(id).await {
                        self.note_store_error(&e);
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // ── Status transitions ──────────────────────────────────────────

    /// Move a task to a new status, enforcing the transition table.
    /// Stamps `started_at` on entry to `Running` and `completed_at` on
    /// entry to a terminal status; records the worker when given.
    pub async fn transition(
        &self,
        id: &str,
        to: TaskStatus,
        worker_id: Option<&str>,
    ) -> Result<Task, QueueError> {
        self.apply_transition(id, to, worker_id, |_| {}).await
    }

    async fn apply_transition<F>(
        &self,
        id: &str,
        to: TaskStatus,
        worker_id: Option<&str>,
        patch: F,
    ) -> Result<Task, QueueError>
    where
        F: FnOnce(&mut Task),
    {
        let Some(store) = self.store() else {
            return Err(QueueError::Unavailable);
        };
        let blob = match store.get_task(id).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return Err(QueueError::TaskNotFound { id: id.to_string() }),
            Err(e) => return self.reject(e),
        };
        let mut task: Task = serde_json::from_str(&blob)?;
        let from = task.status;

        if from == to {
            // Re-entering the current status is idempotent: the blob is
            // refreshed, sets and events are untouched.
            patch(&mut task);
            let rewritten = serde_json::to_string(&task)?;
            if let Err(e) = store.put_task(id, &rewritten, self.config.task_ttl).await {
                return self.reject(e);
            }
            return Ok(task);
        }
        if !from.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        task.status = to;
        if to == TaskStatus::Running {
            task.started_at = Some(Utc::now());
        } else if to.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        if let Some(worker) = worker_id {
            task.worker_id = Some(worker.to_string());
        }
        patch(&mut task);

        let rewritten = serde_json::to_string(&task)?;
        if let Err(e) = store
            .move_status(id, from, to, &rewritten, self.config.task_ttl)
            .await
        {
            return self.reject(e);
        }
        self.publish_event(QueueEvent::status_changed(
            id,
            from,
            to,
            task.worker_id.as_deref(),
        ))
        .await;
        debug!(task_id = %id, from = %from, to = %to, "Task status changed");
        Ok(task)
    }

    // ── Results and retries ─────────────────────────────────────────

    /// Persist a terminal result, fold it into the task blob and move the
    /// task to the result's terminal status.
    pub async fn save_result(&self, result: TaskResult) -> Result<(), QueueError> {
        if !result.status.is_terminal() {
            return Err(QueueError::NotTerminal {
                status: result.status.to_string(),
            });
        }
        let Some(store) = self.store() else {
            return Err(QueueError::Unavailable);
        };
        let blob = serde_json::to_string(&result)?;
        if let Err(e) = store
            .put_result(&result.task_id, &blob, self.config.result_ttl)
            .await
        {
            return self.reject(e);
        }

        let value = result.result.clone();
        let error = result.error.clone();
        let worker = result.worker_id.clone();
        let moved = self
            .apply_transition(&result.task_id, result.status, worker.as_deref(), |task| {
                task.result = value;
                task.error = error;
            })
            .await;
        match moved {
            Ok(_) => {}
            Err(QueueError::TaskNotFound { .. }) => {
                // The blob can expire before its result lands; the result
                // alone is still worth keeping.
                warn!(task_id = %result.task_id, "Result saved for an expired task");
            }
            Err(e) => return Err(e),
        }

        self.publish_event(QueueEvent::completed(&result)).await;
        info!(task_id = %result.task_id, status = %result.status, "Task result saved");
        Ok(())
    }

    /// Persist the result of a single attempt without touching the task's
    /// status. Workers call this before deciding whether to retry, so the
    /// blob always reflects the latest attempt; the next attempt or the
    /// terminal `save_result` overwrites it. No completion event fires.
    pub async fn save_attempt_result(&self, result: &TaskResult) -> Result<(), QueueError> {
        if !result.status.is_terminal() {
            return Err(QueueError::NotTerminal {
                status: result.status.to_string(),
            });
        }
        let Some(store) = self.store() else {
            return Err(QueueError::Unavailable);
        };
        let blob = serde_json::to_string(result)?;
        if let Err(e) = store
            .put_result(&result.task_id, &blob, self.config.result_ttl)
            .await
        {
            return self.reject(e);
        }
        debug!(task_id = %result.task_id, status = %result.status, "Attempt result saved");
        Ok(())
    }

    /// Spend one retry attempt. Within budget the task re-enters its
    /// queue, immediately or via the scheduler depending on its retry
    /// delay, and `true` is returned. With the budget spent the task is
    /// failed and `false` is returned.
    pub async fn retry(&self, id: &str) -> Result<bool, QueueError> {
        let Some(task) = self.get_task(id).await? else {
            return Err(QueueError::TaskNotFound { id: id.to_string() });
        };
        if !task.can_retry() {
            self.transition(id, TaskStatus::Failed, None).await?;
            info!(task_id = %id, retries = task.retry_count, "Retry budget spent; task failed");
            return Ok(false);
        }

        let attempt = task.retry_count + 1;
        let retried = self
            .apply_transition(id, TaskStatus::Retry, None, |task| {
                task.retry_count = attempt;
            })
            .await?;

        let delay = retried.retry_delay();
        if delay.is_zero() {
            self.transition(id, TaskStatus::Pending, None).await?;
            let Some(store) = self.store() else {
                return Err(QueueError::Unavailable);
            };
            if let Err(e) = store.enqueue(id, retried.priority).await {
                return self.reject(e);
            }
            debug!(task_id = %id, attempt, "Task re-queued for immediate retry");
        } else {
            let Some(store) = self.store() else {
                return Err(QueueError::Unavailable);
            };
            let due_epoch = Utc::now().timestamp() as f64 + delay.as_secs_f64();
            if let Err(e) = store.schedule(id, due_epoch).await {
                return self.reject(e);
            }
            debug!(
                task_id = %id,
                attempt,
                delay_secs = delay.as_secs(),
                "Task scheduled for delayed retry"
            );
        }
        Ok(true)
    }

    /// Cancel a pending task. Only tasks still sitting in a priority
    /// queue can be cancelled; everything else returns `false`.
    pub async fn cancel(&self, id: &str) -> Result<bool, QueueError> {
        let Some(store) = self.store() else {
            warn!(task_id = %id, "Cancel skipped; queue unavailable");
            return Ok(false);
        };
        let Some(task) = self.get_task(id).await? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        let removed = match store.remove_queued(id, task.priority).await {
            Ok(removed) => removed,
            Err(e) => return self.degrade(e, false),
        };
        if removed == 0 {
            // A claimant got there first.
            return Ok(false);
        }
        self.transition(id, TaskStatus::Cancelled, None).await?;
        info!(task_id = %id, "Task cancelled");
        Ok(true)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let Some(store) = self.store() else {
            return Ok(None);
        };
        match store.get_task(id).await {
            Ok(Some(blob)) => Ok(Some(serde_json::from_str(&blob)?)),
            Ok(None) => Ok(None),
            Err(e) => self.degrade(e, None),
        }
    }

    pub async fn get_result(&self, id: &str) -> Result<Option<TaskResult>, QueueError> {
        let Some(store) = self.store() else {
            return Ok(None);
        };
        match store.get_result(id).await {
            Ok(Some(blob)) => Ok(Some(serde_json::from_str(&blob)?)),
            Ok(None) => Ok(None),
            Err(e) => self.degrade(e, None),
        }
    }

    /// Tasks currently in a status, or in any status when no filter is
    /// given, up to `limit` (default 100). Status sets are disjoint, so
    /// the unfiltered walk never yields a task twice. Ids whose blob has
    /// expired are skipped.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Task>, QueueError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let Some(store) = self.store() else {
            return Ok(Vec::new());
        };
        let statuses = match status {
            Some(status) => vec![status],
            None => TaskStatus::ALL.to_vec(),
        };
        let mut ids = Vec::new();
        for status in statuses {
            match store.status_members(status).await {
                Ok(members) => ids.extend(members),
                Err(e) => return self.degrade(e, Vec::new()),
            }
        }
        let mut tasks = Vec::new();
        for id in ids {
            if tasks.len() >= limit {
                break;
            }
            if let Some(task) = self.get_task(&id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Snapshot of status counts, worker count and success rate.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let Some(store) = self.store() else {
            return Ok(QueueStats::empty());
        };
        let mut stats = QueueStats::empty();
        for status in TaskStatus::ALL {
            let count = match store.status_len(status).await {
                Ok(count) => count,
                Err(e) => return self.degrade(e, QueueStats::empty()),
            };
            match status {
                TaskStatus::Pending => stats.pending = count,
                TaskStatus::Claimed => stats.claimed = count,
                TaskStatus::Running => stats.running = count,
                TaskStatus::Completed => stats.completed = count,
                TaskStatus::Failed => stats.failed = count,
                TaskStatus::Cancelled => stats.cancelled = count,
                TaskStatus::Retry => stats.retrying = count,
            }
            stats.total += count;
        }
        stats.active_workers = match store.worker_len().await {
            Ok(count) => count,
            Err(e) => return self.degrade(e, QueueStats::empty()),
        };
        stats.success_rate = QueueStats::compute_success_rate(stats.completed, stats.failed);
        stats.timestamp = Utc::now();
        Ok(stats)
    }

    /// Drop everything queued. Returns how many queued ids were dropped.
    pub async fn clear_queue(&self) -> Result<u64, QueueError> {
        let Some(store) = self.store() else {
            return Ok(0);
        };
        match store.clear().await {
            Ok(dropped) => {
                info!(dropped, "Queues cleared");
                Ok(dropped)
            }
            Err(e) => self.degrade(e, 0),
        }
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Persist a task blob and record it as due at `due_epoch`. The task
    /// enters no queue until promoted.
    pub async fn schedule_task(&self, task: &Task, due_epoch: f64) -> Result<(), QueueError> {
        task.validate()?;
        let Some(store) = self.store() else {
            return Err(QueueError::Unavailable);
        };
        let blob = serde_json::to_string(task)?;
        if let Err(e) = store.put_task(&task.id, &blob, self.config.task_ttl).await {
            return self.reject(e);
        }
        if let Err(e) = store.schedule(&task.id, due_epoch).await {
            return self.reject(e);
        }
        debug!(task_id = %task.id, due_epoch, "Task scheduled");
        Ok(())
    }

    /// Atomically take task ids due at or before now, one backend batch
    /// at a time. A backlog larger than the batch drains across ticks.
    pub async fn take_due_tasks(&self) -> Result<Vec<String>, QueueError> {
        let Some(store) = self.store() else {
            return Ok(Vec::new());
        };
        match store.take_due(Utc::now().timestamp() as f64).await {
            Ok(ids) => Ok(ids),
            Err(e) => self.degrade(e, Vec::new()),
        }
    }

    /// Remove a task from the schedule before it is promoted. Also
    /// deletes its blob.
    pub async fn cancel_scheduled(&self, id: &str) -> Result<bool, QueueError> {
        let Some(store) = self.store() else {
            return Ok(false);
        };
        let removed = match store.unschedule(id).await {
            Ok(removed) => removed,
            Err(e) => return self.degrade(e, false),
        };
        if removed {
            if let Err(e) = store.delete_task(id).await {
                return self.degrade(e, true);
            }
            info!(task_id = %id, "Scheduled task cancelled");
        }
        Ok(removed)
    }

    pub async fn scheduled_count(&self) -> Result<u64, QueueError> {
        let Some(store) = self.store() else {
            return Ok(0);
        };
        match store.scheduled_len().await {
            Ok(count) => Ok(count),
            Err(e) => self.degrade(e, 0),
        }
    }

    // ── Worker registry ─────────────────────────────────────────────

    /// Add a worker to the registered set and write its first heartbeat.
    pub async fn register_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        let Some(store) = self.store() else {
            warn!(worker_id = %worker_id, "Worker registration skipped; queue unavailable");
            return Ok(());
        };
        if let Err(e) = store.add_worker(worker_id).await {
            return self.degrade(e, ());
        }
        if let Err(e) = store.touch_heartbeat(worker_id, self.config.heartbeat_ttl).await {
            return self.degrade(e, ());
        }
        info!(worker_id = %worker_id, "Worker registered");
        Ok(())
    }

    pub async fn unregister_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        if let Err(e) = store.remove_worker(worker_id).await {
            return self.degrade(e, ());
        }
        if let Err(e) = store.delete_heartbeat(worker_id).await {
            return self.degrade(e, ());
        }
        info!(worker_id = %worker_id, "Worker unregistered");
        Ok(())
    }

    /// Refresh a worker's liveness marker.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), QueueError> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        match store.touch_heartbeat(worker_id, self.config.heartbeat_ttl).await {
            Ok(()) => Ok(()),
            Err(e) => self.degrade(e, ()),
        }
    }

    /// Registered worker ids.
    pub async fn active_workers(&self) -> Result<Vec<String>, QueueError> {
        let Some(store) = self.store() else {
            return Ok(Vec::new());
        };
        match store.worker_members().await {
            Ok(ids) => Ok(ids),
            Err(e) => self.degrade(e, Vec::new()),
        }
    }

    /// Remove registered workers whose heartbeat has lapsed. Safe to run
    /// from several processes at once.
    pub async fn cleanup_stale_workers(&self) -> Result<u64, QueueError> {
        let Some(store) = self.store() else {
            return Ok(0);
        };
        let ids = match store.worker_members().await {
            Ok(ids) => ids,
            Err(e) => return self.degrade(e, 0),
        };
        let mut removed = 0;
        for id in ids {
            match store.heartbeat_alive(&id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => return self.degrade(e, removed),
            }
            if let Err(e) = store.remove_worker(&id).await {
                return self.degrade(e, removed);
            }
            warn!(worker_id = %id, "Removed stale worker");
            removed += 1;
        }
        Ok(removed)
    }

    /// Send claims whose marker lapsed before the task started running
    /// back to their queues. Guarded per id, so concurrent sweepers never
    /// double-requeue. Returns how many tasks were re-queued.
    pub async fn requeue_lost_claims(&self) -> Result<u64, QueueError> {
        let Some(store) = self.store() else {
            return Ok(0);
        };
        let ids = match store.status_members(TaskStatus::Claimed).await {
            Ok(ids) => ids,
            Err(e) => return self.degrade(e, 0),
        };
        let mut requeued = 0;
        for id in ids {
            match store.claim_alive(&id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => return self.degrade(e, requeued),
            }
            let blob = match store.get_task(&id).await {
                Ok(blob) => blob,
                Err(e) => return self.degrade(e, requeued),
            };
            let Some(blob) = blob else {
                if let Err(e) = store.drop_claimed(&id).await {
                    return self.degrade(e, requeued);
                }
                warn!(task_id = %id, "Dropped lapsed claim with expired task");
                continue;
            };
            let mut task: Task = match serde_json::from_str(&blob) {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Dropped lapsed claim with unreadable task");
                    if let Err(e) = store.drop_claimed(&id).await {
                        return self.degrade(e, requeued);
                    }
                    continue;
                }
            };
            task.status = TaskStatus::Pending;
            task.worker_id = None;
            let normalized = serde_json::to_string(&task)?;
            match store.requeue(&id, task.priority, &normalized).await {
                Ok(true) => {
                    self.publish_event(QueueEvent::status_changed(
                        &id,
                        TaskStatus::Claimed,
                        TaskStatus::Pending,
                        None,
                    ))
                    .await;
                    warn!(task_id = %id, "Re-queued lapsed claim");
                    requeued += 1;
                }
                Ok(false) => {}
                Err(e) => return self.degrade(e, requeued),
            }
        }
        Ok(requeued)
    }

    // ── Events ──────────────────────────────────────────────────────

    /// Subscribe to parsed queue events. Works even while unavailable
    /// (the stream is simply silent).
    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Publish fire-and-forget: a publish failure is logged and never
    /// fails the operation that produced the event.
    async fn publish_event(&self, event: QueueEvent) {
        let Some(store) = self.store() else {
            return;
        };
        match event.to_frame() {
            Ok(frame) => {
                if let Err(e) = store.publish(&frame).await {
                    self.note_store_error(&e);
                    warn!(error = %e, kind = %event.kind, "Event publish failed");
                }
            }
            Err(e) => warn!(error = %e, "Event could not be serialized"),
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        if let Some(decoder) = &self.decoder {
            decoder.abort();
        }
    }
}

/// Parse raw store frames into typed events for local subscribers.
fn spawn_event_decoder(
    mut frames: broadcast::Receiver<String>,
    tx: broadcast::Sender<QueueEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => match serde_json::from_str::<QueueEvent>(&frame) {
                    Ok(event) => {
                        tx.send(event).ok();
                    }
                    Err(e) => debug!(error = %e, "Skipping malformed event frame"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event decoder lagged; frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::store::MemoryStore;
    use crate::task::{TaskPriority, TaskType};
    use serde_json::{Map, Value, json};

    fn test_config() -> QueueConfig {
        QueueConfig {
            claim_timeout: Duration::from_millis(50),
            ..QueueConfig::default()
        }
    }

    fn test_queue() -> TaskQueue {
        TaskQueue::new(Arc::new(MemoryStore::new()), test_config())
    }

    fn query_task(text: &str) -> Task {
        let mut payload = Map::new();
        payload.insert("query".to_string(), Value::String(text.to_string()));
        Task::new(TaskType::AgentQuery, payload)
    }

    #[tokio::test]
    async fn submit_sets_pending_and_is_claimable() {
        let queue = test_queue();
        let id = queue.submit(query_task("hello")).await.unwrap();

        let task = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let claimed = queue.claim_next("worker-a").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn submit_rejects_invalid_payload() {
        let queue = test_queue();
        let task = Task::new(TaskType::AgentQuery, Map::new());
        assert!(matches!(
            queue.submit(task).await,
            Err(QueueError::MissingPayloadField { .. })
        ));
        assert_eq!(queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn claims_drain_priorities_in_order() {
        let queue = test_queue();
        let low = queue
            .submit(query_task("low").with_priority(TaskPriority::Low))
            .await
            .unwrap();
        let urgent = queue
            .submit(query_task("urgent").with_priority(TaskPriority::Urgent))
            .await
            .unwrap();
        let normal = queue.submit(query_task("normal")).await.unwrap();
        let high = queue
            .submit(query_task("high").with_priority(TaskPriority::High))
            .await
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(queue.claim_next("w").await.unwrap().unwrap().id);
        }
        assert_eq!(order, [urgent, high, normal, low]);
        assert!(queue.claim_next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_waits_out_the_timeout_when_empty() {
        let queue = test_queue();
        let started = std::time::Instant::now();
        assert!(queue.claim_next("w").await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn transition_enforces_the_table() {
        let queue = test_queue();
        let id = queue.submit(query_task("q")).await.unwrap();

        let err = queue
            .transition(&id, TaskStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        // Still claimable because nothing moved.
        assert!(queue.claim_next("w").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn repeated_transition_is_a_no_op() {
        let queue = test_queue();
        let id = queue.submit(query_task("q")).await.unwrap();
        queue.claim_next("w").await.unwrap().unwrap();

        let task = queue.transition(&id, TaskStatus::Claimed, None).await.unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(queue.stats().await.unwrap().claimed, 1);
    }

    #[tokio::test]
    async fn unknown_task_transition_is_not_found() {
        let queue = test_queue();
        assert!(matches!(
            queue.transition("missing", TaskStatus::Claimed, None).await,
            Err(QueueError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn full_lifecycle_to_completed() {
        let queue = test_queue();
        let id = queue.submit(query_task("q")).await.unwrap();
        queue.claim_next("worker-a").await.unwrap().unwrap();
        queue
            .transition(&id, TaskStatus::Running, Some("worker-a"))
            .await
            .unwrap();

        let result = TaskResult::success(&id, json!({"answer": "done"}))
            .with_duration(0.5)
            .with_worker("worker-a");
        queue.save_result(result).await.unwrap();

        let task = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
        assert_eq!(task.result, Some(json!({"answer": "done"})));

        let stored = queue.get_result(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.duration, Some(0.5));

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn save_result_rejects_non_terminal_status() {
        let queue = test_queue();
        let mut result = TaskResult::success("t-1", json!(null));
        result.status = TaskStatus::Running;
        assert!(matches!(
            queue.save_result(result).await,
            Err(QueueError::NotTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn attempt_results_do_not_move_the_task() {
        let queue = test_queue();
        let mut events = queue.subscribe_events();
        let id = queue.submit(query_task("q")).await.unwrap();
        queue.claim_next("w").await.unwrap().unwrap();
        queue.transition(&id, TaskStatus::Running, Some("w")).await.unwrap();

        let attempt = TaskResult::failure(&id, "first try failed").with_worker("w");
        queue.save_attempt_result(&attempt).await.unwrap();

        // Result readable mid-flight, task untouched.
        let result = queue.get_result(&id).await.unwrap().unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("first try failed"));
        let task = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.error.is_none());

        // Drain the stream up to a fence submit: the attempt save must
        // not have published a completion anywhere in between.
        let fence = queue.submit(query_task("fence")).await.unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("event should arrive")
                .unwrap();
            assert_ne!(event.kind, EventKind::TaskCompleted);
            if event.kind == EventKind::TaskSubmitted && event.data["task_id"] == fence.as_str() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn immediate_retry_requeues() {
        let queue = test_queue();
        let task = query_task("q").with_retry_delay(Duration::ZERO);
        let id = queue.submit(task).await.unwrap();
        queue.claim_next("w").await.unwrap();
        queue.transition(&id, TaskStatus::Running, None).await.unwrap();

        assert!(queue.retry(&id).await.unwrap());

        let again = queue.claim_next("w").await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.retry_count, 1);
    }

    #[tokio::test]
    async fn delayed_retry_goes_to_the_scheduler() {
        let queue = test_queue();
        let id = queue.submit(query_task("q")).await.unwrap();
        queue.claim_next("w").await.unwrap();
        queue.transition(&id, TaskStatus::Running, None).await.unwrap();

        assert!(queue.retry(&id).await.unwrap());

        // Not claimable: it waits in the schedule, not in a queue.
        assert!(queue.claim_next("w").await.unwrap().is_none());
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);
        let task = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retry);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_the_task() {
        let queue = test_queue();
        let task = query_task("q")
            .with_retry_delay(Duration::ZERO)
            .with_max_retries(1);
        let id = queue.submit(task).await.unwrap();

        // First attempt fails, one retry allowed.
        queue.claim_next("w").await.unwrap();
        queue.transition(&id, TaskStatus::Running, None).await.unwrap();
        assert!(queue.retry(&id).await.unwrap());

        // Second attempt fails with the budget spent.
        queue.claim_next("w").await.unwrap();
        queue.transition(&id, TaskStatus::Running, None).await.unwrap();
        assert!(!queue.retry(&id).await.unwrap());

        let task = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_only_touches_pending_tasks() {
        let queue = test_queue();
        let id = queue.submit(query_task("q")).await.unwrap();
        assert!(queue.cancel(&id).await.unwrap());
        assert_eq!(
            queue.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
        // Gone from the queue.
        assert!(queue.claim_next("w").await.unwrap().is_none());

        let id2 = queue.submit(query_task("q2")).await.unwrap();
        queue.claim_next("w").await.unwrap();
        assert!(!queue.cancel(&id2).await.unwrap());
        assert_eq!(
            queue.get_task(&id2).await.unwrap().unwrap().status,
            TaskStatus::Claimed
        );

        assert!(!queue.cancel("missing").await.unwrap());
    }

    #[tokio::test]
    async fn stats_track_every_bucket() {
        let queue = test_queue();
        queue.submit(query_task("a")).await.unwrap();
        queue.submit(query_task("b")).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();
        queue
            .transition(&claimed.id, TaskStatus::Running, None)
            .await
            .unwrap();
        queue
            .save_result(TaskResult::failure(&claimed.id, "boom"))
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn list_tasks_by_status() {
        let queue = test_queue();
        queue.submit(query_task("a")).await.unwrap();
        queue.submit(query_task("b")).await.unwrap();
        queue.submit(query_task("c")).await.unwrap();

        let pending = queue
            .list_tasks(Some(TaskStatus::Pending), None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);
        let capped = queue
            .list_tasks(Some(TaskStatus::Pending), Some(2))
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
        assert!(queue
            .list_tasks(Some(TaskStatus::Completed), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_tasks_without_a_filter_spans_every_status() {
        let queue = test_queue();
        let first = queue.submit(query_task("a")).await.unwrap();
        let second = queue.submit(query_task("b")).await.unwrap();

        let claimed = queue.claim_next("w").await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        queue
            .transition(&first, TaskStatus::Running, Some("w"))
            .await
            .unwrap();
        queue
            .save_result(TaskResult::success(&first, json!("done")))
            .await
            .unwrap();

        let all = queue.list_tasks(None, None).await.unwrap();
        let mut ids: Vec<String> = all.iter().map(|t| t.id.clone()).collect();
        ids.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(ids, expected);

        let capped = queue.list_tasks(None, Some(1)).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn clear_queue_drops_queued_work() {
        let queue = test_queue();
        queue.submit(query_task("a")).await.unwrap();
        queue.submit(query_task("b")).await.unwrap();
        assert_eq!(queue.clear_queue().await.unwrap(), 2);
        assert!(queue.claim_next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lapsed_claims_are_requeued_exactly_once() {
        let config = QueueConfig {
            claim_ttl: Duration::ZERO,
            claim_timeout: Duration::from_millis(50),
            ..QueueConfig::default()
        };
        let queue = TaskQueue::new(Arc::new(MemoryStore::new()), config);
        let id = queue.submit(query_task("q")).await.unwrap();

        // Claim and "crash": never reach Running.
        queue.claim_next("w1").await.unwrap().unwrap();

        assert_eq!(queue.requeue_lost_claims().await.unwrap(), 1);
        assert_eq!(queue.requeue_lost_claims().await.unwrap(), 0);

        let task = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.worker_id.is_none());

        // Another worker picks it up.
        let again = queue.claim_next("w2").await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.worker_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn live_claims_are_left_alone() {
        let queue = test_queue();
        queue.submit(query_task("q")).await.unwrap();
        queue.claim_next("w").await.unwrap().unwrap();
        assert_eq!(queue.requeue_lost_claims().await.unwrap(), 0);
        assert_eq!(queue.stats().await.unwrap().claimed, 1);
    }

    #[tokio::test]
    async fn worker_registry_roundtrip() {
        let queue = test_queue();
        queue.register_worker("w-1").await.unwrap();
        queue.register_worker("w-2").await.unwrap();
        assert_eq!(queue.active_workers().await.unwrap().len(), 2);
        assert_eq!(queue.stats().await.unwrap().active_workers, 2);

        queue.unregister_worker("w-1").await.unwrap();
        assert_eq!(queue.active_workers().await.unwrap(), ["w-2"]);
    }

    #[tokio::test]
    async fn stale_workers_are_cleaned_up() {
        let config = QueueConfig {
            heartbeat_ttl: Duration::ZERO,
            claim_timeout: Duration::from_millis(50),
            ..QueueConfig::default()
        };
        let queue = TaskQueue::new(Arc::new(MemoryStore::new()), config);
        queue.register_worker("w-1").await.unwrap();
        assert_eq!(queue.cleanup_stale_workers().await.unwrap(), 1);
        assert!(queue.active_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduling_roundtrip() {
        let queue = test_queue();
        let task = query_task("later");
        let id = task.id.clone();
        queue.schedule_task(&task, 100.0).await.unwrap();
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);

        let due = queue.take_due_tasks().await.unwrap();
        assert_eq!(due, [id]);
        assert_eq!(queue.scheduled_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_scheduled_removes_blob() {
        let queue = test_queue();
        let task = query_task("later");
        let id = task.id.clone();
        queue.schedule_task(&task, 4_102_444_800.0).await.unwrap();

        assert!(queue.cancel_scheduled(&id).await.unwrap());
        assert!(!queue.cancel_scheduled(&id).await.unwrap());
        assert!(queue.get_task(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_are_published_and_decoded() {
        let queue = test_queue();
        let mut events = queue.subscribe_events();

        let id = queue.submit(query_task("q")).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event should arrive")
            .unwrap();
        assert_eq!(event.kind, EventKind::TaskSubmitted);
        assert_eq!(event.data["task_id"], id.as_str());
    }

    #[tokio::test]
    async fn detached_queue_is_fail_safe() {
        let queue = TaskQueue::detached(test_config());
        assert!(!queue.is_available());
        assert!(!queue.ping().await);

        assert!(matches!(
            queue.submit(query_task("q")).await,
            Err(QueueError::Unavailable)
        ));
        assert!(matches!(
            queue.schedule_task(&query_task("q"), 100.0).await,
            Err(QueueError::Unavailable)
        ));

        assert!(queue.claim_next("w").await.unwrap().is_none());
        assert!(queue.get_task("t").await.unwrap().is_none());
        assert!(queue.get_result("t").await.unwrap().is_none());
        assert!(queue.list_tasks(None, None).await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().total, 0);
        assert_eq!(queue.requeue_lost_claims().await.unwrap(), 0);
        assert_eq!(queue.cleanup_stale_workers().await.unwrap(), 0);
        assert!(!queue.cancel("t").await.unwrap());
        queue.register_worker("w").await.unwrap();
        queue.heartbeat("w").await.unwrap();
        queue.unregister_worker("w").await.unwrap();
    }
}
