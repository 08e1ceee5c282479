//! In-memory backend: plain maps behind one async mutex, so every compound
//! operation is trivially atomic. TTLs are deadlines honored lazily on
//! read. Backs the test suite and embedded use without a live store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};

use crate::error::StoreError;
use crate::events::EVENT_CHANNEL_CAPACITY;
use crate::store::backend::{QueueBackend, TAKE_DUE_BATCH};
use crate::task::{TaskPriority, TaskStatus};

#[derive(Debug, Clone)]
struct Expiring {
    value: String,
    deadline: Instant,
}

impl Expiring {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            deadline: Instant::now() + ttl,
        }
    }

    fn live(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Expiring>,
    results: HashMap<String, Expiring>,
    queues: HashMap<TaskPriority, VecDeque<String>>,
    statuses: HashMap<TaskStatus, HashSet<String>>,
    claims: HashMap<String, Instant>,
    scheduled: HashMap<String, f64>,
    workers: HashSet<String>,
    heartbeats: HashMap<String, Instant>,
}

impl Inner {
    fn queue(&mut self, priority: TaskPriority) -> &mut VecDeque<String> {
        self.queues.entry(priority).or_default()
    }

    fn status_set(&mut self, status: TaskStatus) -> &mut HashSet<String> {
        self.statuses.entry(status).or_default()
    }
}

/// Everything lives behind one mutex; lock scopes stay short and never
/// span an await.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn put_task(&self, id: &str, blob: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.tasks.insert(id.to_string(), Expiring::new(blob, ttl));
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if let Some(entry) = inner.tasks.get(id) {
            if entry.live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        inner.tasks.remove(id);
        Ok(None)
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.tasks.remove(id);
        Ok(())
    }

    async fn put_result(&self, id: &str, blob: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.results.insert(id.to_string(), Expiring::new(blob, ttl));
        Ok(())
    }

    async fn get_result(&self, id: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if let Some(entry) = inner.results.get(id) {
            if entry.live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        inner.results.remove(id);
        Ok(None)
    }

    async fn enqueue(&self, id: &str, priority: TaskPriority) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.queue(priority).push_back(id.to_string());
        inner.status_set(TaskStatus::Retry).remove(id);
        inner.status_set(TaskStatus::Pending).insert(id.to_string());
        Ok(())
    }

    async fn claim(&self, claim_ttl: Duration) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        for priority in TaskPriority::DESCENDING {
            let Some(id) = inner.queue(priority).pop_front() else {
                continue;
            };
            inner.status_set(TaskStatus::Pending).remove(&id);
            inner.status_set(TaskStatus::Retry).remove(&id);
            inner.status_set(TaskStatus::Claimed).insert(id.clone());
            inner.claims.insert(id.clone(), now + claim_ttl);
            return Ok(Some(id));
        }
        Ok(None)
    }

    async fn remove_queued(&self, id: &str, priority: TaskPriority) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let queue = inner.queue(priority);
        let before = queue.len();
        queue.retain(|queued| queued != id);
        Ok((before - queue.len()) as u64)
    }

    async fn queue_len(&self, priority: TaskPriority) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.queue(priority).len() as u64)
    }

    async fn move_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        blob: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.status_set(from).remove(id);
        inner.tasks.insert(id.to_string(), Expiring::new(blob, ttl));
        inner.status_set(to).insert(id.to_string());
        if from == TaskStatus::Claimed {
            inner.claims.remove(id);
        }
        Ok(())
    }

    async fn status_members(&self, status: TaskStatus) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.status_set(status).iter().cloned().collect())
    }

    async fn status_len(&self, status: TaskStatus) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.status_set(status).len() as u64)
    }

    async fn claim_alive(&self, id: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        Ok(inner.claims.get(id).is_some_and(|deadline| *deadline > now))
    }

    async fn requeue(
        &self,
        id: &str,
        priority: TaskPriority,
        blob: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.status_set(TaskStatus::Claimed).remove(id) {
            return Ok(false);
        }
        inner.claims.remove(id);
        let now = Instant::now();
        // Rewrite in place so the original deadline survives.
        let rewritten = match inner.tasks.get_mut(id) {
            Some(entry) if entry.live(now) => {
                entry.value = blob.to_string();
                true
            }
            _ => false,
        };
        if !rewritten {
            inner.tasks.remove(id);
            return Ok(false);
        }
        inner.status_set(TaskStatus::Pending).insert(id.to_string());
        inner.queue(priority).push_back(id.to_string());
        Ok(true)
    }

    async fn drop_claimed(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.status_set(TaskStatus::Claimed).remove(id);
        inner.claims.remove(id);
        Ok(())
    }

    async fn schedule(&self, id: &str, due_epoch: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.scheduled.insert(id.to_string(), due_epoch);
        Ok(())
    }

    async fn take_due(&self, now_epoch: f64) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut due: Vec<(String, f64)> = inner
            .scheduled
            .iter()
            .filter(|(_, score)| **score <= now_epoch)
            .map(|(id, score)| (id.clone(), *score))
            .collect();
        due.sort_by(|a, b| a.1.total_cmp(&b.1));
        due.truncate(TAKE_DUE_BATCH);
        let due: Vec<String> = due.into_iter().map(|(id, _)| id).collect();
        for id in &due {
            inner.scheduled.remove(id);
        }
        Ok(due)
    }

    async fn unschedule(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.scheduled.remove(id).is_some())
    }

    async fn scheduled_len(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.scheduled.len() as u64)
    }

    async fn add_worker(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.workers.insert(id.to_string());
        Ok(())
    }

    async fn remove_worker(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.workers.remove(id);
        Ok(())
    }

    async fn worker_members(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.workers.iter().cloned().collect())
    }

    async fn worker_len(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.workers.len() as u64)
    }

    async fn touch_heartbeat(&self, id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.heartbeats.insert(id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn heartbeat_alive(&self, id: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        Ok(inner
            .heartbeats
            .get(id)
            .is_some_and(|deadline| *deadline > now))
    }

    async fn delete_heartbeat(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.heartbeats.remove(id);
        Ok(())
    }

    async fn publish(&self, frame: &str) -> Result<(), StoreError> {
        // Nobody listening is fine.
        self.events.send(frame.to_string()).ok();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let dropped: u64 = inner.queues.values().map(|queue| queue.len() as u64).sum();
        inner.queues.clear();
        inner.statuses.clear();
        Ok(dropped)
    }

    async fn close(&self) {}
}
