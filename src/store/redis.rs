//! Redis-backed store. The compound queue operations run as server-side
//! Lua scripts so concurrent workers and sweepers stay correct without
//! client-side locking.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::events::EVENT_CHANNEL_CAPACITY;
use crate::store::backend::{QueueBackend, TAKE_DUE_BATCH};
use crate::task::{TaskPriority, TaskStatus};

/// Push an id onto its priority queue and into the pending set, clearing
/// any stale retry membership.
/// KEYS: queue, retry set, pending set. ARGV: id.
const ENQUEUE_SCRIPT: &str = r#"
redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[1])
return 1
"#;

/// Pop the head of the highest non-empty queue, move the id to the claimed
/// set and write its claim marker.
/// KEYS: queues urgent..low, pending set, retry set, claimed set.
/// ARGV: marker TTL in milliseconds, claim key prefix.
const CLAIM_SCRIPT: &str = r#"
for i = 1, 4 do
    local id = redis.call('LPOP', KEYS[i])
    if id then
        redis.call('SREM', KEYS[5], id)
        redis.call('SREM', KEYS[6], id)
        redis.call('SADD', KEYS[7], id)
        redis.call('SET', ARGV[2] .. id, '1', 'PX', ARGV[1])
        return id
    end
end
return false
"#;

/// Move an id between status sets and rewrite its blob with a fresh TTL.
/// KEYS: old set, task blob, new set, claim marker.
/// ARGV: id, blob, TTL seconds, drop-claim flag.
const MOVE_STATUS_SCRIPT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
redis.call('SADD', KEYS[3], ARGV[1])
if ARGV[4] == '1' then
    redis.call('DEL', KEYS[4])
end
return 1
"#;

/// Remove and return scheduled ids due at or before the cutoff, oldest
/// first. Bounded per call so the ZREM unpack stays inside Lua's stack.
/// KEYS: scheduled zset. ARGV: cutoff timestamp, batch limit.
const TAKE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #due > 0 then
    redis.call('ZREM', KEYS[1], unpack(due))
end
return due
"#;

/// Send a lapsed claim back to pending. Guarded by the SREM so two
/// sweepers cannot both requeue, and bails out when the blob is gone
/// (KEEPTTL on a missing key would resurrect it without an expiry).
/// KEYS: claimed set, claim marker, task blob, pending set, queue.
/// ARGV: id, blob.
const REQUEUE_SCRIPT: &str = r#"
if redis.call('SREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('DEL', KEYS[2])
if redis.call('EXISTS', KEYS[3]) == 0 then
    return 0
end
redis.call('SET', KEYS[3], ARGV[2], 'KEEPTTL')
redis.call('SADD', KEYS[4], ARGV[1])
redis.call('RPUSH', KEYS[5], ARGV[1])
return 1
"#;

/// Store backed by a shared Redis instance. The multiplexed connection is
/// cheap to clone per operation; events arrive through a pub/sub listener
/// task spawned at connect time.
pub struct RedisStore {
    conn: MultiplexedConnection,
    namespace: String,
    events: broadcast::Sender<String>,
    listener: JoinHandle<()>,
}

impl RedisStore {
    /// Connect, subscribe to the event channel and start the listener.
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;

        let channel = format!("{}:events", namespace);
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| StoreError::Subscribe(e.to_string()))?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let listener = spawn_event_listener(pubsub, events.clone());

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            events,
            listener,
        })
    }

    fn task_key(&self, id: &str) -> String {
        format!("{}:task:{}", self.namespace, id)
    }

    fn result_key(&self, id: &str) -> String {
        format!("{}:result:{}", self.namespace, id)
    }

    fn queue_key(&self, priority: TaskPriority) -> String {
        format!("{}:queue:{}", self.namespace, priority.as_str())
    }

    fn status_key(&self, status: TaskStatus) -> String {
        format!("{}:status:{}", self.namespace, status.as_str())
    }

    fn claim_key(&self, id: &str) -> String {
        format!("{}:claim:{}", self.namespace, id)
    }

    fn claim_key_prefix(&self) -> String {
        format!("{}:claim:", self.namespace)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    fn workers_key(&self) -> String {
        format!("{}:workers", self.namespace)
    }

    fn heartbeat_key(&self, id: &str) -> String {
        format!("{}:worker:{}:heartbeat", self.namespace, id)
    }

    fn events_channel(&self) -> String {
        format!("{}:events", self.namespace)
    }
}

/// Forward raw pub/sub frames into the broadcast channel until the
/// subscription drops.
fn spawn_event_listener(
    mut pubsub: ::redis::aio::PubSub,
    tx: broadcast::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_payload::<String>() {
                Ok(frame) => {
                    tx.send(frame).ok();
                }
                Err(e) => debug!(error = %e, "Skipping undecodable event frame"),
            }
        }
        warn!("Event listener stream ended");
    })
}

fn map_redis_error(err: ::redis::RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

#[async_trait]
impl QueueBackend for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn put_task(&self, id: &str, blob: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.task_key(id), blob, ttl.as_secs().max(1))
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let blob: Option<String> = conn
            .get(self.task_key(id))
            .await
            .map_err(map_redis_error)?;
        Ok(blob)
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.task_key(id))
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn put_result(&self, id: &str, blob: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.result_key(id), blob, ttl.as_secs().max(1))
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn get_result(&self, id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let blob: Option<String> = conn
            .get(self.result_key(id))
            .await
            .map_err(map_redis_error)?;
        Ok(blob)
    }

    async fn enqueue(&self, id: &str, priority: TaskPriority) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(ENQUEUE_SCRIPT)
            .key(self.queue_key(priority))
            .key(self.status_key(TaskStatus::Retry))
            .key(self.status_key(TaskStatus::Pending))
            .arg(id)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn claim(&self, claim_ttl: Duration) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = Script::new(CLAIM_SCRIPT)
            .key(self.queue_key(TaskPriority::Urgent))
            .key(self.queue_key(TaskPriority::High))
            .key(self.queue_key(TaskPriority::Normal))
            .key(self.queue_key(TaskPriority::Low))
            .key(self.status_key(TaskStatus::Pending))
            .key(self.status_key(TaskStatus::Retry))
            .key(self.status_key(TaskStatus::Claimed))
            .arg(claim_ttl.as_millis().max(1) as u64)
            .arg(self.claim_key_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(id)
    }

    async fn remove_queued(&self, id: &str, priority: TaskPriority) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .lrem(self.queue_key(priority), 0, id)
            .await
            .map_err(map_redis_error)?;
        Ok(removed)
    }

    async fn queue_len(&self, priority: TaskPriority) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn
            .llen(self.queue_key(priority))
            .await
            .map_err(map_redis_error)?;
        Ok(len)
    }

    async fn move_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        blob: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let drop_claim = if from == TaskStatus::Claimed { "1" } else { "0" };
        let _: i64 = Script::new(MOVE_STATUS_SCRIPT)
            .key(self.status_key(from))
            .key(self.task_key(id))
            .key(self.status_key(to))
            .key(self.claim_key(id))
            .arg(id)
            .arg(blob)
            .arg(ttl.as_secs().max(1))
            .arg(drop_claim)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn status_members(&self, status: TaskStatus) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.status_key(status))
            .await
            .map_err(map_redis_error)?;
        Ok(ids)
    }

    async fn status_len(&self, status: TaskStatus) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn
            .scard(self.status_key(status))
            .await
            .map_err(map_redis_error)?;
        Ok(len)
    }

    async fn claim_alive(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let alive: bool = conn
            .exists(self.claim_key(id))
            .await
            .map_err(map_redis_error)?;
        Ok(alive)
    }

    async fn requeue(
        &self,
        id: &str,
        priority: TaskPriority,
        blob: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let moved: i64 = Script::new(REQUEUE_SCRIPT)
            .key(self.status_key(TaskStatus::Claimed))
            .key(self.claim_key(id))
            .key(self.task_key(id))
            .key(self.status_key(TaskStatus::Pending))
            .key(self.queue_key(priority))
            .arg(id)
            .arg(blob)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(moved == 1)
    }

    async fn drop_claimed(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .srem(self.status_key(TaskStatus::Claimed), id)
            .await
            .map_err(map_redis_error)?;
        let _: () = conn
            .del(self.claim_key(id))
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn schedule(&self, id: &str, due_epoch: f64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(self.scheduled_key(), id, due_epoch)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn take_due(&self, now_epoch: f64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = Script::new(TAKE_DUE_SCRIPT)
            .key(self.scheduled_key())
            .arg(now_epoch)
            .arg(TAKE_DUE_BATCH)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(due)
    }

    async fn unschedule(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .zrem(self.scheduled_key(), id)
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn scheduled_len(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn
            .zcard(self.scheduled_key())
            .await
            .map_err(map_redis_error)?;
        Ok(len)
    }

    async fn add_worker(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .sadd(self.workers_key(), id)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn remove_worker(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .srem(self.workers_key(), id)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn worker_members(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.workers_key())
            .await
            .map_err(map_redis_error)?;
        Ok(ids)
    }

    async fn worker_len(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn
            .scard(self.workers_key())
            .await
            .map_err(map_redis_error)?;
        Ok(len)
    }

    async fn touch_heartbeat(&self, id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.heartbeat_key(id), "1", ttl.as_secs().max(1))
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn heartbeat_alive(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let alive: bool = conn
            .exists(self.heartbeat_key(id))
            .await
            .map_err(map_redis_error)?;
        Ok(alive)
    }

    async fn delete_heartbeat(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.heartbeat_key(id))
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn publish(&self, frame: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(self.events_channel(), frame)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let mut dropped = 0u64;
        for priority in TaskPriority::DESCENDING {
            let len: u64 = conn
                .llen(self.queue_key(priority))
                .await
                .map_err(map_redis_error)?;
            dropped += len;
        }
        let mut keys: Vec<String> = TaskPriority::DESCENDING
            .iter()
            .map(|p| self.queue_key(*p))
            .collect();
        keys.extend(TaskStatus::ALL.iter().map(|s| self.status_key(*s)));
        let _: () = conn.del(keys).await.map_err(map_redis_error)?;
        Ok(dropped)
    }

    async fn close(&self) {
        self.listener.abort();
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
