//! Delayed task scheduling.
//!
//! Tasks parked here sit in a due-time index without occupying any
//! priority queue. A periodic promotion pass moves every task whose due
//! time has passed into the live queue, where workers claim it like any
//! other submission. Delayed retries land in the same index, so one loop
//! drives both.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::QueueError;
use crate::queue::TaskQueue;
use crate::task::Task;

/// Promotes due tasks into the live queue on a fixed interval.
pub struct TaskScheduler {
    queue: Arc<TaskQueue>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(queue: Arc<TaskQueue>, config: SchedulerConfig) -> Self {
        Self { queue, config }
    }

    /// Park a task until `delay` from now. Returns the task id.
    pub async fn schedule_in(&self, task: Task, delay: Duration) -> Result<String, QueueError> {
        let due_epoch = Utc::now().timestamp() as f64 + delay.as_secs_f64();
        self.park(task, due_epoch).await
    }

    /// Park a task until a wall-clock due time. A time already in the
    /// past is promoted on the next pass.
    pub async fn schedule_at(&self, task: Task, due: DateTime<Utc>) -> Result<String, QueueError> {
        self.park(task, due.timestamp() as f64).await
    }

    async fn park(&self, task: Task, due_epoch: f64) -> Result<String, QueueError> {
        self.queue.schedule_task(&task, due_epoch).await?;
        info!(task_id = %task.id, due_epoch, "Task parked until due");
        Ok(task.id)
    }

    /// Remove a parked task before it is promoted.
    pub async fn cancel(&self, id: &str) -> Result<bool, QueueError> {
        self.queue.cancel_scheduled(id).await
    }

    /// Number of tasks waiting for their due time.
    pub async fn pending_count(&self) -> Result<u64, QueueError> {
        self.queue.scheduled_count().await
    }

    /// Promote every due task into the live queue. Returns how many were
    /// promoted.
    pub async fn promote_due(&self) -> Result<u64, QueueError> {
        let ids = self.queue.take_due_tasks().await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut promoted = 0;
        for id in ids {
            let task = match self.queue.get_task(&id).await? {
                Some(task) => task,
                None => {
                    warn!(task_id = %id, "Dropping due task whose blob expired");
                    continue;
                }
            };
            match self.queue.submit(task.clone()).await {
                Ok(_) => promoted += 1,
                Err(QueueError::MissingPayloadField { .. }) => {
                    warn!(task_id = %id, "Dropping due task with invalid payload");
                }
                Err(e) => {
                    // The id already left the index, so park it again
                    // rather than lose it.
                    warn!(task_id = %id, error = %e, "Promotion failed; re-parking task");
                    let now = Utc::now().timestamp() as f64;
                    if let Err(e) = self.queue.schedule_task(&task, now).await {
                        warn!(task_id = %id, error = %e, "Re-parking failed; task dropped");
                    }
                }
            }
        }
        if promoted > 0 {
            debug!(promoted, "Promoted due tasks");
        }
        Ok(promoted)
    }

    /// Run promotion passes until the shutdown flag is set.
    pub async fn run_loop(&self, shutdown: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            "Scheduler started"
        );
        while !shutdown.load(Ordering::Relaxed) {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.promote_due().await {
                warn!(error = %e, "Promotion pass failed");
            }
        }
        info!("Scheduler stopped");
    }
}

/// Spawn the scheduler loop. Returns the join handle and the flag that
/// stops it at the next tick.
pub fn spawn(scheduler: TaskScheduler) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let handle = tokio::spawn(async move {
        scheduler.run_loop(flag).await;
    });
    (handle, shutdown)
}
