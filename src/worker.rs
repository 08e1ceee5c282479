//! The worker loop.
//!
//! A worker registers itself, then claims and executes tasks until its
//! shutdown flag is set. Each claimed task runs inside its own spawned
//! task so a panicking handler fails the task, not the worker. A failed
//! attempt saves its result first and is then charged against the
//! task's retry budget; a spent budget makes the failure terminal. At
//! the heartbeat cadence the worker also performs queue maintenance,
//! sweeping stale workers and lapsed claims on behalf of the whole
//! fleet.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Result, TaskError};
use crate::handlers::HandlerRegistry;
use crate::queue::TaskQueue;
use crate::task::{Task, TaskResult, TaskStatus, TaskType};

/// Largest random addition to the idle pause, in milliseconds. Spreads
/// workers out so an idle fleet does not poll in lockstep.
const IDLE_JITTER_MS: u64 = 250;

/// Point-in-time snapshot of one worker.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub running: bool,
    /// Tasks finished with a completed result.
    pub processed: u64,
    /// Failed attempts, counting each retry separately.
    pub failed: u64,
    pub handler_types: Vec<TaskType>,
}

pub struct TaskWorker {
    queue: Arc<TaskQueue>,
    registry: HandlerRegistry,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
    running: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl TaskWorker {
    pub fn new(queue: Arc<TaskQueue>, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Flag that stops the run loop once the in-flight task finishes.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub async fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.config.worker_id.clone(),
            running: self.running.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            handler_types: self.registry.types().await,
        }
    }

    /// Register, then claim and execute tasks until shut down. Always
    /// unregisters on the way out.
    pub async fn run(&self) -> Result<()> {
        self.queue.register_worker(&self.config.worker_id).await?;
        self.running.store(true, Ordering::Relaxed);
        // Awaiting inside the macro would pin its non-Send temporaries
        // across the await and make this future unspawnable.
        let handlers = self.registry.count().await;
        info!(
            worker_id = %self.config.worker_id,
            handlers,
            "Worker started"
        );

        let mut last_maintenance = Instant::now();
        while !self.shutdown.load(Ordering::Relaxed) {
            if last_maintenance.elapsed() >= self.config.heartbeat_interval {
                self.maintenance().await;
                last_maintenance = Instant::now();
            }
            match self.queue.claim_next(&self.config.worker_id).await {
                Ok(Some(task)) => self.process(task).await,
                Ok(None) => self.idle_pause().await,
                Err(e) => {
                    warn!(worker_id = %self.config.worker_id, error = %e, "Claim failed");
                    self.idle_pause().await;
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        self.queue.unregister_worker(&self.config.worker_id).await?;
        info!(
            worker_id = %self.config.worker_id,
            processed = self.processed.load(Ordering::Relaxed),
            failed = self.failed.load(Ordering::Relaxed),
            "Worker stopped"
        );
        Ok(())
    }

    /// Heartbeat plus fleet-wide sweeps. Failures are logged and the
    /// loop carries on; the next cadence retries them.
    async fn maintenance(&self) {
        if let Err(e) = self.queue.heartbeat(&self.config.worker_id).await {
            warn!(worker_id = %self.config.worker_id, error = %e, "Heartbeat failed");
        }
        if let Err(e) = self.queue.cleanup_stale_workers().await {
            warn!(error = %e, "Stale worker sweep failed");
        }
        if let Err(e) = self.queue.requeue_lost_claims().await {
            warn!(error = %e, "Lost claim sweep failed");
        }
    }

    async fn process(&self, task: Task) {
        let task_id = task.id.clone();
        debug!(task_id = %task_id, task_type = %task.task_type, "Processing task");

        let running = match self
            .queue
            .transition(&task_id, TaskStatus::Running, Some(&self.config.worker_id))
            .await
        {
            Ok(task) => task,
            Err(e) => {
                // Usually the claim sweep re-queued it first; another
                // worker will pick it up.
                warn!(task_id = %task_id, error = %e, "Could not start claimed task");
                return;
            }
        };

        let started = Instant::now();
        let outcome = self.execute_guarded(running).await;
        let duration = started.elapsed().as_secs_f64();

        match outcome {
            Ok(value) => {
                let result = TaskResult::success(&task_id, value)
                    .with_duration(duration)
                    .with_worker(&self.config.worker_id);
                if let Err(e) = self.queue.save_result(result).await {
                    error!(task_id = %task_id, error = %e, "Result could not be saved");
                    return;
                }
                self.processed.fetch_add(1, Ordering::Relaxed);
                info!(task_id = %task_id, duration_secs = duration, "Task completed");
            }
            Err(task_error) => self.record_failure(&task_id, task_error, duration).await,
        }
    }

    /// Run the task's handler inside its own spawned task so a panic is
    /// contained and surfaces as a failed attempt.
    async fn execute_guarded(&self, task: Task) -> std::result::Result<Value, TaskError> {
        let Some(handler) = self.registry.get(task.task_type).await else {
            return Err(TaskError::UnknownType {
                task_type: task.task_type.to_string(),
            });
        };
        let join = tokio::spawn(async move { handler.execute(&task).await });
        match join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let panic = e.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(TaskError::Panicked(message))
            }
            Err(_) => Err(TaskError::Panicked("handler task was cancelled".to_string())),
        }
    }

    /// Save the attempt's failed result, then charge it against the
    /// retry budget. A task still within budget goes back to the queue;
    /// a spent budget makes the failure terminal.
    async fn record_failure(&self, task_id: &str, task_error: TaskError, duration: f64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(task_id = %task_id, error = %task_error, "Task attempt failed");

        // The attempt's result lands before the retry decision, so callers
        // polling during a retry window see the latest error.
        let result = TaskResult::failure(task_id, task_error.to_string())
            .with_duration(duration)
            .with_worker(&self.config.worker_id);
        if let Err(e) = self.queue.save_attempt_result(&result).await {
            error!(task_id = %task_id, error = %e, "Attempt result could not be saved");
        }

        let retried = match self.queue.retry(task_id).await {
            Ok(retried) => retried,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Retry bookkeeping failed");
                return;
            }
        };
        if retried {
            return;
        }

        if let Err(e) = self.queue.save_result(result).await {
            error!(task_id = %task_id, error = %e, "Failed result could not be saved");
        }
    }

    async fn idle_pause(&self) {
        let jitter = rand::thread_rng().gen_range(0..=IDLE_JITTER_MS);
        tokio::time::sleep(self.config.idle_sleep + Duration::from_millis(jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::handlers::TaskHandler;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{Map, json};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const RESULT_WAIT: Duration = Duration::from_secs(5);

    /// Handler that succeeds with an echo, or always fails.
    struct FixedHandler {
        fail: bool,
    }

    #[async_trait]
    impl TaskHandler for FixedHandler {
        fn task_type(&self) -> TaskType {
            TaskType::Scheduled
        }

        async fn execute(&self, task: &Task) -> std::result::Result<Value, TaskError> {
            if self.fail {
                Err(TaskError::Executor("wired to fail".to_string()))
            } else {
                Ok(json!({ "echo": task.id }))
            }
        }
    }

    struct PanickyHandler;

    #[async_trait]
    impl TaskHandler for PanickyHandler {
        fn task_type(&self) -> TaskType {
            TaskType::Scheduled
        }

        async fn execute(&self, _task: &Task) -> std::result::Result<Value, TaskError> {
            panic!("boom");
        }
    }

    fn test_queue() -> Arc<TaskQueue> {
        let config = QueueConfig {
            claim_timeout: Duration::from_millis(50),
            ..QueueConfig::default()
        };
        Arc::new(TaskQueue::new(Arc::new(MemoryStore::new()), config))
    }

    async fn test_worker(
        queue: Arc<TaskQueue>,
        handler: Option<Arc<dyn TaskHandler>>,
    ) -> Arc<TaskWorker> {
        let registry = HandlerRegistry::new();
        if let Some(handler) = handler {
            registry.register(handler).await;
        }
        let config = WorkerConfig {
            worker_id: "w-test".to_string(),
            idle_sleep: Duration::from_millis(10),
            ..WorkerConfig::default()
        };
        Arc::new(TaskWorker::new(queue, registry, config))
    }

    fn start(worker: Arc<TaskWorker>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { worker.run().await })
    }

    async fn wait_for_result(queue: &TaskQueue, id: &str) -> TaskResult {
        timeout(RESULT_WAIT, async {
            loop {
                if let Some(result) = queue.get_result(id).await.unwrap() {
                    return result;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no result before timeout")
    }

    async fn wait_for_task<F>(queue: &TaskQueue, id: &str, accept: F) -> Task
    where
        F: Fn(&Task) -> bool,
    {
        timeout(RESULT_WAIT, async {
            loop {
                if let Some(task) = queue.get_task(id).await.unwrap() {
                    if accept(&task) {
                        return task;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task never reached the expected state")
    }

    fn bare_task() -> Task {
        Task::new(TaskType::Scheduled, Map::new())
    }

    #[tokio::test]
    async fn processes_task_to_completed_result() {
        let queue = test_queue();
        let worker = test_worker(queue.clone(), Some(Arc::new(FixedHandler { fail: false }))).await;
        let shutdown = worker.shutdown_signal();
        let handle = start(worker.clone());

        let id = queue.submit(bare_task()).await.unwrap();
        let result = wait_for_result(&queue, &id).await;

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.result, Some(json!({ "echo": id })));
        assert_eq!(result.worker_id.as_deref(), Some("w-test"));
        assert!(result.duration.is_some());

        let task = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.worker_id.as_deref(), Some("w-test"));

        shutdown.store(true, Ordering::Relaxed);
        timeout(RESULT_WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(worker.status().await.processed, 1);
    }

    #[tokio::test]
    async fn unknown_task_type_fails_the_task() {
        let queue = test_queue();
        let worker = test_worker(queue.clone(), None).await;
        let shutdown = worker.shutdown_signal();
        let handle = start(worker);

        let id = queue.submit(bare_task().with_max_retries(0)).await.unwrap();
        let result = wait_for_result(&queue, &id).await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("No handler registered"));

        shutdown.store(true, Ordering::Relaxed);
        timeout(RESULT_WAIT, handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_task_not_the_worker() {
        let queue = test_queue();
        let worker = test_worker(queue.clone(), Some(Arc::new(PanickyHandler))).await;
        let shutdown = worker.shutdown_signal();
        let handle = start(worker.clone());

        let id = queue.submit(bare_task().with_max_retries(0)).await.unwrap();
        let result = wait_for_result(&queue, &id).await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("boom"));

        // The worker survives and keeps serving.
        let second = queue.submit(bare_task().with_max_retries(0)).await.unwrap();
        let second_result = wait_for_result(&queue, &second).await;
        assert_eq!(second_result.status, TaskStatus::Failed);

        shutdown.store(true, Ordering::Relaxed);
        timeout(RESULT_WAIT, handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn failing_task_walks_the_retry_ladder() {
        let queue = test_queue();
        let worker = test_worker(queue.clone(), Some(Arc::new(FixedHandler { fail: true }))).await;
        let shutdown = worker.shutdown_signal();
        let handle = start(worker.clone());

        let id = queue
            .submit(
                bare_task()
                    .with_max_retries(1)
                    .with_retry_delay(Duration::ZERO),
            )
            .await
            .unwrap();

        // Wait until the terminal failure has been folded into the task.
        let task = wait_for_task(&queue, &id, |t| {
            t.status == TaskStatus::Failed && t.error.is_some()
        })
        .await;
        assert_eq!(task.retry_count, 1);
        assert!(task.error.as_deref().unwrap().contains("wired to fail"));

        let result = wait_for_result(&queue, &id).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("wired to fail"));

        shutdown.store(true, Ordering::Relaxed);
        timeout(RESULT_WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(worker.status().await.failed, 2);
        assert_eq!(worker.status().await.processed, 0);
    }

    #[tokio::test]
    async fn failed_attempt_result_is_readable_during_the_retry_window() {
        let queue = test_queue();
        let worker = test_worker(queue.clone(), Some(Arc::new(FixedHandler { fail: true }))).await;
        let shutdown = worker.shutdown_signal();
        let handle = start(worker);

        // A long retry delay parks the task after its first attempt.
        let id = queue
            .submit(
                bare_task()
                    .with_max_retries(1)
                    .with_retry_delay(Duration::from_secs(300)),
            )
            .await
            .unwrap();

        let result = wait_for_result(&queue, &id).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("wired to fail"));
        assert_eq!(result.worker_id.as_deref(), Some("w-test"));

        // The task itself is waiting on another attempt, not terminal.
        let task = wait_for_task(&queue, &id, |t| t.status == TaskStatus::Retry).await;
        assert_eq!(task.retry_count, 1);

        shutdown.store(true, Ordering::Relaxed);
        timeout(RESULT_WAIT, handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_unregisters_the_worker() {
        let queue = test_queue();
        let worker = test_worker(queue.clone(), Some(Arc::new(FixedHandler { fail: false }))).await;
        let shutdown = worker.shutdown_signal();
        let handle = start(worker.clone());

        timeout(RESULT_WAIT, async {
            while !queue
                .active_workers()
                .await
                .unwrap()
                .contains(&"w-test".to_string())
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker never registered");
        assert!(worker.status().await.running);

        shutdown.store(true, Ordering::Relaxed);
        timeout(RESULT_WAIT, handle).await.unwrap().unwrap().unwrap();

        assert!(!worker.status().await.running);
        assert!(queue.active_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_reports_handler_types() {
        let queue = test_queue();
        let worker = test_worker(queue, Some(Arc::new(FixedHandler { fail: false }))).await;

        let status = worker.status().await;
        assert_eq!(status.worker_id, "w-test");
        assert!(!status.running);
        assert_eq!(status.handler_types, vec![TaskType::Scheduled]);
    }

    #[tokio::test]
    async fn run_future_is_send() {
        // tokio::spawn requires Send; holding a non-Send temporary across
        // an await inside run() would break every embedding that spawns
        // the worker loop.
        fn require_send<T: Send>(_: T) {}
        let worker = test_worker(test_queue(), None).await;
        require_send(worker.run());
    }
}
