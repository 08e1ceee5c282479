use std::sync::Arc;
use std::sync::atomic::Ordering;

use agent_queue::config::{QueueConfig, SchedulerConfig, WorkerConfig};
use agent_queue::handlers::{HandlerRegistry, WebhookHandler};
use agent_queue::queue::TaskQueue;
use agent_queue::scheduler::{self, TaskScheduler};
use agent_queue::worker::TaskWorker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let queue_config = QueueConfig::from_env()?;
    let worker_config = WorkerConfig::from_env();
    let scheduler_config = SchedulerConfig::from_env()?;

    eprintln!("📋 Agent Queue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Store: {}", queue_config.redis_url);
    eprintln!("   Namespace: {}", queue_config.namespace);
    eprintln!("   Worker: {}", worker_config.worker_id);
    eprintln!(
        "   Scheduler: every {}s",
        scheduler_config.check_interval.as_secs()
    );

    // ── Queue ────────────────────────────────────────────────────────────
    let queue = Arc::new(TaskQueue::connect(queue_config).await);
    if queue.ping().await {
        eprintln!("   Queue: reachable");
    } else {
        // Fail-safe mode: the process stays up and idles until the
        // store comes back or an operator restarts it.
        eprintln!("   Queue: UNREACHABLE (accepting no work)");
    }

    // ── Handlers ─────────────────────────────────────────────────────────
    // Only self-contained handlers are wired here. Agent and document
    // handlers need executors from the host application, which embeds
    // this crate as a library and builds its own worker.
    let registry = HandlerRegistry::new();
    registry.register(Arc::new(WebhookHandler::new())).await;
    let handlers = registry.count().await;
    eprintln!("   Handlers: {} registered", handlers);

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = TaskScheduler::new(Arc::clone(&queue), scheduler_config);
    let (scheduler_handle, scheduler_shutdown) = scheduler::spawn(scheduler);

    // ── Worker ───────────────────────────────────────────────────────────
    let worker = Arc::new(TaskWorker::new(
        Arc::clone(&queue),
        registry,
        worker_config,
    ));

    let worker_shutdown = worker.shutdown_signal();
    let scheduler_flag = Arc::clone(&scheduler_shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nShutting down after the task in flight...");
            worker_shutdown.store(true, Ordering::Relaxed);
            scheduler_flag.store(true, Ordering::Relaxed);
        }
    });
    eprintln!("   Press Ctrl-C to stop.\n");

    worker.run().await?;

    scheduler_shutdown.store(true, Ordering::Relaxed);
    scheduler_handle.abort();
    queue.close().await;

    Ok(())
}
