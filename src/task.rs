//! Task model: priorities, the status state machine, task records, results
//! and queue statistics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::QueueError;

/// Priority of a queued task. Each priority has its own queue; claims always
/// drain higher priorities first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background work, claimed only when nothing else is queued.
    Low,
    /// Default for interactive work.
    #[default]
    Normal,
    /// Claimed before normal traffic.
    High,
    /// Claimed before everything else.
    Urgent,
}

impl TaskPriority {
    /// All priorities, highest first. Claim scans walk this order.
    pub const DESCENDING: [TaskPriority; 4] =
        [Self::Urgent, Self::High, Self::Normal, Self::Low];

    /// Name used in queue keys and serialized blobs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting for a worker.
    #[default]
    Pending,
    /// Popped from a queue but not yet running. Short-lived; a claim that
    /// never reaches `Running` is re-queued once its marker lapses.
    Claimed,
    /// Being processed by a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully with the retry budget spent.
    Failed,
    /// Removed from its queue before any worker claimed it.
    Cancelled,
    /// Waiting to be re-queued for another attempt.
    Retry,
}

impl TaskStatus {
    /// Every status, in declaration order. Statistics and sweeps iterate this.
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Claimed,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Retry,
    ];

    /// Check if this status allows transitioning to another status.
    /// Transitioning to the current status is treated as a no-op elsewhere,
    /// not as a legal move here.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Claimed) | (Pending, Cancelled) |
            // From Claimed (back to Pending when a claim marker lapses)
            (Claimed, Running) | (Claimed, Pending) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, Retry) |
            // From Retry (re-queued directly or promoted by the scheduler)
            (Retry, Pending)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Name used in status-set keys and serialized blobs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retry => "retry",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of work a task carries. Dispatch is type-directed: workers look up
/// the handler registered for the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// A natural-language query for the agent executor.
    AgentQuery,
    /// Index a document into the retrieval store.
    DocumentIndex,
    /// A batch of agent queries processed sequentially.
    BatchQuery,
    /// Work created by the scheduler rather than a user.
    Scheduled,
    /// Deliver a payload to an HTTP callback.
    Webhook,
}

impl TaskType {
    /// Payload field that must be present and non-empty for this type.
    pub fn required_payload_field(&self) -> Option<&'static str> {
        match self {
            Self::AgentQuery => Some("query"),
            Self::DocumentIndex => Some("document_path"),
            Self::BatchQuery => Some("queries"),
            Self::Webhook => Some("url"),
            Self::Scheduled => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentQuery => "agent_query",
            Self::DocumentIndex => "document_index",
            Self::BatchQuery => "batch_query",
            Self::Scheduled => "scheduled",
            Self::Webhook => "webhook",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    60
}

/// A unit of work queued for asynchronous execution.
///
/// Stored as a JSON blob with a 24 hour TTL; fields absent in older blobs
/// deserialize to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id (UUID v4).
    pub id: String,
    /// What kind of work this is.
    pub task_type: TaskType,
    /// Free-form payload. Required fields depend on the type.
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub status: TaskStatus,
    /// How many retry attempts are allowed after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Attempts consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Delay before a retry attempt re-enters its queue. Zero retries
    /// immediately; anything else routes through the scheduler.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker that claimed this task, once one has.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Result value, folded in when the task completes.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error string, folded in when the task fails.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(task_type: TaskType, payload: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            payload,
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            max_retries: default_max_retries(),
            retry_count: 0,
            retry_delay_secs: default_retry_delay_secs(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            result: None,
            error: None,
            user_id: None,
            session_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_secs = delay.as_secs();
        self
    }

    /// Delay before a retry re-enters its queue.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Whether another retry attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Fetch a string payload field.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Wall-clock execution time in seconds, when both timestamps are known.
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some(end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Check that the type's required payload field is present and non-empty.
    /// Invalid tasks are rejected at submission and never enqueued.
    pub fn validate(&self) -> Result<(), QueueError> {
        let Some(field) = self.task_type.required_payload_field() else {
            return Ok(());
        };
        let present = match self.payload.get(field) {
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        };
        if present {
            Ok(())
        } else {
            Err(QueueError::MissingPayloadField {
                task_type: self.task_type.to_string(),
                field: field.to_string(),
            })
        }
    }
}

/// Outcome record for one task attempt. Stored separately from the task
/// blob with a shorter TTL so results stay readable after quick task
/// churn; a retried task overwrites it on each attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    /// Terminal status the attempt finished with.
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock execution time in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub worker_id: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// Build a completed result.
    pub fn success(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            duration: None,
            worker_id: None,
            completed_at: Utc::now(),
        }
    }

    /// Build a failed result.
    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
            duration: None,
            worker_id: None,
            completed_at: Utc::now(),
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

/// Point-in-time snapshot of queue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub claimed: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retrying: u64,
    /// Sum of every status count.
    pub total: u64,
    /// Workers currently in the registered set.
    pub active_workers: u64,
    /// completed / (completed + failed), 0.0 when nothing has finished.
    pub success_rate: f64,
    pub timestamp: DateTime<Utc>,
}

impl QueueStats {
    /// An all-zero snapshot, also what an unavailable queue reports.
    pub fn empty() -> Self {
        Self {
            pending: 0,
            claimed: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            retrying: 0,
            total: 0,
            active_workers: 0,
            success_rate: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn compute_success_rate(completed: u64, failed: u64) -> f64 {
        let finished = completed + failed;
        if finished == 0 {
            0.0
        } else {
            completed as f64 / finished as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn status_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Claimed));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Claimed.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Claimed.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Retry));
        assert!(TaskStatus::Retry.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Claimed));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Claimed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Urgent);
        assert_eq!(TaskPriority::DESCENDING[0], TaskPriority::Urgent);
        assert_eq!(TaskPriority::DESCENDING[3], TaskPriority::Low);
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&TaskStatus::Retry).unwrap();
        assert_eq!(json, "\"retry\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Retry);
        assert_eq!(TaskStatus::Claimed.to_string(), "claimed");
    }

    #[test]
    fn task_type_required_fields() {
        assert_eq!(
            TaskType::AgentQuery.required_payload_field(),
            Some("query")
        );
        assert_eq!(
            TaskType::DocumentIndex.required_payload_field(),
            Some("document_path")
        );
        assert_eq!(
            TaskType::BatchQuery.required_payload_field(),
            Some("queries")
        );
        assert_eq!(TaskType::Webhook.required_payload_field(), Some("url"));
        assert_eq!(TaskType::Scheduled.required_payload_field(), None);
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new(TaskType::AgentQuery, payload(&[("query", json!("hi"))]));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.retry_delay_secs, 60);
        assert!(task.started_at.is_none());
        assert!(task.worker_id.is_none());
    }

    #[test]
    fn validate_rejects_missing_field() {
        let task = Task::new(TaskType::AgentQuery, Map::new());
        assert!(matches!(
            task.validate(),
            Err(QueueError::MissingPayloadField { .. })
        ));

        let blank = Task::new(TaskType::AgentQuery, payload(&[("query", json!("   "))]));
        assert!(blank.validate().is_err());

        let empty_batch = Task::new(TaskType::BatchQuery, payload(&[("queries", json!([]))]));
        assert!(empty_batch.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_payloads() {
        let task = Task::new(TaskType::AgentQuery, payload(&[("query", json!("hi"))]));
        assert!(task.validate().is_ok());

        let batch = Task::new(
            TaskType::BatchQuery,
            payload(&[("queries", json!(["a", "b"]))]),
        );
        assert!(batch.validate().is_ok());

        let scheduled = Task::new(TaskType::Scheduled, Map::new());
        assert!(scheduled.validate().is_ok());
    }

    #[test]
    fn retry_budget() {
        let mut task = Task::new(TaskType::Scheduled, Map::new()).with_max_retries(2);
        assert!(task.can_retry());
        task.retry_count = 2;
        assert!(!task.can_retry());
    }

    #[test]
    fn task_duration() {
        let mut task = Task::new(TaskType::Scheduled, Map::new());
        assert_eq!(task.duration(), None);
        let start = Utc::now();
        task.started_at = Some(start);
        task.completed_at = Some(start + chrono::Duration::milliseconds(1500));
        assert_eq!(task.duration(), Some(1.5));
    }

    #[test]
    fn task_blob_roundtrip_ignores_unknown_fields() {
        let task = Task::new(TaskType::Webhook, payload(&[("url", json!("http://x"))]))
            .with_priority(TaskPriority::High)
            .with_session("sess-1");
        let mut blob: Value = serde_json::from_str(&serde_json::to_string(&task).unwrap()).unwrap();
        blob["some_future_field"] = json!(42);
        let parsed: Task = serde_json::from_value(blob).unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.priority, TaskPriority::High);
        assert_eq!(parsed.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn success_rate_derivation() {
        assert_eq!(QueueStats::compute_success_rate(0, 0), 0.0);
        assert_eq!(QueueStats::compute_success_rate(3, 1), 0.75);
        assert_eq!(QueueStats::compute_success_rate(0, 5), 0.0);
        assert_eq!(QueueStats::compute_success_rate(5, 0), 1.0);
    }

    #[test]
    fn result_builders() {
        let ok = TaskResult::success("t-1", json!({"answer": 42}))
            .with_duration(0.25)
            .with_worker("worker-abc");
        assert_eq!(ok.status, TaskStatus::Completed);
        assert_eq!(ok.duration, Some(0.25));
        assert_eq!(ok.worker_id.as_deref(), Some("worker-abc"));

        let err = TaskResult::failure("t-2", "boom");
        assert_eq!(err.status, TaskStatus::Failed);
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert!(err.result.is_none());
    }
}
