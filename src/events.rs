//! Queue event envelopes published over the shared event channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::task::{Task, TaskResult, TaskStatus};

/// Buffered frames per event subscriber before laggards start dropping.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Kind of queue event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A task entered its priority queue.
    #[serde(rename = "task.submitted")]
    TaskSubmitted,
    /// A task moved between statuses.
    #[serde(rename = "task.status_changed")]
    TaskStatusChanged,
    /// A task finished and its result was stored.
    #[serde(rename = "task.completed")]
    TaskCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskSubmitted => "task.submitted",
            Self::TaskStatusChanged => "task.status_changed",
            Self::TaskCompleted => "task.completed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Envelope for every published event. Consumers that do not recognize a
/// `data` shape can still route on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl QueueEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn submitted(task: &Task) -> Self {
        Self::new(
            EventKind::TaskSubmitted,
            json!({
                "task_id": task.id,
                "task_type": task.task_type,
                "priority": task.priority,
            }),
        )
    }

    pub fn status_changed(
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        worker_id: Option<&str>,
    ) -> Self {
        Self::new(
            EventKind::TaskStatusChanged,
            json!({
                "task_id": task_id,
                "from": from,
                "to": to,
                "worker_id": worker_id,
            }),
        )
    }

    pub fn completed(result: &TaskResult) -> Self {
        Self::new(
            EventKind::TaskCompleted,
            json!({
                "task_id": result.task_id,
                "status": result.status,
                "duration": result.duration,
            }),
        )
    }

    /// Serialize for the wire.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
