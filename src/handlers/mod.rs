//! Task handlers.
//!
//! A handler executes one kind of task. The worker looks handlers up in a
//! [`registry::HandlerRegistry`] by task type, and the built-ins under
//! [`builtin`] cover agent queries, batch queries, document indexing and
//! webhook delivery. Handlers that talk to systems outside this crate
//! (the agent, the retrieval store) do so through boundary traits so the
//! queue never links against them directly.

pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TaskError;
use crate::task::{Task, TaskType};

pub use builtin::agent::{AgentAnswer, AgentExecutor, AgentQueryHandler, BatchQueryHandler};
pub use builtin::document::{DocumentIndexHandler, DocumentIndexer};
pub use builtin::webhook::WebhookHandler;
pub use registry::HandlerRegistry;

/// Executes tasks of a single type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task type this handler serves.
    fn task_type(&self) -> TaskType;

    /// Run one task to completion. The returned value becomes the task's
    /// result payload; an error counts as a failed attempt and is charged
    /// against the task's retry budget.
    async fn execute(&self, task: &Task) -> Result<Value, TaskError>;
}
