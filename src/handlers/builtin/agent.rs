//! Handlers that route queries through the conversational agent.
//!
//! The agent itself lives outside this crate; these handlers reach it
//! through the [`AgentExecutor`] boundary trait. `agent_query` runs one
//! query, `batch_query` runs a list of them sequentially and reports
//! per-item outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::handlers::TaskHandler;
use crate::task::{Task, TaskType};

/// Answer produced by the agent for a single query.
#[derive(Debug, Clone)]
pub struct AgentAnswer {
    pub answer: String,
    pub tools_used: Vec<String>,
    pub execution_time: f64,
}

/// Boundary to the conversational agent. Implementations run one query
/// end to end, optionally scoped to an existing session and thread.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run_query(
        &self,
        query: &str,
        session_id: Option<&str>,
        thread_id: Option<&str>,
    ) -> Result<AgentAnswer, TaskError>;
}

/// Runs a single `agent_query` task through the executor.
pub struct AgentQueryHandler {
    executor: Arc<dyn AgentExecutor>,
}

impl AgentQueryHandler {
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TaskHandler for AgentQueryHandler {
    fn task_type(&self) -> TaskType {
        TaskType::AgentQuery
    }

    async fn execute(&self, task: &Task) -> Result<Value, TaskError> {
        let query = task.payload_str("query").ok_or_else(|| TaskError::MissingField {
            field: "query".to_string(),
        })?;
        let thread_id = task.payload_str("thread_id");
        // Session-less tasks get the task id as their session scope.
        let session = task.session_id.as_deref().unwrap_or(&task.id);

        let answer = self
            .executor
            .run_query(query, Some(session), thread_id)
            .await?;
        debug!(
            task_id = %task.id,
            tools = answer.tools_used.len(),
            "Agent query answered"
        );

        Ok(json!({
            "query": query,
            "answer": answer.answer,
            "tools_used": answer.tools_used,
            "execution_time": answer.execution_time,
        }))
    }
}

/// Runs a `batch_query` task: every query goes through the executor in
/// order, and a failed item is recorded in the batch report instead of
/// aborting the rest.
pub struct BatchQueryHandler {
    executor: Arc<dyn AgentExecutor>,
}

impl BatchQueryHandler {
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TaskHandler for BatchQueryHandler {
    fn task_type(&self) -> TaskType {
        TaskType::BatchQuery
    }

    async fn execute(&self, task: &Task) -> Result<Value, TaskError> {
        let entries = match task.payload.get("queries") {
            Some(Value::Array(entries)) => entries,
            Some(_) => {
                return Err(TaskError::InvalidPayload(
                    "queries must be an array".to_string(),
                ));
            }
            None => {
                return Err(TaskError::MissingField {
                    field: "queries".to_string(),
                });
            }
        };

        // Session-less tasks get the task id as their session scope.
        let session = task.session_id.as_deref().unwrap_or(&task.id);
        let mut results = Vec::with_capacity(entries.len());
        let mut successful = 0usize;
        for (index, entry) in entries.iter().enumerate() {
            let Some(query) = entry.as_str() else {
                results.push(json!({
                    "index": index,
                    "error": "query must be a string",
                }));
                continue;
            };
            match self.executor.run_query(query, Some(session), None).await {
                Ok(answer) => {
                    successful += 1;
                    results.push(json!({
                        "index": index,
                        "query": query,
                        "answer": answer.answer,
                    }));
                }
                Err(e) => {
                    warn!(task_id = %task.id, index, error = %e, "Batch item failed");
                    results.push(json!({
                        "index": index,
                        "query": query,
                        "error": e.to_string(),
                    }));
                }
            }
        }

        let failed = entries.len() - successful;
        Ok(json!({
            "total": entries.len(),
            "successful": successful,
            "failed": failed,
            "results": results,
        }))
    }
}
