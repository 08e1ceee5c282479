//! Webhook delivery handler.
//!
//! POSTs a task's JSON body to the URL named in its payload. Non-2xx
//! responses and transport errors both fail the attempt, so delivery is
//! retried on the task's own retry budget.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::TaskError;
use crate::handlers::TaskHandler;
use crate::task::{Task, TaskType};

/// Upper bound on one delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WebhookHandler {
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for WebhookHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Webhook
    }

    async fn execute(&self, task: &Task) -> Result<Value, TaskError> {
        let url = task.payload_str("url").ok_or_else(|| TaskError::MissingField {
            field: "url".to_string(),
        })?;
        let body = task.payload.get("body").cloned().unwrap_or(Value::Null);

        let response = self
            .client
            .post(url)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| TaskError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TaskError::WebhookStatus {
                status: status.as_u16(),
            });
        }
        debug!(task_id = %task.id, url = %url, status = status.as_u16(), "Webhook delivered");

        Ok(json!({
            "url": url,
            "status": status.as_u16(),
        }))
    }
}
