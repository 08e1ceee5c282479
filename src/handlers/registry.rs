//! Handler registry: maps task types to their executors.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::handlers::TaskHandler;
use crate::task::TaskType;

/// Holds every registered [`TaskHandler`], keyed by the task type it
/// serves. Workers share one registry; registration normally happens once
/// at startup.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under its own task type. Registering a second
    /// handler for the same type replaces the first.
    pub async fn register(&self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type();
        let mut handlers = self.handlers.write().await;
        if handlers.insert(task_type, handler).is_some() {
            warn!(task_type = %task_type, "Replacing existing handler");
        } else {
            debug!(task_type = %task_type, "Handler registered");
        }
    }

    /// Look up the handler for a task type.
    pub async fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(&task_type).cloned()
    }

    /// Whether a handler is registered for this task type.
    pub async fn has(&self, task_type: TaskType) -> bool {
        self.handlers.read().await.contains_key(&task_type)
    }

    /// Task types with a registered handler.
    pub async fn types(&self) -> Vec<TaskType> {
        self.handlers.read().await.keys().copied().collect()
    }

    /// Number of registered handlers.
    pub async fn count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
