//! Error types for the task queue.

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors. Every setting has a default, so only a
/// present-but-garbled value can fail.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Backend store errors. Connection-class failures are kept apart from
/// command failures so the queue can distinguish "store is gone" from
/// "this call was wrong".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Event subscription failed: {0}")]
    Subscribe(String),
}

/// Queue-level errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is unavailable (store unreachable or disabled)")]
    Unavailable,

    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Task {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Task payload is missing required field {field} for type {task_type}")]
    MissingPayloadField { task_type: String, field: String },

    #[error("Result status {status} is not terminal")]
    NotTerminal { status: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures produced while executing a task. Handlers return these; the
/// worker folds them into retries and failed results.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Payload field {field} is missing or empty")]
    MissingField { field: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("No handler registered for task type {task_type}")]
    UnknownType { task_type: String },

    #[error("Executor failed: {0}")]
    Executor(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Webhook endpoint returned status {status}")]
    WebhookStatus { status: u16 },

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
