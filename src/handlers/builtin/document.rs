//! Document indexing handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::TaskError;
use crate::handlers::TaskHandler;
use crate::task::{Task, TaskType};

/// Boundary to the retrieval store's ingestion side. Implementations
/// chunk and embed one document, returning how many chunks were written.
#[async_trait]
pub trait DocumentIndexer: Send + Sync {
    async fn index_document(&self, path: &str) -> Result<u64, TaskError>;
}

/// Runs a `document_index` task through the indexer.
pub struct DocumentIndexHandler {
    indexer: Arc<dyn DocumentIndexer>,
}

impl DocumentIndexHandler {
    pub fn new(indexer: Arc<dyn DocumentIndexer>) -> Self {
        Self { indexer }
    }
}

#[async_trait]
impl TaskHandler for DocumentIndexHandler {
    fn task_type(&self) -> TaskType {
        TaskType::DocumentIndex
    }

    async fn execute(&self, task: &Task) -> Result<Value, TaskError> {
        let path = task
            .payload_str("document_path")
            .ok_or_else(|| TaskError::MissingField {
                field: "document_path".to_string(),
            })?;

        let chunks = self.indexer.index_document(path).await?;
        debug!(task_id = %task.id, path = %path, chunks, "Document indexed");

        Ok(json!({
            "document_path": path,
            "indexed": true,
            "chunks": chunks,
        }))
    }
}
