//! Processor contract shared by every stage: input context, result shape and the registry.

use super::error::PipelineError;
use super::stage::Stage;
use crate::store::{Document, DocumentId, ErrorKind};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Input handed to a stage processor.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    /// Document snapshot taken before the stage ran.
    pub document: Document,
    /// Output data of stages that already ran in the same call.
    pub prior_outputs: BTreeMap<Stage, Value>,
    /// Set when re-running a stage whose previous output was judged bad; processors discard
    /// their previous output instead of topping it up.
    pub reprocess: bool,
}

impl ProcessingContext {
    /// Build a context for a fresh run.
    pub fn new(document: Document) -> Self {
        Self {
            document,
            prior_outputs: BTreeMap::new(),
            reprocess: false,
        }
    }

    /// Identifier of the document being processed.
    pub fn document_id(&self) -> DocumentId {
        self.document.id
    }

    /// Location of the uploaded source file.
    pub fn source_path(&self) -> &Path {
        Path::new(&self.document.source_path)
    }
}

/// Outcome reported by a stage processor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingResult {
    /// Whether the stage produced usable output.
    pub success: bool,
    /// Stage-specific output summary.
    pub data: Value,
    /// Failure description, or the partial-failure summary.
    pub message: Option<String>,
    /// Error class when the stage failed or partially failed.
    pub error_kind: Option<ErrorKind>,
    /// Some items failed while the rest were persisted.
    pub partial_success: bool,
    /// Identifiers of the items that failed.
    pub failed_items: Vec<String>,
}

impl ProcessingResult {
    /// Fully successful result.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            message: None,
            error_kind: None,
            partial_success: false,
            failed_items: Vec::new(),
        }
    }

    /// Failed result with an error class.
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            message: Some(message.into()),
            error_kind: Some(kind),
            partial_success: false,
            failed_items: Vec::new(),
        }
    }

    /// Successful result where `failed_items` out of `total` could not be processed.
    pub fn partial(data: Value, failed_items: Vec<String>, total: usize) -> Self {
        let error = PipelineError::PartialFailure {
            failed: failed_items.len(),
            total,
        };
        Self {
            success: true,
            data,
            message: Some(error.to_string()),
            error_kind: Some(error.kind()),
            partial_success: true,
            failed_items,
        }
    }

    /// Failed result derived from a processor error.
    pub fn from_error(error: &PipelineError) -> Self {
        Self::failed(error.kind(), error.to_string())
    }
}

/// A unit of document processing.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Stage this processor implements.
    fn stage(&self) -> Stage;

    /// Run the stage for one document.
    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError>;
}

/// Explicitly constructed mapping from stage to processor.
#[derive(Clone, Default)]
pub struct StageRegistry {
    processors: BTreeMap<Stage, Arc<dyn StageProcessor>>,
}

impl StageRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor under its own stage, replacing any previous one.
    pub fn register(&mut self, processor: Arc<dyn StageProcessor>) -> &mut Self {
        self.processors.insert(processor.stage(), processor);
        self
    }

    /// Processor for a stage, if registered.
    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageProcessor>> {
        self.processors.get(&stage).cloned()
    }

    /// Registered stages in fixed pipeline order.
    pub fn stages(&self) -> Vec<Stage> {
        self.processors.keys().copied().collect()
    }

    /// Whether a processor is registered for `stage`.
    pub fn contains(&self, stage: Stage) -> bool {
        self.processors.contains_key(&stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop(Stage);

    #[async_trait]
    impl StageProcessor for Noop {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn process(
            &self,
            _context: &ProcessingContext,
        ) -> Result<ProcessingResult, PipelineError> {
            Ok(ProcessingResult::ok(json!({})))
        }
    }

    #[test]
    fn registry_lists_stages_in_pipeline_order() {
        let mut registry = StageRegistry::new();
        registry
            .register(Arc::new(Noop(Stage::Embedding)))
            .register(Arc::new(Noop(Stage::Upload)))
            .register(Arc::new(Noop(Stage::ChunkPrep)));
        assert_eq!(
            registry.stages(),
            vec![Stage::Upload, Stage::ChunkPrep, Stage::Embedding]
        );
        assert!(registry.get(Stage::Storage).is_none());
    }

    #[test]
    fn partial_result_is_successful_with_failure_kind() {
        let result = ProcessingResult::partial(json!({"embedded": 8}), vec!["7".into(), "8".into()], 10);
        assert!(result.success);
        assert!(result.partial_success);
        assert_eq!(result.error_kind, Some(ErrorKind::PartialFailure));
        assert_eq!(result.message.as_deref(), Some("partial failure: 2 of 10 items failed"));
    }
}
