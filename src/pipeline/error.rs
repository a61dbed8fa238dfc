//! Errors raised by stage processors and orchestration.

use crate::embedding::EmbeddingClientError;
use crate::extraction::ExtractionError;
use crate::store::{DocumentId, ErrorKind, StoreError};
use thiserror::Error;

/// Errors raised by the orchestrator and stage processors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unknown stage name or missing processor; surfaced to the caller immediately.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Embedding or extraction service failed or timed out.
    #[error("upstream service error: {0}")]
    UpstreamService(String),
    /// Persistence layer failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Stage produced malformed or insufficient output.
    #[error("validation error: {0}")]
    Validation(String),
    /// Some items of a stage failed while others succeeded.
    #[error("partial failure: {failed} of {total} items failed")]
    PartialFailure {
        /// Items that failed.
        failed: usize,
        /// Items attempted.
        total: usize,
    },
    /// Another run already owns the document.
    #[error("document {0} is already being processed")]
    DocumentBusy(DocumentId),
}

impl PipelineError {
    /// Error class recorded in the pipeline error log.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::UpstreamService(_) => ErrorKind::UpstreamService,
            Self::Store(_) => ErrorKind::Store,
            Self::Validation(_) | Self::DocumentBusy(_) => ErrorKind::Validation,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
        }
    }

    /// Shorthand for a document lookup that came back empty.
    pub(crate) fn missing_document(document_id: DocumentId) -> Self {
        Self::Store(StoreError::not_found("document", document_id))
    }
}

impl From<EmbeddingClientError> for PipelineError {
    fn from(error: EmbeddingClientError) -> Self {
        Self::UpstreamService(error.to_string())
    }
}

impl From<ExtractionError> for PipelineError {
    fn from(error: ExtractionError) -> Self {
        match error {
            ExtractionError::Failed(_) => Self::Validation(error.to_string()),
            _ => Self::UpstreamService(error.to_string()),
        }
    }
}
