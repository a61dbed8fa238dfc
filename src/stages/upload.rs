//! Upload stage: confirms the registered source file is still readable and unchanged.

use crate::pipeline::{
    PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor, content_hash,
};
use async_trait::async_trait;
use serde_json::json;

/// Verifies the source file against the document's content hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct UploadVerificationProcessor;

#[async_trait]
impl StageProcessor for UploadVerificationProcessor {
    fn stage(&self) -> Stage {
        Stage::Upload
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let path = context.source_path();
        let bytes = tokio::fs::read(path).await.map_err(|error| {
            PipelineError::Validation(format!("cannot read {}: {error}", path.display()))
        })?;
        let hash = content_hash(&bytes);
        if hash != context.document.content_hash {
            return Err(PipelineError::Validation(format!(
                "{} changed since upload (expected {}, found {hash})",
                path.display(),
                context.document.content_hash
            )));
        }
        Ok(ProcessingResult::ok(json!({
            "bytes": bytes.len(),
            "content_hash": hash,
        })))
    }
}
