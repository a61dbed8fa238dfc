//! Metadata extraction: error codes mentioned in chunks become `error_code` artifacts.

use super::{load_chunks, replace_artifacts};
use crate::pipeline::{PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor};
use crate::store::{ArtifactKind, NewArtifact, Store};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

const METHOD: &str = "pattern";

static ERROR_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:error|fault|alarm)(?:\s+code)?\s*[:#]?\s*([A-Z]{0,2}\d{2,4}(?:-\d{1,4})?)\b[\s:.\-]*([^\n]*)",
    )
    .expect("error code pattern")
});
static TABLE_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\|\s*([A-Z]{1,2}\d{2,4}(?:-\d{1,4})?)\s*\|\s*([^|\n]*)")
        .expect("table code pattern")
});

/// Finds error codes and their descriptions.
pub struct MetadataExtractionProcessor {
    store: Arc<dyn Store>,
}

impl MetadataExtractionProcessor {
    /// Processor writing to `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageProcessor for MetadataExtractionProcessor {
    fn stage(&self) -> Stage {
        Stage::MetadataExtraction
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let chunks = load_chunks(self.store.as_ref(), document_id).await?;

        let mut seen = HashSet::new();
        let mut artifacts = Vec::new();
        for chunk in &chunks {
            let found = ERROR_CODE
                .captures_iter(&chunk.raw_text)
                .chain(TABLE_CODE.captures_iter(&chunk.raw_text));
            for captures in found {
                let code = captures[1].to_uppercase();
                if !seen.insert(code.clone()) {
                    continue;
                }
                let description = captures
                    .get(2)
                    .map(|text| text.as_str().trim().trim_end_matches('|').trim())
                    .unwrap_or_default()
                    .to_string();
                artifacts.push(
                    NewArtifact::new(document_id, ArtifactKind::ErrorCode, METHOD)
                        .page(chunk.page_start)
                        .chunk(chunk.id)
                        .context(captures[0].trim().to_string())
                        .confidence(if description.is_empty() { 0.6 } else { 0.9 })
                        .payload(json!({ "code": code, "description": description })),
                );
            }
        }

        let written =
            replace_artifacts(self.store.as_ref(), document_id, self.stage(), METHOD, artifacts)
                .await?;
        tracing::info!(document_id = %document_id, error_codes = written, "Extracted error codes");
        Ok(ProcessingResult::ok(json!({ "error_codes": written })))
    }
}
