//! Parts extraction: part numbers mentioned in chunks become `part` artifacts.

use super::{load_chunks, replace_artifacts};
use crate::pipeline::{PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor};
use crate::store::{ArtifactKind, NewArtifact, Store};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

const METHOD: &str = "pattern";

static PART_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:part\s*(?:no\.?|number|#)|p/n)\s*[:#]?\s*([A-Z0-9][A-Z0-9-]{3,}[A-Z0-9])\b[\s:,\-]*([^\n]*)",
    )
    .expect("part number pattern")
});

/// Finds spare part numbers and their descriptions.
pub struct PartsExtractionProcessor {
    store: Arc<dyn Store>,
}

impl PartsExtractionProcessor {
    /// Processor writing to `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageProcessor for PartsExtractionProcessor {
    fn stage(&self) -> Stage {
        Stage::PartsExtraction
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let chunks = load_chunks(self.store.as_ref(), document_id).await?;

        let mut seen = HashSet::new();
        let mut artifacts = Vec::new();
        for chunk in &chunks {
            for captures in PART_NUMBER.captures_iter(&chunk.raw_text) {
                let part_number = captures[1].to_uppercase();
                if !seen.insert(part_number.clone()) {
                    continue;
                }
                let description = captures[2].trim().to_string();
                artifacts.push(
                    NewArtifact::new(document_id, ArtifactKind::Part, METHOD)
                        .page(chunk.page_start)
                        .chunk(chunk.id)
                        .context(captures[0].trim().to_string())
                        .payload(json!({
                            "part_number": part_number,
                            "description": description,
                            "series": Value::Null,
                        })),
                );
            }
        }

        let written =
            replace_artifacts(self.store.as_ref(), document_id, self.stage(), METHOD, artifacts)
                .await?;
        tracing::info!(document_id = %document_id, parts = written, "Extracted parts");
        Ok(ProcessingResult::ok(json!({ "parts": written })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::store_with_document;
    use crate::store::{ArtifactStore, ChunkStore, ChunkType, NewChunk};

    #[tokio::test]
    async fn extracts_unique_part_numbers() {
        let (store, document) = store_with_document("/manuals/x.txt").await;
        store
            .create_chunk(NewChunk {
                document_id: document.id,
                index: 0,
                page_start: 7,
                page_end: 7,
                raw_text: "Part No. 302K993090 - Fuser unit\nP/N FK-1150: maintenance kit\nReorder part no. 302k993090".into(),
                cleaned_text: String::new(),
                chunk_type: ChunkType::General,
                chunk_hash: "h".into(),
            })
            .await
            .unwrap();

        let result = PartsExtractionProcessor::new(store.clone())
            .process(&ProcessingContext::new(document.clone()))
            .await
            .unwrap();
        assert_eq!(result.data["parts"], 2);

        let parts = store
            .list_artifacts(document.id, ArtifactKind::Part)
            .await
            .unwrap();
        let fuser = parts
            .iter()
            .find(|part| part.payload_str("part_number") == Some("302K993090"))
            .unwrap();
        assert_eq!(fuser.payload_str("description"), Some("Fuser unit"));
        assert_eq!(fuser.page, Some(7));
        assert!(
            parts
                .iter()
                .any(|part| part.payload_str("part_number") == Some("FK-1150"))
        );
    }
}
