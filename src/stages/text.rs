//! Text extraction stage: page texts become `page` artifacts.

use super::replace_artifacts;
use crate::extraction::ExtractionClient;
use crate::pipeline::{PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor};
use crate::store::{ArtifactKind, NewArtifact, Store};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Extracts page texts from the source file.
pub struct TextExtractionProcessor {
    store: Arc<dyn Store>,
    extraction: Arc<dyn ExtractionClient>,
}

impl TextExtractionProcessor {
    /// Processor writing to `store` through `extraction`.
    pub fn new(store: Arc<dyn Store>, extraction: Arc<dyn ExtractionClient>) -> Self {
        Self { store, extraction }
    }
}

#[async_trait]
impl StageProcessor for TextExtractionProcessor {
    fn stage(&self) -> Stage {
        Stage::TextExtraction
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let pages = self.extraction.extract_text(context.source_path()).await?;
        if pages.is_empty() {
            return Err(PipelineError::Validation(format!(
                "no text extracted from {}",
                context.document.source_path
            )));
        }

        let characters: usize = pages.iter().map(|page| page.text.len()).sum();
        let method = self.extraction.method();
        let artifacts = pages
            .into_iter()
            .map(|page| {
                NewArtifact::new(document_id, ArtifactKind::Page, method)
                    .page(page.number)
                    .payload(json!({ "text": page.text }))
            })
            .collect();
        let written =
            replace_artifacts(self.store.as_ref(), document_id, self.stage(), method, artifacts)
                .await?;

        tracing::info!(document_id = %document_id, pages = written, characters, "Extracted page text");
        Ok(ProcessingResult::ok(json!({
            "pages": written,
            "characters": characters,
            "method": method,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::LocalExtractionClient;
    use crate::stages::test_support::store_with_document;
    use crate::store::ArtifactStore;
    use std::io::Write;

    #[tokio::test]
    async fn writes_one_artifact_per_page() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "Page one\u{c}Page two\u{c}   \u{c}Page four").unwrap();
        let (store, document) = store_with_document(&file.path().display().to_string()).await;
        let processor = TextExtractionProcessor::new(store.clone(), Arc::new(LocalExtractionClient));

        let result = processor
            .process(&ProcessingContext::new(document.clone()))
            .await
            .unwrap();
        assert_eq!(result.data["pages"], 3);

        let pages = store
            .list_artifacts(document.id, ArtifactKind::Page)
            .await
            .unwrap();
        let numbers: Vec<_> = pages.iter().filter_map(|page| page.page).collect();
        assert_eq!(numbers, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn empty_source_is_a_validation_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (store, document) = store_with_document(&file.path().display().to_string()).await;
        let processor = TextExtractionProcessor::new(store, Arc::new(LocalExtractionClient));

        let error = processor
            .process(&ProcessingContext::new(document))
            .await
            .unwrap_err();
        assert!(matches!(error, PipelineError::Validation(_)));
    }
}
