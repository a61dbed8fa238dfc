//! Chunk preparation: page text → cleaned, deduplicated, typed chunks.

use super::load_pages;
use crate::config::{Config, EmbeddingProvider};
use crate::pipeline::{PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor};
use crate::processing::chunking::PageChunker;
use crate::processing::sanitize::{classify_chunk, dedupe_chunks};
use crate::store::{ChunkStore, NewChunk, Store};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Token budget inputs for chunking.
#[derive(Debug, Clone)]
pub struct ChunkingSettings {
    /// Embedding backend, which decides the tokenizer.
    pub provider: EmbeddingProvider,
    /// Embedding model, which decides the context window.
    pub model: String,
    /// Explicit chunk size in tokens.
    pub chunk_size: Option<usize>,
    /// Overlap between adjacent chunks in tokens.
    pub overlap: usize,
}

impl From<&Config> for ChunkingSettings {
    fn from(config: &Config) -> Self {
        Self {
            provider: config.embedding_provider,
            model: config.embedding_model.clone(),
            chunk_size: config.text_splitter_chunk_size,
            overlap: config.text_splitter_chunk_overlap.unwrap_or(0),
        }
    }
}

/// Splits each page into token-budgeted chunks and replaces the document's chunks.
pub struct ChunkPrepProcessor {
    store: Arc<dyn Store>,
    settings: ChunkingSettings,
}

impl ChunkPrepProcessor {
    /// Processor writing to `store`.
    pub fn new(store: Arc<dyn Store>, settings: ChunkingSettings) -> Self {
        Self { store, settings }
    }
}

#[async_trait]
impl StageProcessor for ChunkPrepProcessor {
    fn stage(&self) -> Stage {
        Stage::ChunkPrep
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let pages = load_pages(self.store.as_ref(), document_id).await?;

        let (chunk_size, pieces) = {
            let chunker = PageChunker::for_model(
                self.settings.provider,
                &self.settings.model,
                self.settings.chunk_size,
                self.settings.overlap,
            )
            .map_err(|error| PipelineError::Configuration(error.to_string()))?;
            let pieces: Vec<(u32, String)> = pages
                .iter()
                .flat_map(|page| {
                    chunker
                        .split(&page.text)
                        .into_iter()
                        .map(|text| (page.number, text))
                })
                .collect();
            (chunker.budget(), pieces)
        };
        let (prepared, duplicates) = dedupe_chunks(pieces);
        if prepared.is_empty() {
            return Err(PipelineError::Validation(
                "page text produced no chunks".to_string(),
            ));
        }

        // Replacing chunks also drops their embeddings.
        let removed = self.store.delete_chunks(document_id).await?;
        for (index, chunk) in prepared.iter().enumerate() {
            self.store
                .create_chunk(NewChunk {
                    document_id,
                    index: u32::try_from(index).unwrap_or(u32::MAX),
                    page_start: chunk.page,
                    page_end: chunk.page,
                    chunk_type: classify_chunk(&chunk.raw_text),
                    raw_text: chunk.raw_text.clone(),
                    cleaned_text: chunk.cleaned_text.clone(),
                    chunk_hash: chunk.chunk_hash.clone(),
                })
                .await?;
        }

        tracing::info!(
            document_id = %document_id,
            chunks = prepared.len(),
            duplicates,
            removed,
            chunk_size,
            "Prepared chunks"
        );
        Ok(ProcessingResult::ok(json!({
            "chunks": prepared.len(),
            "duplicates_skipped": duplicates,
            "chunk_size": chunk_size,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::store_with_document;
    use crate::store::{ArtifactKind, ArtifactStore, ChunkType, NewArtifact};

    fn settings(chunk_size: usize) -> ChunkingSettings {
        ChunkingSettings {
            provider: EmbeddingProvider::Hash,
            model: "hash-v1".into(),
            chunk_size: Some(chunk_size),
            overlap: 0,
        }
    }

    #[tokio::test]
    async fn chunks_pages_in_order_and_skips_duplicates() {
        let (store, document) = store_with_document("/manuals/x.txt").await;
        for (page, text) in [
            (1, "Remove the rear cover.\n\nError code E045 means the fuser is cold."),
            (2, "Remove the rear cover."),
        ] {
            store
                .create_artifact(
                    NewArtifact::new(document.id, ArtifactKind::Page, "test")
                        .page(page)
                        .payload(json!({ "text": text })),
                )
                .await
                .unwrap();
        }

        let processor = ChunkPrepProcessor::new(store.clone(), settings(10));
        let result = processor
            .process(&ProcessingContext::new(document.clone()))
            .await
            .unwrap();
        assert_eq!(result.data["duplicates_skipped"], 1);

        let chunks = store.list_chunks(document.id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].cleaned_text, "Remove the rear cover.");
        assert_eq!(chunks[1].chunk_type, ChunkType::ErrorCode);
        assert!(chunks.iter().all(|chunk| chunk.page_start == 1));

        // A second run replaces rather than appends.
        processor
            .process(&ProcessingContext::new(document.clone()))
            .await
            .unwrap();
        assert_eq!(store.list_chunks(document.id).await.unwrap().len(), 2);
    }
}
