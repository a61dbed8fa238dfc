//! Search indexing: recount the document's records and flip its searchable flag.

use crate::analytics::AnalyticsSink;
use crate::pipeline::{PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor};
use crate::store::{DocumentStore, DocumentUpdate, Store};
use async_trait::async_trait;
use std::sync::Arc;

/// Marks a document searchable once every chunk has a current embedding.
pub struct SearchIndexingProcessor {
    store: Arc<dyn Store>,
    analytics: Arc<dyn AnalyticsSink>,
    model: String,
}

impl SearchIndexingProcessor {
    /// Processor counting embeddings produced by `model`.
    pub fn new(store: Arc<dyn Store>, analytics: Arc<dyn AnalyticsSink>, model: String) -> Self {
        Self {
            store,
            analytics,
            model,
        }
    }
}

#[async_trait]
impl StageProcessor for SearchIndexingProcessor {
    fn stage(&self) -> Stage {
        Stage::SearchIndexing
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        // Counts come from the store, never from earlier stage outputs.
        let counts = self.store.document_counts(document_id, &self.model).await?;

        if !counts.is_search_ready() {
            self.store
                .update_document(document_id, DocumentUpdate::searchable(false))
                .await?;
            tracing::warn!(
                document_id = %document_id,
                chunks = counts.chunks,
                embeddings = counts.embeddings,
                "Document not ready for search"
            );
            return Err(PipelineError::Validation(format!(
                "{} of {} chunks embedded with {}",
                counts.embeddings, counts.chunks, self.model
            )));
        }

        self.store
            .update_document(document_id, DocumentUpdate::searchable(true))
            .await?;
        self.analytics
            .log_document_indexed(document_id, &counts)
            .await;
        let data = serde_json::to_value(counts).map_err(|error| {
            PipelineError::Validation(format!("cannot encode document counts: {error}"))
        })?;
        Ok(ProcessingResult::ok(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::MemoryAnalyticsSink;
    use crate::stages::test_support::store_with_document;
    use crate::store::{
        ChunkStore, ChunkType, Document, EmbeddingStore, EmbeddingTarget, InMemoryStore,
        NewChunk, NewEmbedding,
    };

    const MODEL: &str = "hash-v1";

    async fn add_chunk(store: &InMemoryStore, document: &Document, index: u32, embed: bool) {
        let chunk = store
            .create_chunk(NewChunk {
                document_id: document.id,
                index,
                page_start: 1,
                page_end: 1,
                raw_text: format!("chunk {index}"),
                cleaned_text: format!("chunk {index}"),
                chunk_type: ChunkType::General,
                chunk_hash: format!("h{index}"),
            })
            .await
            .unwrap();
        if embed {
            store
                .create_embedding(NewEmbedding {
                    document_id: document.id,
                    target: EmbeddingTarget::Chunk(chunk.id),
                    model: MODEL.into(),
                    vector: vec![1.0, 0.0],
                })
                .await
                .unwrap();
        }
    }

    fn processor(
        store: Arc<InMemoryStore>,
        sink: Arc<MemoryAnalyticsSink>,
    ) -> SearchIndexingProcessor {
        SearchIndexingProcessor::new(store, sink, MODEL.to_string())
    }

    #[tokio::test]
    async fn fully_embedded_document_becomes_searchable() {
        let (store, document) = store_with_document("/manuals/x.txt").await;
        for index in 0..3 {
            add_chunk(&store, &document, index, true).await;
        }
        let sink = Arc::new(MemoryAnalyticsSink::new());

        let result = processor(store.clone(), sink.clone())
            .process(&ProcessingContext::new(document.clone()))
            .await
            .unwrap();
        assert_eq!(result.data["chunks"], 3);
        assert_eq!(result.data["embeddings"], 3);

        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert!(stored.searchable);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, document.id);
        assert_eq!(events[0].1.chunks, 3);
    }

    #[tokio::test]
    async fn missing_embedding_clears_the_flag() {
        let (store, document) = store_with_document("/manuals/x.txt").await;
        add_chunk(&store, &document, 0, true).await;
        add_chunk(&store, &document, 1, false).await;
        store
            .update_document(document.id, DocumentUpdate::searchable(true))
            .await
            .unwrap();
        let sink = Arc::new(MemoryAnalyticsSink::new());

        let error = processor(store.clone(), sink.clone())
            .process(&ProcessingContext::new(document.clone()))
            .await
            .unwrap_err();
        assert!(matches!(error, PipelineError::Validation(_)));
        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert!(!stored.searchable);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn document_without_chunks_is_never_searchable() {
        let (store, document) = store_with_document("/manuals/x.txt").await;
        let sink = Arc::new(MemoryAnalyticsSink::new());
        let error = processor(store.clone(), sink)
            .process(&ProcessingContext::new(document.clone()))
            .await
            .unwrap_err();
        assert!(matches!(error, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn count_failure_leaves_flag_untouched() {
        let (store, document) = store_with_document("/manuals/x.txt").await;
        add_chunk(&store, &document, 0, true).await;
        store
            .update_document(document.id, DocumentUpdate::searchable(true))
            .await
            .unwrap();

        store.set_offline(true);
        let error = processor(store.clone(), Arc::new(MemoryAnalyticsSink::new()))
            .process(&ProcessingContext::new(document.clone()))
            .await
            .unwrap_err();
        assert!(matches!(error, PipelineError::Store(_)));
        store.set_offline(false);

        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert!(stored.searchable);
    }
}
