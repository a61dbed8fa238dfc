//! Stage processors and the default registry wiring them together.
//!
//! Artifact-producing stages share one write discipline: clear the stage's previous artifacts,
//! write the new ones, then write the manifest last. A crash between the two leaves a manifest
//! that disagrees with the stored rows, which the status resolver reports as not completed.

pub mod chunk_prep;
pub mod classification;
pub mod embedding;
pub mod extraction;
pub mod indexing;
pub mod metadata;
pub mod parts;
pub mod series;
pub mod storage;
pub mod text;
pub mod upload;
pub mod visual;

use crate::analytics::AnalyticsSink;
use crate::config::{BatchSettings, Config};
use crate::embedding::EmbeddingClient;
use crate::extraction::{ExtractionClient, PageText};
use crate::metrics::PipelineMetrics;
use crate::pipeline::{PipelineError, Stage, StageRegistry, manifest_artifact};
use crate::store::{ArtifactKind, ArtifactStore, Chunk, DocumentId, NewArtifact, Store};
use std::path::PathBuf;
use std::sync::Arc;

pub use chunk_prep::{ChunkPrepProcessor, ChunkingSettings};
pub use classification::{ClassificationProcessor, DocumentClassifier, HeuristicClassifier};
pub use embedding::{AdaptiveBatcher, EmbeddingProcessor};
pub use extraction::{
    ImageProcessor, LinkExtractionProcessor, SvgProcessor, TableExtractionProcessor,
};
pub use indexing::SearchIndexingProcessor;
pub use metadata::MetadataExtractionProcessor;
pub use parts::PartsExtractionProcessor;
pub use series::SeriesDetectionProcessor;
pub use storage::StorageProcessor;
pub use text::TextExtractionProcessor;
pub use upload::UploadVerificationProcessor;
pub use visual::VisualEmbeddingProcessor;

/// Collaborators shared by the stage processors.
#[derive(Clone)]
pub struct StageDeps {
    /// Persistent store.
    pub store: Arc<dyn Store>,
    /// Extraction backend.
    pub extraction: Arc<dyn ExtractionClient>,
    /// Embedding backend.
    pub embedding: Arc<dyn EmbeddingClient>,
    /// Classification collaborator.
    pub classifier: Arc<dyn DocumentClassifier>,
    /// Receives search-indexing events.
    pub analytics: Arc<dyn AnalyticsSink>,
    /// Shared counters.
    pub metrics: Arc<PipelineMetrics>,
    /// Chunk sizing.
    pub chunking: ChunkingSettings,
    /// Adaptive embedding batch bounds.
    pub batch: BatchSettings,
    /// Root of the content-addressed object directory.
    pub storage_dir: PathBuf,
}

impl StageDeps {
    /// Collaborators configured from `config`, with default classifier.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn Store>,
        extraction: Arc<dyn ExtractionClient>,
        embedding: Arc<dyn EmbeddingClient>,
        analytics: Arc<dyn AnalyticsSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            extraction,
            embedding,
            classifier: Arc::new(HeuristicClassifier),
            analytics,
            metrics,
            chunking: ChunkingSettings::from(config),
            batch: config.embedding_batch,
            storage_dir: config.storage_dir.clone(),
        }
    }

    /// Embedding processor sharing these collaborators; also serves similarity search.
    pub fn embedding_processor(&self) -> EmbeddingProcessor {
        EmbeddingProcessor::new(
            self.store.clone(),
            self.embedding.clone(),
            self.batch,
            self.metrics.clone(),
        )
    }
}

/// Registry with a processor for every stage.
pub fn default_registry(deps: &StageDeps) -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry
        .register(Arc::new(UploadVerificationProcessor))
        .register(Arc::new(TextExtractionProcessor::new(
            deps.store.clone(),
            deps.extraction.clone(),
        )))
        .register(Arc::new(ClassificationProcessor::new(
            deps.store.clone(),
            deps.classifier.clone(),
        )))
        .register(Arc::new(TableExtractionProcessor::new(
            deps.store.clone(),
            deps.extraction.clone(),
        )))
        .register(Arc::new(SvgProcessor::new(
            deps.store.clone(),
            deps.extraction.clone(),
        )))
        .register(Arc::new(ImageProcessor::new(
            deps.store.clone(),
            deps.extraction.clone(),
        )))
        .register(Arc::new(VisualEmbeddingProcessor::new(
            deps.store.clone(),
            deps.embedding.clone(),
            deps.batch,
            deps.metrics.clone(),
        )))
        .register(Arc::new(LinkExtractionProcessor::new(
            deps.store.clone(),
            deps.extraction.clone(),
        )))
        .register(Arc::new(ChunkPrepProcessor::new(
            deps.store.clone(),
            deps.chunking.clone(),
        )))
        .register(Arc::new(MetadataExtractionProcessor::new(deps.store.clone())))
        .register(Arc::new(PartsExtractionProcessor::new(deps.store.clone())))
        .register(Arc::new(SeriesDetectionProcessor::new(deps.store.clone())))
        .register(Arc::new(StorageProcessor::new(
            deps.store.clone(),
            deps.storage_dir.join("objects"),
        )))
        .register(Arc::new(deps.embedding_processor()))
        .register(Arc::new(SearchIndexingProcessor::new(
            deps.store.clone(),
            deps.analytics.clone(),
            deps.embedding.model().to_string(),
        )));
    registry
}

/// Page texts written by text extraction, in page order.
pub(crate) async fn load_pages(
    store: &dyn Store,
    document_id: DocumentId,
) -> Result<Vec<PageText>, PipelineError> {
    let mut pages: Vec<PageText> = store
        .list_artifacts(document_id, ArtifactKind::Page)
        .await?
        .into_iter()
        .filter_map(|artifact| {
            Some(PageText {
                number: artifact.page?,
                text: artifact.payload_str("text")?.to_string(),
            })
        })
        .collect();
    if pages.is_empty() {
        return Err(PipelineError::Validation(
            "document has no extracted page text".to_string(),
        ));
    }
    pages.sort_by_key(|page| page.number);
    Ok(pages)
}

/// Chunks written by chunk preparation; empty is a validation error.
pub(crate) async fn load_chunks(
    store: &dyn Store,
    document_id: DocumentId,
) -> Result<Vec<Chunk>, PipelineError> {
    let chunks = store.list_chunks(document_id).await?;
    if chunks.is_empty() {
        return Err(PipelineError::Validation(
            "document has no prepared chunks".to_string(),
        ));
    }
    Ok(chunks)
}

/// Replace a stage's artifacts and write its manifest; returns the number of artifacts written.
pub(crate) async fn replace_artifacts(
    store: &dyn Store,
    document_id: DocumentId,
    stage: Stage,
    method: &str,
    artifacts: Vec<NewArtifact>,
) -> Result<u64, PipelineError> {
    let mut cleared = 0;
    for kind in stage.artifact_kinds() {
        cleared += store.delete_artifacts(document_id, *kind).await?;
    }
    let mut written = 0;
    for artifact in artifacts {
        store.create_artifact(artifact).await?;
        written += 1;
    }
    store
        .create_artifact(manifest_artifact(document_id, stage, written, method))
        .await?;
    tracing::debug!(
        document_id = %document_id,
        stage = %stage,
        cleared,
        written,
        "Replaced stage artifacts"
    );
    Ok(written)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::store::{Document, DocumentStore, InMemoryStore, NewDocument};
    use serde_json::json;
    use std::sync::Arc;

    /// Store with one document pointing at `source_path`.
    pub(crate) async fn store_with_document(source_path: &str) -> (Arc<InMemoryStore>, Document) {
        let store = Arc::new(InMemoryStore::new());
        let document = store
            .create_document(NewDocument {
                source_path: source_path.to_string(),
                content_hash: format!("hash-{source_path}"),
                metadata: json!({}),
            })
            .await
            .unwrap();
        (store, document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::latest_manifests;
    use crate::store::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn replace_artifacts_clears_previous_run() {
        let (store, document) = test_support::store_with_document("/manuals/a.txt").await;
        for run in 0..2 {
            let artifacts = (0..3)
                .map(|row| {
                    NewArtifact::new(document.id, ArtifactKind::Table, "test")
                        .page(1)
                        .payload(json!({"run": run, "row": row}))
                })
                .collect();
            let written = replace_artifacts(
                store.as_ref(),
                document.id,
                Stage::TableExtraction,
                "test",
                artifacts,
            )
            .await
            .unwrap();
            assert_eq!(written, 3);
        }
        let tables = store
            .list_artifacts(document.id, ArtifactKind::Table)
            .await
            .unwrap();
        assert_eq!(tables.len(), 3);
        assert!(tables.iter().all(|table| table.payload["run"] == 1));

        let manifests = store
            .list_artifacts(document.id, ArtifactKind::Manifest)
            .await
            .unwrap();
        assert_eq!(latest_manifests(&manifests)[&Stage::TableExtraction].items, 3);
    }

    #[tokio::test]
    async fn load_pages_requires_text() {
        let store = InMemoryStore::new();
        let error = load_pages(&store, uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(error, PipelineError::Validation(_)));
    }
}
