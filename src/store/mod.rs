//! Persistence boundary for the pipeline.
//!
//! Every read and write performed by the orchestrator and the stage processors goes through the
//! narrow capability traits below. [`Store`] combines them and adds the aggregate helpers used by
//! search indexing. Two implementations ship with the crate:
//!
//! - [`InMemoryStore`]: lock-protected maps, used by tests and local experiments.
//! - [`SqlStore`]: SQLite through `sqlx`, used in production.

pub mod memory;
mod similarity;
pub mod sql;
pub mod types;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

pub use memory::InMemoryStore;
pub use similarity::{cosine_similarity, rank_scored_chunks};
pub use sql::SqlStore;
pub use types::*;

/// Document rows and the processing-queue view.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document; fails with [`StoreError::Conflict`] on a duplicate content hash.
    async fn create_document(&self, document: NewDocument) -> StoreResult<Document>;

    /// Fetch a document by id.
    async fn get_document(&self, id: DocumentId) -> StoreResult<Option<Document>>;

    /// Fetch a document by content hash.
    async fn get_document_by_hash(&self, content_hash: &str) -> StoreResult<Option<Document>>;

    /// Apply a partial update and return the new row.
    async fn update_document(&self, id: DocumentId, update: DocumentUpdate)
    -> StoreResult<Document>;

    /// Documents that are not `completed`, oldest first.
    async fn processing_queue(&self) -> StoreResult<Vec<Document>>;
}

/// Chunk rows.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert a chunk.
    async fn create_chunk(&self, chunk: NewChunk) -> StoreResult<Chunk>;

    /// All chunks of a document ordered by index.
    async fn list_chunks(&self, document_id: DocumentId) -> StoreResult<Vec<Chunk>>;

    /// Number of chunks and newest chunk timestamp.
    async fn chunk_coverage(&self, document_id: DocumentId) -> StoreResult<Coverage>;

    /// Remove every chunk of a document together with the embeddings attached to them.
    async fn delete_chunks(&self, document_id: DocumentId) -> StoreResult<u64>;
}

/// Embedding records and nearest-neighbour search.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Insert an embedding; fails with [`StoreError::Conflict`] when a current record already
    /// exists for the same target and model.
    async fn create_embedding(&self, embedding: NewEmbedding) -> StoreResult<EmbeddingRecord>;

    /// Targets of the given kind that have a current embedding for `model`.
    async fn embedded_targets(
        &self,
        document_id: DocumentId,
        model: &str,
        kind: TargetKind,
    ) -> StoreResult<HashSet<Uuid>>;

    /// Number of current embeddings and the newest one's timestamp.
    async fn embedding_coverage(
        &self,
        document_id: DocumentId,
        model: &str,
        kind: TargetKind,
    ) -> StoreResult<Coverage>;

    /// Cosine nearest neighbours among current chunk embeddings for `model`.
    async fn search_embeddings(
        &self,
        query: &[f32],
        model: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> StoreResult<Vec<ScoredChunk>>;

    /// Mark the current embeddings of a document as retired; returns how many were retired.
    async fn retire_embeddings(
        &self,
        document_id: DocumentId,
        model: &str,
        kind: TargetKind,
    ) -> StoreResult<u64>;
}

/// Structured artifacts (tables, images, links, parts, manifests, ...).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Insert an artifact.
    async fn create_artifact(&self, artifact: NewArtifact) -> StoreResult<Artifact>;

    /// Artifacts of one kind, ordered by page then creation.
    async fn list_artifacts(
        &self,
        document_id: DocumentId,
        kind: ArtifactKind,
    ) -> StoreResult<Vec<Artifact>>;

    /// Number of artifacts of one kind and the newest timestamp.
    async fn artifact_coverage(
        &self,
        document_id: DocumentId,
        kind: ArtifactKind,
    ) -> StoreResult<Coverage>;

    /// Merge `patch` (a JSON object) into the artifact payload.
    async fn patch_artifact(
        &self,
        id: ArtifactId,
        patch: serde_json::Value,
    ) -> StoreResult<Artifact>;

    /// Remove every artifact of one kind from a document.
    async fn delete_artifacts(&self, document_id: DocumentId, kind: ArtifactKind)
    -> StoreResult<u64>;
}

/// Append-only pipeline error log.
#[async_trait]
pub trait PipelineErrorStore: Send + Sync {
    /// Append an error record.
    async fn create_pipeline_error(
        &self,
        error: NewPipelineError,
    ) -> StoreResult<PipelineErrorRecord>;

    /// Every error recorded for a document, oldest first.
    async fn get_pipeline_errors(
        &self,
        document_id: DocumentId,
    ) -> StoreResult<Vec<PipelineErrorRecord>>;
}

/// Full store capability set consumed by the pipeline.
#[async_trait]
pub trait Store:
    DocumentStore + ChunkStore + EmbeddingStore + ArtifactStore + PipelineErrorStore
{
    /// Aggregate counts used for the search-readiness decision.
    async fn document_counts(
        &self,
        document_id: DocumentId,
        model: &str,
    ) -> StoreResult<DocumentCounts> {
        let chunks = self.chunk_coverage(document_id).await?.count;
        let embeddings = self
            .embedding_coverage(document_id, model, TargetKind::Chunk)
            .await?
            .count;
        let links = self
            .artifact_coverage(document_id, ArtifactKind::Link)
            .await?
            .count;
        let videos = self
            .artifact_coverage(document_id, ArtifactKind::Video)
            .await?
            .count;
        let tables = self
            .artifact_coverage(document_id, ArtifactKind::Table)
            .await?
            .count;
        let images = self
            .artifact_coverage(document_id, ArtifactKind::Image)
            .await?
            .count;
        Ok(DocumentCounts {
            chunks,
            embeddings,
            links,
            videos,
            tables,
            images,
        })
    }
}

/// Strictly increasing UTC timestamps for row stamps.
///
/// Derived stage status compares timestamps across tables, so two writes in the same process must
/// never share a timestamp.
#[derive(Debug, Default)]
pub(crate) struct MonotonicClock {
    last_nanos: Mutex<i128>,
}

impl MonotonicClock {
    pub(crate) fn now(&self) -> OffsetDateTime {
        let wall = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let mut last = self
            .last_nanos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = if wall > *last { wall } else { *last + 1_000 };
        *last = next;
        OffsetDateTime::from_unix_timestamp_nanos(next).unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

/// Merge the keys of a JSON object patch into a payload.
pub(crate) fn merge_payload(payload: &mut serde_json::Value, patch: serde_json::Value) {
    match (payload, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(source)) => {
            for (key, value) in source {
                target.insert(key, value);
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = MonotonicClock::default();
        let mut previous = clock.now();
        for _ in 0..1_000 {
            let next = clock.now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn merge_payload_overwrites_keys() {
        let mut payload = json!({"part_number": "A-1", "series": null});
        merge_payload(&mut payload, json!({"series": "X100"}));
        assert_eq!(payload["series"], "X100");
        assert_eq!(payload["part_number"], "A-1");
    }

    #[test]
    fn merge_payload_replaces_non_objects() {
        let mut payload = serde_json::Value::Null;
        merge_payload(&mut payload, json!({"a": 1}));
        assert_eq!(payload, json!({"a": 1}));
    }
}
