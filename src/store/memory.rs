//! In-memory store adapter used by tests and local experiments.

use super::{
    ArtifactStore, ChunkStore, DocumentStore, EmbeddingStore, MonotonicClock, PipelineErrorStore,
    Store, merge_payload, rank_scored_chunks,
    similarity::cosine_similarity,
    types::*,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    documents: HashMap<DocumentId, Document>,
    chunks: Vec<Chunk>,
    embeddings: Vec<EmbeddingRecord>,
    artifacts: Vec<Artifact>,
    errors: Vec<PipelineErrorRecord>,
}

/// Store adapter holding every row in process memory.
///
/// All tables live behind a single `RwLock`, so aggregate reads such as
/// [`Store::document_counts`] observe one consistent snapshot. [`InMemoryStore::set_offline`]
/// simulates an unreachable backend.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    clock: MonotonicClock,
    offline: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`] until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every embedding record of a document, including retired ones, in insertion order.
    pub async fn all_embeddings(&self, document_id: DocumentId) -> Vec<EmbeddingRecord> {
        let state = self.state.read().await;
        state
            .embeddings
            .iter()
            .filter(|record| record.document_id == document_id)
            .cloned()
            .collect()
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".into()));
        }
        Ok(())
    }
}

fn coverage<'a>(stamps: impl Iterator<Item = &'a time::OffsetDateTime>) -> Coverage {
    stamps.fold(Coverage::default(), |mut acc, stamp| {
        acc.count += 1;
        acc.latest_at = Some(acc.latest_at.map_or(*stamp, |latest| latest.max(*stamp)));
        acc
    })
}

fn current_embeddings<'a>(
    state: &'a State,
    document_id: DocumentId,
    model: &'a str,
    kind: TargetKind,
) -> impl Iterator<Item = &'a EmbeddingRecord> + 'a {
    state.embeddings.iter().filter(move |record| {
        record.document_id == document_id
            && !record.retired
            && record.model == model
            && record.target.kind() == kind
    })
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_document(&self, document: NewDocument) -> StoreResult<Document> {
        self.ensure_online()?;
        let mut state = self.state.write().await;
        if state
            .documents
            .values()
            .any(|existing| existing.content_hash == document.content_hash)
        {
            return Err(StoreError::Conflict(format!(
                "document with hash {} already exists",
                document.content_hash
            )));
        }

        let now = self.clock.now();
        let row = Document {
            id: Uuid::new_v4(),
            source_path: document.source_path,
            content_hash: document.content_hash,
            status: DocumentStatus::Uploaded,
            manufacturer: None,
            document_type: None,
            version: None,
            classified_at: None,
            searchable: false,
            indexed_at: None,
            metadata: document.metadata,
            created_at: now,
            updated_at: now,
        };
        state.documents.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_document(&self, id: DocumentId) -> StoreResult<Option<Document>> {
        self.ensure_online()?;
        Ok(self.state.read().await.documents.get(&id).cloned())
    }

    async fn get_document_by_hash(&self, content_hash: &str) -> StoreResult<Option<Document>> {
        self.ensure_online()?;
        let state = self.state.read().await;
        Ok(state
            .documents
            .values()
            .find(|document| document.content_hash == content_hash)
            .cloned())
    }

    async fn update_document(
        &self,
        id: DocumentId,
        update: DocumentUpdate,
    ) -> StoreResult<Document> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let document = state
            .documents
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("document", id))?;

        if let Some(status) = update.status {
            document.status = status;
        }
        if let Some(classification) = update.classification {
            document.manufacturer = classification.manufacturer;
            document.document_type = Some(classification.document_type);
            document.version = classification.version;
            document.classified_at = Some(now);
        }
        if let Some(searchable) = update.searchable {
            document.searchable = searchable;
            document.indexed_at = searchable.then_some(now);
        }
        document.updated_at = now;
        Ok(document.clone())
    }

    async fn processing_queue(&self) -> StoreResult<Vec<Document>> {
        self.ensure_online()?;
        let state = self.state.read().await;
        let mut queue: Vec<Document> = state
            .documents
            .values()
            .filter(|document| document.status != DocumentStatus::Completed)
            .cloned()
            .collect();
        queue.sort_by_key(|document| document.created_at);
        Ok(queue)
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn create_chunk(&self, chunk: NewChunk) -> StoreResult<Chunk> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if !state.documents.contains_key(&chunk.document_id) {
            return Err(StoreError::not_found("document", chunk.document_id));
        }
        if state
            .chunks
            .iter()
            .any(|existing| existing.document_id == chunk.document_id && existing.index == chunk.index)
        {
            return Err(StoreError::Conflict(format!(
                "chunk {} already exists for document {}",
                chunk.index, chunk.document_id
            )));
        }
        let row = Chunk::from_new(Uuid::new_v4(), chunk, now);
        state.chunks.push(row.clone());
        Ok(row)
    }

    async fn list_chunks(&self, document_id: DocumentId) -> StoreResult<Vec<Chunk>> {
        self.ensure_online()?;
        let state = self.state.read().await;
        let mut chunks: Vec<Chunk> = state
            .chunks
            .iter()
            .filter(|chunk| chunk.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|chunk| chunk.index);
        Ok(chunks)
    }

    async fn chunk_coverage(&self, document_id: DocumentId) -> StoreResult<Coverage> {
        self.ensure_online()?;
        let state = self.state.read().await;
        Ok(coverage(
            state
                .chunks
                .iter()
                .filter(|chunk| chunk.document_id == document_id)
                .map(|chunk| &chunk.created_at),
        ))
    }

    async fn delete_chunks(&self, document_id: DocumentId) -> StoreResult<u64> {
        self.ensure_online()?;
        let mut state = self.state.write().await;
        let removed: HashSet<ChunkId> = state
            .chunks
            .iter()
            .filter(|chunk| chunk.document_id == document_id)
            .map(|chunk| chunk.id)
            .collect();
        state.chunks.retain(|chunk| !removed.contains(&chunk.id));
        state.embeddings.retain(|record| match record.target {
            EmbeddingTarget::Chunk(id) => !removed.contains(&id),
            EmbeddingTarget::Image(_) => true,
        });
        Ok(removed.len() as u64)
    }
}

#[async_trait]
impl EmbeddingStore for InMemoryStore {
    async fn create_embedding(&self, embedding: NewEmbedding) -> StoreResult<EmbeddingRecord> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if state.embeddings.iter().any(|record| {
            !record.retired && record.target == embedding.target && record.model == embedding.model
        }) {
            return Err(StoreError::Conflict(format!(
                "current {} embedding already exists for {} {}",
                embedding.model,
                embedding.target.kind(),
                embedding.target.id()
            )));
        }
        let record = EmbeddingRecord {
            id: Uuid::new_v4(),
            document_id: embedding.document_id,
            target: embedding.target,
            model: embedding.model,
            vector: embedding.vector,
            retired: false,
            created_at: now,
        };
        state.embeddings.push(record.clone());
        Ok(record)
    }

    async fn embedded_targets(
        &self,
        document_id: DocumentId,
        model: &str,
        kind: TargetKind,
    ) -> StoreResult<HashSet<Uuid>> {
        self.ensure_online()?;
        let state = self.state.read().await;
        Ok(current_embeddings(&state, document_id, model, kind)
            .map(|record| record.target.id())
            .collect())
    }

    async fn embedding_coverage(
        &self,
        document_id: DocumentId,
        model: &str,
        kind: TargetKind,
    ) -> StoreResult<Coverage> {
        self.ensure_online()?;
        let state = self.state.read().await;
        Ok(coverage(
            current_embeddings(&state, document_id, model, kind).map(|record| &record.created_at),
        ))
    }

    async fn search_embeddings(
        &self,
        query: &[f32],
        model: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> StoreResult<Vec<ScoredChunk>> {
        self.ensure_online()?;
        let state = self.state.read().await;
        let chunks: HashMap<ChunkId, &Chunk> =
            state.chunks.iter().map(|chunk| (chunk.id, chunk)).collect();
        let manufacturer = filters
            .manufacturer
            .as_deref()
            .map(|value| value.trim().to_lowercase());

        let hits = state
            .embeddings
            .iter()
            .filter(|record| !record.retired && record.model == model)
            .filter_map(|record| match record.target {
                EmbeddingTarget::Chunk(id) => chunks.get(&id).map(|chunk| (record, *chunk)),
                EmbeddingTarget::Image(_) => None,
            })
            .filter(|(_, chunk)| {
                filters
                    .document_id
                    .is_none_or(|document_id| chunk.document_id == document_id)
            })
            .filter(|(_, chunk)| {
                filters
                    .chunk_types
                    .as_ref()
                    .is_none_or(|types| types.contains(&chunk.chunk_type))
            })
            .filter(|(_, chunk)| {
                manufacturer.as_deref().is_none_or(|wanted| {
                    state
                        .documents
                        .get(&chunk.document_id)
                        .and_then(|document| document.manufacturer.as_deref())
                        .is_some_and(|actual| actual.to_lowercase() == wanted)
                })
            })
            .map(|(record, chunk)| ScoredChunk {
                chunk_id: chunk.id,
                document_id: chunk.document_id,
                index: chunk.index,
                page_start: chunk.page_start,
                chunk_type: chunk.chunk_type,
                text: chunk.cleaned_text.clone(),
                score: cosine_similarity(query, &record.vector),
            })
            .collect();

        Ok(rank_scored_chunks(hits, top_k))
    }

    async fn retire_embeddings(
        &self,
        document_id: DocumentId,
        model: &str,
        kind: TargetKind,
    ) -> StoreResult<u64> {
        self.ensure_online()?;
        let mut state = self.state.write().await;
        let mut retired = 0;
        for record in state.embeddings.iter_mut().filter(|record| {
            record.document_id == document_id
                && !record.retired
                && record.model == model
                && record.target.kind() == kind
        }) {
            record.retired = true;
            retired += 1;
        }
        Ok(retired)
    }
}

#[async_trait]
impl ArtifactStore for InMemoryStore {
    async fn create_artifact(&self, artifact: NewArtifact) -> StoreResult<Artifact> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if !state.documents.contains_key(&artifact.document_id) {
            return Err(StoreError::not_found("document", artifact.document_id));
        }
        let row = Artifact::from_new(Uuid::new_v4(), artifact, now);
        state.artifacts.push(row.clone());
        Ok(row)
    }

    async fn list_artifacts(
        &self,
        document_id: DocumentId,
        kind: ArtifactKind,
    ) -> StoreResult<Vec<Artifact>> {
        self.ensure_online()?;
        let state = self.state.read().await;
        let mut artifacts: Vec<Artifact> = state
            .artifacts
            .iter()
            .filter(|artifact| artifact.document_id == document_id && artifact.kind == kind)
            .cloned()
            .collect();
        artifacts.sort_by_key(|artifact| (artifact.page.unwrap_or(u32::MAX), artifact.created_at));
        Ok(artifacts)
    }

    async fn artifact_coverage(
        &self,
        document_id: DocumentId,
        kind: ArtifactKind,
    ) -> StoreResult<Coverage> {
        self.ensure_online()?;
        let state = self.state.read().await;
        Ok(coverage(
            state
                .artifacts
                .iter()
                .filter(|artifact| artifact.document_id == document_id && artifact.kind == kind)
                .map(|artifact| &artifact.created_at),
        ))
    }

    async fn patch_artifact(
        &self,
        id: ArtifactId,
        patch: serde_json::Value,
    ) -> StoreResult<Artifact> {
        self.ensure_online()?;
        let mut state = self.state.write().await;
        let artifact = state
            .artifacts
            .iter_mut()
            .find(|artifact| artifact.id == id)
            .ok_or_else(|| StoreError::not_found("artifact", id))?;
        merge_payload(&mut artifact.payload, patch);
        Ok(artifact.clone())
    }

    async fn delete_artifacts(
        &self,
        document_id: DocumentId,
        kind: ArtifactKind,
    ) -> StoreResult<u64> {
        self.ensure_online()?;
        let mut state = self.state.write().await;
        let removed: HashSet<ArtifactId> = state
            .artifacts
            .iter()
            .filter(|artifact| artifact.document_id == document_id && artifact.kind == kind)
            .map(|artifact| artifact.id)
            .collect();
        state.artifacts.retain(|artifact| !removed.contains(&artifact.id));
        if kind == ArtifactKind::Image {
            state.embeddings.retain(|record| match record.target {
                EmbeddingTarget::Image(id) => !removed.contains(&id),
                EmbeddingTarget::Chunk(_) => true,
            });
        }
        Ok(removed.len() as u64)
    }
}

#[async_trait]
impl PipelineErrorStore for InMemoryStore {
    async fn create_pipeline_error(
        &self,
        error: NewPipelineError,
    ) -> StoreResult<PipelineErrorRecord> {
        self.ensure_online()?;
        let now = self.clock.now();
        let record = PipelineErrorRecord {
            id: Uuid::new_v4(),
            document_id: error.document_id,
            stage: error.stage,
            kind: error.kind,
            message: error.message,
            quality_gate: error.quality_gate,
            created_at: now,
        };
        self.state.write().await.errors.push(record.clone());
        Ok(record)
    }

    async fn get_pipeline_errors(
        &self,
        document_id: DocumentId,
    ) -> StoreResult<Vec<PipelineErrorRecord>> {
        self.ensure_online()?;
        let state = self.state.read().await;
        Ok(state
            .errors
            .iter()
            .filter(|record| record.document_id == document_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn document_counts(
        &self,
        document_id: DocumentId,
        model: &str,
    ) -> StoreResult<DocumentCounts> {
        self.ensure_online()?;
        let state = self.state.read().await;
        let artifacts = |kind: ArtifactKind| {
            state
                .artifacts
                .iter()
                .filter(|artifact| artifact.document_id == document_id && artifact.kind == kind)
                .count() as u64
        };
        Ok(DocumentCounts {
            chunks: state
                .chunks
                .iter()
                .filter(|chunk| chunk.document_id == document_id)
                .count() as u64,
            embeddings: current_embeddings(&state, document_id, model, TargetKind::Chunk).count()
                as u64,
            links: artifacts(ArtifactKind::Link),
            videos: artifacts(ArtifactKind::Video),
            tables: artifacts(ArtifactKind::Table),
            images: artifacts(ArtifactKind::Image),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded_document(store: &InMemoryStore, hash: &str) -> Document {
        store
            .create_document(NewDocument {
                source_path: format!("/manuals/{hash}.pdf"),
                content_hash: hash.into(),
                metadata: json!({}),
            })
            .await
            .expect("document created")
    }

    async fn seeded_chunk(store: &InMemoryStore, document_id: DocumentId, index: u32) -> Chunk {
        store
            .create_chunk(NewChunk {
                document_id,
                index,
                page_start: 1,
                page_end: 1,
                raw_text: format!("raw {index}"),
                cleaned_text: format!("clean {index}"),
                chunk_type: ChunkType::General,
                chunk_hash: format!("hash-{index}"),
            })
            .await
            .expect("chunk created")
    }

    #[tokio::test]
    async fn duplicate_content_hash_is_rejected() {
        let store = InMemoryStore::new();
        seeded_document(&store, "abc").await;
        let error = store
            .create_document(NewDocument {
                source_path: "/other.pdf".into(),
                content_hash: "abc".into(),
                metadata: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::Conflict(_)));
        let found = store.get_document_by_hash("abc").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn current_embedding_is_unique_per_target_and_model() {
        let store = InMemoryStore::new();
        let document = seeded_document(&store, "abc").await;
        let chunk = seeded_chunk(&store, document.id, 0).await;
        let new = || NewEmbedding {
            document_id: document.id,
            target: EmbeddingTarget::Chunk(chunk.id),
            model: "model-v1".into(),
            vector: vec![1.0, 0.0],
        };

        store.create_embedding(new()).await.expect("first insert");
        let error = store.create_embedding(new()).await.unwrap_err();
        assert!(matches!(error, StoreError::Conflict(_)));

        let retired = store
            .retire_embeddings(document.id, "model-v1", TargetKind::Chunk)
            .await
            .unwrap();
        assert_eq!(retired, 1);
        store.create_embedding(new()).await.expect("re-embed after retire");

        let history = store.all_embeddings(document.id).await;
        assert_eq!(history.len(), 2);
        assert!(history[0].retired);
        assert!(!history[1].retired);
    }

    #[tokio::test]
    async fn search_filters_and_breaks_ties_by_index() {
        let store = InMemoryStore::new();
        let first = seeded_document(&store, "one").await;
        let second = seeded_document(&store, "two").await;
        for index in [3, 1, 2] {
            let chunk = seeded_chunk(&store, first.id, index).await;
            store
                .create_embedding(NewEmbedding {
                    document_id: first.id,
                    target: EmbeddingTarget::Chunk(chunk.id),
                    model: "m".into(),
                    vector: vec![1.0, 0.0],
                })
                .await
                .unwrap();
        }
        let other = seeded_chunk(&store, second.id, 0).await;
        store
            .create_embedding(NewEmbedding {
                document_id: second.id,
                target: EmbeddingTarget::Chunk(other.id),
                model: "m".into(),
                vector: vec![1.0, 0.0],
            })
            .await
            .unwrap();

        let filters = SearchFilters {
            document_id: Some(first.id),
            ..SearchFilters::default()
        };
        let hits = store
            .search_embeddings(&[1.0, 0.0], "m", 10, &filters)
            .await
            .unwrap();
        let indexes: Vec<u32> = hits.iter().map(|hit| hit.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        assert!(hits.iter().all(|hit| hit.document_id == first.id));
    }

    #[tokio::test]
    async fn manufacturer_filter_matches_case_insensitively() {
        let store = InMemoryStore::new();
        let document = seeded_document(&store, "abc").await;
        store
            .update_document(
                document.id,
                DocumentUpdate {
                    classification: Some(Classification {
                        manufacturer: Some("Konica Minolta".into()),
                        document_type: "service_manual".into(),
                        version: None,
                    }),
                    ..DocumentUpdate::default()
                },
            )
            .await
            .unwrap();
        let chunk = seeded_chunk(&store, document.id, 0).await;
        store
            .create_embedding(NewEmbedding {
                document_id: document.id,
                target: EmbeddingTarget::Chunk(chunk.id),
                model: "m".into(),
                vector: vec![0.5, 0.5],
            })
            .await
            .unwrap();

        let matching = SearchFilters {
            manufacturer: Some("konica minolta".into()),
            ..SearchFilters::default()
        };
        let other = SearchFilters {
            manufacturer: Some("Lexmark".into()),
            ..SearchFilters::default()
        };
        assert_eq!(
            store
                .search_embeddings(&[0.5, 0.5], "m", 5, &matching)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(
            store
                .search_embeddings(&[0.5, 0.5], "m", 5, &other)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn counts_only_current_embeddings_of_the_model() {
        let store = InMemoryStore::new();
        let document = seeded_document(&store, "abc").await;
        let chunk = seeded_chunk(&store, document.id, 0).await;
        seeded_chunk(&store, document.id, 1).await;
        store
            .create_embedding(NewEmbedding {
                document_id: document.id,
                target: EmbeddingTarget::Chunk(chunk.id),
                model: "old".into(),
                vector: vec![1.0],
            })
            .await
            .unwrap();

        let counts = store.document_counts(document.id, "new").await.unwrap();
        assert_eq!(counts.chunks, 2);
        assert_eq!(counts.embeddings, 0);
        assert!(!counts.is_search_ready());
    }

    #[tokio::test]
    async fn deleting_chunks_cascades_to_embeddings() {
        let store = InMemoryStore::new();
        let document = seeded_document(&store, "abc").await;
        let chunk = seeded_chunk(&store, document.id, 0).await;
        store
            .create_embedding(NewEmbedding {
                document_id: document.id,
                target: EmbeddingTarget::Chunk(chunk.id),
                model: "m".into(),
                vector: vec![1.0],
            })
            .await
            .unwrap();

        assert_eq!(store.delete_chunks(document.id).await.unwrap(), 1);
        assert!(store.all_embeddings(document.id).await.is_empty());
    }

    #[tokio::test]
    async fn offline_store_rejects_operations() {
        let store = InMemoryStore::new();
        store.set_offline(true);
        let error = store.get_document(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(error, StoreError::Unavailable(_)));
        store.set_offline(false);
        assert!(store.get_document(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn searchable_flag_stamps_indexed_at() {
        let store = InMemoryStore::new();
        let document = seeded_document(&store, "abc").await;
        let updated = store
            .update_document(document.id, DocumentUpdate::searchable(true))
            .await
            .unwrap();
        assert!(updated.searchable);
        assert!(updated.indexed_at.is_some());

        let cleared = store
            .update_document(document.id, DocumentUpdate::searchable(false))
            .await
            .unwrap();
        assert!(!cleared.searchable);
        assert!(cleared.indexed_at.is_none());
    }
}
