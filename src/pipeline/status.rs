//! Derived stage status.
//!
//! Status is never stored. Each stage has a cheap evidence check over store counts; the status of a
//! stage follows from its own evidence, the status of its dependencies and the pipeline error log.

use super::error::PipelineError;
use super::manifest::{Manifest, latest_manifests};
use super::stage::Stage;
use crate::store::{
    ArtifactKind, ArtifactStore, ChunkStore, Document, DocumentId, DocumentStore, EmbeddingStore,
    PipelineErrorRecord, PipelineErrorStore, Store, TargetKind,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;

/// Derived status of one stage for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet run, or its inputs changed since it last failed.
    Pending,
    /// The orchestrator holds an active run for the document.
    Processing,
    /// Output present, dependencies completed, no newer quality-gate error.
    Completed,
    /// Last attempt failed after the newest dependency output.
    Failed,
}

/// Result of a stage's evidence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Evidence {
    passed: bool,
    latest_at: Option<OffsetDateTime>,
}

impl Evidence {
    const fn new(passed: bool, latest_at: Option<OffsetDateTime>) -> Self {
        Self { passed, latest_at }
    }
}

/// Computes stage status from persisted state.
pub struct StageStatusResolver {
    store: Arc<dyn Store>,
    embedding_model: String,
}

impl StageStatusResolver {
    /// Resolver judging embedding evidence against `embedding_model`.
    pub fn new(store: Arc<dyn Store>, embedding_model: impl Into<String>) -> Self {
        Self {
            store,
            embedding_model: embedding_model.into(),
        }
    }

    /// Status of every stage in `pipeline`, considering only dependencies that are part of it.
    pub async fn resolve(
        &self,
        document_id: DocumentId,
        pipeline: &[Stage],
    ) -> Result<BTreeMap<Stage, StageStatus>, PipelineError> {
        Ok(self.resolve_with_gates(document_id, pipeline).await?.0)
    }

    /// Like [`StageStatusResolver::resolve`], also returning the stages held back by a
    /// quality-gate error newer than their output.
    pub async fn resolve_with_gates(
        &self,
        document_id: DocumentId,
        pipeline: &[Stage],
    ) -> Result<(BTreeMap<Stage, StageStatus>, BTreeSet<Stage>), PipelineError> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::missing_document(document_id))?;
        let manifests = latest_manifests(
            &self
                .store
                .list_artifacts(document_id, ArtifactKind::Manifest)
                .await?,
        );
        let mut errors: HashMap<String, Vec<PipelineErrorRecord>> = HashMap::new();
        for error in self.store.get_pipeline_errors(document_id).await? {
            errors.entry(error.stage.clone()).or_default().push(error);
        }

        let mut ordered = pipeline.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut evidence: BTreeMap<Stage, Evidence> = BTreeMap::new();
        let mut statuses: BTreeMap<Stage, StageStatus> = BTreeMap::new();
        let mut gated: BTreeSet<Stage> = BTreeSet::new();
        for stage in ordered.iter().copied() {
            let own = self.evidence(stage, &document, &manifests).await?;
            let dependencies: Vec<Stage> = stage
                .dependencies()
                .iter()
                .copied()
                .filter(|dependency| ordered.contains(dependency))
                .collect();
            let dependencies_completed = dependencies
                .iter()
                .all(|dependency| statuses.get(dependency) == Some(&StageStatus::Completed));

            let stage_errors = errors
                .get(stage.name())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let last_run = own
                .latest_at
                .max(manifests.get(&stage).map(|manifest| manifest.created_at));
            let gate_error_newer = stage_errors.iter().any(|error| {
                error.quality_gate && last_run.is_none_or(|at| error.created_at > at)
            });

            let status = if own.passed && dependencies_completed && !gate_error_newer {
                StageStatus::Completed
            } else {
                let baseline = dependencies
                    .iter()
                    .filter_map(|dependency| evidence.get(dependency).and_then(|e| e.latest_at))
                    .max();
                let newest_error = stage_errors.iter().map(|error| error.created_at).max();
                match (newest_error, baseline) {
                    (Some(error_at), Some(baseline)) if error_at > baseline => StageStatus::Failed,
                    (Some(_), None) => StageStatus::Failed,
                    _ => StageStatus::Pending,
                }
            };

            tracing::trace!(
                document_id = %document_id,
                stage = %stage,
                passed = own.passed,
                dependencies_completed,
                gate_error_newer,
                status = ?status,
                "Resolved stage status"
            );
            if gate_error_newer {
                gated.insert(stage);
            }
            evidence.insert(stage, own);
            statuses.insert(stage, status);
        }
        Ok((statuses, gated))
    }

    async fn evidence(
        &self,
        stage: Stage,
        document: &Document,
        manifests: &HashMap<Stage, Manifest>,
    ) -> Result<Evidence, PipelineError> {
        let document_id = document.id;
        let evidence = match stage {
            Stage::Upload => Evidence::new(true, Some(document.created_at)),
            Stage::Classification => {
                Evidence::new(document.document_type.is_some(), document.classified_at)
            }
            Stage::VisualEmbedding => {
                let images = self
                    .store
                    .artifact_coverage(document_id, ArtifactKind::Image)
                    .await?;
                let embedded = self
                    .store
                    .embedding_coverage(document_id, &self.embedding_model, TargetKind::Image)
                    .await?;
                Evidence::new(embedded.count >= images.count, embedded.latest_at)
            }
            Stage::ChunkPrep => {
                let chunks = self.store.chunk_coverage(document_id).await?;
                Evidence::new(chunks.count > 0, chunks.latest_at)
            }
            Stage::Embedding => {
                let chunks = self.store.chunk_coverage(document_id).await?;
                let embedded = self
                    .store
                    .embedding_coverage(document_id, &self.embedding_model, TargetKind::Chunk)
                    .await?;
                Evidence::new(
                    chunks.count > 0 && embedded.count >= chunks.count,
                    embedded.latest_at,
                )
            }
            Stage::SearchIndexing => {
                let ready = document.searchable
                    && self
                        .store
                        .document_counts(document_id, &self.embedding_model)
                        .await?
                        .is_search_ready();
                Evidence::new(ready, document.indexed_at)
            }
            Stage::TextExtraction
            | Stage::TableExtraction
            | Stage::SvgProcessing
            | Stage::ImageProcessing
            | Stage::LinkExtraction
            | Stage::MetadataExtraction
            | Stage::PartsExtraction
            | Stage::SeriesDetection
            | Stage::Storage => match manifests.get(&stage) {
                Some(manifest) => {
                    let mut stored = 0;
                    for kind in stage.artifact_kinds() {
                        stored += self.store.artifact_coverage(document_id, *kind).await?.count;
                    }
                    Evidence::new(stored == manifest.items, Some(manifest.created_at))
                }
                None => Evidence::new(false, None),
            },
        };
        Ok(evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::manifest::manifest_artifact;
    use crate::store::{
        ChunkType, EmbeddingTarget, ErrorKind, InMemoryStore, NewArtifact, NewChunk, NewDocument,
        NewEmbedding, NewPipelineError,
    };
    use serde_json::json;

    const MODEL: &str = "hash-v1";

    async fn setup() -> (Arc<InMemoryStore>, StageStatusResolver, DocumentId) {
        let store = Arc::new(InMemoryStore::new());
        let document = store
            .create_document(NewDocument {
                source_path: "/manuals/a.txt".into(),
                content_hash: "hash-a".into(),
                metadata: json!({}),
            })
            .await
            .unwrap();
        let resolver = StageStatusResolver::new(store.clone(), MODEL);
        (store, resolver, document.id)
    }

    async fn write_pages(store: &InMemoryStore, document_id: DocumentId, pages: u32, declared: u64) {
        for page in 1..=pages {
            store
                .create_artifact(
                    NewArtifact::new(document_id, ArtifactKind::Page, "test")
                        .page(page)
                        .payload(json!({"text": "page"})),
                )
                .await
                .unwrap();
        }
        store
            .create_artifact(manifest_artifact(
                document_id,
                Stage::TextExtraction,
                declared,
                "test",
            ))
            .await
            .unwrap();
    }

    async fn record_error(store: &InMemoryStore, document_id: DocumentId, stage: Stage, gate: bool) {
        store
            .create_pipeline_error(NewPipelineError {
                document_id,
                stage: stage.name().into(),
                kind: ErrorKind::Validation,
                message: "bad output".into(),
                quality_gate: gate,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_upload_leaves_later_stages_pending() {
        let (_store, resolver, document_id) = setup().await;
        let statuses = resolver.resolve(document_id, &Stage::ALL).await.unwrap();
        assert_eq!(statuses[&Stage::Upload], StageStatus::Completed);
        assert_eq!(statuses[&Stage::TextExtraction], StageStatus::Pending);
        assert_eq!(statuses[&Stage::SearchIndexing], StageStatus::Pending);
        assert_eq!(statuses.len(), Stage::ALL.len());
    }

    #[tokio::test]
    async fn inconsistent_manifest_is_not_completed() {
        let (store, resolver, document_id) = setup().await;
        write_pages(&store, document_id, 1, 2).await;
        let statuses = resolver
            .resolve(document_id, &[Stage::Upload, Stage::TextExtraction])
            .await
            .unwrap();
        assert_eq!(statuses[&Stage::TextExtraction], StageStatus::Pending);
    }

    #[tokio::test]
    async fn error_after_dependency_evidence_marks_failed_until_rerun_succeeds() {
        let (store, resolver, document_id) = setup().await;
        record_error(&store, document_id, Stage::TextExtraction, false).await;
        let statuses = resolver
            .resolve(document_id, &[Stage::Upload, Stage::TextExtraction])
            .await
            .unwrap();
        assert_eq!(statuses[&Stage::TextExtraction], StageStatus::Failed);

        write_pages(&store, document_id, 2, 2).await;
        let statuses = resolver
            .resolve(document_id, &[Stage::Upload, Stage::TextExtraction])
            .await
            .unwrap();
        assert_eq!(statuses[&Stage::TextExtraction], StageStatus::Completed);
    }

    #[tokio::test]
    async fn quality_gate_error_fails_stage_and_blocks_dependents() {
        let (store, resolver, document_id) = setup().await;
        write_pages(&store, document_id, 1, 1).await;
        store
            .update_document(
                document_id,
                crate::store::DocumentUpdate {
                    classification: Some(crate::store::Classification {
                        manufacturer: Some("HP".into()),
                        document_type: "service_manual".into(),
                        version: None,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let pipeline = [Stage::Upload, Stage::TextExtraction, Stage::Classification];
        let statuses = resolver.resolve(document_id, &pipeline).await.unwrap();
        assert_eq!(statuses[&Stage::Classification], StageStatus::Completed);

        record_error(&store, document_id, Stage::TextExtraction, true).await;
        let (statuses, gated) = resolver
            .resolve_with_gates(document_id, &pipeline)
            .await
            .unwrap();
        assert_eq!(statuses[&Stage::TextExtraction], StageStatus::Failed);
        assert_eq!(statuses[&Stage::Classification], StageStatus::Pending);
        assert_eq!(gated, BTreeSet::from([Stage::TextExtraction]));
    }

    #[tokio::test]
    async fn dependencies_outside_the_pipeline_are_ignored() {
        let (store, resolver, document_id) = setup().await;
        let chunk = store
            .create_chunk(NewChunk {
                document_id,
                index: 0,
                page_start: 1,
                page_end: 1,
                raw_text: "Remove the drum".into(),
                cleaned_text: "Remove the drum".into(),
                chunk_type: ChunkType::Procedure,
                chunk_hash: "h0".into(),
            })
            .await
            .unwrap();
        store
            .create_embedding(NewEmbedding {
                document_id,
                target: EmbeddingTarget::Chunk(chunk.id),
                model: MODEL.into(),
                vector: vec![1.0, 0.0],
            })
            .await
            .unwrap();

        let statuses = resolver
            .resolve(document_id, &[Stage::ChunkPrep, Stage::Embedding])
            .await
            .unwrap();
        assert_eq!(statuses[&Stage::ChunkPrep], StageStatus::Completed);
        assert_eq!(statuses[&Stage::Embedding], StageStatus::Completed);

        let full = resolver.resolve(document_id, &Stage::ALL).await.unwrap();
        assert_eq!(full[&Stage::Embedding], StageStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_document_is_an_error() {
        let (_store, resolver, _) = setup().await;
        let error = resolver
            .resolve(uuid::Uuid::new_v4(), &Stage::ALL)
            .await
            .unwrap_err();
        assert!(matches!(error, PipelineError::Store(_)));
    }
}
