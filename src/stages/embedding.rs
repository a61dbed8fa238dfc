//! Embedding generation with adaptive batching, and similarity search over the stored vectors.
//!
//! The batcher starts at the configured size, doubles after two consecutive batches that finish
//! in under half the time budget, and halves when a batch overruns the budget or the provider
//! reports resource pressure. Items the provider rejects are reported back as failed items;
//! everything else is persisted, so a later smart run only has to embed what is missing.

use super::load_chunks;
use crate::config::BatchSettings;
use crate::embedding::EmbeddingClient;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor};
use crate::store::{
    DocumentId, EmbeddingTarget, NewEmbedding, ScoredChunk, SearchFilters, Store,
    StoreError, TargetKind,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Consecutive fast batches required before the batch size grows.
const FAST_STREAK_TO_GROW: u32 = 2;
/// Pressure responses tolerated at the minimum batch size before the slice is given up.
const MAX_PRESSURE_RETRIES: u32 = 3;

/// Batch-size controller driven by observed latency and provider back-pressure.
#[derive(Debug, Clone)]
pub struct AdaptiveBatcher {
    settings: BatchSettings,
    size: usize,
    fast_streak: u32,
}

impl AdaptiveBatcher {
    /// Start at `settings.initial`, clamped into `[min, max]`.
    pub fn new(settings: BatchSettings) -> Self {
        let min = settings.min.max(1);
        let max = settings.max.max(min);
        Self {
            settings: BatchSettings { min, max, ..settings },
            size: settings.initial.clamp(min, max),
            fast_streak: 0,
        }
    }

    /// Current target batch size.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Feed back the latency of a batch that returned results.
    pub fn record(&mut self, elapsed: Duration) {
        if elapsed > self.settings.budget {
            self.fast_streak = 0;
            self.size = (self.size / 2).max(self.settings.min);
        } else if elapsed < self.settings.budget / 2 {
            self.fast_streak += 1;
            if self.fast_streak >= FAST_STREAK_TO_GROW {
                self.fast_streak = 0;
                self.size = (self.size * 2).min(self.settings.max);
            }
        } else {
            self.fast_streak = 0;
        }
    }

    /// Halve the batch size after resource pressure; `false` when already at the floor.
    pub fn shrink(&mut self) -> bool {
        self.fast_streak = 0;
        if self.size <= self.settings.min {
            return false;
        }
        self.size = (self.size / 2).max(self.settings.min);
        true
    }
}

/// One text to embed, keyed by the identifier reported when it fails.
pub(crate) struct EmbedItem {
    pub key: String,
    pub target: EmbeddingTarget,
    pub text: String,
}

/// Outcome of [`embed_items`].
#[derive(Debug, Default)]
pub(crate) struct EmbedReport {
    pub created: usize,
    pub already_current: usize,
    pub failed: Vec<String>,
    pub batch_sizes: Vec<usize>,
    pub final_batch_size: usize,
}

/// Embed `items` in adaptive batches and persist every vector that came back valid.
///
/// Store failures abort the run; provider failures only mark the affected items.
pub(crate) async fn embed_items(
    store: &dyn Store,
    client: &dyn EmbeddingClient,
    settings: BatchSettings,
    document_id: DocumentId,
    items: &[EmbedItem],
) -> Result<EmbedReport, PipelineError> {
    let mut batcher = AdaptiveBatcher::new(settings);
    let mut report = EmbedReport::default();
    let mut offset = 0;
    let mut pressure_at_floor = 0;

    while offset < items.len() {
        let size = batcher.size().min(items.len() - offset);
        let slice = &items[offset..offset + size];
        let texts: Vec<String> = slice.iter().map(|item| item.text.clone()).collect();
        let started = Instant::now();

        let outcomes = match client.generate_embeddings(&texts).await {
            Ok(outcomes) => outcomes,
            Err(error) if error.is_resource_pressure() => {
                if batcher.shrink() {
                    tracing::warn!(
                        document_id = %document_id,
                        batch_size = batcher.size(),
                        %error,
                        "Embedding provider under pressure; shrinking batch"
                    );
                    continue;
                }
                pressure_at_floor += 1;
                if pressure_at_floor <= MAX_PRESSURE_RETRIES {
                    tracing::warn!(
                        document_id = %document_id,
                        attempt = pressure_at_floor,
                        %error,
                        "Embedding provider under pressure at minimum batch size; retrying"
                    );
                    continue;
                }
                tracing::error!(
                    document_id = %document_id,
                    items = size,
                    %error,
                    "Giving up on embedding batch after repeated pressure"
                );
                report.failed.extend(slice.iter().map(|item| item.key.clone()));
                pressure_at_floor = 0;
                offset += size;
                continue;
            }
            Err(error) => {
                tracing::error!(
                    document_id = %document_id,
                    items = size,
                    %error,
                    "Embedding batch failed"
                );
                report.batch_sizes.push(size);
                report.failed.extend(slice.iter().map(|item| item.key.clone()));
                offset += size;
                continue;
            }
        };
        pressure_at_floor = 0;
        report.batch_sizes.push(size);
        batcher.record(started.elapsed());

        if outcomes.len() != slice.len() {
            tracing::error!(
                document_id = %document_id,
                expected = slice.len(),
                received = outcomes.len(),
                "Embedding provider returned a mismatched batch"
            );
            report.failed.extend(slice.iter().map(|item| item.key.clone()));
            offset += size;
            continue;
        }

        for (item, outcome) in slice.iter().zip(outcomes) {
            let vector = match outcome {
                Ok(vector) if vector.len() == client.dimension() && !vector.is_empty() => vector,
                Ok(vector) => {
                    tracing::warn!(
                        document_id = %document_id,
                        item = %item.key,
                        dimension = vector.len(),
                        "Discarding malformed embedding vector"
                    );
                    report.failed.push(item.key.clone());
                    continue;
                }
                Err(error) => {
                    tracing::warn!(document_id = %document_id, item = %item.key, %error, "Item not embedded");
                    report.failed.push(item.key.clone());
                    continue;
                }
            };
            let record = NewEmbedding {
                document_id,
                target: item.target,
                model: client.model().to_string(),
                vector,
            };
            match store.create_embedding(record).await {
                Ok(_) => report.created += 1,
                // Another writer got there first; the target already has a current vector.
                Err(StoreError::Conflict(_)) => report.already_current += 1,
                Err(error) => return Err(error.into()),
            }
        }
        offset += size;
    }

    report.final_batch_size = batcher.size();
    Ok(report)
}

/// Embeds document chunks and serves similarity search over them.
pub struct EmbeddingProcessor {
    store: Arc<dyn Store>,
    client: Arc<dyn EmbeddingClient>,
    batch: BatchSettings,
    metrics: Arc<PipelineMetrics>,
}

impl EmbeddingProcessor {
    /// Processor embedding with `client` and persisting to `store`.
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn EmbeddingClient>,
        batch: BatchSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            client,
            batch,
            metrics,
        }
    }

    /// Model whose vectors this processor writes and searches.
    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Nearest chunks to `query_vector` by cosine similarity; ties go to the lower chunk index.
    pub async fn search_similar(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        if query_vector.is_empty() {
            return Err(PipelineError::Validation("query vector is empty".to_string()));
        }
        if query_vector.len() != self.client.dimension() {
            return Err(PipelineError::Validation(format!(
                "query vector has {} dimensions, model {} expects {}",
                query_vector.len(),
                self.client.model(),
                self.client.dimension()
            )));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let hits = self
            .store
            .search_embeddings(query_vector, self.client.model(), top_k, filters)
            .await?;
        tracing::debug!(top_k, hits = hits.len(), "Similarity search");
        Ok(hits)
    }

    /// Embed `query` with the configured model, then search.
    pub async fn search_text(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::Validation("query text is empty".to_string()));
        }
        let vector = self
            .client
            .generate_embeddings(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                PipelineError::UpstreamService("embedding provider returned no vector".to_string())
            })??;
        self.search_similar(&vector, top_k, filters).await
    }
}

#[async_trait]
impl StageProcessor for EmbeddingProcessor {
    fn stage(&self) -> Stage {
        Stage::Embedding
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let model = self.client.model();
        let chunks = load_chunks(self.store.as_ref(), document_id).await?;

        let retired = if context.reprocess {
            self.store
                .retire_embeddings(document_id, model, TargetKind::Chunk)
                .await?
        } else {
            0
        };
        let embedded = self
            .store
            .embedded_targets(document_id, model, TargetKind::Chunk)
            .await?;
        let pending: Vec<EmbedItem> = chunks
            .iter()
            .filter(|chunk| !embedded.contains(&chunk.id))
            .map(|chunk| EmbedItem {
                key: chunk.index.to_string(),
                target: EmbeddingTarget::Chunk(chunk.id),
                text: if chunk.cleaned_text.trim().is_empty() {
                    chunk.raw_text.clone()
                } else {
                    chunk.cleaned_text.clone()
                },
            })
            .collect();

        let report = embed_items(
            self.store.as_ref(),
            self.client.as_ref(),
            self.batch,
            document_id,
            &pending,
        )
        .await?;
        self.metrics
            .record_embeddings(report.created as u64, report.failed.len() as u64);

        if !pending.is_empty() && report.failed.len() == pending.len() {
            return Err(PipelineError::UpstreamService(format!(
                "all {} chunks failed to embed with {model}",
                pending.len()
            )));
        }

        let failed_chunks: Vec<u32> = report
            .failed
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect();
        tracing::info!(
            document_id = %document_id,
            model,
            embedded = report.created,
            skipped = chunks.len() - pending.len(),
            failed = report.failed.len(),
            retired,
            batch_sizes = ?report.batch_sizes,
            "Generated chunk embeddings"
        );
        let data = json!({
            "model": model,
            "embedded": report.created,
            "skipped": chunks.len() - pending.len() + report.already_current,
            "retired": retired,
            "failed_chunks": failed_chunks,
            "batch_sizes": report.batch_sizes,
            "final_batch_size": report.final_batch_size,
        });
        if report.failed.is_empty() {
            Ok(ProcessingResult::ok(data))
        } else {
            Ok(ProcessingResult::partial(data, report.failed, pending.len()))
        }
    }
}
