//! Visual embedding: image artifacts embedded through their caption text.

use super::embedding::{EmbedItem, embed_items};
use crate::config::BatchSettings;
use crate::embedding::EmbeddingClient;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor};
use crate::store::{ArtifactKind, ArtifactStore, EmbeddingTarget, Store, TargetKind};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Embeds every image artifact that lacks a current image embedding.
pub struct VisualEmbeddingProcessor {
    store: Arc<dyn Store>,
    client: Arc<dyn EmbeddingClient>,
    batch: BatchSettings,
    metrics: Arc<PipelineMetrics>,
}

impl VisualEmbeddingProcessor {
    /// Processor embedding with `client`.
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
}

#[async_trait]
impl StageProcessor for VisualEmbeddingProcessor {
    fn stage(&self) -> Stage {
        Stage::VisualEmbedding
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let model = self.client.model();
        let images = self
            .store
            .list_artifacts(document_id, ArtifactKind::Image)
            .await?;

        let retired = if context.reprocess {
            self.store
                .retire_embeddings(document_id, model, TargetKind::Image)
                .await?
        } else {
            0
        };
        let embedded = self
            .store
            .embedded_targets(document_id, model, TargetKind::Image)
            .await?;
        // Caption first, then surrounding text, then the file name.
        let pending: Vec<EmbedItem> = images
            .iter()
            .filter(|image| !embedded.contains(&image.id))
            .filter_map(|image| {
                let text = [
                    image.payload_str("caption"),
                    image.context.as_deref(),
                    image.payload_str("path"),
                ]
                .into_iter()
                .flatten()
                .map(str::trim)
                .find(|text| !text.is_empty())?;
                Some(EmbedItem {
                    key: image.id.to_string(),
                    target: EmbeddingTarget::Image(image.id),
                    text: text.to_string(),
                })
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
                "all {} images failed to embed with {model}",
                pending.len()
            )));
        }

        tracing::info!(
            document_id = %document_id,
            images = images.len(),
            embedded = report.created,
            failed = report.failed.len(),
            retired,
            "Generated image embeddings"
        );
        let data = json!({
            "model": model,
            "images": images.len(),
            "embedded": report.created,
            "retired": retired,
        });
        if report.failed.is_empty() {
            Ok(ProcessingResult::ok(data))
        } else {
            Ok(ProcessingResult::partial(data, report.failed, pending.len()))
        }
    }
}
