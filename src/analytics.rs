//! Analytics sink notified when a document becomes searchable.

use crate::metrics::PipelineMetrics;
use crate::store::{DocumentCounts, DocumentId};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Receives search-indexing events.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// A document passed the readiness check with these counts.
    async fn log_document_indexed(&self, document_id: DocumentId, counts: &DocumentCounts);
}

/// Default sink: a structured log line plus the `documents_indexed` counter.
pub struct TracingAnalyticsSink {
    metrics: Arc<PipelineMetrics>,
}

impl TracingAnalyticsSink {
    /// Sink recording into `metrics`.
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl AnalyticsSink for TracingAnalyticsSink {
    async fn log_document_indexed(&self, document_id: DocumentId, counts: &DocumentCounts) {
        self.metrics.record_indexed();
        tracing::info!(
            target: "docpipe::analytics",
            document_id = %document_id,
            chunks = counts.chunks,
            embeddings = counts.embeddings,
            links = counts.links,
            videos = counts.videos,
            tables = counts.tables,
            images = counts.images,
            "Document indexed"
        );
    }
}

/// Sink that keeps every event in memory.
#[derive(Default)]
pub struct MemoryAnalyticsSink {
    events: Mutex<Vec<(DocumentId, DocumentCounts)>>,
}

impl MemoryAnalyticsSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, oldest first.
    pub fn events(&self) -> Vec<(DocumentId, DocumentCounts)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl AnalyticsSink for MemoryAnalyticsSink {
    async fn log_document_indexed(&self, document_id: DocumentId, counts: &DocumentCounts) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((document_id, *counts));
    }
}
