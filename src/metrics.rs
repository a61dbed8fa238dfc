use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing pipeline activity.
#[derive(Default)]
pub struct PipelineMetrics {
    documents_processed: AtomicU64,
    documents_indexed: AtomicU64,
    stages_succeeded: AtomicU64,
    stages_failed: AtomicU64,
    stage_timeouts: AtomicU64,
    embeddings_created: AtomicU64,
    embedding_failures: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished pipeline run for one document.
    pub fn record_document(&self) {
        self.documents_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a document that became searchable.
    pub fn record_indexed(&self) {
        self.documents_indexed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a single stage execution.
    pub fn record_stage(&self, success: bool) {
        let counter = if success {
            &self.stages_succeeded
        } else {
            &self.stages_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stage that exceeded its time budget.
    pub fn record_timeout(&self) {
        self.stage_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record embedding outcomes for one batch.
    pub fn record_embeddings(&self, created: u64, failed: u64) {
        self.embeddings_created.fetch_add(created, Ordering::Relaxed);
        self.embedding_failures.fetch_add(failed, Ordering::Relaxed);
    }

    /// Mark one processor invocation as running until the returned guard drops.
    pub fn enter_processor(self: &Arc<Self>) -> InFlightGuard {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        InFlightGuard {
            metrics: Arc::clone(self),
        }
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_processed: self.documents_processed.load(Ordering::Relaxed),
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            stages_succeeded: self.stages_succeeded.load(Ordering::Relaxed),
            stages_failed: self.stages_failed.load(Ordering::Relaxed),
            stage_timeouts: self.stage_timeouts.load(Ordering::Relaxed),
            embeddings_created: self.embeddings_created.load(Ordering::Relaxed),
            embedding_failures: self.embedding_failures.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Decrements the in-flight gauge on drop.
pub struct InFlightGuard {
    metrics: Arc<PipelineMetrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Pipeline runs finished since startup.
    pub documents_processed: u64,
    /// Documents flipped to searchable since startup.
    pub documents_indexed: u64,
    /// Stage executions that succeeded.
    pub stages_succeeded: u64,
    /// Stage executions that failed, including timeouts.
    pub stages_failed: u64,
    /// Stage executions cut off by the per-stage timeout.
    pub stage_timeouts: u64,
    /// Embedding records written.
    pub embeddings_created: u64,
    /// Embedding items that failed.
    pub embedding_failures: u64,
    /// Processor invocations currently running.
    pub in_flight: u64,
    /// Highest number of concurrent processor invocations observed.
    pub peak_in_flight: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_stage_outcomes() {
        let metrics = PipelineMetrics::new();
        metrics.record_stage(true);
        metrics.record_stage(true);
        metrics.record_stage(false);
        metrics.record_embeddings(8, 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages_succeeded, 2);
        assert_eq!(snapshot.stages_failed, 1);
        assert_eq!(snapshot.embeddings_created, 8);
        assert_eq!(snapshot.embedding_failures, 2);
    }

    #[test]
    fn in_flight_gauge_tracks_peak() {
        let metrics = Arc::new(PipelineMetrics::new());
        let first = metrics.enter_processor();
        let second = metrics.enter_processor();
        assert_eq!(metrics.snapshot().in_flight, 2);
        drop(first);
        drop(second);

        let _third = metrics.enter_processor();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(snapshot.peak_in_flight, 2);
    }
}
