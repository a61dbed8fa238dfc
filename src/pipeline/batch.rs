//! Bounded worker pool for processing many documents.
//!
//! Each submitted item becomes a task that must acquire a semaphore permit before touching the
//! orchestrator, so at most `max_concurrency` documents run at once. Stages within a document
//! stay sequential. An optional deadline cancels whatever is still running; items that held a
//! permit are reported `incomplete`, the rest `not_started`. Cancelled runs have their document's
//! lifecycle status re-resolved.

use super::error::PipelineError;
use super::orchestrator::{Orchestrator, PipelineResult};
use super::upload::UploadInput;
use crate::config::Config;
use crate::store::{DocumentId, ErrorKind};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// One unit of batch work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchItem {
    /// Smart-process an existing document.
    Document {
        /// Document to process.
        document_id: DocumentId,
    },
    /// Upload a file and run the full pipeline.
    Upload(UploadInput),
}

/// Batch execution limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Maximum number of documents processed at once.
    pub max_concurrency: usize,
    /// Give up on unfinished items after this long.
    pub deadline: Option<Duration>,
}

impl From<&Config> for BatchOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            deadline: None,
        }
    }
}

/// Per-item batch outcome, in submission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchItemResult {
    /// The pipeline ran; its own result says whether the document completed.
    Processed {
        /// Pipeline outcome.
        result: PipelineResult,
    },
    /// The item could not be processed.
    Failed {
        /// Document, when known.
        document_id: Option<DocumentId>,
        /// Error class.
        kind: ErrorKind,
        /// Error description.
        error: String,
    },
    /// Another run already owned the document.
    AlreadyProcessing {
        /// Busy document.
        document_id: DocumentId,
    },
    /// The deadline passed while the item was running.
    Incomplete {
        /// Document, when known.
        document_id: Option<DocumentId>,
    },
    /// The deadline passed before the item acquired a worker.
    NotStarted {
        /// Document, when known.
        document_id: Option<DocumentId>,
    },
}

impl BatchItem {
    fn document_id(&self) -> Option<DocumentId> {
        match self {
            Self::Document { document_id } => Some(*document_id),
            Self::Upload(_) => None,
        }
    }
}

/// What the harness knows about an item while it runs.
#[derive(Debug, Default)]
struct ItemProgress {
    started: bool,
    document_id: Option<DocumentId>,
}

type Progress = Arc<Mutex<ItemProgress>>;

fn progress(slot: &Progress) -> MutexGuard<'_, ItemProgress> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Orchestrator {
    /// Process `items` on a bounded worker pool and report one result per item.
    ///
    /// Runs cut short by the deadline or a panic get their lifecycle status re-resolved, so no
    /// document stays `processing` after the batch returns.
    pub async fn process_batch(
        self: &Arc<Self>,
        items: Vec<BatchItem>,
        options: BatchOptions,
    ) -> Vec<BatchItemResult> {
        let total = items.len();
        let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
        let deadline = options.deadline.map(|budget| Instant::now() + budget);
        let slots: Vec<Progress> = items
            .iter()
            .map(|item| {
                Arc::new(Mutex::new(ItemProgress {
                    started: false,
                    document_id: item.document_id(),
                }))
            })
            .collect();
        let mut results: Vec<Option<BatchItemResult>> = (0..total).map(|_| None).collect();

        tracing::info!(
            items = total,
            max_concurrency = options.max_concurrency,
            deadline_ms = options.deadline.map(|d| d.as_millis() as u64),
            "Starting batch"
        );

        let mut workers = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let orchestrator = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let slot = Arc::clone(&slots[index]);
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    let document_id = progress(&slot).document_id;
                    return (index, BatchItemResult::NotStarted { document_id });
                };
                progress(&slot).started = true;
                let outcome = AssertUnwindSafe(orchestrator.run_batch_item(item, &slot))
                    .catch_unwind()
                    .await;
                let result = match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        let document_id = progress(&slot).document_id;
                        tracing::error!(document_id = ?document_id, "Batch item panicked");
                        if let Some(document_id) = document_id {
                            orchestrator.settle_interrupted(document_id).await;
                        }
                        BatchItemResult::Failed {
                            document_id,
                            kind: ErrorKind::Validation,
                            error: "stage processor panicked".to_string(),
                        }
                    }
                };
                (index, result)
            });
        }

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, workers.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(
                            remaining = workers.len(),
                            "Batch deadline reached; cancelling unfinished items"
                        );
                        workers.abort_all();
                        while workers.join_next().await.is_some() {}
                        break;
                    }
                },
                None => workers.join_next().await,
            };
            match next {
                Some(Ok((index, result))) => results[index] = Some(result),
                Some(Err(error)) => tracing::error!(%error, "Batch worker ended abnormally"),
                None => break,
            }
        }

        let mut settled = Vec::with_capacity(total);
        for (result, slot) in results.into_iter().zip(&slots) {
            let (started, document_id) = {
                let item = progress(slot);
                (item.started, item.document_id)
            };
            let result = match result {
                Some(result) => result,
                None if started => {
                    if let Some(document_id) = document_id {
                        self.settle_interrupted(document_id).await;
                    }
                    BatchItemResult::Incomplete { document_id }
                }
                None => BatchItemResult::NotStarted { document_id },
            };
            settled.push(result);
        }
        settled
    }

    async fn run_batch_item(&self, item: BatchItem, slot: &Progress) -> BatchItemResult {
        let outcome = match item {
            BatchItem::Document { document_id } => self.process_smart(document_id).await,
            BatchItem::Upload(input) => match self.upload(input).await {
                Ok(uploaded) => {
                    progress(slot).document_id = Some(uploaded.document().id);
                    self.run_uploaded(uploaded).await
                }
                Err(error) => Err(error),
            },
        };
        let document_id = progress(slot).document_id;
        match outcome {
            Ok(result) => BatchItemResult::Processed { result },
            Err(PipelineError::DocumentBusy(document_id)) => {
                BatchItemResult::AlreadyProcessing { document_id }
            }
            Err(error) => {
                tracing::warn!(document_id = ?document_id, %error, "Batch item failed");
                BatchItemResult::Failed {
                    document_id,
                    kind: error.kind(),
                    error: error.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PipelineMetrics;
    use crate::pipeline::context::{
        ProcessingContext, ProcessingResult, StageProcessor, StageRegistry,
    };
    use crate::pipeline::orchestrator::OrchestratorSettings;
    use crate::pipeline::stage::Stage;
    use crate::pipeline::upload::StoreUploader;
    use crate::store::{DocumentStatus, DocumentStore, InMemoryStore, NewDocument};
    use async_trait::async_trait;
    use serde_json::json;

    /// Never writes evidence, so every smart run executes it again.
    struct SlowStage(Duration);

    #[async_trait]
    impl StageProcessor for SlowStage {
        fn stage(&self) -> Stage {
            Stage::TextExtraction
        }

        async fn process(
            &self,
            _context: &ProcessingContext,
        ) -> Result<ProcessingResult, PipelineError> {
            tokio::time::sleep(self.0).await;
            Ok(ProcessingResult::ok(json!({})))
        }
    }

    async fn setup(delay: Duration, documents: usize) -> (Arc<Orchestrator>, Vec<DocumentId>) {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = StageRegistry::new();
        registry.register(Arc::new(SlowStage(delay)));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            registry,
            Arc::new(StoreUploader::new(store.clone())),
            Arc::new(PipelineMetrics::new()),
            OrchestratorSettings {
                embedding_model: "hash-v1".into(),
                stage_timeout: Duration::from_secs(10),
            },
        ));
        let mut ids = Vec::new();
        for index in 0..documents {
            let document = store
                .create_document(NewDocument {
                    source_path: format!("/manuals/{index}.txt"),
                    content_hash: format!("hash-{index}"),
                    metadata: json!({}),
                })
                .await
                .unwrap();
            ids.push(document.id);
        }
        (orchestrator, ids)
    }

    fn items(ids: &[DocumentId]) -> Vec<BatchItem> {
        ids.iter()
            .map(|document_id| BatchItem::Document {
                document_id: *document_id,
            })
            .collect()
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_bound() {
        let (orchestrator, ids) = setup(Duration::from_millis(40), 6).await;
        let results = orchestrator
            .process_batch(
                items(&ids),
                BatchOptions {
                    max_concurrency: 2,
                    deadline: None,
                },
            )
            .await;

        assert_eq!(results.len(), 6);
        assert!(
            results
                .iter()
                .all(|result| matches!(result, BatchItemResult::Processed { .. }))
        );
        let snapshot = orchestrator.metrics().snapshot();
        assert_eq!(snapshot.peak_in_flight, 2);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[tokio::test]
    async fn results_follow_submission_order() {
        let (orchestrator, ids) = setup(Duration::from_millis(5), 3).await;
        let results = orchestrator
            .process_batch(
                items(&ids),
                BatchOptions {
                    max_concurrency: 3,
                    deadline: None,
                },
            )
            .await;
        for (result, id) in results.iter().zip(&ids) {
            match result {
                BatchItemResult::Processed { result } => assert_eq!(&result.document_id, id),
                other => panic!("unexpected result {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn duplicate_submission_reports_already_processing() {
        let (orchestrator, ids) = setup(Duration::from_millis(200), 1).await;
        let results = orchestrator
            .process_batch(
                items(&[ids[0], ids[0]]),
                BatchOptions {
                    max_concurrency: 2,
                    deadline: None,
                },
            )
            .await;

        let busy = results
            .iter()
            .filter(|result| matches!(result, BatchItemResult::AlreadyProcessing { .. }))
            .count();
        assert_eq!(busy, 1);
    }

    #[tokio::test]
    async fn deadline_splits_incomplete_and_not_started() {
        let (orchestrator, ids) = setup(Duration::from_millis(500), 3).await;
        let results = orchestrator
            .process_batch(
                items(&ids),
                BatchOptions {
                    max_concurrency: 1,
                    deadline: Some(Duration::from_millis(100)),
                },
            )
            .await;

        let incomplete = results
            .iter()
            .filter(|result| matches!(result, BatchItemResult::Incomplete { .. }))
            .count();
        let not_started = results
            .iter()
            .filter(|result| matches!(result, BatchItemResult::NotStarted { .. }))
            .count();
        assert_eq!(incomplete, 1);
        assert_eq!(not_started, 2);
        assert!(!orchestrator.is_active(ids[0]));

        let cancelled = orchestrator.store().get_document(ids[0]).await.unwrap().unwrap();
        assert_eq!(cancelled.status, DocumentStatus::Failed);
    }

    struct PanickingStage;

    #[async_trait]
    impl StageProcessor for PanickingStage {
        fn stage(&self) -> Stage {
            Stage::TextExtraction
        }

        async fn process(
            &self,
            _context: &ProcessingContext,
        ) -> Result<ProcessingResult, PipelineError> {
            panic!("extraction backend returned garbage");
        }
    }

    #[tokio::test]
    async fn panicking_run_does_not_leave_document_processing() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = StageRegistry::new();
        registry.register(Arc::new(PanickingStage));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            registry,
            Arc::new(StoreUploader::new(store.clone())),
            Arc::new(PipelineMetrics::new()),
            OrchestratorSettings {
                embedding_model: "hash-v1".into(),
                stage_timeout: Duration::from_secs(10),
            },
        ));
        let document = store
            .create_document(NewDocument {
                source_path: "/manuals/panic.txt".into(),
                content_hash: "hash-panic".into(),
                metadata: json!({}),
            })
            .await
            .unwrap();

        let results = orchestrator
            .process_batch(
                items(&[document.id]),
                BatchOptions {
                    max_concurrency: 1,
                    deadline: None,
                },
            )
            .await;
        assert!(matches!(
            results[0],
            BatchItemResult::Failed {
                document_id: Some(id),
                ..
            } if id == document.id
        ));
        assert!(!orchestrator.is_active(document.id));
        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_document_fails_without_stopping_the_batch() {
        let (orchestrator, ids) = setup(Duration::from_millis(1), 1).await;
        let results = orchestrator
            .process_batch(
                items(&[uuid::Uuid::new_v4(), ids[0]]),
                BatchOptions {
                    max_concurrency: 2,
                    deadline: None,
                },
            )
            .await;
        assert!(matches!(
            results[0],
            BatchItemResult::Failed {
                kind: ErrorKind::Store,
                ..
            }
        ));
        assert!(matches!(results[1], BatchItemResult::Processed { .. }));
    }
}
