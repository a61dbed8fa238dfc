//! Pipeline orchestrator: dependency-ordered stage execution with derived status.
//!
//! The orchestrator never stores per-stage state. It asks the [`StageStatusResolver`] which stages
//! are outstanding, runs the matching processors from its [`StageRegistry`] in fixed order, and
//! re-resolves afterwards to decide the document lifecycle status.

use super::context::{ProcessingContext, ProcessingResult, StageRegistry};
use super::error::PipelineError;
use super::manifest::manifest_artifact;
use super::stage::Stage;
use super::status::{StageStatus, StageStatusResolver};
use super::upload::{UploadInput, UploadOutcome, Uploader};
use crate::config::Config;
use crate::metrics::PipelineMetrics;
use crate::store::{
    DocumentId, DocumentStatus, DocumentStore, DocumentUpdate, ErrorKind, NewPipelineError,
    PipelineErrorStore, Store,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Orchestrator tuning derived from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Model whose embeddings count as evidence.
    pub embedding_model: String,
    /// Upper bound on a single processor call.
    pub stage_timeout: Duration,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            embedding_model: config.embedding_model.clone(),
            stage_timeout: config.stage_timeout,
        }
    }
}

/// When a multi-stage call stops after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    /// Abort after the first failed stage.
    StopOnAnyError,
    /// Keep going; skip only dependents of failed or skipped stages.
    ContinueOnError,
    /// Abort only when a gating stage fails.
    StopOnGatingError,
}

/// Outcome of one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    /// Stage that ran.
    pub stage: Stage,
    /// Wall time spent in the processor.
    pub duration_ms: u64,
    /// Processor outcome.
    #[serde(flatten)]
    pub outcome: ProcessingResult,
}

impl StageResult {
    /// Whether the stage succeeded (possibly partially).
    pub fn success(&self) -> bool {
        self.outcome.success
    }
}

/// Outcome of a multi-stage call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStageResult {
    /// Document the stages ran for.
    pub document_id: DocumentId,
    /// Executed stages, in execution order.
    pub results: Vec<StageResult>,
    /// Stages not executed because a dependency failed or the call was aborted.
    pub skipped: Vec<Stage>,
    /// Executed stages that succeeded.
    pub successful: usize,
    /// Executed stages that failed.
    pub failed: usize,
    /// `successful / (successful + failed)`; `1.0` when nothing executed.
    pub success_rate: f64,
    /// Whether the stop policy cut the call short.
    pub aborted: bool,
}

impl BatchStageResult {
    fn new(document_id: DocumentId) -> Self {
        Self {
            document_id,
            results: Vec::new(),
            skipped: Vec::new(),
            successful: 0,
            failed: 0,
            success_rate: 1.0,
            aborted: false,
        }
    }

    fn push(&mut self, result: StageResult) {
        if result.success() {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
        let executed = self.successful + self.failed;
        self.success_rate = self.successful as f64 / executed as f64;
    }
}

/// How a pipeline run selected its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Every registered stage.
    Full,
    /// Only pending and failed stages.
    Smart,
}

/// Outcome of a full or smart pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    /// Document processed.
    pub document_id: DocumentId,
    /// Stage selection mode.
    pub mode: RunMode,
    /// Whether the upload matched an existing document.
    pub duplicate: bool,
    /// Stage executions.
    pub stages: BatchStageResult,
    /// Stage status after the run.
    pub statuses: BTreeMap<Stage, StageStatus>,
    /// Lifecycle status written after the run.
    pub final_status: DocumentStatus,
    /// Whether every registered stage is completed.
    pub success: bool,
}

type ActiveSet = Arc<Mutex<HashSet<DocumentId>>>;

/// Exclusive claim on a document, released on drop.
struct RunClaim {
    active: ActiveSet,
    document_id: DocumentId,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.document_id);
    }
}

/// Runs stage processors against documents.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    registry: StageRegistry,
    resolver: StageStatusResolver,
    uploader: Arc<dyn Uploader>,
    metrics: Arc<PipelineMetrics>,
    stage_timeout: Duration,
    active: ActiveSet,
}

impl Orchestrator {
    /// Assemble an orchestrator from its collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        registry: StageRegistry,
        uploader: Arc<dyn Uploader>,
        metrics: Arc<PipelineMetrics>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            resolver: StageStatusResolver::new(store.clone(), settings.embedding_model),
            store,
            registry,
            uploader,
            metrics,
            stage_timeout: settings.stage_timeout,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Shared metrics accumulator.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Store the orchestrator reads and writes.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Names of the registered stages in fixed order.
    pub fn available_stages(&self) -> Vec<&'static str> {
        self.registry.stages().into_iter().map(Stage::name).collect()
    }

    /// Whether a run currently owns the document.
    pub fn is_active(&self, document_id: DocumentId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&document_id)
    }

    /// Derived status of every registered stage, with `processing` overlaid during a run.
    pub async fn stage_statuses(
        &self,
        document_id: DocumentId,
    ) -> Result<BTreeMap<Stage, StageStatus>, PipelineError> {
        let mut statuses = self
            .resolver
            .resolve(document_id, &self.registry.stages())
            .await?;
        if self.is_active(document_id) {
            for status in statuses.values_mut() {
                if *status != StageStatus::Completed {
                    *status = StageStatus::Processing;
                }
            }
        }
        Ok(statuses)
    }

    /// Run one stage by name.
    ///
    /// Only an unknown stage, an unregistered processor, an unknown document or a concurrent run
    /// are reported as errors; processor failures become a failed [`StageResult`].
    pub async fn run_single_stage(
        &self,
        document_id: DocumentId,
        stage_name: &str,
    ) -> Result<StageResult, PipelineError> {
        let stage = self.registered_stage(stage_name)?;
        self.ensure_document(document_id).await?;
        let _claim = self.claim(document_id)?;
        self.begin_run(document_id).await;

        let result = match self.load_context(document_id, BTreeMap::new(), false).await {
            Ok(context) => self.execute_stage(stage, &context).await,
            Err(error) => self.record_failure(stage, document_id, &error).await,
        };
        if let Err(error) = self.finish_run(document_id).await {
            tracing::warn!(document_id = %document_id, %error, "Failed to update lifecycle status");
        }
        Ok(result)
    }

    /// Run the named stages in caller order.
    pub async fn run_stages(
        &self,
        document_id: DocumentId,
        stage_names: &[String],
        stop_on_error: bool,
    ) -> Result<BatchStageResult, PipelineError> {
        let stages = stage_names
            .iter()
            .map(|name| self.registered_stage(name))
            .collect::<Result<Vec<_>, _>>()?;
        self.ensure_document(document_id).await?;
        let _claim = self.claim(document_id)?;
        self.begin_run(document_id).await;

        let policy = if stop_on_error {
            StopPolicy::StopOnAnyError
        } else {
            StopPolicy::ContinueOnError
        };
        let result = self
            .execute(document_id, &stages, policy, &BTreeSet::new())
            .await;
        if let Err(error) = self.finish_run(document_id).await {
            tracing::warn!(document_id = %document_id, %error, "Failed to update lifecycle status");
        }
        Ok(result)
    }

    /// Upload a source file and run every registered stage; duplicates take the smart path.
    pub async fn process_full_pipeline(
        &self,
        input: UploadInput,
    ) -> Result<PipelineResult, PipelineError> {
        let uploaded = self.upload(input).await?;
        self.run_uploaded(uploaded).await
    }

    pub(super) async fn upload(&self, input: UploadInput) -> Result<UploadOutcome, PipelineError> {
        self.uploader.upload(input).await
    }

    /// Full pipeline for a fresh upload, smart pipeline for a duplicate.
    pub(super) async fn run_uploaded(
        &self,
        uploaded: UploadOutcome,
    ) -> Result<PipelineResult, PipelineError> {
        let document = match uploaded {
            UploadOutcome::Duplicate(document) => {
                let mut result = self.process_smart(document.id).await?;
                result.duplicate = true;
                return Ok(result);
            }
            UploadOutcome::Created(document) => document,
        };

        let document_id = document.id;
        let _claim = self.claim(document_id)?;
        self.begin_run(document_id).await;
        tracing::info!(document_id = %document_id, "Starting full pipeline");

        let stages = self
            .execute(
                document_id,
                &self.registry.stages(),
                StopPolicy::StopOnGatingError,
                &BTreeSet::new(),
            )
            .await;
        self.pipeline_result(document_id, RunMode::Full, stages).await
    }

    /// Run exactly the pending and failed stages of an existing document.
    ///
    /// Stages failed by a quality gate are re-run with `reprocess` set so they replace their
    /// previous output; other failed stages top up what is missing.
    pub async fn process_smart(
        &self,
        document_id: DocumentId,
    ) -> Result<PipelineResult, PipelineError> {
        self.ensure_document(document_id).await?;
        let _claim = self.claim(document_id)?;

        let (statuses, reprocess) = self
            .resolver
            .resolve_with_gates(document_id, &self.registry.stages())
            .await?;
        let selected: Vec<Stage> = statuses
            .iter()
            .filter(|(_, status)| matches!(status, StageStatus::Pending | StageStatus::Failed))
            .map(|(stage, _)| *stage)
            .collect();
        tracing::info!(
            document_id = %document_id,
            stages = ?selected,
            reprocess = ?reprocess,
            "Starting smart pipeline"
        );

        if !selected.is_empty() {
            self.begin_run(document_id).await;
        }
        let stages = self
            .execute(
                document_id,
                &selected,
                StopPolicy::StopOnGatingError,
                &reprocess,
            )
            .await;
        self.pipeline_result(document_id, RunMode::Smart, stages).await
    }

    /// Record a quality-gate failure against a stage whose output previously passed.
    ///
    /// The stage resolves to `failed` and the next smart run re-executes it with `reprocess` set.
    pub async fn flag_stage_failed(
        &self,
        document_id: DocumentId,
        stage_name: &str,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let stage = Stage::parse(stage_name)?;
        self.ensure_document(document_id).await?;
        self.store
            .create_pipeline_error(NewPipelineError {
                document_id,
                stage: stage.name().to_string(),
                kind: ErrorKind::Validation,
                message: reason.to_string(),
                quality_gate: true,
            })
            .await?;
        if !self.is_active(document_id) {
            self.store
                .update_document(document_id, DocumentUpdate::status(DocumentStatus::Failed))
                .await?;
        }
        tracing::warn!(document_id = %document_id, stage = %stage, reason, "Stage flagged by quality gate");
        Ok(())
    }

    fn registered_stage(&self, name: &str) -> Result<Stage, PipelineError> {
        let stage = Stage::parse(name)?;
        if !self.registry.contains(stage) {
            return Err(PipelineError::Configuration(format!(
                "no processor registered for stage '{stage}'"
            )));
        }
        Ok(stage)
    }

    async fn ensure_document(&self, document_id: DocumentId) -> Result<(), PipelineError> {
        self.store
            .get_document(document_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| PipelineError::missing_document(document_id))
    }

    fn claim(&self, document_id: DocumentId) -> Result<RunClaim, PipelineError> {
        let inserted = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(document_id);
        if !inserted {
            return Err(PipelineError::DocumentBusy(document_id));
        }
        Ok(RunClaim {
            active: Arc::clone(&self.active),
            document_id,
        })
    }

    async fn begin_run(&self, document_id: DocumentId) {
        if let Err(error) = self
            .store
            .update_document(document_id, DocumentUpdate::status(DocumentStatus::Processing))
            .await
        {
            tracing::warn!(document_id = %document_id, %error, "Failed to mark document processing");
        }
    }

    /// Re-resolve every registered stage and write the lifecycle status.
    async fn finish_run(
        &self,
        document_id: DocumentId,
    ) -> Result<(BTreeMap<Stage, StageStatus>, DocumentStatus), PipelineError> {
        let statuses = self
            .resolver
            .resolve(document_id, &self.registry.stages())
            .await?;
        let final_status = if statuses
            .values()
            .all(|status| *status == StageStatus::Completed)
        {
            DocumentStatus::Completed
        } else {
            DocumentStatus::Failed
        };
        self.store
            .update_document(document_id, DocumentUpdate::status(final_status))
            .await?;
        self.metrics.record_document();
        tracing::info!(document_id = %document_id, status = %final_status, "Pipeline run finished");
        Ok((statuses, final_status))
    }

    /// Write the lifecycle status of a run that was cancelled or panicked before it finished.
    ///
    /// Only documents still marked `processing` and not owned by another run are touched.
    pub(super) async fn settle_interrupted(&self, document_id: DocumentId) {
        if self.is_active(document_id) {
            return;
        }
        match self.store.get_document(document_id).await {
            Ok(Some(document)) if document.status == DocumentStatus::Processing => {}
            Ok(_) => return,
            Err(error) => {
                tracing::warn!(document_id = %document_id, %error, "Cannot settle interrupted run");
                return;
            }
        }
        match self.finish_run(document_id).await {
            Ok((_, status)) => {
                tracing::warn!(document_id = %document_id, status = %status, "Settled interrupted run");
            }
            Err(error) => {
                tracing::warn!(document_id = %document_id, %error, "Re-resolving interrupted run failed");
                if let Err(error) = self
                    .store
                    .update_document(document_id, DocumentUpdate::status(DocumentStatus::Failed))
                    .await
                {
                    tracing::error!(document_id = %document_id, %error, "Failed to mark interrupted run failed");
                }
            }
        }
    }

    async fn pipeline_result(
        &self,
        document_id: DocumentId,
        mode: RunMode,
        stages: BatchStageResult,
    ) -> Result<PipelineResult, PipelineError> {
        let (statuses, final_status) = self.finish_run(document_id).await?;
        Ok(PipelineResult {
            document_id,
            mode,
            duplicate: false,
            stages,
            statuses,
            success: final_status == DocumentStatus::Completed,
            final_status,
        })
    }

    async fn load_context(
        &self,
        document_id: DocumentId,
        prior_outputs: BTreeMap<Stage, Value>,
        reprocess: bool,
    ) -> Result<ProcessingContext, PipelineError> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::missing_document(document_id))?;
        Ok(ProcessingContext {
            document,
            prior_outputs,
            reprocess,
        })
    }

    /// Execute `stages` in the given order under `policy`.
    async fn execute(
        &self,
        document_id: DocumentId,
        stages: &[Stage],
        policy: StopPolicy,
        reprocess: &BTreeSet<Stage>,
    ) -> BatchStageResult {
        let mut batch = BatchStageResult::new(document_id);
        let mut outputs: BTreeMap<Stage, Value> = BTreeMap::new();
        let mut blocked: HashSet<Stage> = HashSet::new();

        for &stage in stages {
            if batch.aborted {
                batch.skipped.push(stage);
                continue;
            }
            if let Some(dependency) = stage
                .dependencies()
                .iter()
                .find(|dependency| blocked.contains(dependency))
            {
                tracing::info!(
                    document_id = %document_id,
                    stage = %stage,
                    dependency = %dependency,
                    "Skipping stage after dependency failure"
                );
                batch.skipped.push(stage);
                blocked.insert(stage);
                continue;
            }

            let result = match self
                .load_context(document_id, outputs.clone(), reprocess.contains(&stage))
                .await
            {
                Ok(context) => self.execute_stage(stage, &context).await,
                Err(error) => self.record_failure(stage, document_id, &error).await,
            };

            if result.success() {
                outputs.insert(stage, result.outcome.data.clone());
            } else {
                blocked.insert(stage);
                batch.aborted = match policy {
                    StopPolicy::StopOnAnyError => true,
                    StopPolicy::StopOnGatingError => stage.is_gating(),
                    StopPolicy::ContinueOnError => false,
                };
            }
            batch.push(result);
        }
        batch
    }

    /// Run one processor under the stage timeout and record any failure.
    async fn execute_stage(&self, stage: Stage, context: &ProcessingContext) -> StageResult {
        let document_id = context.document_id();
        let Some(processor) = self.registry.get(stage) else {
            let error =
                PipelineError::Configuration(format!("no processor registered for stage '{stage}'"));
            return self.record_failure(stage, document_id, &error).await;
        };

        let started = Instant::now();
        let outcome = {
            let _in_flight = self.metrics.enter_processor();
            tokio::time::timeout(self.stage_timeout, processor.process(context)).await
        };
        let outcome = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => ProcessingResult::from_error(&error),
            Err(_) => {
                self.metrics.record_timeout();
                ProcessingResult::failed(
                    ErrorKind::UpstreamService,
                    format!("stage {stage} timed out after {:?}", self.stage_timeout),
                )
            }
        };
        let result = StageResult {
            stage,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome,
        };

        if !result.outcome.success || result.outcome.partial_success {
            self.log_error(document_id, &result).await;
        }
        if result.outcome.success && stage.artifact_kinds().is_empty() {
            self.record_run_marker(document_id, stage).await;
        }
        self.metrics.record_stage(result.outcome.success);
        if result.outcome.success {
            tracing::info!(
                document_id = %document_id,
                stage = %stage,
                duration_ms = result.duration_ms,
                partial = result.outcome.partial_success,
                "Stage completed"
            );
        } else {
            tracing::warn!(
                document_id = %document_id,
                stage = %stage,
                duration_ms = result.duration_ms,
                error = ?result.outcome.message,
                "Stage failed"
            );
        }
        result
    }

    /// Stages without artifacts of their own leave an empty manifest per successful run, so a
    /// quality-gate flag older than the run no longer holds the stage back.
    async fn record_run_marker(&self, document_id: DocumentId, stage: Stage) {
        let marker = manifest_artifact(document_id, stage, 0, "run");
        if let Err(error) = self.store.create_artifact(marker).await {
            tracing::warn!(
                document_id = %document_id,
                stage = %stage,
                %error,
                "Failed to record stage run"
            );
        }
    }

    async fn record_failure(
        &self,
        stage: Stage,
        document_id: DocumentId,
        error: &PipelineError,
    ) -> StageResult {
        let result = StageResult {
            stage,
            duration_ms: 0,
            outcome: ProcessingResult::from_error(error),
        };
        self.log_error(document_id, &result).await;
        self.metrics.record_stage(false);
        result
    }

    async fn log_error(&self, document_id: DocumentId, result: &StageResult) {
        let record = NewPipelineError {
            document_id,
            stage: result.stage.name().to_string(),
            kind: result.outcome.error_kind.unwrap_or(ErrorKind::Validation),
            message: result
                .outcome
                .message
                .clone()
                .unwrap_or_else(|| "stage failed".to_string()),
            quality_gate: false,
        };
        if let Err(error) = self.store.create_pipeline_error(record).await {
            tracing::error!(
                document_id = %document_id,
                stage = %result.stage,
                %error,
                "Failed to record pipeline error"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::StageProcessor;
    use crate::pipeline::manifest::manifest_artifact;
    use crate::pipeline::upload::StoreUploader;
    use crate::store::{ArtifactKind, ArtifactStore, InMemoryStore, NewArtifact, NewDocument};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Processor writing one page plus manifest, or failing on demand.
    struct PageWriter {
        store: Arc<InMemoryStore>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StageProcessor for PageWriter {
        fn stage(&self) -> Stage {
            Stage::TextExtraction
        }

        async fn process(
            &self,
            context: &ProcessingContext,
        ) -> Result<ProcessingResult, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::UpstreamService("extractor down".into()));
            }
            let id = context.document_id();
            self.store.delete_artifacts(id, ArtifactKind::Page).await?;
            self.store
                .create_artifact(NewArtifact::new(id, ArtifactKind::Page, "test").page(1))
                .await?;
            self.store
                .create_artifact(manifest_artifact(id, Stage::TextExtraction, 1, "test"))
                .await?;
            Ok(ProcessingResult::ok(json!({"pages": 1})))
        }
    }

    struct Passthrough(Stage);

    #[async_trait]
    impl StageProcessor for Passthrough {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn process(
            &self,
            _context: &ProcessingContext,
        ) -> Result<ProcessingResult, PipelineError> {
            Ok(ProcessingResult::ok(json!({})))
        }
    }

    struct Sleeper;

    #[async_trait]
    impl StageProcessor for Sleeper {
        fn stage(&self) -> Stage {
            Stage::Classification
        }

        async fn process(
            &self,
            _context: &ProcessingContext,
        ) -> Result<ProcessingResult, PipelineError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ProcessingResult::ok(json!({})))
        }
    }

    fn orchestrator(store: Arc<InMemoryStore>, registry: StageRegistry) -> Orchestrator {
        Orchestrator::new(
            store.clone(),
            registry,
            Arc::new(StoreUploader::new(store)),
            Arc::new(PipelineMetrics::new()),
            OrchestratorSettings {
                embedding_model: "hash-v1".into(),
                stage_timeout: Duration::from_millis(100),
            },
        )
    }

    async fn document(store: &InMemoryStore) -> DocumentId {
        store
            .create_document(NewDocument {
                source_path: "/manuals/a.txt".into(),
                content_hash: "abc".into(),
                metadata: json!({}),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn unknown_stage_is_a_configuration_error() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = orchestrator(store.clone(), StageRegistry::new());
        let id = document(&store).await;

        let unknown = orchestrator.run_single_stage(id, "ocr").await.unwrap_err();
        assert!(matches!(unknown, PipelineError::Configuration(_)));
        let unregistered = orchestrator
            .run_single_stage(id, "embedding")
            .await
            .unwrap_err();
        assert!(matches!(unregistered, PipelineError::Configuration(_)));
    }

    #[tokio::test]
    async fn processor_error_becomes_failed_result_and_error_record() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = StageRegistry::new();
        registry.register(Arc::new(PageWriter {
            store: store.clone(),
            fail: true,
            calls: AtomicUsize::new(0),
        }));
        let orchestrator = orchestrator(store.clone(), registry);
        let id = document(&store).await;

        let result = orchestrator
            .run_single_stage(id, "text_extraction")
            .await
            .expect("configuration is valid");
        assert!(!result.success());
        assert_eq!(result.outcome.error_kind, Some(ErrorKind::UpstreamService));

        let errors = store.get_pipeline_errors(id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage, "text_extraction");
        let statuses = orchestrator.stage_statuses(id).await.unwrap();
        assert_eq!(statuses[&Stage::TextExtraction], StageStatus::Failed);
        let document = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(document.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn timeout_is_recorded_as_upstream_failure() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = StageRegistry::new();
        registry.register(Arc::new(Sleeper));
        let orchestrator = orchestrator(store.clone(), registry);
        let id = document(&store).await;

        let result = orchestrator
            .run_single_stage(id, "classification")
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.outcome.error_kind, Some(ErrorKind::UpstreamService));
        assert_eq!(orchestrator.metrics().snapshot().stage_timeouts, 1);
    }

    #[tokio::test]
    async fn stop_on_error_aborts_after_first_failure() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = StageRegistry::new();
        registry
            .register(Arc::new(Passthrough(Stage::Upload)))
            .register(Arc::new(PageWriter {
                store: store.clone(),
                fail: true,
                calls: AtomicUsize::new(0),
            }))
            .register(Arc::new(Passthrough(Stage::LinkExtraction)));
        let orchestrator = orchestrator(store.clone(), registry);
        let id = document(&store).await;
        let names: Vec<String> = ["upload", "text_extraction", "link_extraction"]
            .iter()
            .map(|name| name.to_string())
            .collect();

        let stopped = orchestrator.run_stages(id, &names, true).await.unwrap();
        assert_eq!(stopped.successful, 1);
        assert_eq!(stopped.failed, 1);
        assert!((stopped.success_rate - 0.5).abs() < f64::EPSILON);
        assert!(stopped.aborted);
        assert_eq!(stopped.skipped, vec![Stage::LinkExtraction]);

        let continued = orchestrator.run_stages(id, &names, false).await.unwrap();
        assert!(!continued.aborted);
        assert_eq!(continued.skipped, vec![Stage::LinkExtraction]);
    }

    #[tokio::test]
    async fn smart_run_reprocesses_flagged_stage() {
        let store = Arc::new(InMemoryStore::new());
        let writer = Arc::new(PageWriter {
            store: store.clone(),
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let mut registry = StageRegistry::new();
        registry
            .register(Arc::new(Passthrough(Stage::Upload)))
            .register(writer.clone());
        let orchestrator = orchestrator(store.clone(), registry);
        let id = document(&store).await;

        let first = orchestrator.process_smart(id).await.unwrap();
        assert!(first.success);
        assert_eq!(first.final_status, DocumentStatus::Completed);
        assert_eq!(writer.calls.load(Ordering::SeqCst), 1);

        let idle = orchestrator.process_smart(id).await.unwrap();
        assert!(idle.stages.results.is_empty());
        assert_eq!(writer.calls.load(Ordering::SeqCst), 1);

        orchestrator
            .flag_stage_failed(id, "text_extraction", "garbled text")
            .await
            .unwrap();
        let statuses = orchestrator.stage_statuses(id).await.unwrap();
        assert_eq!(statuses[&Stage::TextExtraction], StageStatus::Failed);

        let rerun = orchestrator.process_smart(id).await.unwrap();
        assert_eq!(rerun.stages.results.len(), 1);
        assert!(rerun.success);
        assert_eq!(writer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rerun_clears_flag_on_stages_without_artifacts() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = StageRegistry::new();
        registry
            .register(Arc::new(Passthrough(Stage::Upload)))
            .register(Arc::new(Passthrough(Stage::VisualEmbedding)));
        let orchestrator = orchestrator(store.clone(), registry);
        let id = document(&store).await;
        assert!(orchestrator.process_smart(id).await.unwrap().success);

        for stage in ["upload", "visual_embedding"] {
            orchestrator
                .flag_stage_failed(id, stage, "rejected by reviewer")
                .await
                .unwrap();
            let flagged = Stage::parse(stage).unwrap();
            let statuses = orchestrator.stage_statuses(id).await.unwrap();
            assert_eq!(statuses[&flagged], StageStatus::Failed);

            let rerun = orchestrator.process_smart(id).await.unwrap();
            assert_eq!(rerun.stages.results.len(), 1);
            assert!(rerun.success);
            assert_eq!(rerun.final_status, DocumentStatus::Completed);
            assert_eq!(rerun.statuses[&flagged], StageStatus::Completed);

            let idle = orchestrator.process_smart(id).await.unwrap();
            assert!(idle.stages.results.is_empty());
        }
    }

    #[tokio::test]
    async fn concurrent_claim_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = orchestrator(store.clone(), StageRegistry::new());
        let id = document(&store).await;

        let claim = orchestrator.claim(id).unwrap();
        assert!(orchestrator.is_active(id));
        assert!(matches!(
            orchestrator.process_smart(id).await.unwrap_err(),
            PipelineError::DocumentBusy(_)
        ));
        drop(claim);
        assert!(!orchestrator.is_active(id));
    }
}
