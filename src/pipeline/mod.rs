//! Pipeline core: stage graph, derived status, orchestration and the batch harness.

pub mod batch;
pub mod context;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod stage;
pub mod status;
pub mod upload;

pub use batch::{BatchItem, BatchItemResult, BatchOptions};
pub use context::{ProcessingContext, ProcessingResult, StageProcessor, StageRegistry};
pub use error::PipelineError;
pub use manifest::{Manifest, latest_manifests, manifest_artifact};
pub use orchestrator::{
    BatchStageResult, Orchestrator, OrchestratorSettings, PipelineResult, RunMode, StageResult,
    StopPolicy,
};
pub use stage::Stage;
pub use status::{StageStatus, StageStatusResolver};
pub use upload::{StoreUploader, UploadInput, UploadOutcome, Uploader, content_hash};
