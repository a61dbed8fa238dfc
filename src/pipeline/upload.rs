//! Upload collaborator: registers a source file as a document, detecting duplicates by hash.

use super::error::PipelineError;
use crate::store::{Document, NewDocument, Store, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;

/// Request to register a source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadInput {
    /// Path of the source file.
    pub path: PathBuf,
    /// Free-form metadata stored with the document.
    #[serde(default)]
    pub metadata: Value,
}

impl UploadInput {
    /// Upload without metadata.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            metadata: Value::Null,
        }
    }
}

/// Outcome of an upload.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// A new document row was created.
    Created(Document),
    /// A document with the same content already existed.
    Duplicate(Document),
}

impl UploadOutcome {
    /// The created or pre-existing document.
    pub fn document(&self) -> &Document {
        match self {
            Self::Created(document) | Self::Duplicate(document) => document,
        }
    }

    /// Whether the content was already known.
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Registers uploads as documents.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Register the source file described by `input`.
    async fn upload(&self, input: UploadInput) -> Result<UploadOutcome, PipelineError>;
}

/// SHA-256 hex digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Uploader that hashes the file and writes the document row directly to the store.
pub struct StoreUploader {
    store: Arc<dyn Store>,
}

impl StoreUploader {
    /// Uploader writing to `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Uploader for StoreUploader {
    async fn upload(&self, input: UploadInput) -> Result<UploadOutcome, PipelineError> {
        let bytes = tokio::fs::read(&input.path).await.map_err(|error| {
            PipelineError::Validation(format!("cannot read {}: {error}", input.path.display()))
        })?;
        if bytes.is_empty() {
            return Err(PipelineError::Validation(format!(
                "{} is empty",
                input.path.display()
            )));
        }
        let hash = content_hash(&bytes);

        if let Some(existing) = self.store.get_document_by_hash(&hash).await? {
            tracing::info!(document_id = %existing.id, path = %input.path.display(), "Duplicate upload");
            return Ok(UploadOutcome::Duplicate(existing));
        }

        let metadata = if input.metadata.is_null() {
            Value::Object(Default::default())
        } else {
            input.metadata
        };
        match self
            .store
            .create_document(NewDocument {
                source_path: input.path.display().to_string(),
                content_hash: hash.clone(),
                metadata,
            })
            .await
        {
            Ok(document) => {
                tracing::info!(document_id = %document.id, path = %document.source_path, "Document uploaded");
                Ok(UploadOutcome::Created(document))
            }
            // A concurrent upload of the same content won the insert.
            Err(StoreError::Conflict(_)) => self
                .store
                .get_document_by_hash(&hash)
                .await?
                .map(UploadOutcome::Duplicate)
                .ok_or_else(|| {
                    PipelineError::Store(StoreError::Conflict(format!(
                        "document with hash {hash} vanished after conflict"
                    )))
                }),
            Err(error) => Err(error.into()),
        }
    }
}
