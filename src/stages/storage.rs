//! Storage stage: copies the source file and extracted images into a content-addressed object
//! directory (`<root>/<first two hex digits>/<sha256>`).

use super::replace_artifacts;
use crate::pipeline::{
    PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor, content_hash,
};
use crate::store::{ArtifactKind, ArtifactStore, NewArtifact, Store};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const METHOD: &str = "content_addressed";

/// Copies document files into the object directory.
pub struct StorageProcessor {
    store: Arc<dyn Store>,
    root: PathBuf,
}

impl StorageProcessor {
    /// Processor writing objects under `root`.
    pub fn new(store: Arc<dyn Store>, root: PathBuf) -> Self {
        Self { store, root }
    }

    /// Store `bytes` under their digest; returns the digest and the object path.
    async fn put_object(&self, bytes: &[u8]) -> Result<(String, PathBuf), PipelineError> {
        let digest = content_hash(bytes);
        let directory = self.root.join(&digest[..2]);
        let path = directory.join(&digest);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok((digest, path));
        }
        tokio::fs::create_dir_all(&directory).await.map_err(|error| {
            PipelineError::UpstreamService(format!(
                "cannot create object directory {}: {error}",
                directory.display()
            ))
        })?;
        let partial = directory.join(format!("{digest}.partial"));
        let write = async {
            tokio::fs::write(&partial, bytes).await?;
            tokio::fs::rename(&partial, &path).await
        };
        write.await.map_err(|error| {
            PipelineError::UpstreamService(format!("cannot write object {}: {error}", path.display()))
        })?;
        Ok((digest, path))
    }
}

fn resolve_image(source: &Path, image: &str) -> PathBuf {
    let image = Path::new(image);
    if image.is_absolute() {
        return image.to_path_buf();
    }
    source
        .parent()
        .map_or_else(|| image.to_path_buf(), |parent| parent.join(image))
}

#[async_trait]
impl StageProcessor for StorageProcessor {
    fn stage(&self) -> Stage {
        Stage::Storage
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let source = context.source_path();
        let bytes = tokio::fs::read(source).await.map_err(|error| {
            PipelineError::Validation(format!("cannot read {}: {error}", source.display()))
        })?;
        let (digest, path) = self.put_object(&bytes).await?;
        let mut artifacts = vec![
            NewArtifact::new(document_id, ArtifactKind::StoredObject, METHOD).payload(json!({
                "role": "source",
                "sha256": digest,
                "object_path": path.display().to_string(),
                "original": source.display().to_string(),
                "bytes": bytes.len(),
            })),
        ];

        let images = self
            .store
            .list_artifacts(document_id, ArtifactKind::Image)
            .await?;
        let mut failed = Vec::new();
        for image in &images {
            let Some(reference) = image.payload_str("path") else {
                failed.push(image.id.to_string());
                continue;
            };
            let original = resolve_image(source, reference);
            let bytes = match tokio::fs::read(&original).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::warn!(
                        document_id = %document_id,
                        image = %original.display(),
                        %error,
                        "Image file missing; not stored"
                    );
                    failed.push(image.id.to_string());
                    continue;
                }
            };
            let (digest, path) = self.put_object(&bytes).await?;
            let mut artifact = NewArtifact::new(document_id, ArtifactKind::StoredObject, METHOD)
                .payload(json!({
                    "role": "image",
                    "image_id": image.id,
                    "sha256": digest,
                    "object_path": path.display().to_string(),
                    "original": original.display().to_string(),
                    "bytes": bytes.len(),
                }));
            if let Some(page) = image.page {
                artifact = artifact.page(page);
            }
            artifacts.push(artifact);
        }

        let written =
            replace_artifacts(self.store.as_ref(), document_id, self.stage(), METHOD, artifacts)
                .await?;
        tracing::info!(
            document_id = %document_id,
            objects = written,
            missing_images = failed.len(),
            "Stored document objects"
        );
        let data = json!({ "objects": written, "missing_images": failed.len() });
        if failed.is_empty() {
            Ok(ProcessingResult::ok(data))
        } else {
            Ok(ProcessingResult::partial(data, failed, images.len() + 1))
        }
    }
}
