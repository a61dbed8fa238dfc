//! Structural extraction stages: tables, vector graphics, images and links.
//!
//! All four read the page artifacts written by text extraction and are independent of each
//! other, so any of them can fail without blocking the rest.

use super::{load_pages, replace_artifacts};
use crate::extraction::ExtractionClient;
use crate::pipeline::{PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor};
use crate::store::{ArtifactKind, DocumentId, NewArtifact, Store};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

macro_rules! extraction_processor {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name {
            store: Arc<dyn Store>,
            extraction: Arc<dyn ExtractionClient>,
        }

        impl $name {
            /// Processor writing to `store` through `extraction`.
            pub fn new(store: Arc<dyn Store>, extraction: Arc<dyn ExtractionClient>) -> Self {
                Self { store, extraction }
            }
        }
    };
}

extraction_processor!(
    /// Extracts tables into `table` artifacts.
    TableExtractionProcessor
);
extraction_processor!(
    /// Extracts vector graphics into `svg` artifacts.
    SvgProcessor
);
extraction_processor!(
    /// Extracts raster image references into `image` artifacts.
    ImageProcessor
);
extraction_processor!(
    /// Extracts web and video links into `link` and `video` artifacts.
    LinkExtractionProcessor
);

async fn finish(
    store: &dyn Store,
    document_id: DocumentId,
    stage: Stage,
    method: &str,
    artifacts: Vec<NewArtifact>,
) -> Result<ProcessingResult, PipelineError> {
    let written = replace_artifacts(store, document_id, stage, method, artifacts).await?;
    tracing::info!(document_id = %document_id, stage = %stage, items = written, "Extraction finished");
    Ok(ProcessingResult::ok(json!({ "items": written, "method": method })))
}

#[async_trait]
impl StageProcessor for TableExtractionProcessor {
    fn stage(&self) -> Stage {
        Stage::TableExtraction
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let pages = load_pages(self.store.as_ref(), document_id).await?;
        let method = self.extraction.method();
        let artifacts = self
            .extraction
            .extract_tables(&pages)
            .await?
            .into_iter()
            .map(|table| {
                let columns = table.rows.iter().map(Vec::len).max().unwrap_or(0);
                let mut artifact = NewArtifact::new(document_id, ArtifactKind::Table, method)
                    .page(table.page)
                    .payload(json!({
                        "rows": table.rows,
                        "row_count": table.rows.len(),
                        "column_count": columns,
                    }));
                if let Some(caption) = table.context {
                    artifact = artifact.context(caption);
                }
                artifact
            })
            .collect();
        finish(self.store.as_ref(), document_id, self.stage(), method, artifacts).await
    }
}

#[async_trait]
impl StageProcessor for SvgProcessor {
    fn stage(&self) -> Stage {
        Stage::SvgProcessing
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let pages = load_pages(self.store.as_ref(), document_id).await?;
        let method = self.extraction.method();
        let artifacts = self
            .extraction
            .extract_svgs(&pages)
            .await?
            .into_iter()
            .map(|svg| {
                let mut artifact = NewArtifact::new(document_id, ArtifactKind::Svg, method)
                    .page(svg.page)
                    .payload(json!({ "markup": svg.markup, "title": svg.title }));
                if let Some(title) = svg.title {
                    artifact = artifact.context(title);
                }
                artifact
            })
            .collect();
        finish(self.store.as_ref(), document_id, self.stage(), method, artifacts).await
    }
}

#[async_trait]
impl StageProcessor for ImageProcessor {
    fn stage(&self) -> Stage {
        Stage::ImageProcessing
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let pages = load_pages(self.store.as_ref(), document_id).await?;
        let method = self.extraction.method();
        let artifacts = self
            .extraction
            .extract_images(&pages)
            .await?
            .into_iter()
            .map(|image| {
                let artifact = NewArtifact::new(document_id, ArtifactKind::Image, method)
                    .page(image.page)
                    .payload(json!({ "path": image.path, "caption": image.caption }));
                if image.caption.is_empty() {
                    artifact.confidence(0.5)
                } else {
                    artifact.context(image.caption)
                }
            })
            .collect();
        finish(self.store.as_ref(), document_id, self.stage(), method, artifacts).await
    }
}

#[async_trait]
impl StageProcessor for LinkExtractionProcessor {
    fn stage(&self) -> Stage {
        Stage::LinkExtraction
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let pages = load_pages(self.store.as_ref(), document_id).await?;
        let method = self.extraction.method();
        let links = self.extraction.extract_links(&pages).await?;
        let videos = links.iter().filter(|link| link.is_video).count();
        let artifacts = links
            .into_iter()
            .map(|link| {
                let kind = if link.is_video {
                    ArtifactKind::Video
                } else {
                    ArtifactKind::Link
                };
                NewArtifact::new(document_id, kind, method)
                    .page(link.page)
                    .context(link.context)
                    .payload(json!({ "url": link.url }))
            })
            .collect();
        let mut result =
            finish(self.store.as_ref(), document_id, self.stage(), method, artifacts).await?;
        result.data["videos"] = json!(videos);
        Ok(result)
    }
}
