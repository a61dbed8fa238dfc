//! Stage identifiers, their fixed execution order and declared dependencies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::PipelineError;
use crate::store::ArtifactKind;

/// A named unit of document processing.
///
/// Declaration order is the fixed pipeline order; every dependency precedes its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Document row exists and its source is readable.
    Upload,
    /// Page text extracted from the source.
    TextExtraction,
    /// Manufacturer, document type and version detected.
    Classification,
    /// Tables extracted.
    TableExtraction,
    /// Vector graphics extracted.
    SvgProcessing,
    /// Raster images extracted.
    ImageProcessing,
    /// Image captions embedded.
    VisualEmbedding,
    /// Web and video links extracted.
    LinkExtraction,
    /// Page text split into typed chunks.
    ChunkPrep,
    /// Error codes found in chunks.
    MetadataExtraction,
    /// Spare parts found in chunks.
    PartsExtraction,
    /// Product series detected and parts annotated.
    SeriesDetection,
    /// Source and images copied into the object store.
    Storage,
    /// Chunk embeddings generated.
    Embedding,
    /// Document exposed to search.
    SearchIndexing,
}

impl Stage {
    /// Every stage in fixed pipeline order.
    pub const ALL: [Stage; 15] = [
        Stage::Upload,
        Stage::TextExtraction,
        Stage::Classification,
        Stage::TableExtraction,
        Stage::SvgProcessing,
        Stage::ImageProcessing,
        Stage::VisualEmbedding,
        Stage::LinkExtraction,
        Stage::ChunkPrep,
        Stage::MetadataExtraction,
        Stage::PartsExtraction,
        Stage::SeriesDetection,
        Stage::Storage,
        Stage::Embedding,
        Stage::SearchIndexing,
    ];

    /// Stable snake_case name.
    pub const fn name(self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::TextExtraction => "text_extraction",
            Stage::Classification => "classification",
            Stage::TableExtraction => "table_extraction",
            Stage::SvgProcessing => "svg_processing",
            Stage::ImageProcessing => "image_processing",
            Stage::VisualEmbedding => "visual_embedding",
            Stage::LinkExtraction => "link_extraction",
            Stage::ChunkPrep => "chunk_prep",
            Stage::MetadataExtraction => "metadata_extraction",
            Stage::PartsExtraction => "parts_extraction",
            Stage::SeriesDetection => "series_detection",
            Stage::Storage => "storage",
            Stage::Embedding => "embedding",
            Stage::SearchIndexing => "search_indexing",
        }
    }

    /// Stages that must be completed before this one may run.
    pub const fn dependencies(self) -> &'static [Stage] {
        match self {
            Stage::Upload => &[],
            Stage::TextExtraction => &[Stage::Upload],
            Stage::Classification
            | Stage::TableExtraction
            | Stage::SvgProcessing
            | Stage::ImageProcessing
            | Stage::LinkExtraction
            | Stage::ChunkPrep => &[Stage::TextExtraction],
            Stage::VisualEmbedding => &[Stage::ImageProcessing],
            Stage::MetadataExtraction | Stage::PartsExtraction => &[Stage::ChunkPrep],
            Stage::SeriesDetection => &[Stage::Classification, Stage::PartsExtraction],
            Stage::Storage => &[Stage::ImageProcessing, Stage::SvgProcessing],
            Stage::Embedding => &[Stage::ChunkPrep],
            Stage::SearchIndexing => &[Stage::Embedding],
        }
    }

    /// Artifact kinds a manifest-backed stage writes; empty for stages judged by other evidence.
    pub const fn artifact_kinds(self) -> &'static [ArtifactKind] {
        match self {
            Stage::TextExtraction => &[ArtifactKind::Page],
            Stage::TableExtraction => &[ArtifactKind::Table],
            Stage::SvgProcessing => &[ArtifactKind::Svg],
            Stage::ImageProcessing => &[ArtifactKind::Image],
            Stage::LinkExtraction => &[ArtifactKind::Link, ArtifactKind::Video],
            Stage::MetadataExtraction => &[ArtifactKind::ErrorCode],
            Stage::PartsExtraction => &[ArtifactKind::Part],
            Stage::SeriesDetection => &[ArtifactKind::ProductSeries],
            Stage::Storage => &[ArtifactKind::StoredObject],
            Stage::Upload
            | Stage::Classification
            | Stage::VisualEmbedding
            | Stage::ChunkPrep
            | Stage::Embedding
            | Stage::SearchIndexing => &[],
        }
    }

    /// Gating stages stop the full and smart pipelines when they fail.
    pub const fn is_gating(self) -> bool {
        matches!(
            self,
            Stage::Upload | Stage::TextExtraction | Stage::Classification
        )
    }

    /// Parse a stage name, mapping unknown names to a configuration error.
    pub fn parse(name: &str) -> Result<Self, PipelineError> {
        name.parse()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == wanted)
            .ok_or_else(|| PipelineError::Configuration(format!("unknown stage '{value}'")))
    }
}
