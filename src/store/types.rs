//! Row types shared by every store implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Identifier of a document row.
pub type DocumentId = Uuid;
/// Identifier of a chunk row.
pub type ChunkId = Uuid;
/// Identifier of a structured artifact row.
pub type ArtifactId = Uuid;
/// Identifier of an embedding record.
pub type EmbeddingId = Uuid;

/// Errors raised by store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Requested row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of row that was looked up.
        entity: &'static str,
        /// Identifier used for the lookup.
        id: String,
    },
    /// Write violated a uniqueness invariant.
    #[error("conflicting write: {0}")]
    Conflict(String),
    /// Backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// Database driver reported an error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// JSON payload failed to serialize or deserialize.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Raised when a persisted enum value cannot be parsed.
#[derive(Debug, Error)]
#[error("unknown {field} value '{value}'")]
pub struct UnknownVariant {
    field: &'static str,
    value: String,
}

macro_rules! string_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable string form used in storage and APIs.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(UnknownVariant {
                        field: $field,
                        value: value.to_string(),
                    }),
                }
            }
        }
    };
}

/// Lifecycle of a document across pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Row created by the upload collaborator; no run yet.
    Uploaded,
    /// A pipeline run currently owns the document.
    Processing,
    /// Every registered stage completed.
    Completed,
    /// At least one registered stage did not complete in the last run.
    Failed,
}

string_enum!(DocumentStatus, "document status", {
    Uploaded => "uploaded",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

/// A source manual tracked by the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Row identifier.
    pub id: DocumentId,
    /// Location of the uploaded file.
    pub source_path: String,
    /// SHA-256 of the file contents, used for duplicate detection.
    pub content_hash: String,
    /// Lifecycle status.
    pub status: DocumentStatus,
    /// Manufacturer detected by classification.
    pub manufacturer: Option<String>,
    /// Document type detected by classification.
    pub document_type: Option<String>,
    /// Revision or version string detected by classification.
    pub version: Option<String>,
    /// When classification last wrote to this row.
    #[serde(with = "time::serde::rfc3339::option")]
    pub classified_at: Option<OffsetDateTime>,
    /// Whether the document is exposed to query-time search.
    pub searchable: bool,
    /// When the searchable flag was last set.
    #[serde(with = "time::serde::rfc3339::option")]
    pub indexed_at: Option<OffsetDateTime>,
    /// Free-form metadata supplied at upload time.
    pub metadata: Value,
    /// Row creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last mutation time.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Insert payload for a document row.
#[derive(Debug, Clone)]
pub struct NewDocument {
    /// Location of the uploaded file.
    pub source_path: String,
    /// SHA-256 of the file contents.
    pub content_hash: String,
    /// Free-form metadata supplied at upload time.
    pub metadata: Value,
}

/// Partial update applied to a document row; `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct DocumentUpdate {
    /// New lifecycle status.
    pub status: Option<DocumentStatus>,
    /// Classification results; writing any of these stamps `classified_at`.
    pub classification: Option<Classification>,
    /// New searchable flag; `true` stamps `indexed_at`.
    pub searchable: Option<bool>,
}

impl DocumentUpdate {
    /// Update that only changes the lifecycle status.
    pub fn status(status: DocumentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Update that only changes the searchable flag.
    pub fn searchable(searchable: bool) -> Self {
        Self {
            searchable: Some(searchable),
            ..Self::default()
        }
    }
}

/// Result of document classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Detected manufacturer, if any.
    pub manufacturer: Option<String>,
    /// Detected document type.
    pub document_type: String,
    /// Detected revision string, if any.
    pub version: Option<String>,
}

/// Coarse content class assigned to each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    /// Step-by-step instructions.
    Procedure,
    /// Technical values and tolerances.
    Specification,
    /// Text derived from a table.
    Table,
    /// Section describing error or fault codes.
    ErrorCode,
    /// Anything else.
    General,
}

string_enum!(ChunkType, "chunk type", {
    Procedure => "procedure",
    Specification => "specification",
    Table => "table",
    ErrorCode => "error_code",
    General => "general",
});

/// Insert payload for a chunk row.
#[derive(Debug, Clone)]
pub struct NewChunk {
    /// Owning document.
    pub document_id: DocumentId,
    /// Position within the document.
    pub index: u32,
    /// First page covered by the chunk.
    pub page_start: u32,
    /// Last page covered by the chunk.
    pub page_end: u32,
    /// Text as produced by the chunker.
    pub raw_text: String,
    /// Normalized text used for embedding.
    pub cleaned_text: String,
    /// Content class.
    pub chunk_type: ChunkType,
    /// SHA-256 of the cleaned text.
    pub chunk_hash: String,
}

/// A contiguous slice of a document's normalized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Row identifier.
    pub id: ChunkId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Position within the document.
    pub index: u32,
    /// First page covered by the chunk.
    pub page_start: u32,
    /// Last page covered by the chunk.
    pub page_end: u32,
    /// Text as produced by the chunker.
    pub raw_text: String,
    /// Normalized text used for embedding.
    pub cleaned_text: String,
    /// Content class.
    pub chunk_type: ChunkType,
    /// SHA-256 of the cleaned text.
    pub chunk_hash: String,
    /// Row creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Chunk {
    pub(crate) fn from_new(id: ChunkId, chunk: NewChunk, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            document_id: chunk.document_id,
            index: chunk.index,
            page_start: chunk.page_start,
            page_end: chunk.page_end,
            raw_text: chunk.raw_text,
            cleaned_text: chunk.cleaned_text,
            chunk_type: chunk.chunk_type,
            chunk_hash: chunk.chunk_hash,
            created_at,
        }
    }
}

/// Kind of row an embedding vector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Text chunk.
    Chunk,
    /// Image artifact.
    Image,
}

string_enum!(TargetKind, "embedding target", {
    Chunk => "chunk",
    Image => "image",
});

/// Row an embedding vector was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EmbeddingTarget {
    /// Text chunk.
    Chunk(ChunkId),
    /// Image artifact.
    Image(ArtifactId),
}

impl EmbeddingTarget {
    /// Kind of the target row.
    pub const fn kind(self) -> TargetKind {
        match self {
            Self::Chunk(_) => TargetKind::Chunk,
            Self::Image(_) => TargetKind::Image,
        }
    }

    /// Identifier of the target row.
    pub const fn id(self) -> Uuid {
        match self {
            Self::Chunk(id) | Self::Image(id) => id,
        }
    }
}

/// Insert payload for an embedding record.
#[derive(Debug, Clone)]
pub struct NewEmbedding {
    /// Owning document.
    pub document_id: DocumentId,
    /// Row the vector describes.
    pub target: EmbeddingTarget,
    /// Model identifier (including version) that produced the vector.
    pub model: String,
    /// Vector values.
    pub vector: Vec<f32>,
}

/// Immutable vector tied to a chunk or image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Row identifier.
    pub id: EmbeddingId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Row the vector describes.
    pub target: EmbeddingTarget,
    /// Model identifier that produced the vector.
    pub model: String,
    /// Vector values.
    pub vector: Vec<f32>,
    /// Retired vectors no longer count as current.
    pub retired: bool,
    /// Row creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Kinds of structured artifacts produced by extraction stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Extracted page text.
    Page,
    /// Table.
    Table,
    /// Raster image.
    Image,
    /// Vector graphic.
    Svg,
    /// Web link.
    Link,
    /// Video link.
    Video,
    /// Error or fault code.
    ErrorCode,
    /// Spare part.
    Part,
    /// Product series.
    ProductSeries,
    /// File copied into the object store.
    StoredObject,
    /// Per-stage record of how many artifacts a run produced.
    Manifest,
}

string_enum!(ArtifactKind, "artifact kind", {
    Page => "page",
    Table => "table",
    Image => "image",
    Svg => "svg",
    Link => "link",
    Video => "video",
    ErrorCode => "error_code",
    Part => "part",
    ProductSeries => "product_series",
    StoredObject => "stored_object",
    Manifest => "manifest",
});

/// Insert payload for a structured artifact.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Owning document.
    pub document_id: DocumentId,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Page the artifact was found on.
    pub page: Option<u32>,
    /// Chunk the artifact was found in.
    pub chunk_id: Option<ChunkId>,
    /// Short surrounding text.
    pub context: Option<String>,
    /// Extraction method provenance.
    pub method: String,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f32,
    /// Kind-specific payload.
    pub payload: Value,
}

impl NewArtifact {
    /// Start an artifact with the mandatory fields.
    pub fn new(document_id: DocumentId, kind: ArtifactKind, method: impl Into<String>) -> Self {
        Self {
            document_id,
            kind,
            page: None,
            chunk_id: None,
            context: None,
            method: method.into(),
            confidence: 1.0,
            payload: Value::Null,
        }
    }

    /// Attach the page number.
    pub fn page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Attach the owning chunk.
    pub fn chunk(mut self, chunk_id: ChunkId) -> Self {
        self.chunk_id = Some(chunk_id);
        self
    }

    /// Attach a context snippet.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set the confidence score, clamped into `[0, 1]`.
    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Set the payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A structured artifact tied to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Row identifier.
    pub id: ArtifactId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Page the artifact was found on.
    pub page: Option<u32>,
    /// Chunk the artifact was found in.
    pub chunk_id: Option<ChunkId>,
    /// Short surrounding text.
    pub context: Option<String>,
    /// Extraction method provenance.
    pub method: String,
    /// Extraction confidence.
    pub confidence: f32,
    /// Kind-specific payload.
    pub payload: Value,
    /// Row creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Artifact {
    pub(crate) fn from_new(id: ArtifactId, artifact: NewArtifact, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            document_id: artifact.document_id,
            kind: artifact.kind,
            page: artifact.page,
            chunk_id: artifact.chunk_id,
            context: artifact.context,
            method: artifact.method,
            confidence: artifact.confidence,
            payload: artifact.payload,
            created_at,
        }
    }

    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Error taxonomy recorded with every pipeline error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown stage or missing processor.
    Configuration,
    /// Embedding or extraction service failed or timed out.
    UpstreamService,
    /// Persistence read or write failed.
    Store,
    /// Stage output was malformed or below quality.
    Validation,
    /// Some items of an otherwise successful stage failed.
    PartialFailure,
}

string_enum!(ErrorKind, "error kind", {
    Configuration => "configuration",
    UpstreamService => "upstream_service",
    Store => "store",
    Validation => "validation",
    PartialFailure => "partial_failure",
});

/// Insert payload for a pipeline error.
#[derive(Debug, Clone)]
pub struct NewPipelineError {
    /// Document the stage ran for.
    pub document_id: DocumentId,
    /// Stage name.
    pub stage: String,
    /// Error class.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Raised by a quality check against output that previously passed.
    pub quality_gate: bool,
}

/// Append-only record of a stage failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineErrorRecord {
    /// Row identifier.
    pub id: Uuid,
    /// Document the stage ran for.
    pub document_id: DocumentId,
    /// Stage name.
    pub stage: String,
    /// Error class.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Raised by a quality check.
    pub quality_gate: bool,
    /// Row creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Count and newest timestamp of a group of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coverage {
    /// Number of rows.
    pub count: u64,
    /// Newest `created_at` among the rows.
    pub latest_at: Option<OffsetDateTime>,
}

/// Aggregate counts used by search indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentCounts {
    /// Chunks owned by the document.
    pub chunks: u64,
    /// Chunks with a current embedding for the active model.
    pub embeddings: u64,
    /// Web links.
    pub links: u64,
    /// Video links.
    pub videos: u64,
    /// Tables.
    pub tables: u64,
    /// Images.
    pub images: u64,
}

impl DocumentCounts {
    /// Readiness rule: at least one chunk and every chunk embedded.
    pub const fn is_search_ready(&self) -> bool {
        self.chunks > 0 && self.embeddings >= self.chunks
    }
}

/// Optional metadata restrictions for similarity search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Restrict to a single document.
    #[serde(default)]
    pub document_id: Option<DocumentId>,
    /// Restrict to documents from one manufacturer (case-insensitive).
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Restrict to the given chunk types.
    #[serde(default)]
    pub chunk_types: Option<Vec<ChunkType>>,
}

/// Chunk returned by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    /// Chunk identifier.
    pub chunk_id: ChunkId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Position of the chunk within its document.
    pub index: u32,
    /// First page covered by the chunk.
    pub page_start: u32,
    /// Chunk content class.
    pub chunk_type: ChunkType,
    /// Cleaned chunk text.
    pub text: String,
    /// Cosine similarity with the query.
    pub score: f32,
}
