//! Error and value types for text preparation.

use anyhow::Error as TokenizerError;
use thiserror::Error;

/// Errors produced while turning page text into semantic chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Configured an impossible token budget.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Tokenizer resources were unavailable for the configured model.
    #[error("failed to initialize tokenizer for model '{model}': {source}")]
    Tokenizer {
        /// Embedding model we attempted to load.
        model: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: TokenizerError,
    },
}

/// Chunk text with its dedupe digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedChunk {
    /// Page the chunk came from.
    pub page: u32,
    /// Text as produced by the chunker.
    pub raw_text: String,
    /// Whitespace-normalized text.
    pub cleaned_text: String,
    /// SHA-256 of the cleaned text.
    pub chunk_hash: String,
}
