//! Text preparation: token-budgeted chunking, cleaning and duplicate removal.

pub mod chunking;
pub mod sanitize;
pub mod types;

pub use types::{ChunkingError, PreparedChunk};
