//! Cosine similarity and deterministic ranking shared by the store implementations.

use super::types::ScoredChunk;

/// Cosine similarity of two vectors; `0.0` for mismatched lengths or zero vectors.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut left_norm = 0.0_f32;
    let mut right_norm = 0.0_f32;
    for (a, b) in left.iter().zip(right) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Sort by score descending, break ties by chunk index then document id, and keep `top_k`.
pub fn rank_scored_chunks(mut hits: Vec<ScoredChunk>, top_k: usize) -> Vec<ScoredChunk> {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.index.cmp(&b.index))
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    hits.truncate(top_k);
    hits
}
