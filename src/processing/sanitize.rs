//! Helpers for normalizing extracted text before it is stored and embedded.

use super::types::PreparedChunk;
use crate::store::ChunkType;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::LazyLock;

static HYPHEN_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\p{L})-\n\s*(\p{Ll})").expect("hyphen break pattern"));
static PROCEDURE_STEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(step\s+\d+|\d+[.)]\s+\p{L})").expect("procedure step pattern")
});
static ERROR_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|fault|alarm)\s+(code\s+)?[A-Z]?\d{2,}(-\d+)?\b")
        .expect("error code pattern")
});
static MEASUREMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d+(\.\d+)?\s?(mm|cm|kg|g|v|vac|vdc|a|ma|w|hz|khz|°c|psi|bar|rpm|ppm)\b")
        .expect("measurement pattern")
});

/// Trim whitespace and drop empty strings.
pub fn sanitize_string(value: Option<String>) -> Option<String> {
    value.and_then(|input| {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Normalize chunk text: rejoin hyphenated line breaks, drop control characters, collapse runs of
/// whitespace to single spaces.
pub fn clean_text(text: &str) -> String {
    let joined = HYPHEN_BREAK.replace_all(text, "$1$2");
    joined
        .split(|c: char| c.is_whitespace() || (c.is_control() && c != '\n'))
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 hex digest of normalized chunk text.
pub fn chunk_hash(cleaned_text: &str) -> String {
    hex::encode(Sha256::digest(cleaned_text.as_bytes()))
}

/// Clean `(page, text)` chunks and remove duplicates within a document, keeping the first
/// occurrence.
///
/// Returns the surviving chunks and how many duplicates were skipped. Chunks that clean down to
/// nothing are dropped without counting as duplicates.
pub fn dedupe_chunks(chunks: Vec<(u32, String)>) -> (Vec<PreparedChunk>, usize) {
    let mut seen = HashSet::new();
    let mut prepared = Vec::new();
    let mut skipped = 0;

    for (page, raw_text) in chunks {
        let cleaned_text = clean_text(&raw_text);
        if cleaned_text.is_empty() {
            continue;
        }
        let hash = chunk_hash(&cleaned_text);
        if seen.insert(hash.clone()) {
            prepared.push(PreparedChunk {
                page,
                raw_text,
                cleaned_text,
                chunk_hash: hash,
            });
        } else {
            skipped += 1;
        }
    }

    (prepared, skipped)
}

/// Coarse content class of a chunk.
///
/// `raw_text` keeps line structure, which the table and procedure checks rely on.
pub fn classify_chunk(raw_text: &str) -> ChunkType {
    let table_rows = raw_text
        .lines()
        .filter(|line| line.trim_start().starts_with('|'))
        .count();
    if table_rows >= 2 {
        return ChunkType::Table;
    }
    if ERROR_CODE.is_match(raw_text) {
        return ChunkType::ErrorCode;
    }
    if PROCEDURE_STEP.find_iter(raw_text).count() >= 2 {
        return ChunkType::Procedure;
    }
    if MEASUREMENT.find_iter(raw_text).count() >= 2 {
        return ChunkType::Specification;
    }
    ChunkType::General
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_string_trims_and_drops_empty() {
        assert_eq!(sanitize_string(Some("  Acme  ".into())), Some("Acme".into()));
        assert_eq!(sanitize_string(Some("   ".into())), None);
        assert_eq!(sanitize_string(None), None);
    }

    #[test]
    fn clean_text_rejoins_hyphenation_and_collapses_whitespace() {
        assert_eq!(
            clean_text("Replace the main-\n  tenance kit\t\tevery   100k pages.\n"),
            "Replace the maintenance kit every 100k pages."
        );
    }

    #[test]
    fn dedupe_chunks_removes_duplicates_and_counts_skips() {
        let chunks = vec![
            (1, "alpha".to_string()),
            (1, "beta".to_string()),
            (2, " alpha ".to_string()),
            (3, "beta".to_string()),
            (3, "   ".to_string()),
        ];
        let (deduped, skipped) = dedupe_chunks(chunks);
        let texts: Vec<_> = deduped.iter().map(|chunk| chunk.cleaned_text.as_str()).collect();
        assert_eq!(texts, vec!["alpha", "beta"]);
        assert!(deduped.iter().all(|chunk| chunk.page == 1));
        assert_eq!(skipped, 2);
        assert_ne!(deduped[0].chunk_hash, deduped[1].chunk_hash);
    }

    #[test]
    fn classify_chunk_detects_content_classes() {
        assert_eq!(classify_chunk("| Code | Meaning |\n| E01 | Jam |"), ChunkType::Table);
        assert_eq!(
            classify_chunk("Error code E045 indicates a fuser fault."),
            ChunkType::ErrorCode
        );
        assert_eq!(
            classify_chunk("1. Open the front cover.\n2. Remove the drum unit."),
            ChunkType::Procedure
        );
        assert_eq!(
            classify_chunk("Input 220 VAC, 50 Hz. Weight 42 kg."),
            ChunkType::Specification
        );
        assert_eq!(classify_chunk("Thank you for choosing us."), ChunkType::General);
    }
}
