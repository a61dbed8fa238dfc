//! Token-budgeted semantic chunking for page text.
//!
//! The budget is `TEXT_SPLITTER_CHUNK_SIZE` when set. Otherwise it is a quarter of the embedding
//! model's context window, kept within `[256, 1024]` tokens. Adjacent chunks of a page may share
//! `TEXT_SPLITTER_CHUNK_OVERLAP` tokens. Tokens are counted with `tiktoken-rs` where the model has
//! a known encoding and by whitespace-separated words otherwise.

use super::types::ChunkingError;
use crate::config::EmbeddingProvider;
use semchunk_rs::Chunker;
use std::sync::Arc;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, model::get_context_size, o200k_base, p50k_base,
    p50k_edit, r50k_base,
};

const AUTO_BUDGET_FLOOR: usize = 256;
const AUTO_BUDGET_CEILING: usize = 1024;
/// Split points tried, coarsest first, when a piece exceeds the budget.
const BREAKS: [&str; 3] = ["\n\n", "\n", " "];

/// Chunk budget in tokens: the explicit size when given (at least 1), else derived from the
/// model's context window.
pub fn chunk_budget(explicit: Option<usize>, provider: EmbeddingProvider, model: &str) -> usize {
    match explicit {
        Some(size) => size.max(1),
        None => (context_window(provider, model) / 4).clamp(AUTO_BUDGET_FLOOR, AUTO_BUDGET_CEILING),
    }
}

/// Context window of the embedding model, in tokens.
pub fn context_window(provider: EmbeddingProvider, model: &str) -> usize {
    let model = model.trim().to_lowercase();
    match provider {
        EmbeddingProvider::Hash => 2048,
        EmbeddingProvider::OpenAI
            if model.starts_with("text-embedding-3") || model == "text-embedding-ada-002" =>
        {
            8192
        }
        EmbeddingProvider::OpenAI => get_context_size(&model),
        EmbeddingProvider::Ollama => {
            if ["nomic-embed-text", "mxbai-embed-large", "bge-m3"]
                .iter()
                .any(|known| model.starts_with(known))
            {
                8192
            } else if model.contains("all-minilm") {
                512
            } else if model.contains("e5-large") {
                4096
            } else {
                tracing::trace!(model, "No context window on record; assuming 4096");
                4096
            }
        }
    }
}

#[derive(Clone)]
enum Tokenizer {
    Bpe(Arc<CoreBPE>),
    Words,
}

impl Tokenizer {
    fn count(&self, text: &str) -> usize {
        match self {
            Self::Bpe(bpe) => bpe.encode_ordinary(text).len(),
            // Non-empty text is never free, or the chunker could pack whitespace runs forever.
            Self::Words => match text.split_whitespace().count() {
                0 if !text.is_empty() => 1,
                words => words,
            },
        }
    }
}

/// Splits page text into chunks of at most `budget` tokens.
#[derive(Clone)]
pub struct PageChunker {
    budget: usize,
    overlap: usize,
    tokenizer: Tokenizer,
}

impl PageChunker {
    /// Chunker sized and tokenized for an embedding model.
    ///
    /// OpenAI models must resolve to a tiktoken encoding. Ollama models that do not fall back to
    /// word counting; the hashing embedder always counts words.
    pub fn for_model(
        provider: EmbeddingProvider,
        model: &str,
        explicit_budget: Option<usize>,
        overlap: usize,
    ) -> Result<Self, ChunkingError> {
        let budget = chunk_budget(explicit_budget, provider, model);
        let tokenizer = match provider {
            EmbeddingProvider::Hash => Tokenizer::Words,
            EmbeddingProvider::OpenAI => Tokenizer::Bpe(Arc::new(bpe_for(model)?)),
            EmbeddingProvider::Ollama => match bpe_for(model) {
                Ok(bpe) => Tokenizer::Bpe(Arc::new(bpe)),
                Err(error) => {
                    tracing::warn!(model, %error, "Counting words instead of BPE tokens");
                    Tokenizer::Words
                }
            },
        };
        Self::build(budget, overlap, tokenizer)
    }

    /// Chunker counting whitespace-separated words.
    pub fn with_word_counter(budget: usize, overlap: usize) -> Result<Self, ChunkingError> {
        Self::build(budget, overlap, Tokenizer::Words)
    }

    fn build(budget: usize, overlap: usize, tokenizer: Tokenizer) -> Result<Self, ChunkingError> {
        if budget == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        Ok(Self {
            budget,
            overlap: overlap.min(budget - 1),
            tokenizer,
        })
    }

    /// Token budget per chunk.
    pub const fn budget(&self) -> usize {
        self.budget
    }

    /// Tokens in `text` as this chunker counts them.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    /// Semantic chunks of `text`, each within the budget; blank text yields nothing.
    ///
    /// Pieces the semantic splitter returns over budget are re-split at paragraph, line and word
    /// breaks, in that order.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let tokenizer = self.tokenizer.clone();
        let chunker = Chunker::new(
            self.budget,
            Box::new(move |segment: &str| tokenizer.count(segment)),
        );
        let mut pieces = Vec::new();
        for piece in chunker.chunk(text) {
            self.fit_to_budget(&piece, 0, &mut pieces);
        }
        if self.overlap == 0 {
            return pieces;
        }

        let mut chunks = Vec::with_capacity(pieces.len());
        let mut previous: Option<String> = None;
        for piece in pieces {
            let chunk = match previous.as_deref() {
                None => piece.clone(),
                Some(previous) => self.prepend_tail(previous, &piece),
            };
            chunks.push(chunk);
            previous = Some(piece);
        }
        chunks
    }

    /// Push `text` as one chunk when it fits, otherwise greedily regroup its parts split at
    /// `BREAKS[level]`, descending to finer breaks for parts that still do not fit.
    fn fit_to_budget(&self, text: &str, level: usize, out: &mut Vec<String>) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.count_tokens(text) <= self.budget {
            out.push(text.to_string());
            return;
        }
        let Some(separator) = BREAKS.get(level) else {
            self.split_chars(text, out);
            return;
        };

        let mut current = String::new();
        for part in text.split(separator).map(str::trim).filter(|part| !part.is_empty()) {
            let candidate = if current.is_empty() {
                part.to_string()
            } else {
                format!("{current}{separator}{part}")
            };
            if self.count_tokens(&candidate) <= self.budget {
                current = candidate;
                continue;
            }
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            if self.count_tokens(part) <= self.budget {
                current = part.to_string();
            } else {
                self.fit_to_budget(part, level + 1, out);
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
    }

    /// Last resort for a single word longer than the budget.
    fn split_chars(&self, word: &str, out: &mut Vec<String>) {
        let mut current = String::new();
        for ch in word.chars() {
            current.push(ch);
            if current.chars().count() > 1 && self.count_tokens(&current) > self.budget {
                current.pop();
                out.push(std::mem::take(&mut current));
                current.push(ch);
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
    }

    /// `piece` preceded by up to `overlap` tokens from the end of `previous`, cut back to budget.
    fn prepend_tail(&self, previous: &str, piece: &str) -> String {
        let tail = self.suffix_within(previous, self.overlap);
        if tail.is_empty() {
            return piece.to_string();
        }
        let separator = if tail.ends_with(char::is_whitespace) || piece.starts_with(char::is_whitespace)
        {
            ""
        } else {
            " "
        };
        let joined = format!("{tail}{separator}{piece}");
        match self.suffix_within(&joined, self.budget) {
            "" => piece.to_string(),
            fitted => fitted.to_string(),
        }
    }

    /// Longest word-aligned suffix of `text` counting at most `limit` tokens.
    fn suffix_within<'a>(&self, text: &'a str, limit: usize) -> &'a str {
        if limit == 0 {
            return "";
        }
        let mut rest = text.trim_start();
        while self.tokenizer.count(rest) > limit {
            match rest.find(char::is_whitespace) {
                Some(cut) => rest = rest[cut..].trim_start(),
                None => return "",
            }
        }
        rest
    }
}

/// Encoding for `model`: by model name, then by encoding name, then `cl100k_base`.
fn bpe_for(model: &str) -> Result<CoreBPE, ChunkingError> {
    let model = model.trim();
    let resolved = get_bpe_from_model(model).or_else(|lookup_error| {
        tracing::debug!(model, error = %lookup_error, "Model has no registered encoding");
        match model {
            "o200k_base" => o200k_base(),
            "p50k_base" => p50k_base(),
            "p50k_edit" => p50k_edit(),
            "r50k_base" | "gpt2" => r50k_base(),
            _ => cl100k_base(),
        }
    });
    resolved.map_err(|source| ChunkingError::Tokenizer {
        model: model.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(budget: usize, overlap: usize) -> PageChunker {
        PageChunker::with_word_counter(budget, overlap).unwrap()
    }

    #[test]
    fn splits_within_the_word_budget() {
        let chunks = words(2, 0).split("one two three four five");
        assert_eq!(chunks, vec!["one two", "three four", "five"]);
    }

    #[test]
    fn blank_page_yields_no_chunks() {
        assert!(words(4, 0).split("  \n ").is_empty());
    }

    #[test]
    fn overlap_carries_the_previous_tail() {
        let chunker = words(3, 1);
        let chunks = chunker.split("one two three four five");
        assert_eq!(chunks, vec!["one two three", "three four five"]);
        assert!(chunks.iter().all(|chunk| chunker.count_tokens(chunk) <= 3));
    }

    #[test]
    fn overlap_never_reaches_the_whole_budget() {
        let chunker = words(2, 5);
        for chunk in chunker.split("alpha beta gamma delta epsilon") {
            assert!(chunker.count_tokens(&chunk) <= 2);
        }
    }

    #[test]
    fn oversized_page_breaks_at_paragraphs_first() {
        let chunker = words(10, 0);
        let chunks =
            chunker.split("Remove the rear cover.\n\nError code E045 means the fuser is cold.");
        assert_eq!(
            chunks,
            vec!["Remove the rear cover.", "Error code E045 means the fuser is cold."]
        );
    }

    #[test]
    fn long_word_is_cut_to_the_token_budget() {
        let word = "Pneumonoultramicroscopicsilicovolcanoconiosis";
        let chunker =
            PageChunker::for_model(EmbeddingProvider::OpenAI, "text-embedding-3-small", Some(2), 0)
                .unwrap();
        let chunks = chunker.split(word);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|chunk| chunker.count_tokens(chunk) <= 2));
        assert_eq!(chunks.concat(), word);
    }

    #[test]
    fn zero_budget_is_rejected() {
        assert!(matches!(
            PageChunker::with_word_counter(0, 0),
            Err(ChunkingError::InvalidChunkSize)
        ));
    }

    #[test]
    fn bpe_chunks_stay_within_budget_and_keep_every_word() {
        let text = "Remove the four screws that hold the rear panel before lifting the fuser unit.";
        let chunker = PageChunker::for_model(
            EmbeddingProvider::OpenAI,
            "text-embedding-3-small",
            Some(5),
            0,
        )
        .unwrap();
        let chunks = chunker.split(text);
        assert!(chunks.iter().all(|chunk| chunker.count_tokens(chunk) <= 5));
        let rejoined: Vec<&str> = chunks.iter().flat_map(|chunk| chunk.split_whitespace()).collect();
        assert_eq!(rejoined, text.split_whitespace().collect::<Vec<_>>());
    }

    #[test]
    fn explicit_budget_wins() {
        assert_eq!(
            chunk_budget(Some(42), EmbeddingProvider::OpenAI, "text-embedding-3-small"),
            42
        );
        assert_eq!(chunk_budget(Some(0), EmbeddingProvider::Hash, "hash-v1"), 1);
    }

    #[test]
    fn automatic_budget_follows_the_context_window() {
        assert_eq!(
            chunk_budget(None, EmbeddingProvider::OpenAI, "text-embedding-3-small"),
            1024
        );
        assert_eq!(
            chunk_budget(None, EmbeddingProvider::Ollama, "all-minilm-l6-v2"),
            256
        );
        assert_eq!(chunk_budget(None, EmbeddingProvider::Hash, "hash-v1"), 512);
    }
}
