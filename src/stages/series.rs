//! Series detection: product series named in the manual, linked back onto the parts.

use super::{load_chunks, replace_artifacts};
use crate::pipeline::{PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor};
use crate::processing::sanitize::sanitize_string;
use crate::store::{ArtifactKind, ArtifactStore, NewArtifact, Store};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};

const METHOD: &str = "pattern";

static SERIES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][A-Za-z]*\s)?([A-Z]{0,3}\d{2,5}[A-Za-z]{0,3})\s+[Ss]eries\b")
        .expect("series pattern")
});

const LEADING_STOPWORDS: &[&str] = &["A", "All", "An", "For", "Our", "The", "This"];

/// Detects product series and patches part artifacts with the primary one.
pub struct SeriesDetectionProcessor {
    store: Arc<dyn Store>,
}

impl SeriesDetectionProcessor {
    /// Processor writing to `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

/// Series names in order of first mention with their mention counts.
fn detect_series<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<(String, usize)> {
    let mut found: Vec<(String, usize)> = Vec::new();
    for text in texts {
        for captures in SERIES.captures_iter(text) {
            let family = captures
                .get(1)
                .map(|family| family.as_str().trim())
                .filter(|family| !LEADING_STOPWORDS.contains(family));
            let name = match family {
                Some(family) => format!("{family} {}", &captures[2]),
                None => captures[2].to_string(),
            };
            match found.iter_mut().find(|(existing, _)| *existing == name) {
                Some((_, count)) => *count += 1,
                None => found.push((name, 1)),
            }
        }
    }
    found
}

#[async_trait]
impl StageProcessor for SeriesDetectionProcessor {
    fn stage(&self) -> Stage {
        Stage::SeriesDetection
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let chunks = load_chunks(self.store.as_ref(), document_id).await?;
        let mut series = detect_series(chunks.iter().map(|chunk| chunk.raw_text.as_str()));
        if series.is_empty() {
            let declared = context
                .document
                .metadata
                .get("series")
                .and_then(|value| value.as_str())
                .map(str::to_string);
            if let Some(name) = sanitize_string(declared) {
                series.push((name, 0));
            }
        }

        let manufacturer = context.document.manufacturer.clone();
        let primary = series
            .iter()
            .enumerate()
            .max_by(|(left_index, left), (right_index, right)| {
                left.1.cmp(&right.1).then(right_index.cmp(left_index))
            })
            .map(|(_, (name, _))| name.clone());
        let artifacts = series
            .iter()
            .map(|(name, mentions)| {
                NewArtifact::new(document_id, ArtifactKind::ProductSeries, METHOD)
                    .confidence(if *mentions > 0 { 0.8 } else { 0.5 })
                    .payload(json!({
                        "name": name,
                        "manufacturer": manufacturer,
                        "mentions": mentions,
                        "primary": Some(name) == primary.as_ref(),
                    }))
            })
            .collect();
        let written =
            replace_artifacts(self.store.as_ref(), document_id, self.stage(), METHOD, artifacts)
                .await?;

        let mut patched = 0;
        if let Some(primary) = &primary {
            for part in self
                .store
                .list_artifacts(document_id, ArtifactKind::Part)
                .await?
            {
                self.store
                    .patch_artifact(part.id, json!({ "series": primary }))
                    .await?;
                patched += 1;
            }
        }

        tracing::info!(
            document_id = %document_id,
            series = written,
            primary = ?primary,
            patched_parts = patched,
            "Detected product series"
        );
        Ok(ProcessingResult::ok(json!({
            "series": written,
            "primary": primary,
            "patched_parts": patched,
        })))
    }
}
