//! Classification stage: manufacturer, document type and version on the document row.

use super::load_pages;
use crate::extraction::PageText;
use crate::pipeline::{PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor};
use crate::processing::sanitize::sanitize_string;
use crate::store::{Classification, Document, DocumentStore, DocumentUpdate, Store};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};

/// Decides what a document is.
#[async_trait]
pub trait DocumentClassifier: Send + Sync {
    /// Classify `document` from its extracted pages.
    async fn classify(
        &self,
        document: &Document,
        pages: &[PageText],
    ) -> Result<Classification, PipelineError>;
}

/// Pages inspected by the heuristic classifier.
const LEADING_PAGES: usize = 3;

const MANUFACTURERS: &[&str] = &[
    "Brother", "Canon", "Epson", "Fujifilm", "HP", "Konica Minolta", "Kyocera", "Lexmark",
    "Ricoh", "Sharp", "Toshiba", "Xerox",
];

const DOCUMENT_TYPES: &[(&str, &str)] = &[
    ("service manual", "service_manual"),
    ("parts catalog", "parts_catalog"),
    ("parts list", "parts_catalog"),
    ("installation guide", "installation_guide"),
    ("user guide", "user_manual"),
    ("operator", "user_manual"),
    ("bulletin", "service_bulletin"),
];

static VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:version|revision|rev\.?)\s*[:#]?\s*([A-Z0-9][A-Z0-9._-]*)")
        .expect("version pattern")
});

/// Keyword classifier over the first pages; upload metadata `manufacturer` wins when present.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

#[async_trait]
impl DocumentClassifier for HeuristicClassifier {
    async fn classify(
        &self,
        document: &Document,
        pages: &[PageText],
    ) -> Result<Classification, PipelineError> {
        let head: String = pages
            .iter()
            .take(LEADING_PAGES)
            .map(|page| page.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let lower = head.to_lowercase();

        let manufacturer = sanitize_string(
            document
                .metadata
                .get("manufacturer")
                .and_then(|value| value.as_str())
                .map(str::to_string),
        )
        .or_else(|| {
            MANUFACTURERS
                .iter()
                .find(|name| contains_word(&lower, &name.to_lowercase()))
                .map(|name| name.to_string())
        });
        let document_type = DOCUMENT_TYPES
            .iter()
            .find(|(keyword, _)| lower.contains(keyword))
            .map_or("technical_document", |(_, kind)| kind)
            .to_string();
        let version = VERSION
            .captures(&head)
            .map(|captures| captures[1].trim_end_matches('.').to_string());

        Ok(Classification {
            manufacturer,
            document_type,
            version,
        })
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + word.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Writes the classifier's verdict onto the document.
pub struct ClassificationProcessor {
    store: Arc<dyn Store>,
    classifier: Arc<dyn DocumentClassifier>,
}

impl ClassificationProcessor {
    /// Processor writing to `store` using `classifier`.
    pub fn new(store: Arc<dyn Store>, classifier: Arc<dyn DocumentClassifier>) -> Self {
        Self { store, classifier }
    }
}

#[async_trait]
impl StageProcessor for ClassificationProcessor {
    fn stage(&self) -> Stage {
        Stage::Classification
    }

    async fn process(&self, context: &ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let document_id = context.document_id();
        let pages = load_pages(self.store.as_ref(), document_id).await?;
        let classification = self.classifier.classify(&context.document, &pages).await?;
        if classification.document_type.trim().is_empty() {
            return Err(PipelineError::Validation(
                "classifier returned an empty document type".to_string(),
            ));
        }
        self.store
            .update_document(
                document_id,
                DocumentUpdate {
                    classification: Some(classification.clone()),
                    ..DocumentUpdate::default()
                },
            )
            .await?;
        tracing::info!(
            document_id = %document_id,
            manufacturer = ?classification.manufacturer,
            document_type = %classification.document_type,
            version = ?classification.version,
            "Document classified"
        );
        Ok(ProcessingResult::ok(json!(classification)))
    }
}
