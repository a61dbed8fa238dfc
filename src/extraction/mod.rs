//! Extraction service clients.
//!
//! `extract_text` turns a source file into page texts; the structural extractors work on those
//! pages. [`LocalExtractionClient`] understands plain-text manuals (form feed separated pages,
//! pipe tables, markdown image references, inline `<svg>` blocks, bare URLs) and keeps the
//! pipeline runnable without a remote service. [`HttpExtractionClient`] delegates to a remote
//! extraction service that shares the upload directory.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by extraction backends.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Source file could not be read.
    #[error("failed to read source: {0}")]
    Io(#[from] std::io::Error),
    /// Extraction service could not be reached.
    #[error("extraction service unavailable: {0}")]
    Unavailable(String),
    /// Extraction ran but produced nothing usable.
    #[error("extraction failed: {0}")]
    Failed(String),
    /// Extraction service response could not be decoded.
    #[error("malformed extraction response: {0}")]
    InvalidResponse(String),
}

/// Text of one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageText {
    /// 1-based page number.
    pub number: u32,
    /// Page text.
    pub text: String,
}

/// Table found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedTable {
    /// Page number.
    pub page: u32,
    /// Cell values, header row first.
    pub rows: Vec<Vec<String>>,
    /// Line preceding the table, usually its caption.
    pub context: Option<String>,
}

/// Raster image referenced on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedImage {
    /// Page number.
    pub page: u32,
    /// Image location, relative to the source file when not absolute.
    pub path: String,
    /// Caption or OCR text.
    pub caption: String,
}

/// Vector graphic found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedSvg {
    /// Page number.
    pub page: u32,
    /// Raw SVG markup.
    pub markup: String,
    /// Contents of the `<title>` element, when present.
    pub title: Option<String>,
}

/// Web or video link found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedLink {
    /// Page number.
    pub page: u32,
    /// Normalized URL.
    pub url: String,
    /// Whether the link points at a video.
    pub is_video: bool,
    /// Line the link appeared on.
    pub context: String,
}

/// Interface implemented by extraction backends.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Provenance recorded on every artifact this backend produces.
    fn method(&self) -> &'static str;

    /// Extract page texts from the source file.
    async fn extract_text(&self, source: &Path) -> Result<Vec<PageText>, ExtractionError>;

    /// Extract tables from page texts.
    async fn extract_tables(&self, pages: &[PageText]) -> Result<Vec<ExtractedTable>, ExtractionError>;

    /// Extract raster image references from page texts.
    async fn extract_images(&self, pages: &[PageText]) -> Result<Vec<ExtractedImage>, ExtractionError>;

    /// Extract vector graphics from page texts.
    async fn extract_svgs(&self, pages: &[PageText]) -> Result<Vec<ExtractedSvg>, ExtractionError>;

    /// Extract web and video links from page texts.
    async fn extract_links(&self, pages: &[PageText]) -> Result<Vec<ExtractedLink>, ExtractionError>;
}

/// Build the extraction backend: remote when `base_url` is set, local otherwise.
pub fn build_extraction_client(
    base_url: Option<&str>,
    request_timeout: Duration,
) -> Result<Arc<dyn ExtractionClient>, ExtractionError> {
    match base_url {
        Some(url) => Ok(Arc::new(HttpExtractionClient::new(url, request_timeout)?)),
        None => Ok(Arc::new(LocalExtractionClient)),
    }
}

static IMAGE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").expect("image reference pattern")
});
static SVG_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<svg\b.*?</svg>").expect("svg block pattern"));
static SVG_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title>(.*?)</title>").expect("svg title pattern"));
static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>()\[\]"']+"#).expect("url pattern")
});

const VIDEO_HOSTS: &[&str] = &["youtube.com", "youtu.be", "vimeo.com"];
const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".webm", ".mov"];

/// Whether a URL points at a video.
pub fn is_video_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    VIDEO_HOSTS.iter().any(|host| lower.contains(host))
        || VIDEO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// In-process extraction for plain-text manuals.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalExtractionClient;

impl LocalExtractionClient {
    fn split_pages(content: &str) -> Vec<PageText> {
        content
            .split('\u{c}')
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(idx, text)| PageText {
                number: u32::try_from(idx + 1).unwrap_or(u32::MAX),
                text: text.to_string(),
            })
            .collect()
    }

    fn parse_tables(page: &PageText) -> Vec<ExtractedTable> {
        let mut tables = Vec::new();
        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut context: Option<String> = None;
        let mut last_text_line: Option<String> = None;

        let mut flush = |rows: &mut Vec<Vec<String>>, context: &mut Option<String>| {
            if rows.len() >= 2 {
                tables.push(ExtractedTable {
                    page: page.number,
                    rows: std::mem::take(rows),
                    context: context.take(),
                });
            }
            rows.clear();
            *context = None;
        };

        for line in page.text.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('|') {
                if rows.is_empty() {
                    context = last_text_line.clone();
                }
                let is_separator = trimmed
                    .chars()
                    .all(|c| matches!(c, '|' | '-' | ':' | ' ' | '+'));
                if !is_separator {
                    rows.push(
                        trimmed
                            .trim_matches('|')
                            .split('|')
                            .map(|cell| cell.trim().to_string())
                            .collect(),
                    );
                }
            } else {
                flush(&mut rows, &mut context);
                if !trimmed.is_empty() {
                    last_text_line = Some(trimmed.to_string());
                }
            }
        }
        flush(&mut rows, &mut context);
        tables
    }

    fn trim_url(raw: &str) -> &str {
        raw.trim_end_matches(['.', ',', ';', ':', '!', '?'])
    }
}

#[async_trait]
impl ExtractionClient for LocalExtractionClient {
    fn method(&self) -> &'static str {
        "local_text"
    }

    async fn extract_text(&self, source: &Path) -> Result<Vec<PageText>, ExtractionError> {
        let bytes = tokio::fs::read(source).await?;
        let content = String::from_utf8_lossy(&bytes);
        let pages = Self::split_pages(&content);
        if pages.is_empty() {
            return Err(ExtractionError::Failed(format!(
                "no text found in {}",
                source.display()
            )));
        }
        Ok(pages)
    }

    async fn extract_tables(&self, pages: &[PageText]) -> Result<Vec<ExtractedTable>, ExtractionError> {
        Ok(pages.iter().flat_map(Self::parse_tables).collect())
    }

    async fn extract_images(&self, pages: &[PageText]) -> Result<Vec<ExtractedImage>, ExtractionError> {
        Ok(pages
            .iter()
            .flat_map(|page| {
                IMAGE_REF.captures_iter(&page.text).map(|captures| ExtractedImage {
                    page: page.number,
                    path: captures[2].to_string(),
                    caption: captures[1].trim().to_string(),
                })
            })
            .collect())
    }

    async fn extract_svgs(&self, pages: &[PageText]) -> Result<Vec<ExtractedSvg>, ExtractionError> {
        Ok(pages
            .iter()
            .flat_map(|page| {
                SVG_BLOCK.find_iter(&page.text).map(|found| {
                    let markup = found.as_str().to_string();
                    let title = SVG_TITLE
                        .captures(&markup)
                        .map(|captures| captures[1].trim().to_string());
                    ExtractedSvg {
                        page: page.number,
                        markup,
                        title,
                    }
                })
            })
            .collect())
    }

    async fn extract_links(&self, pages: &[PageText]) -> Result<Vec<ExtractedLink>, ExtractionError> {
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for page in pages {
            for line in page.text.lines() {
                // Image references are handled by image extraction.
                let without_images = IMAGE_REF.replace_all(line, "");
                for found in URL.find_iter(&without_images) {
                    let url = Self::trim_url(found.as_str()).to_string();
                    if seen.insert(url.clone()) {
                        links.push(ExtractedLink {
                            page: page.number,
                            is_video: is_video_url(&url),
                            url,
                            context: line.trim().to_string(),
                        });
                    }
                }
            }
        }
        Ok(links)
    }
}

/// Client for a remote extraction service.
///
/// The service exposes `POST /extract/text` (`{"path": ..}` → `{"items": [PageText]}`) and
/// `POST /extract/{tables,images,svgs,links}` (`{"pages": [PageText]}` → `{"items": [..]}`).
pub struct HttpExtractionClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
struct ItemsResponse<T> {
    items: Vec<T>,
}

impl HttpExtractionClient {
    /// Construct a client for `base_url` whose requests give up after `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExtractionError> {
        let http = Client::builder()
            .user_agent("docpipe/extraction")
            .timeout(timeout)
            .build()
            .map_err(|error| ExtractionError::Unavailable(format!("http client: {error}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Vec<T>, ExtractionError> {
        let url = format!("{}/extract/{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|error| request_error(&url, &error))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Failed(format!("{url} returned {status}: {body}")));
        }

        let body: ItemsResponse<T> = response.json().await.map_err(|error| {
            if error.is_timeout() {
                request_error(&url, &error)
            } else {
                ExtractionError::InvalidResponse(format!("{url}: {error}"))
            }
        })?;
        Ok(body.items)
    }
}

fn request_error(url: &str, error: &reqwest::Error) -> ExtractionError {
    if error.is_timeout() {
        ExtractionError::Unavailable(format!("{url} timed out: {error}"))
    } else {
        ExtractionError::Unavailable(format!("{url}: {error}"))
    }
}

#[async_trait]
impl ExtractionClient for HttpExtractionClient {
    fn method(&self) -> &'static str {
        "remote_service"
    }

    async fn extract_text(&self, source: &Path) -> Result<Vec<PageText>, ExtractionError> {
        let pages: Vec<PageText> = self
            .post("text", json!({ "path": source.display().to_string() }))
            .await?;
        if pages.is_empty() {
            return Err(ExtractionError::Failed(format!(
                "service returned no pages for {}",
                source.display()
            )));
        }
        Ok(pages)
    }

    async fn extract_tables(&self, pages: &[PageText]) -> Result<Vec<ExtractedTable>, ExtractionError> {
        self.post("tables", json!({ "pages": pages })).await
    }

    async fn extract_images(&self, pages: &[PageText]) -> Result<Vec<ExtractedImage>, ExtractionError> {
        self.post("images", json!({ "pages": pages })).await
    }

    async fn extract_svgs(&self, pages: &[PageText]) -> Result<Vec<ExtractedSvg>, ExtractionError> {
        self.post("svgs", json!({ "pages": pages })).await
    }

    async fn extract_links(&self, pages: &[PageText]) -> Result<Vec<ExtractedLink>, ExtractionError> {
        self.post("links", json!({ "pages": pages })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use std::io::Write;

    fn page(number: u32, text: &str) -> PageText {
        PageText {
            number,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn splits_pages_on_form_feed_and_skips_blank_pages() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "Cover\u{c}\u{c}Chapter 1\nReplace the fuser").unwrap();

        let pages = LocalExtractionClient
            .extract_text(file.path())
            .await
            .expect("pages");
        let numbers: Vec<u32> = pages.iter().map(|page| page.number).collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[tokio::test]
    async fn empty_source_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let error = LocalExtractionClient
            .extract_text(file.path())
            .await
            .unwrap_err();
        assert!(matches!(error, ExtractionError::Failed(_)));
    }

    #[tokio::test]
    async fn parses_pipe_tables_with_caption() {
        let pages = [page(
            2,
            "Table 3: Error codes\n| Code | Meaning |\n|---|---|\n| C2557 | Toner low |\n\nAfter",
        )];
        let tables = LocalExtractionClient.extract_tables(&pages).await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].rows[1], vec!["C2557", "Toner low"]);
        assert_eq!(tables[0].context.as_deref(), Some("Table 3: Error codes"));
    }

    #[tokio::test]
    async fn finds_images_svgs_and_links() {
        let pages = [page(
            4,
            "See ![Fuser unit](img/fuser.png) and https://example.com/manual.\n\
             Video: https://www.youtube.com/watch?v=abc\n\
             <svg viewBox=\"0 0 1 1\"><title>Paper path</title></svg>",
        )];
        let client = LocalExtractionClient;

        let images = client.extract_images(&pages).await.unwrap();
        assert_eq!(images[0].path, "img/fuser.png");
        assert_eq!(images[0].caption, "Fuser unit");

        let svgs = client.extract_svgs(&pages).await.unwrap();
        assert_eq!(svgs[0].title.as_deref(), Some("Paper path"));

        let links = client.extract_links(&pages).await.unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url, "https://example.com/manual");
        assert!(!links[0].is_video);
        assert!(links[1].is_video);
    }

    #[tokio::test]
    async fn http_client_posts_pages() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/extract/links");
                then.status(200).json_body(json!({
                    "items": [{
                        "page": 1,
                        "url": "https://vimeo.com/1",
                        "is_video": true,
                        "context": "watch"
                    }]
                }));
            })
            .await;
        let client = HttpExtractionClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();

        let links = client.extract_links(&[page(1, "watch")]).await.unwrap();
        mock.assert();
        assert!(links[0].is_video);
    }

    #[tokio::test]
    async fn http_errors_are_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/extract/text");
                then.status(500).body("boom");
            })
            .await;
        let client = HttpExtractionClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
        let error = client
            .extract_text(Path::new("/tmp/manual.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(error, ExtractionError::Failed(_)));
    }

    #[tokio::test]
    async fn slow_service_times_out_as_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/extract/text");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({ "items": [{ "number": 1, "text": "late" }] }));
            })
            .await;
        let client =
            HttpExtractionClient::new(&server.base_url(), Duration::from_millis(50)).unwrap();

        let error = client
            .extract_text(Path::new("/tmp/manual.pdf"))
            .await
            .unwrap_err();
        assert!(
            matches!(&error, ExtractionError::Unavailable(message) if message.contains("timed out")),
            "{error}"
        );
    }
}
