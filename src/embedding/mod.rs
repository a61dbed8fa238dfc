//! Embedding service clients.
//!
//! Every client returns one outcome per input text so the embedding stage can persist the
//! vectors that succeeded and report the rest as partial failures. A call-level error means no
//! item was embedded; [`EmbeddingClientError::ResourcePressure`] additionally tells the adaptive
//! batcher to shrink and retry. Requests that exceed the configured timeout count as pressure.

use crate::config::{Config, EmbeddingProvider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

/// Errors raised by embedding providers.
#[derive(Debug, Clone, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Provider is overloaded (rate limited or out of capacity); retry with a smaller batch.
    #[error("Embedding provider under resource pressure: {0}")]
    ResourcePressure(String),
    /// Provider could not be reached.
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),
    /// Provider response could not be interpreted.
    #[error("Malformed embedding response: {0}")]
    InvalidResponse(String),
}

impl EmbeddingClientError {
    /// Whether the caller should back off by shrinking its batch.
    pub const fn is_resource_pressure(&self) -> bool {
        matches!(self, Self::ResourcePressure(_))
    }
}

/// Result for a single input text.
pub type EmbeddingOutcome = Result<Vec<f32>, EmbeddingClientError>;

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Model identifier recorded with every vector this client produces.
    fn model(&self) -> &str;

    /// Dimension of the produced vectors.
    fn dimension(&self) -> usize;

    /// Produce one outcome per supplied text, in input order.
    async fn generate_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<EmbeddingOutcome>, EmbeddingClientError>;
}

/// Settings needed to construct an embedding client.
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    /// Backend selection.
    pub provider: EmbeddingProvider,
    /// Model identifier.
    pub model: String,
    /// Expected vector dimension.
    pub dimension: usize,
    /// Base URL override.
    pub base_url: Option<String>,
    /// API key for hosted providers.
    pub api_key: Option<String>,
    /// Upper bound on one provider request.
    pub request_timeout: Duration,
}

impl From<&Config> for EmbeddingSettings {
    fn from(config: &Config) -> Self {
        Self {
            provider: config.embedding_provider,
            model: config.embedding_model.clone(),
            dimension: config.embedding_dimension,
            base_url: config.embedding_url.clone(),
            api_key: config.embedding_api_key.clone(),
            request_timeout: config.http_timeout,
        }
    }
}

/// Build an embedding client for the given settings.
pub fn build_embedding_client(
    settings: &EmbeddingSettings,
) -> Result<Arc<dyn EmbeddingClient>, EmbeddingClientError> {
    tracing::debug!(
        provider = ?settings.provider,
        model = %settings.model,
        dimension = settings.dimension,
        "Building embedding client"
    );
    let client: Arc<dyn EmbeddingClient> = match settings.provider {
        EmbeddingProvider::Hash => Arc::new(HashEmbeddingClient::new(
            settings.model.clone(),
            settings.dimension,
        )),
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbeddingClient::new(
            http_client(settings.request_timeout)?,
            settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            settings.model.clone(),
            settings.dimension,
        )),
        EmbeddingProvider::OpenAI => {
            let api_key = settings.api_key.clone().ok_or_else(|| {
                EmbeddingClientError::Unavailable("EMBEDDING_API_KEY is required for openai".into())
            })?;
            Arc::new(OpenAiEmbeddingClient::new(
                http_client(settings.request_timeout)?,
                settings
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
                api_key,
                settings.model.clone(),
                settings.dimension,
            ))
        }
    };
    Ok(client)
}

fn http_client(timeout: Duration) -> Result<Client, EmbeddingClientError> {
    Client::builder()
        .user_agent("docpipe/embedding")
        .timeout(timeout)
        .build()
        .map_err(|error| EmbeddingClientError::Unavailable(format!("http client: {error}")))
}

/// Map a transport error; a timed out request is treated like a rate limit.
fn request_error(provider: &str, error: &reqwest::Error) -> EmbeddingClientError {
    if error.is_timeout() {
        EmbeddingClientError::ResourcePressure(format!("{provider} request timed out: {error}"))
    } else {
        EmbeddingClientError::Unavailable(format!("failed to reach {provider}: {error}"))
    }
}

/// Check a returned vector against the expected dimension.
fn validate_vector(vector: Vec<f32>, dimension: usize) -> EmbeddingOutcome {
    if vector.len() != dimension {
        return Err(EmbeddingClientError::InvalidResponse(format!(
            "expected {dimension} dimensions, got {}",
            vector.len()
        )));
    }
    if vector.iter().any(|value| !value.is_finite()) {
        return Err(EmbeddingClientError::InvalidResponse(
            "vector contains non-finite values".into(),
        ));
    }
    Ok(vector)
}

async fn check_status(
    response: reqwest::Response,
    provider: &str,
) -> Result<reqwest::Response, EmbeddingClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{provider} returned {status}: {body}");
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            EmbeddingClientError::ResourcePressure(message)
        }
        StatusCode::NOT_FOUND => EmbeddingClientError::Unavailable(message),
        _ => EmbeddingClientError::GenerationFailed(message),
    })
}

/// Deterministic embedding client that hashes bytes into vector slots.
///
/// Identical text always yields the identical unit vector, which keeps tests and offline runs
/// reproducible. Empty text fails per item.
pub struct HashEmbeddingClient {
    model: String,
    dimension: usize,
}

impl HashEmbeddingClient {
    /// Construct a client producing `dimension`-sized vectors tagged with `model`.
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
        }
    }

    /// Encode a single text.
    pub fn encode(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; dimension];

        if text.is_empty() || dimension == 0 {
            return embedding;
        }

        for (idx, byte) in text.bytes().enumerate() {
            let position = idx % dimension;
            // Spread bytes so anagrams land in different slots.
            embedding[(position + usize::from(byte)) % dimension] += f32::from(byte) / 255.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn generate_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<EmbeddingOutcome>, EmbeddingClientError> {
        if self.dimension == 0 {
            return Err(EmbeddingClientError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        Ok(texts
            .iter()
            .map(|text| {
                if text.trim().is_empty() {
                    Err(EmbeddingClientError::GenerationFailed(
                        "empty text cannot be embedded".into(),
                    ))
                } else {
                    Ok(Self::encode(text, self.dimension))
                }
            })
            .collect())
    }
}

/// Client for the Ollama `/api/embed` endpoint.
pub struct OllamaEmbeddingClient {
    http: Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbeddingClient {
    fn new(http: Client, base_url: String, model: String, dimension: usize) -> Self {
        Self {
            http,
            base_url,
            model,
            dimension,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbeddingClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn generate_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<EmbeddingOutcome>, EmbeddingClientError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .http
            .post(self.endpoint())
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|error| request_error("Ollama", &error))?;
        let response = check_status(response, "Ollama").await?;

        let body: OllamaEmbedResponse = response.json().await.map_err(|error| {
            if error.is_timeout() {
                request_error("Ollama", &error)
            } else {
                EmbeddingClientError::InvalidResponse(format!(
                    "failed to decode Ollama response: {error}"
                ))
            }
        })?;
        if body.embeddings.len() != texts.len() {
            return Err(EmbeddingClientError::InvalidResponse(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                body.embeddings.len()
            )));
        }

        Ok(body
            .embeddings
            .into_iter()
            .map(|vector| validate_vector(vector, self.dimension))
            .collect())
    }
}

/// Client for the OpenAI-compatible `/v1/embeddings` endpoint.
pub struct OpenAiEmbeddingClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingClient {
    fn new(
        http: Client,
        base_url: String,
        api_key: String,
        model: String,
        dimension: usize,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key,
            model,
            dimension,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn generate_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<EmbeddingOutcome>, EmbeddingClientError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|error| request_error("OpenAI", &error))?;
        let response = check_status(response, "OpenAI").await?;

        let body: OpenAiEmbedResponse = response.json().await.map_err(|error| {
            if error.is_timeout() {
                request_error("OpenAI", &error)
            } else {
                EmbeddingClientError::InvalidResponse(format!(
                    "failed to decode OpenAI response: {error}"
                ))
            }
        })?;

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for item in body.data {
            if let Some(slot) = slots.get_mut(item.index) {
                *slot = Some(item.embedding);
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| match slot {
                Some(vector) => validate_vector(vector, self.dimension),
                None => Err(EmbeddingClientError::InvalidResponse(
                    "provider omitted this input".into(),
                )),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn texts(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn test_http() -> Client {
        Client::builder()
            .user_agent("docpipe-test")
            .build()
            .expect("client")
    }

    #[tokio::test]
    async fn hash_client_is_deterministic_and_normalized() {
        let client = HashEmbeddingClient::new("hash-v1", 16);
        let first = client
            .generate_embeddings(&texts(&["toner cartridge"]))
            .await
            .unwrap();
        let second = client
            .generate_embeddings(&texts(&["toner cartridge"]))
            .await
            .unwrap();
        let vector = first[0].as_ref().unwrap();
        assert_eq!(vector, second[0].as_ref().unwrap());
        let norm: f32 = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hash_client_fails_empty_items_individually() {
        let client = HashEmbeddingClient::new("hash-v1", 8);
        let outcomes = client
            .generate_embeddings(&texts(&["fuser", "  ", "drum"]))
            .await
            .unwrap();
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_err());
        assert!(outcomes[2].is_ok());
    }

    #[tokio::test]
    async fn ollama_client_returns_vectors_in_order() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200).json_body(json!({
                    "embeddings": [[0.1, 0.2], [0.3, 0.4]]
                }));
            })
            .await;
        let client =
            OllamaEmbeddingClient::new(test_http(), server.base_url(), "nomic".into(), 2);

        let outcomes = client
            .generate_embeddings(&texts(&["a", "b"]))
            .await
            .expect("embeddings");

        mock.assert();
        assert_eq!(outcomes[1].as_ref().unwrap(), &vec![0.3, 0.4]);
    }

    #[tokio::test]
    async fn ollama_client_flags_wrong_dimension_per_item() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200).json_body(json!({
                    "embeddings": [[0.1, 0.2, 0.3], [0.3]]
                }));
            })
            .await;
        let client =
            OllamaEmbeddingClient::new(test_http(), server.base_url(), "nomic".into(), 3);

        let outcomes = client
            .generate_embeddings(&texts(&["a", "b"]))
            .await
            .unwrap();
        assert!(outcomes[0].is_ok());
        assert!(matches!(
            outcomes[1],
            Err(EmbeddingClientError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn rate_limit_maps_to_resource_pressure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(429).body("slow down");
            })
            .await;
        let client =
            OllamaEmbeddingClient::new(test_http(), server.base_url(), "nomic".into(), 3);

        let error = client
            .generate_embeddings(&texts(&["a"]))
            .await
            .unwrap_err();
        assert!(error.is_resource_pressure());
    }

    #[tokio::test]
    async fn slow_provider_times_out_as_resource_pressure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({ "embeddings": [[0.1, 0.2]] }));
            })
            .await;
        let client = OllamaEmbeddingClient::new(
            http_client(Duration::from_millis(50)).unwrap(),
            server.base_url(),
            "nomic".into(),
            2,
        );

        let error = client
            .generate_embeddings(&texts(&["a"]))
            .await
            .unwrap_err();
        assert!(error.is_resource_pressure(), "{error}");
    }

    #[tokio::test]
    async fn openai_client_reorders_by_index_and_sends_bearer() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/embeddings")
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(json!({
                    "data": [
                        {"index": 1, "embedding": [0.0, 1.0]},
                        {"index": 0, "embedding": [1.0, 0.0]}
                    ]
                }));
            })
            .await;
        let client = OpenAiEmbeddingClient::new(
            test_http(),
            server.base_url(),
            "secret".into(),
            "text-embedding-3-small".into(),
            2,
        );

        let outcomes = client
            .generate_embeddings(&texts(&["first", "second"]))
            .await
            .unwrap();

        mock.assert();
        assert_eq!(outcomes[0].as_ref().unwrap(), &vec![1.0, 0.0]);
        assert_eq!(outcomes[1].as_ref().unwrap(), &vec![0.0, 1.0]);
    }

    #[test]
    fn openai_requires_api_key() {
        let settings = EmbeddingSettings {
            provider: EmbeddingProvider::OpenAI,
            model: "text-embedding-3-small".into(),
            dimension: 1536,
            base_url: None,
            api_key: None,
            request_timeout: Duration::from_secs(5),
        };
        assert!(build_embedding_client(&settings).is_err());
    }
}
