use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
    /// Configuration was installed twice.
    #[error("Configuration already initialized")]
    AlreadyInitialized,
}

/// Runtime configuration for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection string used by the persistent store.
    pub database_url: String,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider and recorded with every vector.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Base URL of the embedding service; provider default when unset.
    pub embedding_url: Option<String>,
    /// API key for hosted embedding providers.
    pub embedding_api_key: Option<String>,
    /// Base URL of the remote extraction service; local extraction when unset.
    pub extraction_url: Option<String>,
    /// Root of the content-addressed object directory.
    pub storage_dir: PathBuf,
    /// Optional override for the automatic chunk size selection.
    pub text_splitter_chunk_size: Option<usize>,
    /// Optional override for the chunk overlap.
    pub text_splitter_chunk_overlap: Option<usize>,
    /// Adaptive batching bounds for embedding generation.
    pub embedding_batch: BatchSettings,
    /// Upper bound on a single stage processor call.
    pub stage_timeout: Duration,
    /// Upper bound on a single embedding or extraction HTTP request.
    pub http_timeout: Duration,
    /// Maximum number of documents processed concurrently by batch runs.
    pub max_concurrency: usize,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported embedding backends for the processing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI embeddings API.
    OpenAI,
    /// Deterministic in-process hashing embedder (offline use and tests).
    Hash,
}

/// Adaptive batch-size bounds for embedding generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Starting batch size.
    pub initial: usize,
    /// Floor the batch size never shrinks below.
    pub min: usize,
    /// Ceiling the batch size never grows above.
    pub max: usize,
    /// Time budget per batch; slower batches shrink the size.
    pub budget: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            initial: 8,
            min: 1,
            max: 64,
            budget: Duration::from_millis(2_000),
        }
    }
}

const DEFAULT_DATABASE_URL: &str = "sqlite://docpipe.db";
const DEFAULT_STORAGE_DIR: &str = "storage";
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_CONCURRENCY: usize = 4;

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset. Used by [`Config::from_env`] and by tests that must not
    /// mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required =
            |key: &str| optional(key).ok_or_else(|| ConfigError::MissingVariable(key.to_string()));

        let defaults = BatchSettings::default();
        let embedding_batch = BatchSettings {
            initial: parse_optional(&optional, "EMBEDDING_BATCH_SIZE")?.unwrap_or(defaults.initial),
            min: parse_optional(&optional, "EMBEDDING_BATCH_MIN")?.unwrap_or(defaults.min),
            max: parse_optional(&optional, "EMBEDDING_BATCH_MAX")?.unwrap_or(defaults.max),
            budget: parse_optional(&optional, "EMBEDDING_BATCH_BUDGET_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.budget),
        };
        if embedding_batch.min == 0
            || embedding_batch.min > embedding_batch.initial
            || embedding_batch.initial > embedding_batch.max
        {
            return Err(ConfigError::InvalidValue(
                "EMBEDDING_BATCH_MIN <= EMBEDDING_BATCH_SIZE <= EMBEDDING_BATCH_MAX".to_string(),
            ));
        }

        let max_concurrency =
            parse_optional(&optional, "MAX_CONCURRENCY")?.unwrap_or(DEFAULT_MAX_CONCURRENCY);
        if max_concurrency == 0 {
            return Err(ConfigError::InvalidValue("MAX_CONCURRENCY".to_string()));
        }

        let embedding_dimension: usize = required("EMBEDDING_DIMENSION")?
            .parse()
            .map_err(|_| ConfigError::InvalidValue("EMBEDDING_DIMENSION".to_string()))?;
        if embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".to_string()));
        }

        let http_timeout = Duration::from_secs(
            parse_optional(&optional, "HTTP_TIMEOUT_SECS")?.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        );
        if http_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("HTTP_TIMEOUT_SECS".to_string()));
        }

        Ok(Self {
            database_url: optional("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            embedding_provider: required("EMBEDDING_PROVIDER")?
                .parse()
                .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".to_string()))?,
            embedding_model: required("EMBEDDING_MODEL")?,
            embedding_dimension,
            embedding_url: optional("EMBEDDING_URL"),
            embedding_api_key: optional("EMBEDDING_API_KEY"),
            extraction_url: optional("EXTRACTION_URL"),
            storage_dir: optional("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR)),
            text_splitter_chunk_size: parse_optional(&optional, "TEXT_SPLITTER_CHUNK_SIZE")?,
            text_splitter_chunk_overlap: parse_optional(&optional, "TEXT_SPLITTER_CHUNK_OVERLAP")?,
            embedding_batch,
            stage_timeout: Duration::from_secs(
                parse_optional(&optional, "STAGE_TIMEOUT_SECS")?
                    .unwrap_or(DEFAULT_STAGE_TIMEOUT_SECS),
            ),
            http_timeout,
            max_concurrency,
            server_port: parse_optional(&optional, "SERVER_PORT")?,
        })
    }
}

fn parse_optional<T, F>(optional: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            "hash" => Ok(Self::Hash),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment (and `.env`) and install it in the global cache.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        database_url = %config.database_url,
        embedding_provider = ?config.embedding_provider,
        embedding_model = %config.embedding_model,
        extraction_url = ?config.extraction_url,
        max_concurrency = config.max_concurrency,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyInitialized)?;
    Ok(get_config())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("EMBEDDING_PROVIDER", "hash"),
        ("EMBEDDING_MODEL", "hash-v1"),
        ("EMBEDDING_DIMENSION", "64"),
    ];

    #[test]
    fn applies_defaults_for_optional_values() {
        let config = Config::from_lookup(lookup(BASE)).expect("config");
        assert_eq!(config.embedding_provider, EmbeddingProvider::Hash);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.embedding_batch, BatchSettings::default());
        assert_eq!(config.stage_timeout, Duration::from_secs(300));
        assert_eq!(config.http_timeout, Duration::from_secs(60));
        assert_eq!(config.max_concurrency, 4);
        assert!(config.extraction_url.is_none());
    }

    #[test]
    fn missing_model_is_reported() {
        let error = Config::from_lookup(lookup(&[
            ("EMBEDDING_PROVIDER", "ollama"),
            ("EMBEDDING_DIMENSION", "768"),
        ]))
        .unwrap_err();
        assert!(matches!(error, ConfigError::MissingVariable(key) if key == "EMBEDDING_MODEL"));
    }

    #[test]
    fn rejects_inverted_batch_bounds() {
        let mut pairs = BASE.to_vec();
        pairs.extend([("EMBEDDING_BATCH_SIZE", "32"), ("EMBEDDING_BATCH_MAX", "16")]);
        let error = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let mut pairs = BASE.to_vec();
        pairs.extend([("EXTRACTION_URL", "  "), ("SERVER_PORT", "8088")]);
        let config = Config::from_lookup(lookup(&pairs)).expect("config");
        assert!(config.extraction_url.is_none());
        assert_eq!(config.server_port, Some(8088));
    }

    #[test]
    fn zero_http_timeout_is_invalid() {
        let mut pairs = BASE.to_vec();
        pairs.push(("HTTP_TIMEOUT_SECS", "0"));
        let error = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue(key) if key == "HTTP_TIMEOUT_SECS"));
    }

    #[test]
    fn unknown_provider_is_invalid() {
        let mut pairs = BASE.to_vec();
        pairs[0] = ("EMBEDDING_PROVIDER", "cohere");
        let error = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue(key) if key == "EMBEDDING_PROVIDER"));
    }
}
