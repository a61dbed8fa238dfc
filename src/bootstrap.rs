//! Wiring: builds the store, service clients, stage registry and orchestrator from a [`Config`].

use crate::analytics::{AnalyticsSink, TracingAnalyticsSink};
use crate::config::Config;
use crate::embedding::{
    EmbeddingClient, EmbeddingClientError, EmbeddingSettings, build_embedding_client,
};
use crate::extraction::{ExtractionClient, ExtractionError, build_extraction_client};
use crate::metrics::PipelineMetrics;
use crate::pipeline::{Orchestrator, OrchestratorSettings, StoreUploader};
use crate::stages::{EmbeddingProcessor, StageDeps, default_registry};
use crate::store::{SqlStore, Store, StoreError};
use std::sync::Arc;
use thiserror::Error;

/// Failures while assembling the application.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Database could not be opened or migrated.
    #[error("store initialization failed: {0}")]
    Store(#[from] StoreError),
    /// Embedding client could not be constructed.
    #[error("embedding client initialization failed: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// Extraction client could not be constructed.
    #[error("extraction client initialization failed: {0}")]
    Extraction(#[from] ExtractionError),
}

/// Long-lived services shared by the HTTP server and the batch CLI.
#[derive(Clone)]
pub struct Services {
    /// Pipeline entry point.
    pub orchestrator: Arc<Orchestrator>,
    /// Embedding processor used for similarity search.
    pub search: Arc<EmbeddingProcessor>,
    /// Shared counters.
    pub metrics: Arc<PipelineMetrics>,
}

/// Open the SQLite store and build every service on top of it.
pub async fn build_services(config: &Config) -> Result<Services, BootstrapError> {
    let store: Arc<dyn Store> = Arc::new(SqlStore::connect(&config.database_url).await?);
    tracing::info!(database_url = %config.database_url, "Connected to store");
    let embedding = build_embedding_client(&EmbeddingSettings::from(config))?;
    let extraction =
        build_extraction_client(config.extraction_url.as_deref(), config.http_timeout)?;
    Ok(assemble(config, store, extraction, embedding, None))
}

/// Build services over explicit collaborators.
///
/// `analytics` defaults to a [`TracingAnalyticsSink`] recording into the shared metrics.
pub fn assemble(
    config: &Config,
    store: Arc<dyn Store>,
    extraction: Arc<dyn ExtractionClient>,
    embedding: Arc<dyn EmbeddingClient>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
) -> Services {
    let metrics = Arc::new(PipelineMetrics::new());
    let analytics: Arc<dyn AnalyticsSink> = match analytics {
        Some(sink) => sink,
        None => Arc::new(TracingAnalyticsSink::new(metrics.clone())),
    };
    let deps = StageDeps::from_config(
        config,
        store.clone(),
        extraction,
        embedding,
        analytics,
        metrics.clone(),
    );
    let registry = default_registry(&deps);
    tracing::debug!(stages = ?registry.stages(), "Registered stage processors");
    let orchestrator = Orchestrator::new(
        store.clone(),
        registry,
        Arc::new(StoreUploader::new(store)),
        metrics.clone(),
        OrchestratorSettings::from(config),
    );
    Services {
        orchestrator: Arc::new(orchestrator),
        search: Arc::new(deps.embedding_processor()),
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingClient;
    use crate::extraction::LocalExtractionClient;
    use crate::store::InMemoryStore;

    #[test]
    fn assembles_every_stage() {
        let config = Config::from_lookup(|key| match key {
            "EMBEDDING_PROVIDER" => Some("hash".into()),
            "EMBEDDING_MODEL" => Some("hash-v1".into()),
            "EMBEDDING_DIMENSION" => Some("32".into()),
            _ => None,
        })
        .unwrap();
        let services = assemble(
            &config,
            Arc::new(InMemoryStore::new()),
            Arc::new(LocalExtractionClient),
            Arc::new(HashEmbeddingClient::new("hash-v1", 32)),
            None,
        );
        let stages = services.orchestrator.available_stages();
        assert_eq!(stages.len(), 15);
        assert_eq!(stages.first(), Some(&"upload"));
        assert_eq!(stages.last(), Some(&"search_indexing"));
        assert_eq!(services.search.model(), "hash-v1");
    }
}
