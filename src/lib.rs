#![deny(missing_docs)]

//! Core library for the docpipe document-processing pipeline.

/// Analytics sink notified when documents become searchable.
pub mod analytics;
/// HTTP routing and REST handlers.
pub mod api;
/// Service wiring from configuration.
pub mod bootstrap;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Extraction client abstraction and adapters.
pub mod extraction;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline metrics helpers.
pub mod metrics;
/// Orchestrator, stage graph, derived status and batch harness.
pub mod pipeline;
/// Text chunking and sanitizing utilities.
pub mod processing;
/// Stage processors and the default registry.
pub mod stages;
/// Persistence capability traits and store adapters.
pub mod store;
