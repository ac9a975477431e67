//! The `Runtime` bundle (`spec.md` Design Notes §9, SPEC_FULL.md §4.9):
//! every shared dependency a stage needs, constructed once and threaded
//! through by reference. Replaces the singleton configs/metrics/health the
//! spec explicitly calls out as needing re-architecture.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::cost::PricingTable;
use crate::embedding_cache::EmbeddingCache;
use crate::error::PipelineError;
use crate::llm::LlmClient;
use crate::logging::log_info;
use crate::observability::{AlertManager, HealthRegistry, MetricsCollector};
use crate::store::DocumentStore;
use crate::vector_store::VectorStoreClient;

/// Shared dependencies for one pipeline run. Built once in `main` (or test
/// setup) and cloned (cheaply, via `Arc`) into each worker task.
pub struct Runtime {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
    pub llm: Arc<dyn LlmClient>,
    pub vector_store: Arc<dyn VectorStoreClient>,
    pub embedding_cache: Arc<EmbeddingCache>,
    pub pricing: Arc<PricingTable>,
    pub metrics: Arc<MetricsCollector>,
    pub alerts: Arc<AlertManager>,
    pub health: Arc<HealthRegistry>,
    /// Resolved once via `VectorStoreClient::ensure_store`, cached for the
    /// life of the runtime rather than re-resolved per document.
    pub vector_store_id: String,
}

impl Runtime {
    /// Resolves the vector store id once (idempotent server-side via the
    /// client's own caching, `spec.md` §6 `.<app>_vs_id`) and bundles every
    /// other dependency as handed in by the caller.
    pub async fn new(
        config: Arc<Config>,
        store: Arc<dyn DocumentStore>,
        llm: Arc<dyn LlmClient>,
        vector_store: Arc<dyn VectorStoreClient>,
        embedding_cache: Arc<EmbeddingCache>,
        pricing: Arc<PricingTable>,
        metrics: Arc<MetricsCollector>,
        alerts: Arc<AlertManager>,
        health: Arc<HealthRegistry>,
    ) -> Result<Self, PipelineError> {
        let vector_store_id = vector_store
            .ensure_store(&config.vector_store_name, Some(config.vector_cache_ttl_days as u32))
            .await?;

        log_info!(vector_store_id = %vector_store_id, "runtime bundle assembled");

        Ok(Self {
            config,
            store,
            llm,
            vector_store,
            embedding_cache,
            pricing,
            metrics,
            alerts,
            health,
            vector_store_id,
        })
    }

    /// Per-document deadline derived from `API_TIMEOUT_SECONDS`, generous
    /// enough to cover upload + extraction + a full vector-attach poll.
    pub fn document_timeout(&self) -> Duration {
        self.config.api_timeout * 4
    }
}
