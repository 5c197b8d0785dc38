use std::env;
use std::sync::Arc;

use super::config::{FileSettings, SettingsProvider};
use super::llm::LlmProvider;
use super::metrics::{MetricsSink, NullMetricsSink};
use crate::engines::retriever::RetrieverRegistry;
use crate::index::embed::Embedder;
use crate::ratelimit::AdaptiveRateLimitTracker;

/// Shared application state threaded through engines and strategies.
#[derive(Clone)]
pub struct AppState {
    pub http_client: reqwest::Client,
    pub settings: Arc<dyn SettingsProvider>,
    pub tracker: Arc<AdaptiveRateLimitTracker>,
    pub metrics: Arc<dyn MetricsSink>,
    /// LLM handle; engines that require one degrade gracefully without it.
    pub llm: Option<Arc<dyn LlmProvider>>,
    /// Embedding model; the local index is unavailable without it.
    pub embedder: Option<Arc<dyn Embedder>>,
    /// Externally registered retrievers exposed as named engines.
    pub retrievers: Arc<RetrieverRegistry>,
    // Concurrency control for outbound search calls
    pub outbound_limit: Arc<tokio::sync::Semaphore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("llm_enabled", &self.llm.is_some())
            .field("embedder_enabled", &self.embedder.is_some())
            .finish()
    }
}

impl AppState {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self::with_settings(http_client, Arc::new(FileSettings::load()))
    }

    pub fn with_settings(http_client: reqwest::Client, settings: Arc<dyn SettingsProvider>) -> Self {
        let outbound_limit = env::var("DELVER_OUTBOUND_LIMIT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or_else(|| settings.get_usize("search.worker_pool", 4));

        let tracker = Arc::new(AdaptiveRateLimitTracker::from_settings(settings.as_ref()));

        Self {
            http_client,
            settings,
            tracker,
            metrics: Arc::new(NullMetricsSink),
            llm: None,
            embedder: None,
            retrievers: Arc::new(RetrieverRegistry::new()),
            outbound_limit: Arc::new(tokio::sync::Semaphore::new(outbound_limit.max(1))),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<AdaptiveRateLimitTracker>) -> Self {
        self.tracker = tracker;
        self
    }
}
