//! delver — adaptive multi-engine deep-research core.
//!
//! Given a natural-language question, delver drives multiple iterations of
//! web/academic/local search behind one engine contract, paces every engine
//! with a learned rate-limit tracker, filters and synthesizes results with an
//! LLM, and returns structured findings with stable citations.

pub mod core;
pub mod engines;
pub mod filters;
pub mod index;
pub mod ratelimit;
pub mod research;

use std::sync::Arc;

// --- Primary exports ---
pub use crate::core::{
    AppState, Citation, FileSettings, Finding, LlmProvider, MemoryMetricsSink, MetricsSink,
    NullMetricsSink, OpenAiCompatLlm, ResearchContext, ResearchResult, SearchError, SearchMetric,
    SearchResult, SettingsProvider, StaticSettings,
};
pub use engines::retriever::{Retriever, RetrieverRegistry};
pub use engines::SearchEngine;
pub use index::embed::{Embedder, HashingEmbedder, Model2VecEmbedder};
pub use index::DocumentIndex;
pub use ratelimit::AdaptiveRateLimitTracker;
pub use research::ResearchOrchestrator;

/// Run one research query. Convenience wrapper over
/// [`ResearchOrchestrator::research`].
pub async fn research(
    query: &str,
    context: ResearchContext,
    state: &AppState,
) -> ResearchResult {
    ResearchOrchestrator::new(state.clone())
        .research(query, context)
        .await
}

/// Install an external retriever as a named engine. Thread-safe; overwrites
/// on name collision.
pub fn register_retriever(state: &AppState, name: &str, retriever: Arc<dyn Retriever>) {
    state.retrievers.register(name, retriever);
}
