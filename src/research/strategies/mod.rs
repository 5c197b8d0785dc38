//! Search strategies: the algorithms that decide what to query next and when
//! to stop. All of them publish progress through the injected callback and
//! honor the shared stop conditions (terminal criterion, cancellation, step
//! budget, repeated-empty-result livelock guard).

pub mod decomposition;
pub mod direct;
pub mod reasoning;
pub mod router;
pub mod source_based;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::core::context::{ProgressCallback, ResearchContext, ResearchResult};
use crate::core::llm::LlmProvider;
use crate::core::types::{Finding, SearchResult};
use crate::engines::{EngineServices, SearchEngine};
use crate::filters::CrossEngineFilter;
use crate::research::citations::CitationHandler;

pub use decomposition::IterativeDecompositionStrategy;
pub use direct::DirectStrategy;
pub use reasoning::IterativeReasoningStrategy;
pub use router::{build_strategy, SmartRouter};
pub use source_based::SourceBasedStrategy;

/// What `analyze_topic` returns. The orchestrator converts this 1:1 into the
/// public [`ResearchResult`].
#[derive(Debug, Clone)]
pub struct StrategyOutput {
    pub findings: Vec<Finding>,
    pub iterations: usize,
    pub questions_by_iteration: BTreeMap<usize, Vec<String>>,
    pub formatted_findings: String,
    pub current_knowledge: String,
    pub all_links_of_system: Vec<SearchResult>,
    pub cancelled: bool,
    /// Final confidence where the strategy tracks one; drives router
    /// re-dispatch.
    pub confidence: Option<f64>,
}

impl StrategyOutput {
    pub fn into_result(self) -> ResearchResult {
        ResearchResult {
            findings: self.findings,
            iterations: self.iterations,
            questions_by_iteration: self.questions_by_iteration,
            formatted_findings: self.formatted_findings,
            current_knowledge: self.current_knowledge,
            all_links_of_system: self.all_links_of_system,
            cancelled: self.cancelled,
            warnings: Vec::new(),
            total_duration_ms: 0,
            error: None,
        }
    }
}

#[async_trait]
pub trait SearchStrategy: Send {
    fn name(&self) -> &'static str;
    async fn analyze_topic(&mut self, query: &str) -> StrategyOutput;
}

/// Everything a strategy needs, bundled once by the orchestrator.
#[derive(Clone)]
pub struct StrategyDeps {
    pub context: ResearchContext,
    pub engines: Vec<Arc<dyn SearchEngine>>,
    pub services: EngineServices,
    pub progress: ProgressCallback,
    pub citations: Arc<CitationHandler>,
    pub cross_filter: Arc<CrossEngineFilter>,
    /// Bound on concurrent outbound sub-queries.
    pub worker_pool: usize,
}

impl StrategyDeps {
    pub fn llm(&self) -> Option<&dyn LlmProvider> {
        self.services.llm.as_deref()
    }

    pub fn cancelled(&self) -> bool {
        self.services.cancel.is_cancelled()
    }

    pub fn publish(&self, message: &str, percent: u8, detail: Value) {
        (self.progress)(message, percent, &detail);
    }

    /// One query across every configured engine, concurrently.
    pub async fn search_all(&self, query: &str) -> Vec<SearchResult> {
        let futures: Vec<_> = self
            .engines
            .iter()
            .map(|engine| {
                let engine = engine.clone();
                let context = self.context.clone();
                let services = self.services.clone();
                let query = query.to_string();
                async move { engine.run(&query, &context, &services).await }
            })
            .collect();
        futures::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Several queries fanned out over the bounded worker pool. The context
    /// rides along into every worker so metric rows keep their research id.
    pub async fn fan_out(&self, queries: &[String]) -> Vec<SearchResult> {
        let jobs: Vec<(Arc<dyn SearchEngine>, String)> = queries
            .iter()
            .flat_map(|q| {
                self.engines
                    .iter()
                    .map(|e| (e.clone(), q.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        stream::iter(jobs)
            .map(|(engine, query)| {
                let context = self.context.clone();
                let services = self.services.clone();
                async move { engine.run(&query, &context, &services).await }
            })
            .buffer_unordered(self.worker_pool.max(1))
            .collect::<Vec<Vec<SearchResult>>>()
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Livelock guard: trips after two consecutive iterations that produced no
/// results from the same query shape.
#[derive(Default)]
pub struct EmptyStreak {
    last_query: Option<String>,
    streak: usize,
}

impl EmptyStreak {
    /// Record an iteration's outcome; returns true when the strategy must
    /// stop.
    pub fn observe(&mut self, query: &str, result_count: usize) -> bool {
        if result_count > 0 {
            self.streak = 0;
            self.last_query = None;
            return false;
        }
        if self.last_query.as_deref() == Some(query) {
            self.streak += 1;
        } else {
            self.streak = 1;
            self.last_query = Some(query.to_string());
        }
        self.streak >= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_streak_trips_on_repeated_identical_empty_queries() {
        let mut streak = EmptyStreak::default();
        assert!(!streak.observe("q", 0));
        assert!(streak.observe("q", 0));
    }

    #[test]
    fn empty_streak_resets_on_results_or_new_query() {
        let mut streak = EmptyStreak::default();
        assert!(!streak.observe("q", 0));
        assert!(!streak.observe("q", 3));
        assert!(!streak.observe("q", 0));
        assert!(!streak.observe("different", 0));
        assert!(streak.observe("different", 0));
    }
}
