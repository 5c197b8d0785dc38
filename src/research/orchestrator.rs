use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::context::{null_progress, ProgressCallback, ResearchContext, ResearchResult};
use crate::core::state::AppState;
use crate::engines::{create_engine, EngineServices, SearchEngine};
use crate::filters::CrossEngineFilter;
use crate::research::citations::CitationHandler;
use crate::research::strategies::{build_strategy, SearchStrategy, SmartRouter, StrategyDeps};

/// Thin entry point over the strategy machinery.
///
/// Validates the context, wires the run-scoped services (progress channel,
/// citation handler, cancellation token), resolves the strategy — explicit
/// name, else the smart router — and guarantees the caller always gets a
/// well-formed [`ResearchResult`]: strategy failures degrade to an `Error`
/// finding, never a propagated error.
pub struct ResearchOrchestrator {
    state: AppState,
}

impl ResearchOrchestrator {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn research(&self, query: &str, context: ResearchContext) -> ResearchResult {
        self.research_with(query, context, null_progress(), CancellationToken::new())
            .await
    }

    pub async fn research_with(
        &self,
        query: &str,
        context: ResearchContext,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> ResearchResult {
        let start = Instant::now();
        let mut warnings: Vec<String> = Vec::new();

        if query.trim().is_empty() {
            let mut result = ResearchResult::from_error(query, "empty query");
            result.total_duration_ms = start.elapsed().as_millis() as u64;
            return result;
        }

        let mut context = context;
        if context.max_iterations == 0 {
            warn!("max_iterations of 0 clamped to 1");
            warnings.push("max_iterations_clamped".to_string());
            context.max_iterations = 1;
        }

        let mut engines: Vec<Arc<dyn SearchEngine>> = Vec::new();
        for name in &context.search_engines {
            match create_engine(name, &self.state) {
                Some(engine) => {
                    if !engine.is_available() {
                        warnings.push(format!("engine_unavailable:{name}"));
                    }
                    engines.push(engine);
                }
                None => {
                    warn!("unknown search engine '{name}' requested, skipping");
                    warnings.push(format!("unknown_engine:{name}"));
                }
            }
        }
        if engines.is_empty() {
            warn!("no usable engines among {:?}", context.search_engines);
            warnings.push("no_usable_engines".to_string());
        }

        // The context travels as one immutable value from here on; workers
        // spawned by strategies re-attach it so metric rows keep research_id.
        let services = EngineServices::from_state(&self.state, cancel);
        let citations = Arc::new(CitationHandler::new(self.state.llm.clone()));
        let cross_filter = Arc::new(CrossEngineFilter::new(
            self.state.llm.clone(),
            self.state
                .settings
                .get_usize("search.cross_engine_max_results", 100),
        ));
        let worker_pool = self.state.settings.get_usize("search.worker_pool", 4);

        let deps = StrategyDeps {
            context: context.clone(),
            engines,
            services,
            progress,
            citations,
            cross_filter,
            worker_pool,
        };

        let mut strategy: Box<dyn SearchStrategy> = match context.strategy.as_deref() {
            Some(name) => build_strategy(name, deps),
            None => Box::new(SmartRouter::new(deps)),
        };

        info!(
            research_id = %context.research_id,
            strategy = strategy.name(),
            "starting research"
        );

        let output = strategy.analyze_topic(query).await;

        let mut result = output.into_result();
        if result.cancelled {
            info!(research_id = %context.research_id, "research cancelled, returning partial result");
        }
        if result.current_knowledge.trim().is_empty() && result.findings.is_empty() {
            // Even a run that found nothing returns the full shape.
            result.current_knowledge = if result.cancelled {
                "Research cancelled before any findings.".to_string()
            } else {
                "No findings were produced for this query.".to_string()
            };
        }
        result.warnings = warnings;
        result.total_duration_ms = start.elapsed().as_millis() as u64;
        result
    }
}
