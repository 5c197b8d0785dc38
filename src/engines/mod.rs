//! Search-engine contract and adapters.
//!
//! Every source sits behind one trait with a two-phase retrieval shape:
//! cheap previews first, an LLM relevance pass over them, then expensive full
//! content only for what survived. The provided `run` owns pacing (via the
//! adaptive tracker), retries on rate limits, per-phase timeouts, and the
//! metrics row — adapters only implement the two phases.

pub mod arxiv;
pub mod brave;
pub mod duckduckgo;
pub mod github;
pub mod local;
pub mod meta;
pub mod retriever;
pub mod wayback;
pub mod wikipedia;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::config::SettingsProvider;
use crate::core::context::ResearchContext;
use crate::core::error::SearchError;
use crate::core::llm::LlmProvider;
use crate::core::metrics::{MetricsSink, SearchMetric};
use crate::core::state::AppState;
use crate::core::types::SearchResult;
use crate::filters::relevance::filter_for_relevance;
use crate::ratelimit::AdaptiveRateLimitTracker;

/// Attempts per `run` while the engine keeps reporting rate limits.
const MAX_RETRY_ATTEMPTS: usize = 3;

/// Shared services handed to every `run` invocation.
#[derive(Clone)]
pub struct EngineServices {
    pub tracker: Arc<AdaptiveRateLimitTracker>,
    pub metrics: Arc<dyn MetricsSink>,
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub settings: Arc<dyn SettingsProvider>,
    pub cancel: CancellationToken,
    /// Caps concurrent outbound engine calls process-wide.
    pub outbound_limit: Arc<tokio::sync::Semaphore>,
}

impl EngineServices {
    pub fn from_state(state: &AppState, cancel: CancellationToken) -> Self {
        Self {
            tracker: state.tracker.clone(),
            metrics: state.metrics.clone(),
            llm: state.llm.clone(),
            settings: state.settings.clone(),
            cancel,
            outbound_limit: state.outbound_limit.clone(),
        }
    }
}

/// The engine capability set. Adapters implement the two retrieval phases and
/// the capability flags; `run` is provided.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Stable engine label used for pacing, metrics and result tagging.
    fn name(&self) -> &str;

    fn requires_api_key(&self) -> bool {
        false
    }

    fn requires_llm(&self) -> bool {
        false
    }

    /// Whether `get_full_content` does real work beyond echoing previews.
    fn supports_full_search(&self) -> bool {
        false
    }

    /// False when construction found the engine unusable (missing key,
    /// missing index, …). An unavailable engine's `run` yields `[]`.
    fn is_available(&self) -> bool {
        true
    }

    /// Engines whose previews already carry a strong ranking (vector stores,
    /// retrievers) skip the per-engine LLM filter.
    fn skips_relevance_filter(&self) -> bool {
        false
    }

    fn max_results(&self) -> usize {
        10
    }

    fn max_filtered_results(&self) -> usize {
        5
    }

    /// Phase 1: cheap preview records.
    async fn get_previews(&self, query: &str) -> Result<Vec<SearchResult>, SearchError>;

    /// Phase 2: upgrade previews to full results. Every returned result must
    /// originate from one of the given previews (same `id`).
    async fn get_full_content(
        &self,
        previews: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>, SearchError>;

    /// Two-phase retrieval with adaptive pacing and retry.
    ///
    /// Never returns an error: failures degrade to `[]` with a recorded
    /// metric. Rate-limit failures retry up to three times with the tracker
    /// deciding the wait; everything else fails the run immediately.
    async fn run(
        &self,
        query: &str,
        context: &ResearchContext,
        services: &EngineServices,
    ) -> Vec<SearchResult> {
        let start = Instant::now();

        if !self.is_available() {
            warn!("engine '{}' unavailable, skipping", self.name());
            record_metric(services, self, query, context, 0, start, false, Some("config"));
            return Vec::new();
        }

        // Backpressure: the pool size bounds concurrent outbound calls.
        let _permit = services.outbound_limit.acquire().await.ok();

        let attempts = if services.tracker.enabled() {
            MAX_RETRY_ATTEMPTS
        } else {
            1
        };
        let preview_budget = Duration::from_secs(
            services
                .settings
                .get_u64("search.preview_timeout_secs", 15),
        );

        let mut previews: Option<Vec<SearchResult>> = None;
        let mut last_error: Option<SearchError> = None;

        for attempt in 1..=attempts {
            if services.cancel.is_cancelled() {
                last_error = Some(SearchError::Cancelled);
                break;
            }

            let wait = services.tracker.wait_time(self.name());
            if wait > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }

            let outcome = match tokio::time::timeout(preview_budget, self.get_previews(query)).await
            {
                Err(_) => Err(SearchError::Timeout(preview_budget)),
                Ok(result) => result,
            };

            match outcome {
                Ok(batch) => {
                    services.tracker.record_outcome(
                        self.name(),
                        wait,
                        true,
                        attempt,
                        None,
                        Some(batch.len()),
                    );
                    previews = Some(batch);
                    break;
                }
                Err(e) if e.is_rate_limit() => {
                    services.tracker.record_outcome(
                        self.name(),
                        wait,
                        false,
                        attempt,
                        Some(e.kind()),
                        None,
                    );
                    warn!(
                        "engine '{}' rate limited (attempt {attempt}/{attempts}): {e}",
                        self.name()
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    services.tracker.record_outcome(
                        self.name(),
                        wait,
                        false,
                        attempt,
                        Some(e.kind()),
                        None,
                    );
                    warn!("engine '{}' failed: {e}", self.name());
                    last_error = Some(e);
                    break;
                }
            }
        }

        let Some(previews) = previews else {
            let kind = last_error.as_ref().map(|e| e.kind());
            record_metric(services, self, query, context, 0, start, false, kind);
            return Vec::new();
        };

        if previews.is_empty() {
            info!("engine '{}' returned no previews", self.name());
            record_metric(services, self, query, context, 0, start, true, None);
            return Vec::new();
        }

        // Phase 2: LLM relevance pass over the previews.
        let filtered = if self.skips_relevance_filter() {
            previews
        } else {
            filter_for_relevance(
                services.llm.as_deref(),
                previews,
                query,
                self.max_filtered_results(),
            )
            .await
        };

        // Phase 3: full content, unless snippets satisfy the run.
        let snippets_only = services.settings.get_bool("search.snippets_only", true);
        let mut results = if snippets_only || !self.supports_full_search() {
            filtered
        } else {
            if services.cancel.is_cancelled() {
                record_metric(services, self, query, context, 0, start, false, Some("cancelled"));
                return Vec::new();
            }
            let content_budget = Duration::from_secs(
                services
                    .settings
                    .get_u64("search.full_content_timeout_secs", 30),
            );
            match tokio::time::timeout(content_budget, self.get_full_content(filtered)).await {
                Ok(Ok(full)) => full,
                Ok(Err(e)) => {
                    warn!("engine '{}' full-content phase failed: {e}", self.name());
                    record_metric(services, self, query, context, 0, start, false, Some(e.kind()));
                    return Vec::new();
                }
                Err(_) => {
                    warn!("engine '{}' full-content phase timed out", self.name());
                    record_metric(services, self, query, context, 0, start, false, Some("timeout"));
                    return Vec::new();
                }
            }
        };

        results.truncate(self.max_results());
        record_metric(services, self, query, context, results.len(), start, true, None);
        results
    }
}

#[allow(clippy::too_many_arguments)]
fn record_metric(
    services: &EngineServices,
    engine: &(impl SearchEngine + ?Sized),
    query: &str,
    context: &ResearchContext,
    result_count: usize,
    start: Instant,
    success: bool,
    error: Option<&str>,
) {
    services.metrics.record_search(SearchMetric {
        engine: engine.name().to_string(),
        query: query.to_string(),
        result_count,
        latency_ms: start.elapsed().as_millis() as u64,
        success,
        error: error.map(|e| e.to_string()),
        research_id: Some(context.research_id.clone()),
    });
}

// ---------------------------------------------------------------------------
// Shared HTTP helpers
// ---------------------------------------------------------------------------

/// Map an HTTP response to a throttling signal, if it is one. Covers status
/// codes and the common block-page bodies.
pub fn detect_rate_limit(status: StatusCode, body: &str) -> Option<String> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some("http_429".to_string());
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        return Some("http_503".to_string());
    }

    let lower = body.to_lowercase();
    let needles = [
        ("too many requests", "too_many_requests"),
        ("rate limit", "rate_limit_body"),
        ("unusual traffic", "unusual_traffic"),
        ("captcha", "captcha"),
        ("verify you are human", "captcha"),
    ];
    for (needle, label) in needles {
        if lower.contains(needle) {
            return Some(label.to_string());
        }
    }

    None
}

/// Common per-engine settings, read from `search.engine.<name>.*` with
/// global `search.*` fallbacks.
pub struct EngineParams {
    pub max_results: usize,
    pub max_filtered_results: usize,
    pub api_key: Option<String>,
    pub language: String,
    pub safesearch: u8,
    pub region: Option<String>,
}

impl EngineParams {
    pub fn load(settings: &dyn SettingsProvider, engine: &str) -> Self {
        let prefix = format!("search.engine.{engine}");
        Self {
            max_results: settings.get_usize(
                &format!("{prefix}.max_results"),
                settings.get_usize("search.max_results", 10),
            ),
            max_filtered_results: settings.get_usize(
                &format!("{prefix}.max_filtered_results"),
                settings.get_usize("search.max_filtered_results", 5),
            ),
            api_key: settings.get_string_opt(&format!("{prefix}.api_key")),
            language: settings.get_string(&format!("{prefix}.language"), "en"),
            safesearch: settings.get_u64(&format!("{prefix}.safesearch"), 1) as u8,
            region: settings.get_string_opt(&format!("{prefix}.region")),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Instantiate an engine by name. Unknown names fall through to the retriever
/// registry. Engines with unmet prerequisites still construct — in
/// "unavailable" state — so a single bad engine never sinks a run.
pub fn create_engine(name: &str, state: &AppState) -> Option<Arc<dyn SearchEngine>> {
    let engine: Arc<dyn SearchEngine> = match name {
        "meta" | "searx" => Arc::new(meta::SearxMetaEngine::from_settings(state)),
        "brave" => Arc::new(brave::BraveEngine::from_settings(state)),
        "duckduckgo" | "ddg" => Arc::new(duckduckgo::DuckDuckGoEngine::from_settings(state)),
        "arxiv" => Arc::new(arxiv::ArxivEngine::from_settings(state)),
        "wikipedia" => Arc::new(wikipedia::WikipediaEngine::from_settings(state)),
        "wayback" => {
            let resolver: Option<Arc<dyn SearchEngine>> =
                Some(Arc::new(duckduckgo::DuckDuckGoEngine::from_settings(state)));
            Arc::new(wayback::WaybackEngine::from_settings(state, resolver))
        }
        "github" => Arc::new(github::GitHubEngine::from_settings(state)),
        "local" => Arc::new(local::LocalIndexEngine::from_settings(state)),
        other => {
            let retriever = state.retrievers.get(other)?;
            Arc::new(retriever::RetrieverEngine::new(other, retriever))
        }
    };
    Some(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_rate_limit() {
        assert_eq!(
            detect_rate_limit(StatusCode::TOO_MANY_REQUESTS, ""),
            Some("http_429".into())
        );
        assert_eq!(
            detect_rate_limit(StatusCode::SERVICE_UNAVAILABLE, ""),
            Some("http_503".into())
        );
        assert_eq!(detect_rate_limit(StatusCode::OK, "all good"), None);
    }

    #[test]
    fn block_bodies_are_sniffed() {
        assert!(detect_rate_limit(StatusCode::OK, "Too Many Requests, slow down").is_some());
        assert!(detect_rate_limit(StatusCode::OK, "please solve this CAPTCHA").is_some());
    }
}
