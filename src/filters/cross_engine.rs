use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::core::llm::{parse_index_array, LlmProvider};
use crate::core::types::SearchResult;

/// Below this many combined results, ranking is skipped entirely — the LLM
/// round-trip costs more than it buys on a short list.
pub const CROSS_ENGINE_FILTER_MIN: usize = 10;

/// Snippet truncation for the ranking prompt.
const MAX_SNIPPET_CHARS: usize = 200;
/// Context cap for the ranking prompt.
const MAX_CONTEXT_ITEMS: usize = 30;

/// Ranks and filters the concatenated previews of multiple engines, collapses
/// duplicate links, and stamps continuous citation indices.
///
/// `reorder` controls whether the LLM's ranking order is applied (otherwise
/// kept results stay in arrival order); `reindex` controls whether `index` is
/// restamped as `start_index + 1, +2, …` over the kept items. The two are
/// independent.
pub struct CrossEngineFilter {
    llm: Option<Arc<dyn LlmProvider>>,
    max_results: usize,
    default_reorder: bool,
    default_reindex: bool,
}

impl CrossEngineFilter {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>, max_results: usize) -> Self {
        Self {
            llm,
            max_results: max_results.max(1),
            default_reorder: true,
            default_reindex: true,
        }
    }

    pub fn with_defaults(mut self, reorder: bool, reindex: bool) -> Self {
        self.default_reorder = reorder;
        self.default_reindex = reindex;
        self
    }

    pub async fn filter_results(
        &self,
        results: Vec<SearchResult>,
        query: &str,
        reorder: Option<bool>,
        reindex: Option<bool>,
        start_index: usize,
    ) -> Vec<SearchResult> {
        let reorder = reorder.unwrap_or(self.default_reorder);
        let reindex = reindex.unwrap_or(self.default_reindex);

        // Engines overlap; collapse by link before anything looks at indices.
        let results = dedup_by_link(results);

        if self.llm.is_none() || results.len() <= CROSS_ENGINE_FILTER_MIN {
            return self.finish(truncate(results, self.max_results), reindex, start_index);
        }
        let llm = self.llm.as_ref().expect("checked above");

        let mut context = Vec::new();
        for (i, result) in results.iter().take(MAX_CONTEXT_ITEMS).enumerate() {
            let title = result.title.trim();
            let title = if title.is_empty() { "Untitled" } else { title };
            let mut snippet = result.snippet.trim().to_string();
            if snippet.chars().count() > MAX_SNIPPET_CHARS {
                snippet = snippet.chars().take(MAX_SNIPPET_CHARS).collect::<String>() + "...";
            }
            context.push(format!(
                "[{i}] Engine: {} | Title: {title}\nSnippet: {snippet}",
                result.engine
            ));
        }

        let prompt = format!(
            "You are a search result filter. Your task is to rank search results from multiple \
             engines by relevance to a query.\n\n\
             Query: \"{query}\"\n\n\
             Search Results:\n{}\n\n\
             Return the search results as a JSON array of indices, ranked from most to least \
             relevant to the query.\n\
             Only include indices of results that are actually relevant to the query.\n\
             For example: [3, 0, 7, 1]\n\n\
             If no results seem relevant to the query, return an empty array: []",
            context.join("\n\n")
        );

        let ranked = match llm.invoke(&prompt).await {
            Ok(response) => parse_index_array(&response),
            Err(e) => {
                warn!("cross-engine filtering error: {e}");
                None
            }
        };

        let Some(ranked) = ranked else {
            info!("no usable ranking from LLM, returning top originals");
            return self.finish(truncate(results, self.max_results), reindex, start_index);
        };

        let kept: Vec<SearchResult> = if reorder {
            ranked
                .iter()
                .filter(|&&idx| idx < results.len())
                .map(|&idx| results[idx].clone())
                .collect()
        } else {
            // Keep the relevant set but preserve arrival order.
            let mut sorted: Vec<usize> = ranked.into_iter().filter(|&i| i < results.len()).collect();
            sorted.sort_unstable();
            sorted.dedup();
            sorted.into_iter().map(|idx| results[idx].clone()).collect()
        };

        // The model judged everything irrelevant: better to surface the top
        // originals than nothing.
        if kept.is_empty() && !results.is_empty() {
            info!("cross-engine filtering removed all results, returning top originals instead");
            return self.finish(
                truncate(results, CROSS_ENGINE_FILTER_MIN.min(self.max_results)),
                reindex,
                start_index,
            );
        }

        info!(
            "cross-engine filtering kept {}/{} results (reorder={reorder}, reindex={reindex})",
            kept.len().min(self.max_results),
            results.len()
        );
        self.finish(truncate(kept, self.max_results), reindex, start_index)
    }

    fn finish(
        &self,
        mut results: Vec<SearchResult>,
        reindex: bool,
        start_index: usize,
    ) -> Vec<SearchResult> {
        if reindex {
            for (i, result) in results.iter_mut().enumerate() {
                result.index = Some((start_index + i + 1).to_string());
            }
        }
        results
    }
}

fn truncate(mut results: Vec<SearchResult>, max: usize) -> Vec<SearchResult> {
    results.truncate(max);
    results
}

/// Collapse duplicate links, keeping the first occurrence but backfilling
/// empty title/snippet fields from later duplicates.
fn dedup_by_link(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, SearchResult> = HashMap::new();

    for result in results {
        let key = normalize_link_key(&result.link);
        match by_key.get_mut(&key) {
            None => {
                order.push(key.clone());
                by_key.insert(key, result);
            }
            Some(existing) => {
                if existing.title.trim().is_empty() && !result.title.trim().is_empty() {
                    existing.title = result.title;
                }
                if existing.snippet.trim().is_empty() && !result.snippet.trim().is_empty() {
                    existing.snippet = result.snippet;
                }
                if existing.score.is_none() {
                    existing.score = result.score;
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Canonical form of a link for duplicate detection: no fragment, no common
/// tracking params, sorted query.
pub(crate) fn normalize_link_key(link: &str) -> String {
    let trimmed = link.trim();
    let Ok(mut parsed) = url::Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    parsed.set_fragment(None);

    if parsed.query().is_some() {
        let mut kept: Vec<(String, String)> = Vec::new();
        for (k, v) in parsed.query_pairs() {
            let k_lower = k.to_ascii_lowercase();
            if k_lower.starts_with("utm_")
                || matches!(k_lower.as_str(), "gclid" | "fbclid" | "yclid" | "ref" | "ref_src")
            {
                continue;
            }
            kept.push((k.to_string(), v.to_string()));
        }
        kept.sort();
        parsed.set_query(None);
        if !kept.is_empty() {
            let mut qp = parsed.query_pairs_mut();
            for (k, v) in kept {
                qp.append_pair(&k, &v);
            }
        }
    }

    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SearchError;
    use async_trait::async_trait;

    struct FixedLlm(String);

    #[async_trait]
    impl LlmProvider for FixedLlm {
        async fn invoke(&self, _prompt: &str) -> Result<String, SearchError> {
            Ok(self.0.clone())
        }
    }

    fn results(n: usize) -> Vec<SearchResult> {
        (0..n)
            .map(|i| {
                SearchResult::preview(
                    i.to_string(),
                    format!("title {i}"),
                    format!("https://example.com/page{i}"),
                    format!("snippet {i}"),
                    if i % 2 == 0 { "brave" } else { "meta" },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn small_batches_skip_ranking_but_still_reindex() {
        let filter = CrossEngineFilter::new(None, 100);
        let out = filter
            .filter_results(results(4), "q", Some(true), Some(true), 7)
            .await;
        assert_eq!(out.len(), 4);
        let indices: Vec<&str> = out.iter().map(|r| r.index.as_deref().unwrap()).collect();
        assert_eq!(indices, vec!["8", "9", "10", "11"]);
    }

    #[tokio::test]
    async fn reindex_false_leaves_indices_alone() {
        let filter = CrossEngineFilter::new(None, 100);
        let out = filter
            .filter_results(results(3), "q", Some(true), Some(false), 0)
            .await;
        assert!(out.iter().all(|r| r.index.is_none()));
    }

    #[tokio::test]
    async fn ranked_reorder_applies_llm_order() {
        let llm: Arc<dyn LlmProvider> = Arc::new(FixedLlm("[11, 2, 5]".into()));
        let filter = CrossEngineFilter::new(Some(llm), 100);
        let out = filter
            .filter_results(results(12), "q", Some(true), Some(true), 0)
            .await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].id, "11");
        assert_eq!(out[1].id, "2");
        assert_eq!(out[2].id, "5");
        let indices: Vec<&str> = out.iter().map(|r| r.index.as_deref().unwrap()).collect();
        assert_eq!(indices, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn reorder_false_keeps_arrival_order() {
        let llm: Arc<dyn LlmProvider> = Arc::new(FixedLlm("[11, 2, 5]".into()));
        let filter = CrossEngineFilter::new(Some(llm), 100);
        let out = filter
            .filter_results(results(12), "q", Some(false), Some(true), 0)
            .await;
        let ids: Vec<&str> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "5", "11"]);
    }

    #[tokio::test]
    async fn empty_ranking_falls_back_to_top_originals() {
        let llm: Arc<dyn LlmProvider> = Arc::new(FixedLlm("[]".into()));
        let filter = CrossEngineFilter::new(Some(llm), 100);
        let out = filter
            .filter_results(results(15), "q", Some(true), Some(true), 0)
            .await;
        assert_eq!(out.len(), CROSS_ENGINE_FILTER_MIN);
        assert_eq!(out[0].id, "0");
    }

    #[tokio::test]
    async fn duplicate_links_collapse_before_indexing() {
        let mut input = results(3);
        let mut dup = input[0].clone();
        dup.engine = "meta".into();
        dup.id = "99".into();
        input.push(dup);

        let filter = CrossEngineFilter::new(None, 100);
        let out = filter
            .filter_results(input, "q", Some(true), Some(true), 0)
            .await;
        assert_eq!(out.len(), 3);
        let mut links: Vec<&str> = out.iter().map(|r| r.link.as_str()).collect();
        links.sort_unstable();
        links.dedup();
        assert_eq!(links.len(), 3);
        let indices: Vec<&str> = out.iter().map(|r| r.index.as_deref().unwrap()).collect();
        assert_eq!(indices, vec!["1", "2", "3"]);
    }

    #[test]
    fn link_normalization_strips_tracking_noise() {
        let a = normalize_link_key("https://example.com/p?utm_source=x&id=1#frag");
        let b = normalize_link_key("https://example.com/p?id=1");
        assert_eq!(a, b);
    }
}
