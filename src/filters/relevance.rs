use chrono::Utc;
use tracing::{info, warn};

use crate::core::llm::{parse_index_array, LlmProvider};
use crate::core::types::SearchResult;

/// Context cap: previews beyond this many never reach the prompt.
const MAX_CONTEXT_ITEMS: usize = 30;
/// Snippets longer than this are truncated in the prompt.
const MAX_SNIPPET_CHARS: usize = 300;
/// Fallback cut when the LLM response is unusable.
const FALLBACK_TOP_K: usize = 5;

/// Rank and cull previews by relevance to `query` using the LLM.
///
/// Pass-through when no LLM is configured or there is at most one preview.
/// On any LLM or parse failure the top previews are returned unchanged —
/// filtering is an optimization, never a point of failure.
pub async fn filter_for_relevance(
    llm: Option<&dyn LlmProvider>,
    previews: Vec<SearchResult>,
    query: &str,
    max_filtered_results: usize,
) -> Vec<SearchResult> {
    let Some(llm) = llm else {
        return previews;
    };
    if previews.len() <= 1 {
        return previews;
    }

    let mut context = Vec::new();
    for (i, preview) in previews.iter().take(MAX_CONTEXT_ITEMS).enumerate() {
        let title = preview.title.trim();
        let title = if title.is_empty() { "Untitled" } else { title };
        let mut snippet = preview.snippet.trim().to_string();
        if snippet.chars().count() > MAX_SNIPPET_CHARS {
            snippet = snippet.chars().take(MAX_SNIPPET_CHARS).collect::<String>() + "...";
        }
        context.push(format!("[{i}] Title: {title}\nSnippet: {snippet}"));
    }

    let current_date = Utc::now().format("%Y-%m-%d");
    let prompt = format!(
        "Analyze these search results and provide a ranked list of the most relevant ones.\n\n\
         IMPORTANT: Evaluate and rank based on these criteria (in order of importance):\n\
         1. Timeliness - current/recent information as of {current_date}\n\
         2. Direct relevance to query: \"{query}\"\n\
         3. Source reliability (prefer official sources, established websites)\n\
         4. Factual accuracy (cross-reference major claims)\n\n\
         Search results to evaluate:\n{}\n\n\
         Return ONLY a JSON array of indices (0-based) ranked from most to least relevant.\n\
         Include ONLY indices that meet ALL criteria, with the most relevant first.\n\
         Example response: [4, 0, 2]\n\n\
         Respond with ONLY the JSON array, no other text.",
        context.join("\n\n")
    );

    let fallback_cut = FALLBACK_TOP_K.min(previews.len());
    let response = match llm.invoke(&prompt).await {
        Ok(text) => text,
        Err(e) => {
            warn!("relevance filtering error, keeping top previews: {e}");
            return previews.into_iter().take(fallback_cut).collect();
        }
    };

    let Some(ranked) = parse_index_array(&response) else {
        warn!("could not find index array in relevance response, keeping top previews");
        return previews.into_iter().take(fallback_cut).collect();
    };

    let mut kept = Vec::new();
    for idx in ranked {
        if idx < previews.len() {
            kept.push(previews[idx].clone());
        } else {
            warn!("relevance index {idx} out of range, skipping");
        }
        if kept.len() >= max_filtered_results {
            break;
        }
    }

    info!(
        "relevance filter kept {}/{} previews for query",
        kept.len(),
        previews.len()
    );
    kept
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

    struct FailingLlm;

    #[async_trait]
    impl LlmProvider for FailingLlm {
        async fn invoke(&self, _prompt: &str) -> Result<String, SearchError> {
            Err(SearchError::Llm("boom".into()))
        }
    }

    fn previews(n: usize) -> Vec<SearchResult> {
        (0..n)
            .map(|i| {
                SearchResult::preview(
                    i.to_string(),
                    format!("title {i}"),
                    format!("http://example.com/{i}"),
                    format!("snippet {i}"),
                    "test",
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn passes_through_without_llm() {
        let out = filter_for_relevance(None, previews(4), "q", 5).await;
        assert_eq!(out.len(), 4);
    }

    #[tokio::test]
    async fn single_preview_is_never_filtered() {
        let llm = FixedLlm("[]".into());
        let out = filter_for_relevance(Some(&llm), previews(1), "q", 5).await;
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn ranked_order_is_applied_and_capped() {
        let llm = FixedLlm("[3, 1, 0, 2]".into());
        let out = filter_for_relevance(Some(&llm), previews(4), "q", 2).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "3");
        assert_eq!(out[1].id, "1");
    }

    #[tokio::test]
    async fn unusable_response_keeps_top_previews() {
        let llm = FixedLlm("I cannot rank these.".into());
        let out = filter_for_relevance(Some(&llm), previews(8), "q", 5).await;
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].id, "0");
    }

    #[tokio::test]
    async fn llm_failure_keeps_top_previews() {
        let out = filter_for_relevance(Some(&FailingLlm), previews(3), "q", 5).await;
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn out_of_range_indices_are_skipped() {
        let llm = FixedLlm("[9, 1]".into());
        let out = filter_for_relevance(Some(&llm), previews(3), "q", 5).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "1");
    }
}
