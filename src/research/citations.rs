use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::core::llm::LlmProvider;
use crate::core::types::{Citation, SearchResult};

/// Source text handed to synthesis, per citation.
const MAX_SOURCE_CHARS: usize = 4_000;

/// Outcome of one synthesis step: the LLM's inline-cited answer plus the
/// citations it may draw on.
pub struct CitationResult {
    pub content: String,
    pub documents: Vec<Citation>,
}

/// Assigns run-global citation indices and produces cited syntheses.
///
/// Indices are 1-based and monotonic across the whole run; a link that was
/// cited before always keeps its original index, so repeated invocations with
/// the same link set are idempotent. The assignment map sits behind a mutex —
/// concurrent sub-queries serialize their index claims here.
pub struct CitationHandler {
    llm: Option<Arc<dyn LlmProvider>>,
    assigned: Mutex<AssignmentState>,
}

#[derive(Default)]
struct AssignmentState {
    by_link: HashMap<String, usize>,
    citations: Vec<Citation>,
}

impl CitationHandler {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            llm,
            assigned: Mutex::new(AssignmentState::default()),
        }
    }

    /// Number of citations issued so far in this run.
    pub async fn issued(&self) -> usize {
        self.assigned.lock().await.citations.len()
    }

    /// All citations issued so far, in index order.
    pub async fn citations(&self) -> Vec<Citation> {
        self.assigned.lock().await.citations.clone()
    }

    /// Stamp citation indices onto a batch of results. New links get the next
    /// monotonic index; known links reuse theirs. Returns the citations that
    /// cover this batch.
    pub async fn assign(&self, results: &mut [SearchResult]) -> Vec<Citation> {
        let mut state = self.assigned.lock().await;
        let mut batch = Vec::new();

        for result in results.iter_mut() {
            if result.link.trim().is_empty() {
                continue;
            }
            let index = match state.by_link.get(&result.link) {
                Some(&index) => index,
                None => {
                    let index = state.citations.len() + 1;
                    state.by_link.insert(result.link.clone(), index);
                    state.citations.push(Citation {
                        index: index.to_string(),
                        link: result.link.clone(),
                        title: result.title.clone(),
                        snippet: (!result.snippet.trim().is_empty())
                            .then(|| result.snippet.clone()),
                    });
                    index
                }
            };
            result.index = Some(index.to_string());
            batch.push(state.citations[index - 1].clone());
        }

        batch.sort_by_key(|c| c.index.parse::<usize>().unwrap_or(usize::MAX));
        batch.dedup_by(|a, b| a.index == b.index);
        batch
    }

    /// Synthesize an answer to `query` from `results`, inline-citing with the
    /// run-global indices. `previous_knowledge` carries earlier iterations'
    /// synthesis for follow-up steps.
    pub async fn analyze_followup(
        &self,
        query: &str,
        results: &mut [SearchResult],
        previous_knowledge: &str,
    ) -> CitationResult {
        let documents = self.assign(results).await;

        let Some(llm) = &self.llm else {
            return CitationResult {
                content: fallback_summary(results),
                documents,
            };
        };

        let mut sources = String::new();
        for result in results.iter() {
            let Some(index) = &result.index else {
                continue;
            };
            let body: String = result.best_content().chars().take(MAX_SOURCE_CHARS).collect();
            sources.push_str(&format!("[{index}] {}\n{body}\n\n", result.title));
        }

        let previous_block = if previous_knowledge.trim().is_empty() {
            String::new()
        } else {
            format!("Previous knowledge:\n{previous_knowledge}\n\n")
        };

        let prompt = format!(
            "Answer the question using ONLY the numbered sources below. Cite sources inline with \
             their bracketed numbers, e.g. \"The capital is Paris [1].\" Use every relevant \
             source, ignore irrelevant ones, and say so when the sources are insufficient.\n\n\
             {previous_block}Question: {query}\n\nSources:\n{sources}\n\
             Write a focused, well-cited answer."
        );

        match llm.invoke(&prompt).await {
            Ok(content) => CitationResult {
                content: crate::core::llm::strip_think_tags(&content),
                documents,
            },
            Err(e) => {
                warn!("citation synthesis failed, falling back to extract summary: {e}");
                CitationResult {
                    content: fallback_summary(results),
                    documents,
                }
            }
        }
    }
}

/// No-LLM synthesis: the cited snippets, stitched together.
fn fallback_summary(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No relevant results found.".to_string();
    }
    let mut out = String::new();
    for result in results {
        let index = result.index.as_deref().unwrap_or("-");
        let body: String = result.best_content().chars().take(400).collect();
        out.push_str(&format!("[{index}] {}: {body}\n", result.title));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(link: &str, title: &str) -> SearchResult {
        SearchResult::preview("id", title, link, "snippet", "test")
    }

    #[tokio::test]
    async fn new_links_get_monotonic_indices() {
        let handler = CitationHandler::new(None);
        let mut batch = vec![result("https://a", "A"), result("https://b", "B")];
        handler.assign(&mut batch).await;
        assert_eq!(batch[0].index.as_deref(), Some("1"));
        assert_eq!(batch[1].index.as_deref(), Some("2"));

        let mut second = vec![result("https://c", "C")];
        handler.assign(&mut second).await;
        assert_eq!(second[0].index.as_deref(), Some("3"));
        assert_eq!(handler.issued().await, 3);
    }

    #[tokio::test]
    async fn repeated_links_share_an_index() {
        let handler = CitationHandler::new(None);
        let mut first = vec![result("https://a", "A")];
        handler.assign(&mut first).await;

        let mut second = vec![result("https://b", "B"), result("https://a", "A again")];
        let docs = handler.assign(&mut second).await;
        assert_eq!(second[1].index.as_deref(), Some("1"));
        assert_eq!(second[0].index.as_deref(), Some("2"));
        // The citation keeps its first-seen title.
        assert!(docs.iter().any(|c| c.index == "1" && c.title == "A"));
    }

    #[tokio::test]
    async fn assignment_is_idempotent_on_link_equality() {
        let handler = CitationHandler::new(None);
        let mut batch = vec![result("https://a", "A"), result("https://b", "B")];
        handler.assign(&mut batch).await;
        let before = handler.citations().await;

        let mut again = vec![result("https://a", "A"), result("https://b", "B")];
        handler.assign(&mut again).await;
        let after = handler.citations().await;
        assert_eq!(before, after);
        assert_eq!(again[0].index.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn blank_links_are_not_cited() {
        let handler = CitationHandler::new(None);
        let mut batch = vec![result("", "no link")];
        let docs = handler.assign(&mut batch).await;
        assert!(docs.is_empty());
        assert!(batch[0].index.is_none());
        assert_eq!(handler.issued().await, 0);
    }

    #[tokio::test]
    async fn followup_without_llm_produces_cited_fallback() {
        let handler = CitationHandler::new(None);
        let mut batch = vec![result("https://a", "A")];
        let outcome = handler.analyze_followup("q", &mut batch, "").await;
        assert!(outcome.content.contains("[1] A"));
        assert_eq!(outcome.documents.len(), 1);
    }
}
