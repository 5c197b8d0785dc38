//! End-to-end strategy scenarios through the orchestrator, with scripted
//! LLMs and retriever-backed engines.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common::{test_state, FnLlm};
use delver::core::null_progress;
use delver::engines::retriever::{RetrievedDocument, Retriever};
use delver::core::{ResearchContext, SearchError};
use delver::{register_retriever, ResearchOrchestrator};

/// Retriever returning fixed documents, optionally cancelling a token after a
/// given number of calls (the "in-flight work finishes, results discarded"
/// path).
struct ScriptedRetriever {
    docs: Vec<(String, String, String)>, // (title, url, content)
    calls: Arc<AtomicUsize>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedRetriever {
    fn new(docs: Vec<(&str, &str, &str)>) -> Self {
        Self {
            docs: docs
                .into_iter()
                .map(|(t, u, c)| (t.to_string(), u.to_string(), c.to_string()))
                .collect(),
            calls: Arc::new(AtomicUsize::new(0)),
            cancel_after: None,
        }
    }

    fn cancelling(mut self, after: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((after, token));
        self
    }
}

#[async_trait]
impl Retriever for ScriptedRetriever {
    async fn retrieve(&self, _query: &str) -> Result<Vec<RetrievedDocument>, SearchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if call >= *after {
                token.cancel();
            }
        }
        Ok(self
            .docs
            .iter()
            .map(|(title, url, content)| {
                let mut metadata = serde_json::Map::new();
                metadata.insert("title".into(), title.clone().into());
                metadata.insert("source".into(), url.clone().into());
                RetrievedDocument {
                    page_content: content.clone(),
                    metadata,
                }
            })
            .collect())
    }
}

fn paris_docs() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        (
            "Paris - Encyclopedia",
            "https://encyclopedia.example/paris",
            "Paris is the capital and largest city of France, on the Seine.",
        ),
        (
            "France - Country profile",
            "https://atlas.example/france",
            "France is a country in Western Europe. Its capital is Paris.",
        ),
    ]
}

/// A factoid query routes to the direct strategy and answers with a citation.
#[tokio::test]
async fn factoid_query_routes_to_direct_and_cites() {
    let (state, _metrics) = test_state();
    let llm = FnLlm::new(|prompt| {
        if prompt.contains("Classify this research query") {
            "factoid".to_string()
        } else if prompt.contains("numbered sources") {
            "The capital of France is Paris [1].".to_string()
        } else {
            "[]".to_string()
        }
    });
    let state = state.with_llm(llm);
    register_retriever(&state, "kb", Arc::new(ScriptedRetriever::new(paris_docs())));

    let context = ResearchContext::new(vec!["kb".to_string()]);
    let result = ResearchOrchestrator::new(state)
        .research("What is the capital of France?", context)
        .await;

    assert_eq!(result.iterations, 1);
    assert!(result.current_knowledge.contains("Paris"));
    assert!(!result.cancelled);
    assert_eq!(result.findings.len(), 1);
    assert_eq!(result.findings[0].phase, "Direct Search");
    assert!(
        !result.findings[0].documents.is_empty(),
        "expected at least one citation"
    );
    assert!(result
        .all_links_of_system
        .iter()
        .any(|r| r.index.as_deref() == Some("1")));
}

/// Cancellation during iteration 3's search leaves exactly the two
/// completed findings and marks the run cancelled.
#[tokio::test]
async fn cancellation_mid_search_keeps_completed_iterations() {
    let (state, _metrics) = test_state();
    let llm = FnLlm::new(|prompt| {
        if prompt.contains("next_search_query") {
            r#"{"next_search_query": "probe deeper",
                "extracted_facts": ["a fact"],
                "updated_candidates": [{"answer": "Candidate", "confidence": 0.4}],
                "remaining_uncertainties": ["more"],
                "confidence": 0.4}"#
                .to_string()
        } else if prompt.contains("numbered sources") {
            "Partial synthesis [1].".to_string()
        } else {
            "[]".to_string()
        }
    });
    let state = state.with_llm(llm);

    let cancel = CancellationToken::new();
    let retriever = ScriptedRetriever::new(paris_docs()).cancelling(3, cancel.clone());
    register_retriever(&state, "kb", Arc::new(retriever));

    let context = ResearchContext::new(vec!["kb".to_string()])
        .with_strategy("iterative-reasoning")
        .with_max_iterations(5);

    let result = ResearchOrchestrator::new(state)
        .research_with(
            "Which landmark fits all of these clues?",
            context,
            null_progress(),
            cancel,
        )
        .await;

    assert!(result.cancelled);
    assert_eq!(result.iterations, 2, "only completed iterations count");
    assert_eq!(result.findings.len(), 2);
    assert!(result.findings.iter().all(|f| f.phase.starts_with("Iteration")));
}

/// Reasoning stops as soon as the confidence threshold is met, and the best
/// candidate becomes the answer.
#[tokio::test]
async fn reasoning_concludes_on_confident_candidate() {
    let (state, _metrics) = test_state();
    let llm = FnLlm::new(|prompt| {
        if prompt.contains("next_search_query") {
            r#"{"next_search_query": "",
                "extracted_facts": ["formed during the last ice age"],
                "updated_candidates": [{"answer": "Angels Landing", "confidence": 0.9}],
                "remaining_uncertainties": [],
                "confidence": 0.9}"#
                .to_string()
        } else {
            "irrelevant".to_string()
        }
    });
    let state = state.with_llm(llm);
    register_retriever(&state, "kb", Arc::new(ScriptedRetriever::new(paris_docs())));

    let context = ResearchContext::new(vec!["kb".to_string()])
        .with_strategy("iterative-reasoning")
        .with_max_iterations(8);

    let result = ResearchOrchestrator::new(state)
        .research("ice age hike puzzle", context)
        .await;

    assert!(result.iterations <= 8);
    assert!(result.current_knowledge.contains("Angels Landing"));
    assert!(result.current_knowledge.starts_with("Answer:"));
}

/// The router re-dispatches at most once, no matter how low the downstream
/// confidence stays.
#[tokio::test]
async fn router_redispatches_at_most_once() {
    let (state, _metrics) = test_state();
    let classify_calls = Arc::new(AtomicUsize::new(0));
    let decompose_calls = Arc::new(AtomicUsize::new(0));

    let classify_counter = classify_calls.clone();
    let decompose_counter = decompose_calls.clone();
    let llm = FnLlm::new(move |prompt| {
        if prompt.contains("Classify this research query") {
            classify_counter.fetch_add(1, Ordering::SeqCst);
            "puzzle".to_string()
        } else if prompt.contains("next_search_query") {
            // Reasoning stays hopeless: low confidence forever.
            r#"{"next_search_query": "another probe",
                "extracted_facts": [],
                "updated_candidates": [{"answer": "Unsure", "confidence": 0.1}],
                "remaining_uncertainties": ["everything"],
                "confidence": 0.1}"#
                .to_string()
        } else if prompt.contains("Decompose this research topic") {
            decompose_counter.fetch_add(1, Ordering::SeqCst);
            r#"["angle one", "angle two"]"#.to_string()
        } else if prompt.contains("numbered sources") {
            "Broad synthesis [1].".to_string()
        } else {
            "[]".to_string()
        }
    });
    let state = state.with_llm(llm);
    register_retriever(&state, "kb", Arc::new(ScriptedRetriever::new(paris_docs())));

    let context = ResearchContext::new(vec!["kb".to_string()]).with_max_iterations(1);
    let result = ResearchOrchestrator::new(state)
        .research("a riddle the reasoner cannot crack", context)
        .await;

    assert_eq!(classify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        decompose_calls.load(Ordering::SeqCst),
        1,
        "source-based fallback must run exactly once"
    );
    assert!(result
        .findings
        .iter()
        .any(|f| f.phase == "Source-Based Search"));
}

/// Citation indices stay stable across iterations: the same link keeps its
/// index no matter how many times it is re-selected.
#[tokio::test]
async fn citation_indices_are_stable_across_iterations() {
    let (state, _metrics) = test_state();
    let llm = FnLlm::new(|prompt| {
        if prompt.contains("next_search_query") {
            r#"{"next_search_query": "same sources again",
                "extracted_facts": ["fact"],
                "updated_candidates": [{"answer": "X", "confidence": 0.4}],
                "remaining_uncertainties": [],
                "confidence": 0.4}"#
                .to_string()
        } else if prompt.contains("numbered sources") {
            "Synthesis [1][2].".to_string()
        } else {
            "[]".to_string()
        }
    });
    let state = state.with_llm(llm);
    register_retriever(&state, "kb", Arc::new(ScriptedRetriever::new(paris_docs())));

    let context = ResearchContext::new(vec!["kb".to_string()])
        .with_strategy("iterative-reasoning")
        .with_max_iterations(2);

    let result = ResearchOrchestrator::new(state)
        .research("repeat query", context)
        .await;

    assert_eq!(result.iterations, 2);
    // Both iterations saw the same two links; each link has exactly one index.
    let mut seen: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for link in &result.all_links_of_system {
        let index = link.index.as_deref().expect("cited result must be indexed");
        if let Some(existing) = seen.get(link.link.as_str()) {
            assert_eq!(*existing, index, "link {} changed index", link.link);
        } else {
            seen.insert(link.link.as_str(), index);
        }
    }
    assert_eq!(seen.len(), 2);
}
