use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{SearchStrategy, StrategyDeps, StrategyOutput};
use crate::core::types::Finding;
use crate::research::findings::FindingsRepository;

/// Single-pass strategy for entity/factoid queries: one search across the
/// engines, one cross-engine filter, one cited synthesis. No question
/// generation, no iteration.
pub struct DirectStrategy {
    deps: StrategyDeps,
}

impl DirectStrategy {
    pub fn new(deps: StrategyDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl SearchStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn analyze_topic(&mut self, query: &str) -> StrategyOutput {
        let deps = &self.deps;
        info!("starting direct search on topic: {query}");

        let mut repo = FindingsRepository::new();
        let questions = BTreeMap::from([(1usize, vec![query.to_string()])]);

        deps.publish(
            "Initializing direct search",
            5,
            json!({"phase": "init", "strategy": "direct", "query": query.chars().take(100).collect::<String>()}),
        );

        if deps.engines.is_empty() {
            let message = "Error: Unable to conduct research without a search engine.";
            return StrategyOutput {
                findings: vec![Finding::error(query, message)],
                iterations: 1,
                questions_by_iteration: questions,
                formatted_findings: message.to_string(),
                current_knowledge: String::new(),
                all_links_of_system: Vec::new(),
                cancelled: false,
                confidence: None,
            };
        }

        if deps.cancelled() {
            return cancelled_output(questions);
        }

        deps.publish("Searching", 20, json!({"phase": "searching", "query": query}));
        let search_results = deps.search_all(query).await;
        deps.publish(
            &format!("Found {} results", search_results.len()),
            40,
            json!({"phase": "search_complete", "result_count": search_results.len()}),
        );

        deps.publish("Filtering search results", 50, json!({"phase": "filtering"}));
        let start_index = deps.citations.issued().await;
        let mut filtered = deps
            .cross_filter
            .filter_results(search_results, query, None, None, start_index)
            .await;
        deps.publish(
            &format!("Filtered to {} results", filtered.len()),
            60,
            json!({"phase": "filtering_complete", "filtered_count": filtered.len()}),
        );

        if deps.cancelled() {
            return cancelled_output(questions);
        }

        deps.publish("Generating synthesis", 80, json!({"phase": "synthesis"}));
        let citation_result = deps
            .citations
            .analyze_followup(query, &mut filtered, "")
            .await;

        let synthesized = if citation_result.content.trim().is_empty() {
            "No relevant results found.".to_string()
        } else {
            citation_result.content
        };

        repo.add_documents(citation_result.documents.clone());
        repo.add(Finding {
            phase: "Direct Search".to_string(),
            question: query.to_string(),
            content: synthesized.clone(),
            search_results: filtered.clone(),
            documents: citation_result.documents,
        });

        let formatted_findings = repo.format_findings_to_text(&synthesized);
        deps.publish("Search complete", 100, json!({"phase": "complete"}));

        StrategyOutput {
            findings: repo.into_findings(),
            iterations: 1,
            questions_by_iteration: questions,
            formatted_findings,
            current_knowledge: synthesized,
            all_links_of_system: filtered,
            cancelled: false,
            confidence: None,
        }
    }
}

fn cancelled_output(questions: BTreeMap<usize, Vec<String>>) -> StrategyOutput {
    StrategyOutput {
        findings: Vec::new(),
        iterations: 0,
        questions_by_iteration: questions,
        formatted_findings: String::new(),
        current_knowledge: String::new(),
        all_links_of_system: Vec::new(),
        cancelled: true,
        confidence: None,
    }
}
