use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{SearchStrategy, StrategyDeps, StrategyOutput};
use crate::core::llm::parse_string_array;
use crate::core::types::Finding;
use crate::research::findings::FindingsRepository;

/// Breadth-first strategy: decompose the topic into parallel sub-queries,
/// accumulate results across all engines, filter the union once, synthesize
/// once. One logical iteration.
pub struct SourceBasedStrategy {
    deps: StrategyDeps,
}

impl SourceBasedStrategy {
    pub fn new(deps: StrategyDeps) -> Self {
        Self { deps }
    }

    /// Sub-query generation; the original query always stays in the set.
    async fn generate_sub_queries(&self, query: &str) -> Vec<String> {
        let count = self.deps.context.questions_per_iteration.clamp(1, 8);
        let mut queries = vec![query.to_string()];

        if count > 1 {
            if let Some(llm) = self.deps.llm() {
                let prompt = format!(
                    "Decompose this research topic into {} focused web search queries that \
                     together cover its key aspects.\n\nTopic: {query}\n\n\
                     Respond with ONLY a JSON array of strings.",
                    count - 1
                );
                match llm.invoke(&prompt).await {
                    Ok(response) => {
                        for sub in parse_string_array(&response) {
                            let sub = sub.trim().to_string();
                            if !sub.is_empty() && !queries.contains(&sub) {
                                queries.push(sub);
                            }
                            if queries.len() >= count {
                                break;
                            }
                        }
                    }
                    Err(e) => warn!("sub-query generation failed, searching the topic as-is: {e}"),
                }
            }
        }

        queries
    }
}

#[async_trait]
impl SearchStrategy for SourceBasedStrategy {
    fn name(&self) -> &'static str {
        "source-based"
    }

    async fn analyze_topic(&mut self, query: &str) -> StrategyOutput {
        let deps = self.deps.clone();
        let mut repo = FindingsRepository::new();

        deps.publish(
            "Initializing source-based search",
            5,
            json!({"phase": "init", "strategy": "source-based"}),
        );

        if deps.cancelled() {
            return StrategyOutput {
                findings: Vec::new(),
                iterations: 0,
                questions_by_iteration: BTreeMap::new(),
                formatted_findings: String::new(),
                current_knowledge: String::new(),
                all_links_of_system: Vec::new(),
                cancelled: true,
                confidence: None,
            };
        }

        let sub_queries = self.generate_sub_queries(query).await;
        let questions = BTreeMap::from([(1usize, sub_queries.clone())]);
        info!("source-based search over {} sub-queries", sub_queries.len());
        deps.publish(
            &format!("Searching {} sub-queries", sub_queries.len()),
            20,
            json!({"phase": "searching", "sub_queries": sub_queries}),
        );

        // Parallel fan-out, bounded by the worker pool.
        let accumulated = deps.fan_out(&sub_queries).await;
        if deps.cancelled() {
            return StrategyOutput {
                findings: Vec::new(),
                iterations: 0,
                questions_by_iteration: questions,
                formatted_findings: String::new(),
                current_knowledge: String::new(),
                all_links_of_system: Vec::new(),
                cancelled: true,
                confidence: None,
            };
        }
        deps.publish(
            &format!("Accumulated {} raw results", accumulated.len()),
            55,
            json!({"phase": "search_complete", "result_count": accumulated.len()}),
        );

        // One cross-engine pass over the union.
        let start_index = deps.citations.issued().await;
        let mut filtered = deps
            .cross_filter
            .filter_results(accumulated, query, None, None, start_index)
            .await;
        deps.publish(
            &format!("Filtered to {} results", filtered.len()),
            70,
            json!({"phase": "filtering_complete", "filtered_count": filtered.len()}),
        );

        if deps.cancelled() {
            return StrategyOutput {
                findings: Vec::new(),
                iterations: 0,
                questions_by_iteration: questions,
                formatted_findings: String::new(),
                current_knowledge: String::new(),
                all_links_of_system: Vec::new(),
                cancelled: true,
                confidence: None,
            };
        }

        deps.publish("Generating synthesis", 85, json!({"phase": "synthesis"}));
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
            phase: "Source-Based Search".to_string(),
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
