use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::{EmptyStreak, SearchStrategy, StrategyDeps, StrategyOutput};
use crate::core::llm::parse_json_object;
use crate::core::types::Finding;
use crate::research::findings::FindingsRepository;

/// Consecutive unusable LLM responses tolerated before giving up.
const MAX_PARSE_FAILURES: usize = 2;

#[derive(Debug, Clone, Serialize, Default)]
pub struct CandidateAnswer {
    pub answer: String,
    pub confidence: f64,
}

/// The strategy's running belief: facts, candidates, open questions and an
/// overall confidence. Mutated only here.
#[derive(Debug, Clone, Serialize, Default)]
pub struct KnowledgeState {
    pub key_facts: Vec<String>,
    pub candidate_answers: Vec<CandidateAnswer>,
    pub uncertainties: Vec<String>,
    pub search_history: Vec<String>,
    pub iteration: usize,
    pub confidence: f64,
}

impl KnowledgeState {
    /// Merge new candidates by normalized-answer equality, keeping the
    /// highest confidence (and its surface form). Returns true when anything
    /// changed.
    pub fn merge_candidates(&mut self, incoming: Vec<CandidateAnswer>) -> bool {
        let mut changed = false;
        for candidate in incoming {
            let candidate = CandidateAnswer {
                confidence: candidate.confidence.clamp(0.0, 1.0),
                ..candidate
            };
            let key = normalize_answer(&candidate.answer);
            if key.is_empty() {
                continue;
            }
            match self
                .candidate_answers
                .iter_mut()
                .find(|c| normalize_answer(&c.answer) == key)
            {
                Some(existing) => {
                    if candidate.confidence > existing.confidence {
                        *existing = candidate;
                        changed = true;
                    }
                }
                None => {
                    self.candidate_answers.push(candidate);
                    changed = true;
                }
            }
        }
        self.candidate_answers.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        changed
    }

    pub fn add_facts(&mut self, facts: Vec<String>) {
        for fact in facts {
            let fact = fact.trim().to_string();
            if !fact.is_empty() && !self.key_facts.contains(&fact) {
                self.key_facts.push(fact);
            }
        }
    }

    pub fn best_candidate(&self) -> Option<&CandidateAnswer> {
        self.candidate_answers.first()
    }
}

/// Deterministic merge key: lowercased, non-alphanumerics collapsed to single
/// spaces.
pub fn normalize_answer(answer: &str) -> String {
    let mut out = String::with_capacity(answer.len());
    let mut last_space = true;
    for c in answer.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

struct ReasoningStep {
    next_search_query: String,
    extracted_facts: Vec<String>,
    updated_candidates: Vec<CandidateAnswer>,
    remaining_uncertainties: Vec<String>,
    confidence: f64,
}

fn parse_step(response: &str) -> Option<ReasoningStep> {
    let doc = parse_json_object(response)?;
    let strings = |key: &str| -> Vec<String> {
        doc.get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    let candidates = doc
        .get("updated_candidates")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(CandidateAnswer {
                        answer: item.get("answer")?.as_str()?.to_string(),
                        confidence: item.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ReasoningStep {
        next_search_query: doc
            .get("next_search_query")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        extracted_facts: strings("extracted_facts"),
        updated_candidates: candidates,
        remaining_uncertainties: strings("remaining_uncertainties"),
        confidence: doc
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0),
    })
}

/// Iterative-reasoning strategy for puzzle-like queries: maintain a knowledge
/// state, let the LLM pick the next probe, search, fold the evidence back in,
/// and stop once the confidence threshold is met or the iteration budget is
/// spent. The final answer is the highest-confidence candidate.
pub struct IterativeReasoningStrategy {
    deps: StrategyDeps,
    confidence_threshold: f64,
}

impl IterativeReasoningStrategy {
    pub fn new(deps: StrategyDeps) -> Self {
        let confidence_threshold = deps
            .services
            .settings
            .get_f64("search.reasoning.confidence_threshold", 0.85);
        Self {
            deps,
            confidence_threshold,
        }
    }

    fn reason_prompt(&self, query: &str, state: &KnowledgeState, evidence: &str) -> String {
        let state_json = serde_json::to_string_pretty(state).unwrap_or_else(|_| "{}".to_string());
        format!(
            "You are doing iterative research on a question. Review the current knowledge state \
             and the latest evidence, then decide what to search next.\n\n\
             Question: {query}\n\n\
             Knowledge state:\n{state_json}\n\n\
             Latest evidence:\n{evidence}\n\n\
             Respond with ONLY a JSON object:\n\
             {{\"next_search_query\": \"the single most informative next search\",\n\
               \"extracted_facts\": [\"fact\", ...],\n\
               \"updated_candidates\": [{{\"answer\": \"...\", \"confidence\": 0.0}}, ...],\n\
               \"remaining_uncertainties\": [\"...\", ...],\n\
               \"confidence\": 0.0}}\n\
             Confidence is your overall certainty (0-1) that the best candidate answers the \
             question."
        )
    }
}

#[async_trait]
impl SearchStrategy for IterativeReasoningStrategy {
    fn name(&self) -> &'static str {
        "iterative-reasoning"
    }

    async fn analyze_topic(&mut self, query: &str) -> StrategyOutput {
        let deps = self.deps.clone();
        let max_iterations = deps.context.max_iterations.max(1);

        let mut state = KnowledgeState::default();
        let mut repo = FindingsRepository::new();
        let mut questions: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut all_links = Vec::new();
        let mut evidence = String::from("(no searches yet)");
        let mut streak = EmptyStreak::default();
        let mut parse_failures = 0usize;
        let mut completed = 0usize;
        let mut cancelled = false;

        deps.publish(
            "Starting iterative reasoning",
            5,
            json!({"phase": "init", "strategy": "iterative-reasoning", "max_iterations": max_iterations}),
        );

        for iteration in 1..=max_iterations {
            if deps.cancelled() {
                cancelled = true;
                break;
            }

            let percent = (5 + (90 * iteration) / (max_iterations + 1)).min(95) as u8;
            deps.publish(
                &format!("Reasoning iteration {iteration}/{max_iterations}"),
                percent,
                json!({"phase": "reasoning", "iteration": iteration, "confidence": state.confidence}),
            );

            // Ask the model where to look next.
            let step = match deps.llm() {
                Some(llm) => match llm.invoke(&self.reason_prompt(query, &state, &evidence)).await {
                    Ok(response) => parse_step(&response),
                    Err(e) => {
                        warn!("reasoning step failed: {e}");
                        None
                    }
                },
                None => None,
            };

            let Some(step) = step else {
                parse_failures += 1;
                if deps.llm().is_none() || parse_failures >= MAX_PARSE_FAILURES {
                    warn!("no usable reasoning step, stopping");
                    break;
                }
                continue;
            };
            parse_failures = 0;

            // Fold the step into the knowledge state. Confidence may only
            // drop when new evidence actually changed the candidate set.
            state.add_facts(step.extracted_facts.clone());
            let candidates_changed = state.merge_candidates(step.updated_candidates);
            state.uncertainties = step.remaining_uncertainties;
            state.confidence = if candidates_changed {
                step.confidence
            } else {
                step.confidence.max(state.confidence)
            };

            if state.confidence >= self.confidence_threshold {
                state.iteration = iteration;
                completed = iteration;
                info!(
                    "reasoning reached confidence {:.2} at iteration {iteration}",
                    state.confidence
                );
                break;
            }

            let search_query = if step.next_search_query.trim().is_empty() {
                query.to_string()
            } else {
                step.next_search_query.clone()
            };
            questions.insert(iteration, vec![search_query.clone()]);

            let results = deps.search_all(&search_query).await;
            if deps.cancelled() {
                // In-flight work finished, but its results are discarded.
                cancelled = true;
                break;
            }

            let result_count = results.len();
            let start_index = deps.citations.issued().await;
            let mut filtered = deps
                .cross_filter
                .filter_results(results, &search_query, None, None, start_index)
                .await;
            let citation_result = deps
                .citations
                .analyze_followup(&search_query, &mut filtered, &state.key_facts.join("\n"))
                .await;

            evidence = filtered
                .iter()
                .take(5)
                .map(|r| {
                    format!(
                        "[{}] {}: {}",
                        r.index.as_deref().unwrap_or("-"),
                        r.title,
                        r.snippet.chars().take(200).collect::<String>()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            if evidence.is_empty() {
                evidence = "(search returned nothing)".to_string();
            }

            state.search_history.push(search_query.clone());
            state.iteration = iteration;
            all_links.extend(filtered.clone());

            repo.add_documents(citation_result.documents.clone());
            repo.add(Finding {
                phase: format!("Iteration {iteration}"),
                question: search_query.clone(),
                content: citation_result.content,
                search_results: filtered,
                documents: citation_result.documents,
            });
            completed = iteration;

            if streak.observe(&search_query, result_count) {
                warn!("two empty iterations with the same query shape, stopping");
                break;
            }
        }

        // Conclusion: the best candidate wins, labeled when it fell short of
        // the threshold.
        let current_knowledge = match state.best_candidate() {
            Some(best) if state.confidence >= self.confidence_threshold => format!(
                "Answer: {} (confidence {:.0}%)\n\nKey facts:\n- {}",
                best.answer,
                best.confidence * 100.0,
                state.key_facts.join("\n- ")
            ),
            Some(best) => format!(
                "Best candidate (below confidence threshold {:.0}%): {} (confidence {:.0}%)\n\n\
                 Key facts:\n- {}\n\nOpen uncertainties:\n- {}",
                self.confidence_threshold * 100.0,
                best.answer,
                best.confidence * 100.0,
                state.key_facts.join("\n- "),
                state.uncertainties.join("\n- ")
            ),
            None if cancelled => "Research cancelled before any candidate emerged.".to_string(),
            None => "No candidate answer emerged from the searches.".to_string(),
        };

        if !cancelled {
            repo.add(Finding {
                phase: "Conclusion".to_string(),
                question: query.to_string(),
                content: current_knowledge.clone(),
                search_results: Vec::new(),
                documents: Vec::new(),
            });
        }

        deps.publish(
            "Reasoning complete",
            100,
            json!({"phase": "complete", "iterations": completed, "confidence": state.confidence}),
        );

        let formatted_findings = repo.format_findings_to_text(&current_knowledge);
        StrategyOutput {
            findings: repo.into_findings(),
            iterations: completed,
            questions_by_iteration: questions,
            formatted_findings,
            current_knowledge,
            all_links_of_system: all_links,
            cancelled,
            confidence: Some(state.confidence),
        }
    }
}
