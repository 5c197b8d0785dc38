use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::reasoning::{normalize_answer, CandidateAnswer};
use super::{EmptyStreak, SearchStrategy, StrategyDeps, StrategyOutput};
use crate::core::llm::parse_json_object;
use crate::core::types::Finding;
use crate::research::findings::FindingsRepository;

/// Step budget for the action loop.
const MAX_STEPS: usize = 10;
/// Conclude once a candidate reaches this confidence.
const MIN_CONFIDENCE: f64 = 0.8;
const MAX_PARSE_FAILURES: usize = 2;

/// The controller's fixed action set; the LLM picks one per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    ExtractConstraints,
    ProposeCandidates,
    VerifyCandidate,
    RefineQuery,
    Conclude,
}

impl Action {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "extract_constraints" => Some(Self::ExtractConstraints),
            "propose_candidates" => Some(Self::ProposeCandidates),
            "verify_candidate" => Some(Self::VerifyCandidate),
            "refine_query" => Some(Self::RefineQuery),
            "conclude" => Some(Self::Conclude),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::ExtractConstraints => "extract_constraints",
            Self::ProposeCandidates => "propose_candidates",
            Self::VerifyCandidate => "verify_candidate",
            Self::RefineQuery => "refine_query",
            Self::Conclude => "conclude",
        }
    }
}

/// Working knowledge for constraint decomposition.
#[derive(Debug, Default, Clone, serde::Serialize)]
struct WorkingKnowledge {
    constraints: Vec<String>,
    candidates: Vec<CandidateAnswer>,
    verified_facts: Vec<String>,
    confidence: f64,
}

impl WorkingKnowledge {
    fn merge_candidates(&mut self, incoming: Vec<CandidateAnswer>) {
        for candidate in incoming {
            let key = normalize_answer(&candidate.answer);
            if key.is_empty() {
                continue;
            }
            match self
                .candidates
                .iter_mut()
                .find(|c| normalize_answer(&c.answer) == key)
            {
                Some(existing) => {
                    existing.confidence = existing.confidence.max(candidate.confidence)
                }
                None => self.candidates.push(candidate),
            }
        }
        self.candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

struct Step {
    action: Action,
    query: String,
    constraints: Vec<String>,
    candidates: Vec<CandidateAnswer>,
    verified_fact: String,
    confidence: f64,
}

fn parse_action_step(response: &str) -> Option<Step> {
    let doc = parse_json_object(response)?;
    let action = Action::parse(doc.get("action")?.as_str()?)?;
    let candidates = doc
        .get("candidates")
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
    Some(Step {
        action,
        query: doc
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        constraints: doc
            .get("constraints")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        candidates,
        verified_fact: doc
            .get("verified_fact")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        confidence: doc
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0),
    })
}

/// Iterative decomposition for compound/constraint queries.
///
/// Keeps a working knowledge of constraints, candidates and verified facts.
/// Each step the LLM picks an action; search-bearing actions issue the chosen
/// query and fold the filtered evidence back in. Ends on `conclude`, on
/// reaching [`MIN_CONFIDENCE`], or after [`MAX_STEPS`].
pub struct IterativeDecompositionStrategy {
    deps: StrategyDeps,
}

impl IterativeDecompositionStrategy {
    pub fn new(deps: StrategyDeps) -> Self {
        Self { deps }
    }

    fn step_prompt(&self, query: &str, knowledge: &WorkingKnowledge, evidence: &str) -> String {
        let knowledge_json =
            serde_json::to_string_pretty(knowledge).unwrap_or_else(|_| "{}".to_string());
        format!(
            "You are decomposing a compound research question into verifiable constraints.\n\n\
             Question: {query}\n\n\
             Working knowledge:\n{knowledge_json}\n\n\
             Latest evidence:\n{evidence}\n\n\
             Pick exactly ONE next action:\n\
             - extract_constraints: list the question's constraints\n\
             - propose_candidates: search for answers satisfying the constraints\n\
             - verify_candidate: check the top candidate against one constraint\n\
             - refine_query: reformulate the search query\n\
             - conclude: the answer is settled\n\n\
             Respond with ONLY a JSON object:\n\
             {{\"action\": \"...\", \"query\": \"search query if the action needs one\",\n\
               \"constraints\": [\"...\"], \"candidates\": [{{\"answer\": \"...\", \"confidence\": 0.0}}],\n\
               \"verified_fact\": \"...\", \"confidence\": 0.0}}"
        )
    }
}

#[async_trait]
impl SearchStrategy for IterativeDecompositionStrategy {
    fn name(&self) -> &'static str {
        "iterative-decomposition"
    }

    async fn analyze_topic(&mut self, query: &str) -> StrategyOutput {
        let deps = self.deps.clone();
        let max_steps = MAX_STEPS.min(deps.context.max_iterations.max(1) * 2).max(1);

        let mut knowledge = WorkingKnowledge::default();
        let mut repo = FindingsRepository::new();
        let mut questions: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut all_links = Vec::new();
        let mut evidence = String::from("(none yet)");
        let mut streak = EmptyStreak::default();
        let mut parse_failures = 0usize;
        let mut completed = 0usize;
        let mut cancelled = false;
        let mut concluded = false;

        deps.publish(
            "Starting constraint decomposition",
            5,
            json!({"phase": "init", "strategy": "iterative-decomposition"}),
        );

        for step_no in 1..=max_steps {
            if deps.cancelled() {
                cancelled = true;
                break;
            }

            let percent = (5 + (90 * step_no) / (max_steps + 1)).min(95) as u8;
            deps.publish(
                &format!("Decomposition step {step_no}/{max_steps}"),
                percent,
                json!({"phase": "step", "step": step_no, "confidence": knowledge.confidence}),
            );

            let step = match deps.llm() {
                Some(llm) => match llm
                    .invoke(&self.step_prompt(query, &knowledge, &evidence))
                    .await
                {
                    Ok(response) => parse_action_step(&response),
                    Err(e) => {
                        warn!("decomposition step failed: {e}");
                        None
                    }
                },
                None => None,
            };

            let Some(step) = step else {
                parse_failures += 1;
                if deps.llm().is_none() || parse_failures >= MAX_PARSE_FAILURES {
                    warn!("no usable decomposition step, stopping");
                    break;
                }
                continue;
            };
            parse_failures = 0;

            if !step.constraints.is_empty() {
                for constraint in step.constraints {
                    let constraint = constraint.trim().to_string();
                    if !constraint.is_empty() && !knowledge.constraints.contains(&constraint) {
                        knowledge.constraints.push(constraint);
                    }
                }
            }
            knowledge.merge_candidates(step.candidates);
            if !step.verified_fact.trim().is_empty() {
                knowledge.verified_facts.push(step.verified_fact.trim().to_string());
            }
            knowledge.confidence = knowledge.confidence.max(step.confidence);

            if step.action == Action::Conclude {
                info!("decomposition concluded at step {step_no}");
                completed = step_no;
                concluded = true;
                break;
            }

            // Search-bearing actions issue their query.
            let mut step_content = format!("Action: {}", step.action.label());
            if !step.query.trim().is_empty() {
                let search_query = step.query.trim().to_string();
                questions.insert(step_no, vec![search_query.clone()]);

                let results = deps.search_all(&search_query).await;
                if deps.cancelled() {
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
                    .analyze_followup(
                        &search_query,
                        &mut filtered,
                        &knowledge.verified_facts.join("\n"),
                    )
                    .await;

                evidence = filtered
                    .iter()
                    .take(5)
                    .map(|r| format!("- {}: {}", r.title, r.snippet.chars().take(200).collect::<String>()))
                    .collect::<Vec<_>>()
                    .join("\n");
                if evidence.is_empty() {
                    evidence = "(search returned nothing)".to_string();
                }

                step_content = citation_result.content.clone();
                all_links.extend(filtered.clone());
                repo.add_documents(citation_result.documents.clone());
                repo.add(Finding {
                    phase: format!("Step {step_no}: {}", step.action.label()),
                    question: search_query.clone(),
                    content: step_content.clone(),
                    search_results: filtered,
                    documents: citation_result.documents,
                });

                if streak.observe(&search_query, result_count) {
                    warn!("two empty steps with the same query shape, stopping");
                    completed = step_no;
                    break;
                }
            } else {
                repo.add(Finding {
                    phase: format!("Step {step_no}: {}", step.action.label()),
                    question: query.to_string(),
                    content: format!(
                        "{step_content}\nConstraints: {}",
                        knowledge.constraints.join("; ")
                    ),
                    search_results: Vec::new(),
                    documents: Vec::new(),
                });
            }
            completed = step_no;

            if knowledge.confidence >= MIN_CONFIDENCE {
                info!(
                    "decomposition reached confidence {:.2} at step {step_no}",
                    knowledge.confidence
                );
                concluded = true;
                break;
            }
        }

        let current_knowledge = match knowledge.candidates.first() {
            Some(best) if concluded => format!(
                "Answer: {} (confidence {:.0}%)\n\nConstraints:\n- {}\n\nVerified facts:\n- {}",
                best.answer,
                best.confidence * 100.0,
                knowledge.constraints.join("\n- "),
                knowledge.verified_facts.join("\n- ")
            ),
            Some(best) => format!(
                "Best candidate (not concluded): {} (confidence {:.0}%)\n\nConstraints:\n- {}",
                best.answer,
                best.confidence * 100.0,
                knowledge.constraints.join("\n- ")
            ),
            None if cancelled => "Research cancelled before any candidate emerged.".to_string(),
            None => "No candidate satisfied the constraints.".to_string(),
        };

        deps.publish(
            "Decomposition complete",
            100,
            json!({"phase": "complete", "steps": completed, "confidence": knowledge.confidence}),
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
            confidence: Some(knowledge.confidence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_parse_from_labels() {
        assert_eq!(Action::parse("conclude"), Some(Action::Conclude));
        assert_eq!(
            Action::parse(" Extract_Constraints "),
            Some(Action::ExtractConstraints)
        );
        assert_eq!(Action::parse("unknown"), None);
    }

    #[test]
    fn step_parse_reads_all_fields() {
        let response = r#"{"action": "verify_candidate", "query": "Angels Landing ice age",
            "constraints": ["formed in ice age"],
            "candidates": [{"answer": "Angels Landing", "confidence": 0.7}],
            "verified_fact": "carved by glaciers", "confidence": 0.7}"#;
        let step = parse_action_step(response).unwrap();
        assert_eq!(step.action, Action::VerifyCandidate);
        assert_eq!(step.constraints.len(), 1);
        assert_eq!(step.candidates.len(), 1);
        assert_eq!(step.verified_fact, "carved by glaciers");
    }

    #[test]
    fn bad_action_is_rejected() {
        assert!(parse_action_step(r#"{"action": "dance"}"#).is_none());
    }

    #[test]
    fn working_knowledge_merges_candidates_by_normalized_answer() {
        let mut knowledge = WorkingKnowledge::default();
        knowledge.merge_candidates(vec![CandidateAnswer {
            answer: "Half Dome".into(),
            confidence: 0.3,
        }]);
        knowledge.merge_candidates(vec![CandidateAnswer {
            answer: "half dome".into(),
            confidence: 0.9,
        }]);
        assert_eq!(knowledge.candidates.len(), 1);
        assert!((knowledge.candidates[0].confidence - 0.9).abs() < 1e-9);
    }
}
