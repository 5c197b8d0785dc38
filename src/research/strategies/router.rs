use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{
    DirectStrategy, IterativeDecompositionStrategy, IterativeReasoningStrategy, SearchStrategy,
    SourceBasedStrategy, StrategyDeps, StrategyOutput,
};

/// A downstream result below this confidence triggers the one allowed
/// re-dispatch.
const REDISPATCH_BELOW: f64 = 0.3;

/// Query classes the router distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Factoid,
    Puzzle,
    Compound,
    Research,
}

impl QueryClass {
    fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        for (needle, class) in [
            ("factoid", Self::Factoid),
            ("puzzle", Self::Puzzle),
            ("compound", Self::Compound),
            ("research", Self::Research),
        ] {
            if lower.contains(needle) {
                return Some(class);
            }
        }
        None
    }

    fn strategy_name(self) -> &'static str {
        match self {
            Self::Factoid => "direct",
            Self::Puzzle => "iterative-reasoning",
            Self::Compound => "iterative-decomposition",
            Self::Research => "source-based",
        }
    }
}

/// Word-count / shape heuristic used when no LLM is available or the
/// classification response is unusable.
pub fn heuristic_class(query: &str) -> QueryClass {
    let words = query.split_whitespace().count();
    let lower = query.to_lowercase();
    let interrogative = ["what", "who", "when", "where", "which"]
        .iter()
        .any(|w| lower.starts_with(w));

    if interrogative && words <= 10 {
        QueryClass::Factoid
    } else if words > 25 || lower.matches('.').count() >= 3 {
        // Long multi-clause riddles read like constraint puzzles.
        QueryClass::Puzzle
    } else if lower.contains(" and ") && interrogative {
        QueryClass::Compound
    } else {
        QueryClass::Research
    }
}

/// LLM-backed query classifier + dispatcher.
///
/// Classifies the query as factoid / puzzle / compound / research, runs the
/// matching strategy, and — at most once — re-dispatches to the breadth-first
/// strategy when the first pick comes back with very low confidence.
pub struct SmartRouter {
    deps: StrategyDeps,
}

impl SmartRouter {
    pub fn new(deps: StrategyDeps) -> Self {
        Self { deps }
    }

    async fn classify(&self, query: &str) -> QueryClass {
        let Some(llm) = self.deps.llm() else {
            return heuristic_class(query);
        };

        let prompt = format!(
            "Classify this research query into exactly one category:\n\
             - factoid: a single verifiable fact (\"What is the capital of France?\")\n\
             - puzzle: composite constraints pointing at one entity\n\
             - compound: several related factual sub-questions\n\
             - research: an open-ended topic needing broad coverage\n\n\
             Query: {query}\n\nRespond with ONLY the category word."
        );

        match llm.invoke(&prompt).await {
            Ok(response) => QueryClass::parse(&response).unwrap_or_else(|| {
                warn!("unusable classification '{}', using heuristic", response.trim());
                heuristic_class(query)
            }),
            Err(e) => {
                warn!("query classification failed, using heuristic: {e}");
                heuristic_class(query)
            }
        }
    }

    fn build(&self, name: &str) -> Box<dyn SearchStrategy> {
        build_strategy(name, self.deps.clone())
    }
}

/// Name → strategy constructor map shared with the orchestrator.
pub fn build_strategy(name: &str, deps: StrategyDeps) -> Box<dyn SearchStrategy> {
    match name {
        "direct" => Box::new(DirectStrategy::new(deps)),
        "iterative-reasoning" | "reasoning" => Box::new(IterativeReasoningStrategy::new(deps)),
        "iterative-decomposition" | "decomposition" => {
            Box::new(IterativeDecompositionStrategy::new(deps))
        }
        _ => Box::new(SourceBasedStrategy::new(deps)),
    }
}

#[async_trait]
impl SearchStrategy for SmartRouter {
    fn name(&self) -> &'static str {
        "smart"
    }

    async fn analyze_topic(&mut self, query: &str) -> StrategyOutput {
        let class = self.classify(query).await;
        let chosen = class.strategy_name();
        info!("router classified query as {class:?}, dispatching to {chosen}");
        self.deps.publish(
            &format!("Routing to {chosen} strategy"),
            2,
            json!({"phase": "routing", "class": format!("{class:?}"), "strategy": chosen}),
        );

        let mut strategy = self.build(chosen);
        let output = strategy.analyze_topic(query).await;

        // One re-dispatch, ever: a confident-enough answer, a cancellation,
        // or an already-broad strategy all return as-is.
        let low_confidence = output
            .confidence
            .is_some_and(|c| c < REDISPATCH_BELOW);
        if !low_confidence || output.cancelled || chosen == "source-based" {
            return output;
        }

        info!(
            "router re-dispatching once: {chosen} returned confidence {:.2}",
            output.confidence.unwrap_or(0.0)
        );
        self.deps.publish(
            "Low confidence — re-dispatching to source-based strategy",
            50,
            json!({"phase": "redispatch", "from": chosen}),
        );
        let mut fallback = self.build("source-based");
        fallback.analyze_topic(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_parsing_accepts_wrapped_labels() {
        assert_eq!(QueryClass::parse("Category: factoid."), Some(QueryClass::Factoid));
        assert_eq!(QueryClass::parse("PUZZLE"), Some(QueryClass::Puzzle));
        assert_eq!(QueryClass::parse("none of these"), None);
    }

    #[test]
    fn classes_map_to_strategies() {
        assert_eq!(QueryClass::Factoid.strategy_name(), "direct");
        assert_eq!(QueryClass::Puzzle.strategy_name(), "iterative-reasoning");
        assert_eq!(QueryClass::Compound.strategy_name(), "iterative-decomposition");
        assert_eq!(QueryClass::Research.strategy_name(), "source-based");
    }

    #[test]
    fn heuristic_spots_factoids_and_puzzles() {
        assert_eq!(
            heuristic_class("What is the capital of France?"),
            QueryClass::Factoid
        );
        let puzzle = "I am looking for a hike. It was formed during the last ice age. \
                      Part of its name relates to a body part. Someone fell from the viewpoint. \
                      What is the name of this location?";
        assert_eq!(heuristic_class(puzzle), QueryClass::Puzzle);
        assert_eq!(
            heuristic_class("state of the art in retrieval augmented generation"),
            QueryClass::Research
        );
    }
}
