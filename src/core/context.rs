use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::types::{Finding, SearchResult};

/// Immutable per-run configuration. The orchestrator packages this once and
/// re-attaches it to every spawned worker so metric rows carry the right
/// `research_id` even off the caller's task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchContext {
    pub research_id: String,
    /// Explicit strategy name; `None` lets the smart router decide.
    pub strategy: Option<String>,
    /// Engine names to query, in preference order.
    pub search_engines: Vec<String>,
    pub max_iterations: usize,
    pub questions_per_iteration: usize,
    pub temperature: f64,
    pub fact_check: bool,
    /// Per-engine parameter overrides keyed by engine name.
    #[serde(default)]
    pub engine_params: serde_json::Map<String, Value>,
}

impl Default for ResearchContext {
    fn default() -> Self {
        Self {
            research_id: Uuid::new_v4().to_string(),
            strategy: None,
            search_engines: vec!["meta".to_string()],
            max_iterations: 8,
            questions_per_iteration: 3,
            temperature: 0.2,
            fact_check: false,
            engine_params: serde_json::Map::new(),
        }
    }
}

impl ResearchContext {
    pub fn new(search_engines: Vec<String>) -> Self {
        Self {
            search_engines,
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }
}

/// What every strategy (and therefore `research`) returns. Every error path
/// still produces this shape — partial results are always preferred over
/// failure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResearchResult {
    pub findings: Vec<Finding>,
    /// Completed iterations only; under cancellation this excludes the
    /// iteration that was cut short.
    pub iterations: usize,
    pub questions_by_iteration: BTreeMap<usize, Vec<String>>,
    pub formatted_findings: String,
    pub current_knowledge: String,
    /// Every cited result of the run, in citation order.
    pub all_links_of_system: Vec<SearchResult>,
    #[serde(default)]
    pub cancelled: bool,
    /// Non-fatal conditions accumulated during the run
    /// (`unknown_engine:<name>`, `engine_unavailable:<name>`, …).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Total wall-clock time for the run.
    #[serde(default)]
    pub total_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResearchResult {
    pub fn empty() -> Self {
        Self {
            findings: Vec::new(),
            iterations: 0,
            questions_by_iteration: BTreeMap::new(),
            formatted_findings: String::new(),
            current_knowledge: String::new(),
            all_links_of_system: Vec::new(),
            cancelled: false,
            warnings: Vec::new(),
            total_duration_ms: 0,
            error: None,
        }
    }

    pub fn from_error(query: &str, message: impl std::fmt::Display) -> Self {
        let msg = format!("Error: {message}");
        Self {
            findings: vec![Finding::error(query, msg.clone())],
            formatted_findings: msg.clone(),
            current_knowledge: msg,
            error: Some(message.to_string()),
            ..Self::empty()
        }
    }
}

/// Progress publication: `(message, percent, detail)`. Strategies call this
/// at every phase transition; the orchestrator supplies a no-op when the
/// caller does not care.
pub type ProgressCallback = Arc<dyn Fn(&str, u8, &Value) + Send + Sync>;

pub fn null_progress() -> ProgressCallback {
    Arc::new(|_message, _percent, _detail| {})
}
