use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One search result, in preview or full form.
///
/// `get_previews` produces the lean shape (`content` / `full_content` empty);
/// `get_full_content` upgrades previews in place. `id` is engine-local and
/// stable within a run. `index` is the citation index and is stamped only by
/// the cross-engine filter — it is a string so it survives JSON round-trips
/// through the LLM unchanged.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub link: String,
    pub snippet: String,
    /// Engine label that produced this result (e.g. "brave", "arxiv").
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Canonical extracted text (full form only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Same as `content` or a richer rendition (full form only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
    /// Engine-specific extras. The local index stashes `_full_content` /
    /// `_metadata` here so its second phase needs no extra I/O pass.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

impl SearchResult {
    pub fn preview(
        id: impl Into<String>,
        title: impl Into<String>,
        link: impl Into<String>,
        snippet: impl Into<String>,
        engine: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            link: link.into(),
            snippet: snippet.into(),
            engine: engine.into(),
            ..Default::default()
        }
    }

    /// Text to hand to synthesis: full content when present, else snippet.
    pub fn best_content(&self) -> &str {
        self.full_content
            .as_deref()
            .or(self.content.as_deref())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.snippet)
    }

    pub fn has_full_content(&self) -> bool {
        self.content.is_some() || self.full_content.is_some()
    }
}

/// One entry in the append-only record of intermediate synthesis outputs.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Finding {
    /// Strategy-defined phase label ("Direct Search", "Iteration 2", "Error").
    pub phase: String,
    pub question: String,
    pub content: String,
    #[serde(default)]
    pub search_results: Vec<SearchResult>,
    #[serde(default)]
    pub documents: Vec<Citation>,
}

impl Finding {
    pub fn error(question: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase: "Error".to_string(),
            question: question.into(),
            content: message.into(),
            search_results: Vec::new(),
            documents: Vec::new(),
        }
    }
}

/// A cited source. Two citations with the same `link` always share the same
/// `index` within a run; indices are monotonic across strategy iterations.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Citation {
    /// 1-based citation number, stringly typed to match `SearchResult::index`.
    pub index: String,
    pub link: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}
