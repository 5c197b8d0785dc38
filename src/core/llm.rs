use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::config::SettingsProvider;
use super::error::SearchError;

/// Language-model handle used for relevance filtering, query shaping and
/// synthesis. Implementations must be thread-safe; transport retries are the
/// implementation's business, not the core's.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<String, SearchError>;
}

/// OpenAI-compatible chat-completions client.
///
/// Resolution chain for every knob: settings key → env var → default, so a
/// key-less local endpoint (Ollama / LM Studio) works by just setting
/// `llm.base_url`.
pub struct OpenAiCompatLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl OpenAiCompatLlm {
    pub fn from_settings(client: reqwest::Client, settings: &dyn SettingsProvider) -> Self {
        let base_url = settings.get_string_opt("llm.base_url").unwrap_or_else(|| {
            std::env::var("OPENAI_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
        });
        let api_key = settings
            .get_string_opt("llm.api_key")
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|v| !v.trim().is_empty()));
        let model = settings.get_string("llm.model", "gpt-4o-mini");
        let temperature = settings.get_f64("llm.temperature", 0.2);
        let max_tokens = settings.get_u64("llm.max_tokens", 1024) as u32;

        Self {
            client,
            base_url,
            api_key,
            model,
            temperature,
            max_tokens,
        }
    }

    /// True when a usable endpoint is configured (key present, or an
    /// explicitly non-default base URL that presumably needs none).
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() || !self.base_url.contains("api.openai.com")
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatLlm {
    async fn invoke(&self, prompt: &str) -> Result<String, SearchError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                req = req.bearer_auth(key);
            }
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SearchError::Llm(format!("request failed: {e}")))?;
        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| SearchError::Llm(format!("bad response body: {e}")))?;

        if !status.is_success() {
            return Err(SearchError::Llm(format!(
                "endpoint returned {status}: {}",
                payload
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
            )));
        }

        payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| SearchError::Llm("no message content in response".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Response post-processing helpers
// ---------------------------------------------------------------------------

/// Strip `<think>…</think>` blocks that reasoning models prepend.
pub fn strip_think_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Locate the outermost `[…]` in an LLM response.
pub fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

/// Locate the outermost `{…}` in an LLM response.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse a ranked index array (`[3, 0, 7]`) out of a possibly chatty LLM
/// response. Returns `None` when no valid integer array can be located.
pub fn parse_index_array(text: &str) -> Option<Vec<usize>> {
    let cleaned = strip_think_tags(text);
    let array = extract_json_array(&cleaned)?;
    match serde_json::from_str::<Vec<i64>>(array) {
        Ok(values) => Some(
            values
                .into_iter()
                .filter_map(|v| usize::try_from(v).ok())
                .collect(),
        ),
        Err(e) => {
            warn!("could not parse index array from LLM response: {e}");
            None
        }
    }
}

/// Parse a JSON string array (`["a", "b"]`) out of a possibly chatty LLM
/// response. Non-string entries are dropped; no array yields an empty vec.
pub fn parse_string_array(text: &str) -> Vec<String> {
    let cleaned = strip_think_tags(text);
    let Some(array) = extract_json_array(&cleaned) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<Value>>(array) {
        Ok(values) => values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Parse the outermost JSON object out of a possibly chatty LLM response.
pub fn parse_json_object(text: &str) -> Option<Value> {
    let cleaned = strip_think_tags(text);
    let object = extract_json_object(&cleaned)?;
    serde_json::from_str(object).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_array_survives_prose_wrapping() {
        let response = "Sure! Ranked by relevance: [2, 0, 5]. Hope that helps.";
        assert_eq!(parse_index_array(response), Some(vec![2, 0, 5]));
    }

    #[test]
    fn negative_indices_are_dropped() {
        assert_eq!(parse_index_array("[-1, 3]"), Some(vec![3]));
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(parse_index_array("no array here"), None);
        assert_eq!(parse_index_array("[not, numbers]"), None);
    }

    #[test]
    fn think_tags_are_removed() {
        let text = "<think>internal monologue</think>[1, 2]";
        assert_eq!(parse_index_array(text), Some(vec![1, 2]));
    }

    #[test]
    fn string_arrays_parse_and_filter() {
        let response = r#"Here: ["first query", "second query", 3]"#;
        assert_eq!(
            parse_string_array(response),
            vec!["first query".to_string(), "second query".to_string()]
        );
        assert!(parse_string_array("nothing here").is_empty());
    }

    #[test]
    fn json_object_extraction() {
        let response = "Here you go:\n{\"confidence\": 0.9, \"answer\": \"Paris\"}\nDone.";
        let parsed = parse_json_object(response).unwrap();
        assert_eq!(parsed["answer"], "Paris");
    }
}
