use async_trait::async_trait;
use tracing::warn;

use super::{EngineParams, SearchEngine};
use crate::core::error::SearchError;
use crate::core::state::AppState;
use crate::core::types::SearchResult;

const API_URL: &str = "https://api.search.brave.com/res/v1/web/search";
/// Brave caps `count` per request; pagination fills the rest.
const PAGE_SIZE: usize = 20;

/// Brave Search API adapter. Requires a subscription token; constructs in
/// unavailable state without one.
pub struct BraveEngine {
    client: reqwest::Client,
    params: EngineParams,
}

impl BraveEngine {
    pub fn from_settings(state: &AppState) -> Self {
        let mut params = EngineParams::load(state.settings.as_ref(), "brave");
        if params.api_key.is_none() {
            params.api_key = std::env::var("BRAVE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty());
        }
        if params.api_key.is_none() {
            warn!("brave engine has no API key configured — marked unavailable");
        }
        Self {
            client: state.http_client.clone(),
            params,
        }
    }

    fn parse_page(&self, doc: &serde_json::Value, offset: usize) -> Vec<SearchResult> {
        let Some(items) = doc
            .get("web")
            .and_then(|w| w.get("results"))
            .and_then(|r| r.as_array())
        else {
            return Vec::new();
        };

        items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                let link = item.get("url").and_then(|v| v.as_str())?;
                let title = item.get("title").and_then(|v| v.as_str())?;
                let snippet = item
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let mut result = SearchResult::preview(
                    format!("brave-{}", offset + i),
                    title,
                    link,
                    strip_markup(snippet),
                    "brave",
                );
                if let Some(age) = item.get("age").and_then(|v| v.as_str()) {
                    result.extra.insert("age".into(), age.into());
                }
                Some(result)
            })
            .collect()
    }
}

/// Brave descriptions embed `<strong>` highlighting; drop the tags.
fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[async_trait]
impl SearchEngine for BraveEngine {
    fn name(&self) -> &str {
        "brave"
    }

    fn requires_api_key(&self) -> bool {
        true
    }

    fn is_available(&self) -> bool {
        self.params.api_key.is_some()
    }

    fn max_results(&self) -> usize {
        self.params.max_results
    }

    fn max_filtered_results(&self) -> usize {
        self.params.max_filtered_results
    }

    async fn get_previews(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let Some(api_key) = &self.params.api_key else {
            return Err(SearchError::Auth("brave API key missing".into()));
        };

        let mut out: Vec<SearchResult> = Vec::new();
        let mut offset = 0usize;

        // Paginate until the target count is reached or a page comes up short.
        while out.len() < self.params.max_results {
            let count = PAGE_SIZE.min(self.params.max_results - out.len());
            let count_param = count.to_string();
            let offset_param = (offset / PAGE_SIZE).to_string();
            let mut req = self
                .client
                .get(API_URL)
                .header("X-Subscription-Token", api_key)
                .header("Accept", "application/json")
                .query(&[
                    ("q", query),
                    ("count", count_param.as_str()),
                    ("offset", offset_param.as_str()),
                    ("search_lang", self.params.language.as_str()),
                    ("safesearch", brave_safesearch(self.params.safesearch)),
                ]);
            if let Some(region) = &self.params.region {
                req = req.query(&[("country", region.as_str())]);
            }

            let resp = req.send().await.map_err(SearchError::from)?;
            let status = resp.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(SearchError::rate_limited("http_429"));
            }
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(SearchError::Auth(format!("brave rejected key: {status}")));
            }
            if !status.is_success() {
                return Err(SearchError::Transport(format!("brave returned {status}")));
            }

            let doc: serde_json::Value =
                resp.json().await.map_err(|e| SearchError::Parse(e.to_string()))?;
            let page = self.parse_page(&doc, offset);
            let page_len = page.len();
            out.extend(page);

            if page_len < count {
                break; // upstream ran out of results
            }
            offset += page_len;
        }

        out.truncate(self.params.max_results);
        Ok(out)
    }

    async fn get_full_content(
        &self,
        previews: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        Ok(previews)
    }
}

fn brave_safesearch(level: u8) -> &'static str {
    match level {
        0 => "off",
        1 => "moderate",
        _ => "strict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StaticSettings;
    use std::sync::Arc;

    fn engine_with_key() -> BraveEngine {
        let state = AppState::with_settings(
            reqwest::Client::new(),
            Arc::new(
                StaticSettings::new()
                    .set("search.engine.brave.api_key", "test-key")
                    .set("rate_limiting.persist", false),
            ),
        );
        BraveEngine::from_settings(&state)
    }

    #[test]
    fn missing_key_means_unavailable() {
        let state = AppState::with_settings(
            reqwest::Client::new(),
            Arc::new(StaticSettings::new().set("rate_limiting.persist", false)),
        );
        // Only check when the ambient env has no key configured.
        if std::env::var("BRAVE_API_KEY").is_err() {
            let engine = BraveEngine::from_settings(&state);
            assert!(!engine.is_available());
            assert!(engine.requires_api_key());
        }
    }

    #[test]
    fn page_parsing_strips_highlight_markup() {
        let engine = engine_with_key();
        let doc = serde_json::json!({
            "web": { "results": [
                { "url": "https://a.com", "title": "A", "description": "has <strong>bold</strong> text" },
                { "title": "no url, dropped" },
            ]}
        });
        let page = engine.parse_page(&doc, 0);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].snippet, "has bold text");
        assert_eq!(page[0].id, "brave-0");
    }

    #[test]
    fn safesearch_levels_map() {
        assert_eq!(brave_safesearch(0), "off");
        assert_eq!(brave_safesearch(1), "moderate");
        assert_eq!(brave_safesearch(2), "strict");
    }
}
