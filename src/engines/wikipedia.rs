use async_trait::async_trait;
use tracing::warn;

use super::{detect_rate_limit, EngineParams, SearchEngine};
use crate::core::error::SearchError;
use crate::core::state::AppState;
use crate::core::types::SearchResult;

/// Wikipedia search via the MediaWiki action API; full content via the
/// plaintext extracts endpoint.
pub struct WikipediaEngine {
    client: reqwest::Client,
    params: EngineParams,
    api_url: String,
    base_url: String,
}

impl WikipediaEngine {
    pub fn from_settings(state: &AppState) -> Self {
        let params = EngineParams::load(state.settings.as_ref(), "wikipedia");
        // Language-specific wikis share the API shape.
        let host = format!("{}.wikipedia.org", params.language);
        Self {
            client: state.http_client.clone(),
            api_url: format!("https://{host}/w/api.php"),
            base_url: format!("https://{host}/wiki"),
            params,
        }
    }

    fn page_link(&self, title: &str) -> String {
        format!("{}/{}", self.base_url, title.replace(' ', "_"))
    }
}

/// Search snippets come back with `<span class="searchmatch">` highlighting.
fn strip_html(text: &str) -> String {
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
    out.replace("&quot;", "\"").replace("&amp;", "&")
}

#[async_trait]
impl SearchEngine for WikipediaEngine {
    fn name(&self) -> &str {
        "wikipedia"
    }

    fn supports_full_search(&self) -> bool {
        true
    }

    fn max_results(&self) -> usize {
        self.params.max_results
    }

    fn max_filtered_results(&self) -> usize {
        self.params.max_filtered_results
    }

    async fn get_previews(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let limit = self.params.max_results.to_string();
        let resp = self
            .client
            .get(&self.api_url)
            .query(&[
                ("action", "query"),
                ("list", "search"),
                ("srsearch", query),
                ("srlimit", limit.as_str()),
                ("format", "json"),
            ])
            .send()
            .await
            .map_err(SearchError::from)?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if let Some(reason) = detect_rate_limit(status, &body) {
            return Err(SearchError::rate_limited(reason));
        }
        if !status.is_success() {
            return Err(SearchError::Transport(format!("wikipedia returned {status}")));
        }

        let doc: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| SearchError::Parse(e.to_string()))?;
        let hits = doc
            .get("query")
            .and_then(|q| q.get("search"))
            .and_then(|s| s.as_array())
            .ok_or_else(|| SearchError::Parse("no search array in wikipedia response".into()))?;

        let mut out = Vec::new();
        for (i, hit) in hits.iter().enumerate() {
            let Some(title) = hit.get("title").and_then(|v| v.as_str()) else {
                continue;
            };
            let snippet = hit.get("snippet").and_then(|v| v.as_str()).unwrap_or("");
            let mut result = SearchResult::preview(
                format!("wikipedia-{i}"),
                title,
                self.page_link(title),
                strip_html(snippet),
                "wikipedia",
            );
            if let Some(pageid) = hit.get("pageid").and_then(|v| v.as_u64()) {
                result.extra.insert("pageid".into(), pageid.into());
            }
            out.push(result);
        }
        Ok(out)
    }

    /// Upgrade previews with plaintext article extracts, keyed by page id.
    async fn get_full_content(
        &self,
        previews: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let mut out = Vec::with_capacity(previews.len());

        for mut preview in previews {
            let Some(pageid) = preview.extra.get("pageid").and_then(|v| v.as_u64()) else {
                preview.content = Some(preview.snippet.clone());
                out.push(preview);
                continue;
            };

            let pageid_param = pageid.to_string();
            let extract = self
                .client
                .get(&self.api_url)
                .query(&[
                    ("action", "query"),
                    ("prop", "extracts"),
                    ("explaintext", "1"),
                    ("pageids", pageid_param.as_str()),
                    ("format", "json"),
                ])
                .send()
                .await
                .ok();

            let text = match extract {
                Some(resp) if resp.status().is_success() => resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|doc| {
                        doc.get("query")
                            .and_then(|q| q.get("pages"))
                            .and_then(|p| p.get(pageid.to_string()))
                            .and_then(|p| p.get("extract"))
                            .and_then(|e| e.as_str())
                            .map(str::to_string)
                    }),
                _ => {
                    warn!("wikipedia extract fetch failed for page {pageid}");
                    None
                }
            };

            match text {
                Some(text) if !text.trim().is_empty() => {
                    preview.content = Some(text.clone());
                    preview.full_content = Some(text);
                }
                _ => {
                    preview.content = Some(preview.snippet.clone());
                    preview.full_content = Some(preview.snippet.clone());
                }
            }
            out.push(preview);
        }

        Ok(out)
    }
}
