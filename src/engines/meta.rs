use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use super::{detect_rate_limit, EngineParams, SearchEngine};
use crate::core::error::SearchError;
use crate::core::state::AppState;
use crate::core::types::SearchResult;

/// Self-hosted meta-search aggregator (SearXNG-style instance).
///
/// Prefers the JSON API; instances with `format=json` disabled get an HTML
/// fallback parse. The aggregator fans out to its own upstreams, so this
/// engine is snippet-only — full content is someone else's job.
pub struct SearxMetaEngine {
    client: reqwest::Client,
    base_url: String,
    params: EngineParams,
    categories: Option<String>,
    time_range: Option<String>,
}

impl SearxMetaEngine {
    pub fn from_settings(state: &AppState) -> Self {
        let base_url = state
            .settings
            .get_string("search.engine.meta.base_url", "http://localhost:8080");
        Self {
            client: state.http_client.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            params: EngineParams::load(state.settings.as_ref(), "meta"),
            categories: state.settings.get_string_opt("search.engine.meta.categories"),
            time_range: state.settings.get_string_opt("search.engine.meta.time_range"),
        }
    }

    fn search_url(&self, query: &str, json: bool) -> Result<reqwest::Url, SearchError> {
        let mut url = reqwest::Url::parse(&format!("{}/search", self.base_url))
            .map_err(|e| SearchError::Config(format!("bad meta base_url: {e}")))?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("q", query);
            qp.append_pair("language", &self.params.language);
            qp.append_pair("safesearch", &self.params.safesearch.to_string());
            if let Some(categories) = &self.categories {
                qp.append_pair("categories", categories);
            }
            if let Some(time_range) = &self.time_range {
                qp.append_pair("time_range", time_range);
            }
            if json {
                qp.append_pair("format", "json");
            }
        }
        Ok(url)
    }

    fn parse_json(&self, body: &str) -> Result<Vec<SearchResult>, SearchError> {
        let doc: serde_json::Value =
            serde_json::from_str(body).map_err(|e| SearchError::Parse(e.to_string()))?;
        let results = doc
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| SearchError::Parse("no results array in meta response".into()))?;

        let mut out = Vec::new();
        for (i, item) in results.iter().enumerate() {
            if out.len() >= self.params.max_results {
                break;
            }
            let link = item.get("url").and_then(|v| v.as_str()).unwrap_or("");
            let title = item.get("title").and_then(|v| v.as_str()).unwrap_or("");
            if link.is_empty() || title.is_empty() {
                continue;
            }
            let snippet = item.get("content").and_then(|v| v.as_str()).unwrap_or("");
            let mut result =
                SearchResult::preview(format!("meta-{i}"), title, link, snippet, "meta");
            result.score = item.get("score").and_then(|v| v.as_f64());
            if let Some(upstream) = item.get("engine").and_then(|v| v.as_str()) {
                result
                    .extra
                    .insert("upstream_engine".into(), upstream.into());
            }
            out.push(result);
        }
        Ok(out)
    }

    fn parse_html(&self, body: &str) -> Vec<SearchResult> {
        let doc = Html::parse_document(body);
        let sel_item = Selector::parse("article.result").expect("static selector");
        let sel_link = Selector::parse("h3 a").expect("static selector");
        let sel_snip = Selector::parse("p.content").expect("static selector");

        let mut out = Vec::new();
        for (i, item) in doc.select(&sel_item).enumerate() {
            if out.len() >= self.params.max_results {
                break;
            }
            let Some(anchor) = item.select(&sel_link).next() else {
                continue;
            };
            let link = anchor.value().attr("href").unwrap_or("").trim();
            if !link.starts_with("http") {
                continue;
            }
            let title = anchor.text().collect::<Vec<_>>().join(" ");
            let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
            if title.is_empty() {
                continue;
            }
            let snippet = item
                .select(&sel_snip)
                .next()
                .map(|n| n.text().collect::<Vec<_>>().join(" "))
                .unwrap_or_default();
            let snippet = snippet.split_whitespace().collect::<Vec<_>>().join(" ");
            out.push(SearchResult::preview(
                format!("meta-{i}"),
                title,
                link,
                snippet,
                "meta",
            ));
        }
        out
    }
}

#[async_trait]
impl SearchEngine for SearxMetaEngine {
    fn name(&self) -> &str {
        "meta"
    }

    fn max_results(&self) -> usize {
        self.params.max_results
    }

    fn max_filtered_results(&self) -> usize {
        self.params.max_filtered_results
    }

    async fn get_previews(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let url = self.search_url(query, true)?;
        let resp = self.client.get(url).send().await.map_err(SearchError::from)?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if let Some(reason) = detect_rate_limit(status, &body) {
            return Err(SearchError::rate_limited(reason));
        }

        // Instances commonly ship with the JSON API disabled (403); fall
        // back to scraping our own instance's HTML.
        if status == reqwest::StatusCode::FORBIDDEN || self.parse_json(&body).is_err() {
            debug!("meta JSON API unavailable, falling back to HTML parse");
            let url = self.search_url(query, false)?;
            let resp = self.client.get(url).send().await.map_err(SearchError::from)?;
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if let Some(reason) = detect_rate_limit(status, &body) {
                return Err(SearchError::rate_limited(reason));
            }
            if !status.is_success() {
                return Err(SearchError::Transport(format!("meta returned {status}")));
            }
            return Ok(self.parse_html(&body));
        }

        if !status.is_success() {
            warn!("meta engine returned {status}");
            return Err(SearchError::Transport(format!("meta returned {status}")));
        }

        self.parse_json(&body)
    }

    async fn get_full_content(
        &self,
        previews: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        Ok(previews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StaticSettings;
    use std::sync::Arc;

    fn engine() -> SearxMetaEngine {
        let state = AppState::with_settings(
            reqwest::Client::new(),
            Arc::new(StaticSettings::new().set("rate_limiting.persist", false)),
        );
        SearxMetaEngine::from_settings(&state)
    }

    #[test]
    fn json_results_are_parsed_and_capped() {
        let e = engine();
        let body = serde_json::json!({
            "results": (0..20).map(|i| serde_json::json!({
                "url": format!("https://example.com/{i}"),
                "title": format!("Result {i}"),
                "content": "some snippet",
                "engine": "bing",
                "score": 1.5,
            })).collect::<Vec<_>>()
        })
        .to_string();
        let parsed = e.parse_json(&body).unwrap();
        assert_eq!(parsed.len(), 10);
        assert_eq!(parsed[0].engine, "meta");
        assert_eq!(
            parsed[0].extra.get("upstream_engine").and_then(|v| v.as_str()),
            Some("bing")
        );
    }

    #[test]
    fn results_without_links_are_dropped() {
        let e = engine();
        let body = r#"{"results": [{"title": "no url"}, {"url": "https://a.com", "title": "ok"}]}"#;
        let parsed = e.parse_json(body).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].link, "https://a.com");
    }

    #[test]
    fn html_fallback_parses_articles() {
        let e = engine();
        let html = r#"
            <html><body>
              <article class="result">
                <h3><a href="https://example.com/a">First hit</a></h3>
                <p class="content">A useful snippet.</p>
              </article>
              <article class="result">
                <h3><a href="/relative">Skipped</a></h3>
              </article>
            </body></html>"#;
        let parsed = e.parse_html(html);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].title, "First hit");
        assert_eq!(parsed[0].snippet, "A useful snippet.");
    }
}
