use async_trait::async_trait;
use scraper::{Html, Selector};

use super::{detect_rate_limit, EngineParams, SearchEngine};
use crate::core::error::SearchError;
use crate::core::state::AppState;
use crate::core::types::SearchResult;

/// DuckDuckGo HTML endpoint. No key, no JSON API — just the lite SERP parse.
pub struct DuckDuckGoEngine {
    client: reqwest::Client,
    params: EngineParams,
}

impl DuckDuckGoEngine {
    pub fn from_settings(state: &AppState) -> Self {
        Self {
            client: state.http_client.clone(),
            params: EngineParams::load(state.settings.as_ref(), "duckduckgo"),
        }
    }

    pub(crate) fn parse_results(html: &str, max_results: usize) -> Vec<SearchResult> {
        let doc = Html::parse_document(html);
        let sel_item = Selector::parse("div.results_links, div.result").expect("static selector");
        let sel_link = Selector::parse("a.result__a").expect("static selector");
        let sel_snip =
            Selector::parse("a.result__snippet, div.result__snippet").expect("static selector");

        let mut out = Vec::new();
        for item in doc.select(&sel_item) {
            if out.len() >= max_results {
                break;
            }

            let Some(anchor) = item.select(&sel_link).next() else {
                continue;
            };
            let Some(link) = normalize_ddg_href(anchor.value().attr("href").unwrap_or("")) else {
                continue;
            };
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
                format!("ddg-{}", out.len()),
                title,
                link,
                snippet,
                "duckduckgo",
            ));
        }

        out
    }
}

/// DDG wraps outbound links in a `/l/?uddg=` redirect; unwrap it.
fn normalize_ddg_href(href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    let candidate = if href.starts_with("//") {
        format!("https:{href}")
    } else if href.starts_with('/') {
        format!("https://duckduckgo.com{href}")
    } else {
        href.to_string()
    };

    if let Ok(url) = url::Url::parse(&candidate) {
        if matches!(url.host_str(), Some("duckduckgo.com")) && url.path().starts_with("/l/") {
            for (k, v) in url.query_pairs() {
                if k == "uddg" && !v.trim().is_empty() {
                    return Some(v.to_string());
                }
            }
        }
    }

    candidate
        .starts_with("http")
        .then_some(candidate)
}

#[async_trait]
impl SearchEngine for DuckDuckGoEngine {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    fn max_results(&self) -> usize {
        self.params.max_results
    }

    fn max_filtered_results(&self) -> usize {
        self.params.max_filtered_results
    }

    async fn get_previews(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let mut url = reqwest::Url::parse("https://html.duckduckgo.com/html/")
            .map_err(|e| SearchError::Config(e.to_string()))?;
        url.query_pairs_mut().append_pair("q", query);
        if let Some(region) = &self.params.region {
            url.query_pairs_mut().append_pair("kl", region);
        }

        let resp = self
            .client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml")
            .send()
            .await
            .map_err(SearchError::from)?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if let Some(reason) = detect_rate_limit(status, &body) {
            return Err(SearchError::rate_limited(reason));
        }
        if !status.is_success() {
            return Err(SearchError::Transport(format!("duckduckgo returned {status}")));
        }

        Ok(Self::parse_results(&body, self.params.max_results))
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

    #[test]
    fn redirect_links_are_unwrapped() {
        let href = "//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fpage&rut=abc";
        assert_eq!(
            normalize_ddg_href(href),
            Some("https://example.com/page".to_string())
        );
    }

    #[test]
    fn absolute_links_pass_through() {
        assert_eq!(
            normalize_ddg_href("https://example.com/x"),
            Some("https://example.com/x".to_string())
        );
        assert_eq!(normalize_ddg_href("javascript:void(0)"), None);
    }

    #[test]
    fn serp_html_parses_into_previews() {
        let html = r#"
            <div class="results_links">
              <a class="result__a" href="https://example.com/one">One</a>
              <a class="result__snippet">First snippet here</a>
            </div>
            <div class="results_links">
              <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Ftwo">Two</a>
              <div class="result__snippet">Second snippet</div>
            </div>"#;
        let results = DuckDuckGoEngine::parse_results(html, 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "One");
        assert_eq!(results[1].link, "https://example.com/two");
        assert_eq!(results[1].snippet, "Second snippet");
    }

    #[test]
    fn parse_respects_max_results() {
        let html = (0..5)
            .map(|i| {
                format!(
                    r#"<div class="results_links"><a class="result__a" href="https://e.com/{i}">T{i}</a></div>"#
                )
            })
            .collect::<String>();
        assert_eq!(DuckDuckGoEngine::parse_results(&html, 3).len(), 3);
    }
}
