use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{EngineParams, SearchEngine};
use crate::core::error::SearchError;
use crate::core::llm::LlmProvider;
use crate::core::state::AppState;
use crate::core::types::SearchResult;

const API_BASE: &str = "https://api.github.com";

/// GitHub repository/code search.
///
/// The NL query is rewritten into GitHub qualifier syntax by the LLM when one
/// is configured, with a heuristic fallback otherwise. Full content fetches
/// the repository README on demand. A token is optional; without one the
/// unauthenticated rate limits apply.
pub struct GitHubEngine {
    client: reqwest::Client,
    params: EngineParams,
    llm: Option<Arc<dyn LlmProvider>>,
    search_kind: String,
}

impl GitHubEngine {
    pub fn from_settings(state: &AppState) -> Self {
        let settings = state.settings.as_ref();
        let mut params = EngineParams::load(settings, "github");
        if params.api_key.is_none() {
            params.api_key = std::env::var("GITHUB_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty());
        }
        Self {
            client: state.http_client.clone(),
            params,
            llm: state.llm.clone(),
            search_kind: settings.get_string("search.engine.github.search_kind", "repositories"),
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(url)
            .header("User-Agent", "delver-research")
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.params.api_key {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Rewrite a natural-language query into GitHub search syntax.
    async fn shape_query(&self, query: &str) -> String {
        if let Some(llm) = &self.llm {
            let prompt = format!(
                "Convert this natural language request into a GitHub search query using GitHub's \
                 search qualifier syntax (language:, stars:, in:name, in:readme, user:, topic:).\n\
                 Request: \"{query}\"\n\
                 Keep it short. Respond with ONLY the search query, no explanation."
            );
            match llm.invoke(&prompt).await {
                Ok(rewritten) => {
                    let rewritten = rewritten.trim().trim_matches('"').to_string();
                    if !rewritten.is_empty() && rewritten.len() < 256 {
                        debug!("github query rewritten: '{query}' -> '{rewritten}'");
                        return rewritten;
                    }
                }
                Err(e) => warn!("github query rewrite failed, using heuristic: {e}"),
            }
        }
        heuristic_query(query)
    }

    fn parse_repositories(&self, doc: &serde_json::Value) -> Vec<SearchResult> {
        let Some(items) = doc.get("items").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                let full_name = item.get("full_name").and_then(|v| v.as_str())?;
                let link = item.get("html_url").and_then(|v| v.as_str())?;
                let description = item
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let stars = item
                    .get("stargazers_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let language = item.get("language").and_then(|v| v.as_str()).unwrap_or("");

                let snippet = if language.is_empty() {
                    format!("{description} (★{stars})")
                } else {
                    format!("{description} (★{stars}, {language})")
                };
                let mut result = SearchResult::preview(
                    format!("github-{i}"),
                    full_name,
                    link,
                    snippet,
                    "github",
                );
                result.score = Some(stars as f64);
                result
                    .extra
                    .insert("full_name".into(), full_name.into());
                Some(result)
            })
            .collect()
    }

    fn parse_code(&self, doc: &serde_json::Value) -> Vec<SearchResult> {
        let Some(items) = doc.get("items").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                let path = item.get("path").and_then(|v| v.as_str())?;
                let link = item.get("html_url").and_then(|v| v.as_str())?;
                let repo = item
                    .get("repository")
                    .and_then(|r| r.get("full_name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let mut result = SearchResult::preview(
                    format!("github-{i}"),
                    format!("{repo}: {path}"),
                    link,
                    format!("Code match in {repo}"),
                    "github",
                );
                if !repo.is_empty() {
                    result.extra.insert("full_name".into(), repo.into());
                }
                Some(result)
            })
            .collect()
    }
}

/// No-LLM fallback: pass the query through, adding a language qualifier when
/// one is plainly named.
fn heuristic_query(query: &str) -> String {
    let lower = query.to_lowercase();
    for lang in ["rust", "python", "typescript", "javascript", "go", "java", "c++"] {
        if lower.split_whitespace().any(|w| w == lang) {
            let stripped: Vec<&str> = query
                .split_whitespace()
                .filter(|w| !w.eq_ignore_ascii_case(lang))
                .collect();
            return format!("{} language:{lang}", stripped.join(" "));
        }
    }
    query.to_string()
}

#[async_trait]
impl SearchEngine for GitHubEngine {
    fn name(&self) -> &str {
        "github"
    }

    fn requires_llm(&self) -> bool {
        true
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
        let shaped = self.shape_query(query).await;
        let url = format!("{API_BASE}/search/{}", self.search_kind);
        let per_page = self.params.max_results.to_string();
        let resp = self
            .request(&url)
            .query(&[("q", shaped.as_str()), ("per_page", per_page.as_str())])
            .send()
            .await
            .map_err(SearchError::from)?;
        let status = resp.status();

        if status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            // GitHub reports search throttling as 403 with a telltale body.
            return Err(SearchError::rate_limited(format!("github {status}")));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SearchError::Auth("github token rejected".into()));
        }
        if !status.is_success() {
            return Err(SearchError::Transport(format!("github returned {status}")));
        }

        let doc: serde_json::Value =
            resp.json().await.map_err(|e| SearchError::Parse(e.to_string()))?;

        Ok(match self.search_kind.as_str() {
            "code" => self.parse_code(&doc),
            _ => self.parse_repositories(&doc),
        })
    }

    /// READMEs on demand: one fetch per repository preview.
    async fn get_full_content(
        &self,
        previews: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let mut out = Vec::with_capacity(previews.len());
        for mut preview in previews {
            let full_name = preview
                .extra
                .get("full_name")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            if let Some(full_name) = full_name {
                let url = format!("{API_BASE}/repos/{full_name}/readme");
                match self
                    .request(&url)
                    .header("Accept", "application/vnd.github.raw+json")
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => {
                        let readme = resp.text().await.unwrap_or_default();
                        if !readme.trim().is_empty() {
                            preview.content = Some(readme.clone());
                            preview.full_content = Some(readme);
                        }
                    }
                    Ok(resp) => debug!("readme fetch for {full_name} returned {}", resp.status()),
                    Err(e) => warn!("readme fetch for {full_name} failed: {e}"),
                }
            }

            if preview.content.is_none() {
                preview.content = Some(preview.snippet.clone());
            }
            out.push(preview);
        }
        Ok(out)
    }
}
