use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use super::{detect_rate_limit, EngineParams, SearchEngine};
use crate::core::error::SearchError;
use crate::core::state::AppState;
use crate::core::types::SearchResult;

const CDX_URL: &str = "https://web.archive.org/cdx/search/cdx";
/// Snapshots listed per target URL.
const SNAPSHOTS_PER_URL: usize = 5;
/// Free-text queries resolve to at most this many target URLs.
const RESOLVED_URLS: usize = 3;

/// Wayback Machine adapter over the CDX index.
///
/// Accepts either a URL (snapshots of exactly that page) or free text, which
/// is first resolved to URLs through an injected fallback web engine. With no
/// resolver configured, free-text queries yield `[]` — reported as a config
/// failure once per run, then silently.
pub struct WaybackEngine {
    client: reqwest::Client,
    params: EngineParams,
    resolver: Option<Arc<dyn SearchEngine>>,
    from_date: Option<String>,
    to_date: Option<String>,
    missing_resolver_reported: AtomicBool,
}

impl WaybackEngine {
    pub fn from_settings(state: &AppState, resolver: Option<Arc<dyn SearchEngine>>) -> Self {
        let settings = state.settings.as_ref();
        Self {
            client: state.http_client.clone(),
            params: EngineParams::load(settings, "wayback"),
            resolver,
            from_date: settings.get_string_opt("search.engine.wayback.from_date"),
            to_date: settings.get_string_opt("search.engine.wayback.to_date"),
            missing_resolver_reported: AtomicBool::new(false),
        }
    }

    async fn snapshots_for(&self, target: &str) -> Result<Vec<SearchResult>, SearchError> {
        let limit = SNAPSHOTS_PER_URL.to_string();
        let mut req = self.client.get(CDX_URL).query(&[
            ("url", target),
            ("output", "json"),
            ("limit", limit.as_str()),
            ("filter", "statuscode:200"),
            ("collapse", "digest"),
        ]);
        if let Some(from) = &self.from_date {
            req = req.query(&[("from", from.as_str())]);
        }
        if let Some(to) = &self.to_date {
            req = req.query(&[("to", to.as_str())]);
        }

        let resp = req.send().await.map_err(SearchError::from)?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if let Some(reason) = detect_rate_limit(status, &body) {
            return Err(SearchError::rate_limited(reason));
        }
        if !status.is_success() {
            return Err(SearchError::Transport(format!("cdx returned {status}")));
        }

        parse_cdx_rows(&body, target)
    }
}

/// CDX JSON output: first row is the column header, the rest are snapshots
/// `[urlkey, timestamp, original, mimetype, statuscode, digest, length]`.
fn parse_cdx_rows(body: &str, target: &str) -> Result<Vec<SearchResult>, SearchError> {
    let rows: Vec<Vec<String>> =
        serde_json::from_str(body).map_err(|e| SearchError::Parse(format!("cdx body: {e}")))?;

    let mut out = Vec::new();
    for row in rows.iter().skip(1) {
        if row.len() < 3 {
            continue;
        }
        let timestamp = &row[1];
        let original = &row[2];
        let snapshot_url = format!("https://web.archive.org/web/{timestamp}/{original}");
        let display_date = human_timestamp(timestamp);
        out.push(SearchResult::preview(
            format!("wayback-{}", out.len()),
            format!("Archived: {original} ({display_date})"),
            snapshot_url,
            format!("Wayback Machine snapshot of {target} captured {display_date}"),
            "wayback",
        ));
    }
    Ok(out)
}

/// `20210115000000` → `2021-01-15`.
fn human_timestamp(ts: &str) -> String {
    if ts.len() >= 8 {
        format!("{}-{}-{}", &ts[0..4], &ts[4..6], &ts[6..8])
    } else {
        ts.to_string()
    }
}

fn looks_like_url(query: &str) -> bool {
    let q = query.trim();
    q.starts_with("http://") || q.starts_with("https://") || (!q.contains(' ') && q.contains('.'))
}

#[async_trait]
impl SearchEngine for WaybackEngine {
    fn name(&self) -> &str {
        "wayback"
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
        let targets: Vec<String> = if looks_like_url(query) {
            vec![query.trim().to_string()]
        } else {
            let Some(resolver) = &self.resolver else {
                // Undefined upstream; settled behavior: empty result, one
                // config failure on first use, silence after.
                if !self.missing_resolver_reported.swap(true, Ordering::SeqCst) {
                    return Err(SearchError::Config(
                        "wayback free-text query needs a resolver engine".into(),
                    ));
                }
                return Ok(Vec::new());
            };
            resolver
                .get_previews(query)
                .await?
                .into_iter()
                .map(|r| r.link)
                .filter(|l| l.starts_with("http"))
                .take(RESOLVED_URLS)
                .collect()
        };

        let mut out = Vec::new();
        for target in &targets {
            match self.snapshots_for(target).await {
                Ok(snapshots) => out.extend(snapshots),
                Err(e) if e.is_rate_limit() => return Err(e),
                Err(e) => warn!("cdx lookup failed for {target}: {e}"),
            }
            if out.len() >= self.params.max_results {
                break;
            }
        }

        // Re-key ids after merging multiple targets.
        out.truncate(self.params.max_results);
        for (i, r) in out.iter_mut().enumerate() {
            r.id = format!("wayback-{i}");
        }
        Ok(out)
    }

    /// Fetch each snapshot page and reduce it to text.
    async fn get_full_content(
        &self,
        previews: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let mut out = Vec::with_capacity(previews.len());
        for mut preview in previews {
            match self.client.get(&preview.link).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let html = resp.text().await.unwrap_or_default();
                    let text = html_to_text(&html);
                    if !text.trim().is_empty() {
                        preview.content = Some(text.clone());
                        preview.full_content = Some(text);
                    }
                }
                Ok(resp) => debug!("snapshot fetch returned {}", resp.status()),
                Err(e) => warn!("snapshot fetch failed for {}: {e}", preview.link),
            }
            if preview.content.is_none() {
                preview.content = Some(preview.snippet.clone());
            }
            out.push(preview);
        }
        Ok(out)
    }
}

/// Crude but dependency-light page-to-text: body text joined by newlines,
/// scripts and styles dropped.
fn html_to_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let body_sel = Selector::parse("body").expect("static selector");
    let Some(body) = doc.select(&body_sel).next() else {
        return String::new();
    };
    let mut out = String::new();
    for text in body.text() {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    out
}
