use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};

use super::{detect_rate_limit, EngineParams, SearchEngine};
use crate::core::error::SearchError;
use crate::core::state::AppState;
use crate::core::types::SearchResult;

const API_URL: &str = "https://export.arxiv.org/api/query";
/// PDF text kept per paper; abstracts remain for the rest.
const MAX_PDF_CHARS: usize = 60_000;

/// arXiv adapter: Atom feed previews, full text via PDF extraction with a
/// per-run download cap.
pub struct ArxivEngine {
    client: reqwest::Client,
    params: EngineParams,
    sort_by: String,
    sort_order: String,
    max_pdf_downloads: usize,
    downloads_this_run: AtomicUsize,
}

impl ArxivEngine {
    pub fn from_settings(state: &AppState) -> Self {
        let settings = state.settings.as_ref();
        Self {
            client: state.http_client.clone(),
            params: EngineParams::load(settings, "arxiv"),
            sort_by: settings.get_string("search.engine.arxiv.sort_by", "relevance"),
            sort_order: settings.get_string("search.engine.arxiv.sort_order", "descending"),
            max_pdf_downloads: settings.get_usize("search.engine.arxiv.max_pdf_downloads", 3),
            downloads_this_run: AtomicUsize::new(0),
        }
    }
}

#[derive(Default)]
struct EntryAccumulator {
    id: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    pdf_link: String,
}

/// Parse the Atom feed into previews. The snippet is the abstract; the PDF
/// link rides along in `extra` for the full-content phase.
pub(crate) fn parse_atom_feed(xml: &str, max_results: usize) -> Result<Vec<SearchResult>, SearchError> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    let mut entry: Option<EntryAccumulator> = None;
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"entry" => entry = Some(EntryAccumulator::default()),
                b"title" if entry.is_some() => field = Some("title"),
                b"summary" if entry.is_some() => field = Some("summary"),
                b"id" if entry.is_some() => field = Some("id"),
                b"published" if entry.is_some() => field = Some("published"),
                b"name" if entry.is_some() => field = Some("author"),
                _ => {}
            },
            Ok(Event::Empty(e)) if e.name().as_ref() == b"link" => {
                if let Some(acc) = entry.as_mut() {
                    let mut href = String::new();
                    let mut is_pdf = false;
                    for attr in e.attributes().flatten() {
                        let value = String::from_utf8_lossy(&attr.value).to_string();
                        match attr.key.as_ref() {
                            b"href" => href = value,
                            b"title" if value == "pdf" => is_pdf = true,
                            b"type" if value == "application/pdf" => is_pdf = true,
                            _ => {}
                        }
                    }
                    if is_pdf && !href.is_empty() {
                        acc.pdf_link = href;
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(acc), Some(name)) = (entry.as_mut(), field) {
                    let text = t.unescape().unwrap_or_default().to_string();
                    match name {
                        "title" => acc.title.push_str(&text),
                        "summary" => acc.summary.push_str(&text),
                        "id" => acc.id.push_str(&text),
                        "published" => acc.published.push_str(&text),
                        "author" => acc.authors.push(text.trim().to_string()),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"entry" => {
                    if let Some(acc) = entry.take() {
                        if out.len() < max_results && !acc.id.trim().is_empty() {
                            out.push(entry_to_preview(acc, out.len()));
                        }
                    }
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(SearchError::Parse(format!("bad atom feed: {e}"))),
            _ => {}
        }
    }

    Ok(out)
}

fn entry_to_preview(acc: EntryAccumulator, ordinal: usize) -> SearchResult {
    let title = acc.title.split_whitespace().collect::<Vec<_>>().join(" ");
    let snippet = acc.summary.split_whitespace().collect::<Vec<_>>().join(" ");
    let link = acc.id.trim().to_string();

    let mut result = SearchResult::preview(format!("arxiv-{ordinal}"), title, link, snippet, "arxiv");
    if !acc.pdf_link.is_empty() {
        result.extra.insert("pdf_url".into(), acc.pdf_link.into());
    }
    if !acc.published.is_empty() {
        result
            .extra
            .insert("published".into(), acc.published.trim().into());
    }
    if !acc.authors.is_empty() {
        result.extra.insert(
            "authors".into(),
            serde_json::Value::Array(acc.authors.into_iter().map(Into::into).collect()),
        );
    }
    result
}

#[async_trait]
impl SearchEngine for ArxivEngine {
    fn name(&self) -> &str {
        "arxiv"
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
        let search_query = format!("all:{query}");
        let max_results = self.params.max_results.to_string();
        let resp = self
            .client
            .get(API_URL)
            .query(&[
                ("search_query", search_query.as_str()),
                ("start", "0"),
                ("max_results", max_results.as_str()),
                ("sortBy", self.sort_by.as_str()),
                ("sortOrder", self.sort_order.as_str()),
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
            return Err(SearchError::Transport(format!("arxiv returned {status}")));
        }

        parse_atom_feed(&body, self.params.max_results)
    }

    /// Abstracts become `content` for every paper; the first few also get
    /// their PDF downloaded and extracted, bounded by the per-run cap.
    async fn get_full_content(
        &self,
        previews: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let mut out = Vec::with_capacity(previews.len());

        for mut preview in previews {
            preview.content = Some(preview.snippet.clone());

            let pdf_url = preview
                .extra
                .get("pdf_url")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            if let Some(pdf_url) = pdf_url {
                let used = self.downloads_this_run.fetch_add(1, Ordering::SeqCst);
                if used < self.max_pdf_downloads {
                    match self.fetch_pdf_text(&pdf_url).await {
                        Ok(text) if !text.trim().is_empty() => {
                            let truncated: String = text.chars().take(MAX_PDF_CHARS).collect();
                            preview.full_content = Some(truncated);
                        }
                        Ok(_) => debug!("empty pdf text for {pdf_url}"),
                        Err(e) => warn!("pdf extraction failed for {pdf_url}: {e}"),
                    }
                } else {
                    self.downloads_this_run.fetch_sub(1, Ordering::SeqCst);
                }
            }

            if preview.full_content.is_none() {
                preview.full_content = preview.content.clone();
            }
            out.push(preview);
        }

        Ok(out)
    }
}

impl ArxivEngine {
    async fn fetch_pdf_text(&self, pdf_url: &str) -> Result<String, SearchError> {
        let resp = self
            .client
            .get(pdf_url)
            .send()
            .await
            .map_err(SearchError::from)?;
        if !resp.status().is_success() {
            return Err(SearchError::Transport(format!(
                "pdf fetch returned {}",
                resp.status()
            )));
        }
        let bytes = resp.bytes().await.map_err(SearchError::from)?;

        // PDF extraction is CPU-bound; keep it off the runtime threads.
        tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem(&bytes)
                .map_err(|e| SearchError::Parse(format!("pdf extract: {e}")))
        })
        .await
        .map_err(|e| SearchError::Parse(format!("pdf task join: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>ArXiv Query Results</title>
  <entry>
    <id>http://arxiv.org/abs/2101.00001v1</id>
    <title>Adaptive  Retrieval
      Systems</title>
    <summary>We study adaptive retrieval.</summary>
    <published>2021-01-01T00:00:00Z</published>
    <author><name>A. Author</name></author>
    <link href="http://arxiv.org/abs/2101.00001v1" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2101.00001v1" rel="related" type="application/pdf"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2101.00002v2</id>
    <title>Second Paper</title>
    <summary>Another abstract.</summary>
    <published>2021-02-01T00:00:00Z</published>
    <author><name>B. Writer</name></author>
  </entry>
</feed>"#;

    #[test]
    fn atom_entries_parse_into_previews() {
        let results = parse_atom_feed(FEED, 10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Adaptive Retrieval Systems");
        assert_eq!(results[0].link, "http://arxiv.org/abs/2101.00001v1");
        assert_eq!(results[0].snippet, "We study adaptive retrieval.");
        assert_eq!(
            results[0].extra.get("pdf_url").and_then(|v| v.as_str()),
            Some("http://arxiv.org/pdf/2101.00001v1")
        );
        assert_eq!(results[1].extra.get("pdf_url"), None);
    }

    #[test]
    fn feed_parse_respects_max_results() {
        let results = parse_atom_feed(FEED, 1).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn malformed_feed_is_a_parse_error() {
        let err = parse_atom_feed("<feed><entry><title>unclosed", 10);
        // Either an explicit error or an empty set is acceptable for garbage
        // input, but it must not panic.
        if let Ok(results) = err {
            assert!(results.is_empty());
        }
    }
}
