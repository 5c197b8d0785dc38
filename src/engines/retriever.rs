use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use super::SearchEngine;
use crate::core::error::SearchError;
use crate::core::types::SearchResult;

/// A document returned by an external retriever.
#[derive(Debug, Clone)]
pub struct RetrievedDocument {
    pub page_content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Externally supplied retrieval backend. Implementations are installed into
/// the [`RetrieverRegistry`] and become addressable as named engines.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedDocument>, SearchError>;
}

/// Thread-safe name → retriever map. Registration overwrites on collision.
#[derive(Default)]
pub struct RetrieverRegistry {
    retrievers: Mutex<HashMap<String, Arc<dyn Retriever>>>,
}

impl RetrieverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, retriever: Arc<dyn Retriever>) {
        let name = name.into();
        info!("registered retriever '{name}'");
        self.retrievers
            .lock()
            .expect("retriever registry poisoned")
            .insert(name, retriever);
    }

    pub fn unregister(&self, name: &str) {
        if self
            .retrievers
            .lock()
            .expect("retriever registry poisoned")
            .remove(name)
            .is_some()
        {
            info!("unregistered retriever '{name}'");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Retriever>> {
        self.retrievers
            .lock()
            .expect("retriever registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.retrievers
            .lock()
            .expect("retriever registry poisoned")
            .contains_key(name)
    }

    pub fn list_registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .retrievers
            .lock()
            .expect("retriever registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Engine adapter over a registered retriever. The retriever's own ranking is
/// trusted — the LLM relevance filter is skipped.
pub struct RetrieverEngine {
    name: String,
    retriever: Arc<dyn Retriever>,
}

impl RetrieverEngine {
    pub fn new(name: impl Into<String>, retriever: Arc<dyn Retriever>) -> Self {
        Self {
            name: name.into(),
            retriever,
        }
    }
}

#[async_trait]
impl SearchEngine for RetrieverEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn skips_relevance_filter(&self) -> bool {
        true
    }

    fn supports_full_search(&self) -> bool {
        true
    }

    async fn get_previews(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let docs = self.retriever.retrieve(query).await?;
        let mut out = Vec::with_capacity(docs.len());
        for (i, doc) in docs.into_iter().enumerate() {
            let title = doc
                .metadata
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("Untitled document")
                .to_string();
            let link = doc
                .metadata
                .get("source")
                .or_else(|| doc.metadata.get("url"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("retriever://{}/{i}", self.name));
            let snippet: String = doc.page_content.chars().take(300).collect();

            let mut result =
                SearchResult::preview(format!("{}-{i}", self.name), title, link, snippet, &self.name);
            result
                .extra
                .insert("_full_content".into(), doc.page_content.into());
            result.extra.insert(
                "_metadata".into(),
                serde_json::Value::Object(doc.metadata),
            );
            out.push(result);
        }
        Ok(out)
    }

    /// The whole document arrived with the preview; just promote it.
    async fn get_full_content(
        &self,
        previews: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        Ok(previews
            .into_iter()
            .map(|mut preview| {
                if let Some(full) = preview
                    .extra
                    .get("_full_content")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                {
                    preview.content = Some(full.clone());
                    preview.full_content = Some(full);
                }
                preview
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRetriever(Vec<&'static str>);

    #[async_trait]
    impl Retriever for StaticRetriever {
        async fn retrieve(&self, _query: &str) -> Result<Vec<RetrievedDocument>, SearchError> {
            Ok(self
                .0
                .iter()
                .map(|content| RetrievedDocument {
                    page_content: content.to_string(),
                    metadata: serde_json::Map::new(),
                })
                .collect())
        }
    }

    #[test]
    fn registration_overwrites_on_collision() {
        let registry = RetrieverRegistry::new();
        registry.register("kb", Arc::new(StaticRetriever(vec!["a"])));
        registry.register("kb", Arc::new(StaticRetriever(vec!["b", "c"])));
        assert!(registry.is_registered("kb"));
        assert_eq!(registry.list_registered(), vec!["kb"]);
    }

    #[tokio::test]
    async fn previews_carry_full_content_in_extras() {
        let engine = RetrieverEngine::new("kb", Arc::new(StaticRetriever(vec!["document body"])));
        let previews = engine.get_previews("q").await.unwrap();
        assert_eq!(previews.len(), 1);
        assert!(previews[0].link.starts_with("retriever://kb/"));

        let full = engine.get_full_content(previews).await.unwrap();
        assert_eq!(full[0].content.as_deref(), Some("document body"));
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = RetrieverRegistry::new();
        registry.register("kb", Arc::new(StaticRetriever(vec![])));
        registry.unregister("kb");
        assert!(!registry.is_registered("kb"));
        assert!(registry.get("kb").is_none());
    }
}
