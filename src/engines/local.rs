use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{EngineParams, SearchEngine};
use crate::core::error::SearchError;
use crate::core::state::AppState;
use crate::core::types::SearchResult;
use crate::index::{collections_from_settings, CollectionConfig, DocumentIndex, IndexConfig};

/// Engine over the local embedding index.
///
/// Unavailable without an embedder or any configured collection. The vector
/// score is already a ranking, so the LLM relevance filter is skipped; the
/// full-content phase just promotes the `_full_content` extras stashed by the
/// index search, avoiding a second I/O pass.
pub struct LocalIndexEngine {
    index: Option<Arc<DocumentIndex>>,
    collections: Vec<CollectionConfig>,
    params: EngineParams,
    score_threshold: f32,
}

impl LocalIndexEngine {
    pub fn from_settings(state: &AppState) -> Self {
        let settings = state.settings.as_ref();
        let params = EngineParams::load(settings, "local");
        let collections = collections_from_settings(settings);

        let index = match &state.embedder {
            Some(embedder) => Some(Arc::new(DocumentIndex::new(
                IndexConfig::from_settings(settings),
                embedder.clone(),
            ))),
            None => {
                warn!("local engine has no embedder configured — marked unavailable");
                None
            }
        };
        if collections.is_empty() {
            warn!("local engine has no collections configured — marked unavailable");
        }

        let score_threshold = settings.get_f64("local_index.score_threshold", 0.1) as f32;
        Self {
            index,
            collections,
            params,
            score_threshold,
        }
    }

    /// Engine built around an existing index (used by embedding callers that
    /// manage indexing themselves).
    pub fn with_index(index: Arc<DocumentIndex>, collections: Vec<CollectionConfig>) -> Self {
        Self {
            index: Some(index),
            collections,
            params: EngineParams {
                max_results: 10,
                max_filtered_results: 5,
                api_key: None,
                language: "en".to_string(),
                safesearch: 1,
                region: None,
            },
            score_threshold: 0.1,
        }
    }

    pub fn index(&self) -> Option<&Arc<DocumentIndex>> {
        self.index.as_ref()
    }

    /// Index every folder of every collection. Folder-level failures are
    /// logged and skipped so one bad path cannot block the rest.
    pub async fn index_collections(&self, force: bool) {
        let Some(index) = &self.index else {
            return;
        };
        for collection in &self.collections {
            for folder in &collection.folders {
                if let Err(e) = index.index_folder(folder, force).await {
                    warn!(
                        "indexing failed for {} in collection '{}': {e:#}",
                        folder.display(),
                        collection.name
                    );
                }
            }
        }
    }

    fn all_folders(&self) -> Vec<(String, PathBuf)> {
        self.collections
            .iter()
            .flat_map(|c| {
                c.folders
                    .iter()
                    .map(|f| (c.name.clone(), f.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[async_trait]
impl SearchEngine for LocalIndexEngine {
    fn name(&self) -> &str {
        "local"
    }

    fn supports_full_search(&self) -> bool {
        true
    }

    fn skips_relevance_filter(&self) -> bool {
        true
    }

    fn is_available(&self) -> bool {
        self.index.is_some() && !self.collections.is_empty()
    }

    fn max_results(&self) -> usize {
        self.params.max_results
    }

    fn max_filtered_results(&self) -> usize {
        self.params.max_filtered_results
    }

    async fn get_previews(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let Some(index) = &self.index else {
            return Err(SearchError::Config("local index has no embedder".into()));
        };

        let mut merged: Vec<SearchResult> = Vec::new();
        for (collection_name, folder) in self.all_folders() {
            let hits = index
                .search(
                    query,
                    std::slice::from_ref(&folder),
                    self.params.max_results,
                    Some(self.score_threshold),
                )
                .await
                .map_err(|e| SearchError::Index(format!("{e:#}")))?;

            for mut hit in hits {
                hit.extra
                    .insert("collection".into(), collection_name.clone().into());
                merged.push(hit);
            }
        }

        merged.sort_by(|a, b| {
            b.score
                .unwrap_or(0.0)
                .partial_cmp(&a.score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(self.params.max_results);
        Ok(merged)
    }

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
