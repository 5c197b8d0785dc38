//! Local embedding index.
//!
//! Manages named collections of folders. Each folder gets its own on-disk
//! vector store under `<cache_dir>/index_<folder_hash>/`; a shared
//! `index_metadata.json` maps folder hashes to their indexing state,
//! including the `relpath → [chunk_id…]` table that makes incremental
//! re-indexing possible.

pub mod chunker;
pub mod embed;
pub mod loader;
pub mod store;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::SettingsProvider;
use crate::core::types::SearchResult;
use embed::Embedder;
use store::{ChunkRow, ChunkStore};

/// Indexing configuration. Changing `chunk_size`, `chunk_overlap` or the
/// embedding model invalidates existing vectors and forces a full rebuild —
/// vectors are incomparable across embedding configs.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub cache_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub score_threshold: f32,
}

impl IndexConfig {
    pub fn from_settings(settings: &dyn SettingsProvider) -> Self {
        let cache_dir = settings
            .get_string_opt("local_index.cache_dir")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".delver").join("local_index")))
            .unwrap_or_else(|| PathBuf::from(".delver-index"));
        Self {
            cache_dir,
            chunk_size: settings.get_usize("local_index.chunk_size", 1000),
            chunk_overlap: settings.get_usize("local_index.chunk_overlap", 200),
            score_threshold: settings.get_f64("local_index.score_threshold", 0.1) as f32,
        }
    }
}

/// A named group of folders searched together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub folders: Vec<PathBuf>,
}

/// Collections come from `local_index.collections` (array of
/// `{name, folders}`); a bare `local_index.folders` array becomes the
/// `default` collection.
pub fn collections_from_settings(settings: &dyn SettingsProvider) -> Vec<CollectionConfig> {
    let mut out = Vec::new();

    if let Some(serde_json::Value::Array(items)) = settings.get("local_index.collections") {
        for item in items {
            match serde_json::from_value::<CollectionConfig>(item) {
                Ok(collection) => out.push(collection),
                Err(e) => warn!("bad local_index collection entry: {e}"),
            }
        }
    }

    if let Some(serde_json::Value::Array(folders)) = settings.get("local_index.folders") {
        let folders: Vec<PathBuf> = folders
            .into_iter()
            .filter_map(|v| v.as_str().map(PathBuf::from))
            .collect();
        if !folders.is_empty() {
            out.push(CollectionConfig {
                name: "default".to_string(),
                folders,
            });
        }
    }

    out
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderMetadata {
    pub path: String,
    pub last_indexed: f64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_model: String,
    /// relpath → chunk ids currently live in the store for that file.
    pub indexed_files: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataDoc {
    folders: BTreeMap<String, FolderMetadata>,
}

/// Outcome of one `index_folder` pass.
#[derive(Debug, Default, Clone)]
pub struct IndexReport {
    pub files_indexed: usize,
    pub files_removed: usize,
    pub chunks_added: usize,
    pub chunks_removed: usize,
    pub full_rebuild: bool,
}

impl IndexReport {
    pub fn did_work(&self) -> bool {
        self.files_indexed > 0 || self.files_removed > 0 || self.chunks_removed > 0
    }
}

/// The document index: folder walking, chunking, embedding, vector storage
/// and incremental maintenance.
pub struct DocumentIndex {
    config: IndexConfig,
    embedder: Arc<dyn Embedder>,
    metadata: Mutex<MetadataDoc>,
    // One lazily-opened store handle per folder; the RwLock lets searches
    // proceed concurrently while a re-index holds the write side.
    stores: moka::future::Cache<String, Arc<RwLock<ChunkStore>>>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl DocumentIndex {
    pub fn new(config: IndexConfig, embedder: Arc<dyn Embedder>) -> Self {
        let metadata = Self::load_metadata(&config.cache_dir);
        Self {
            config,
            embedder,
            metadata: Mutex::new(metadata),
            stores: moka::future::Cache::builder().max_capacity(64).build(),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Stable hash of the canonical folder path; names the on-disk artifacts.
    pub fn folder_hash(folder: &Path) -> String {
        let canonical = folder
            .canonicalize()
            .unwrap_or_else(|_| folder.to_path_buf());
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        hex_prefix(&digest, 16)
    }

    fn store_dir(&self, hash: &str) -> PathBuf {
        self.config.cache_dir.join(format!("index_{hash}"))
    }

    fn metadata_path(&self) -> PathBuf {
        self.config.cache_dir.join("index_metadata.json")
    }

    fn load_metadata(cache_dir: &Path) -> MetadataDoc {
        let path = cache_dir.join("index_metadata.json");
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("corrupt index metadata at {}: {e}", path.display());
                MetadataDoc::default()
            }),
            Err(_) => MetadataDoc::default(),
        }
    }

    fn persist_metadata(&self, doc: &MetadataDoc) -> Result<()> {
        std::fs::create_dir_all(&self.config.cache_dir)
            .context("failed to create index cache dir")?;
        let json = serde_json::to_string_pretty(doc).context("failed to serialize metadata")?;
        std::fs::write(self.metadata_path(), json).context("failed to write index metadata")
    }

    async fn open_store(&self, hash: &str) -> Result<Arc<RwLock<ChunkStore>>> {
        let dir = self.store_dir(hash);
        let dimension = self.embedder.dimension();
        self.stores
            .try_get_with(hash.to_string(), async move {
                ChunkStore::open(&dir, dimension).await.map(|s| Arc::new(RwLock::new(s)))
            })
            .await
            .map_err(|e: Arc<anyhow::Error>| anyhow::anyhow!("store open failed: {e}"))
    }

    /// Index (or incrementally re-index) one folder.
    ///
    /// Work set: everything on embedding-config change or `force`; otherwise
    /// files whose mtime is newer than the last pass plus files never seen.
    /// Files that disappeared since the last pass have their chunks purged.
    /// A pass with nothing to do performs no writes at all.
    pub async fn index_folder(&self, folder: &Path, force: bool) -> Result<IndexReport> {
        let folder = folder
            .canonicalize()
            .with_context(|| format!("invalid folder {}", folder.display()))?;
        anyhow::ensure!(folder.is_dir(), "{} is not a directory", folder.display());

        let hash = Self::folder_hash(&folder);
        let mut doc = self.metadata.lock().await;

        let existing = doc.folders.get(&hash);
        let config_changed = existing.is_some_and(|e| {
            e.chunk_size != self.config.chunk_size
                || e.chunk_overlap != self.config.chunk_overlap
                || e.embedding_model != self.embedder.model_id()
        });
        let full_rebuild = force || config_changed;

        if full_rebuild {
            // Old vectors are useless (or unwanted); start from nothing.
            if config_changed {
                info!(
                    "embedding config changed for {}, rebuilding index",
                    folder.display()
                );
            }
            self.stores.invalidate(&hash).await;
            let dir = self.store_dir(&hash);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to clear {}", dir.display()))?;
            }
            doc.folders.remove(&hash);
        }

        let mut entry = doc.folders.remove(&hash).unwrap_or_else(|| FolderMetadata {
            path: folder.to_string_lossy().to_string(),
            last_indexed: 0.0,
            chunk_size: self.config.chunk_size,
            chunk_overlap: self.config.chunk_overlap,
            embedding_model: self.embedder.model_id().to_string(),
            indexed_files: BTreeMap::new(),
        });

        let live_files = loader::walk_folder(&folder)?;
        let live_rel: Vec<String> = live_files
            .iter()
            .filter_map(|p| p.strip_prefix(&folder).ok())
            .map(|p| p.to_string_lossy().to_string())
            .collect();

        // Decide the work set.
        let mut work: Vec<(PathBuf, String)> = Vec::new();
        for (abs, rel) in live_files.iter().zip(live_rel.iter()) {
            let modified = file_mtime(abs).unwrap_or(f64::MAX);
            let known = entry.indexed_files.contains_key(rel);
            if full_rebuild || !known || modified > entry.last_indexed {
                work.push((abs.clone(), rel.clone()));
            }
        }

        // Files that vanished since the last pass.
        let removed: Vec<String> = entry
            .indexed_files
            .keys()
            .filter(|rel| !live_rel.contains(rel))
            .cloned()
            .collect();

        let mut report = IndexReport {
            full_rebuild,
            ..Default::default()
        };

        if work.is_empty() && removed.is_empty() {
            debug!("index pass for {} found nothing to do", folder.display());
            doc.folders.insert(hash, entry);
            return Ok(report);
        }

        let store = self.open_store(&hash).await?;
        let store = store.write().await;

        for rel in &removed {
            if let Some(ids) = entry.indexed_files.remove(rel) {
                report.chunks_removed += ids.len();
                store.delete_ids(&ids).await?;
            }
            report.files_removed += 1;
        }

        for (abs, rel) in &work {
            let text = match loader::load_document(abs) {
                Ok(text) => text,
                Err(e) => {
                    warn!("skipping {}: {e:#}", abs.display());
                    continue;
                }
            };

            let chunks =
                chunker::split_text(&text, self.config.chunk_size, self.config.chunk_overlap);

            // A modified file drops its old chunks before the new ones land.
            if let Some(old_ids) = entry.indexed_files.remove(rel) {
                report.chunks_removed += old_ids.len();
                store.delete_ids(&old_ids).await?;
            }

            if chunks.is_empty() {
                continue;
            }

            let embedder = self.embedder.clone();
            let chunk_texts = chunks.clone();
            let vectors = tokio::task::spawn_blocking(move || embedder.embed_batch(&chunk_texts))
                .await
                .context("embedding task panicked")??;

            let ids: Vec<String> = chunks.iter().map(|_| Uuid::new_v4().to_string()).collect();
            let rows: Vec<ChunkRow> = ids
                .iter()
                .zip(&chunks)
                .map(|(id, text)| (id.clone(), rel.clone(), text.clone()))
                .collect();
            store.add_chunks(&rows, &vectors).await?;

            report.chunks_added += rows.len();
            report.files_indexed += 1;
            entry.indexed_files.insert(rel.clone(), ids);
        }

        drop(store);

        entry.path = folder.to_string_lossy().to_string();
        entry.last_indexed = now_secs();
        entry.chunk_size = self.config.chunk_size;
        entry.chunk_overlap = self.config.chunk_overlap;
        entry.embedding_model = self.embedder.model_id().to_string();
        doc.folders.insert(hash, entry);
        self.persist_metadata(&doc)?;

        info!(
            "indexed {}: {} files, +{} / -{} chunks{}",
            folder.display(),
            report.files_indexed,
            report.chunks_added,
            report.chunks_removed,
            if full_rebuild { " (full rebuild)" } else { "" }
        );
        Ok(report)
    }

    /// Similarity search across one or more indexed folders.
    ///
    /// Unknown or never-indexed folders are dropped with a warning. Hits are
    /// merged across folders, sorted by similarity and cut at `limit`. Each
    /// result carries `_full_content` / `_metadata` extras so the engine's
    /// full-content phase needs no further I/O.
    pub async fn search(
        &self,
        query: &str,
        folders: &[PathBuf],
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchResult>> {
        let threshold = threshold.unwrap_or(self.config.score_threshold);

        let embedder = self.embedder.clone();
        let query_owned = query.to_string();
        let query_vec = tokio::task::spawn_blocking(move || embedder.embed_one(&query_owned))
            .await
            .context("query embedding task panicked")??;

        let mut hits: Vec<SearchResult> = Vec::new();

        for folder in folders {
            let Ok(canonical) = folder.canonicalize() else {
                warn!("dropping invalid search folder {}", folder.display());
                continue;
            };
            let hash = Self::folder_hash(&canonical);
            {
                let doc = self.metadata.lock().await;
                if !doc.folders.contains_key(&hash) {
                    warn!("folder {} has no index yet, skipping", canonical.display());
                    continue;
                }
            }

            let store = match self.open_store(&hash).await {
                Ok(store) => store,
                Err(e) => {
                    warn!("could not open index for {}: {e:#}", canonical.display());
                    continue;
                }
            };
            let store = store.read().await;

            let folder_hits = match store.search(&query_vec, limit).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("search failed in {}: {e:#}", canonical.display());
                    continue;
                }
            };

            for hit in folder_hits {
                if hit.similarity < threshold {
                    continue;
                }
                hits.push(chunk_hit_to_result(hit, &canonical));
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .unwrap_or(0.0)
                .partial_cmp(&a.score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// The `relpath → chunk ids` table for one folder, if indexed.
    pub async fn indexed_files(&self, folder: &Path) -> Option<BTreeMap<String, Vec<String>>> {
        let canonical = folder.canonicalize().ok()?;
        let hash = Self::folder_hash(&canonical);
        let doc = self.metadata.lock().await;
        doc.folders.get(&hash).map(|e| e.indexed_files.clone())
    }

    /// Total chunks currently stored for one folder.
    pub async fn chunk_count(&self, folder: &Path) -> Result<usize> {
        let canonical = folder.canonicalize().context("bad folder")?;
        let hash = Self::folder_hash(&canonical);
        let store = self.open_store(&hash).await?;
        let store = store.read().await;
        store.count().await
    }

    /// Chunk ids present in the vector store for one folder.
    pub async fn stored_chunk_ids(&self, folder: &Path) -> Result<Vec<String>> {
        let canonical = folder.canonicalize().context("bad folder")?;
        let hash = Self::folder_hash(&canonical);
        let store = self.open_store(&hash).await?;
        let store = store.read().await;
        store.all_chunk_ids().await
    }
}

fn chunk_hit_to_result(hit: store::ChunkHit, folder: &Path) -> SearchResult {
    let file_path = folder.join(&hit.file);
    let filename = file_path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| hit.file.clone());
    let snippet: String = hit.text.chars().take(250).collect();

    let mut result = SearchResult::preview(
        hit.chunk_id.clone(),
        filename,
        format!("file://{}", file_path.display()),
        snippet,
        "local",
    );
    result.score = Some(f64::from(hit.similarity));
    result
        .extra
        .insert("_full_content".into(), hit.text.into());
    result.extra.insert(
        "_metadata".into(),
        serde_json::json!({
            "folder": folder.display().to_string(),
            "file": hit.file,
            "similarity": hit.similarity,
        }),
    );
    result
}

fn file_mtime(path: &Path) -> Option<f64> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}
