use anyhow::{Context, Result};
use model2vec_rs::model::StaticModel;

/// Embedding model behind the local index.
///
/// Implementations are synchronous and CPU-bound; async callers wrap them in
/// `spawn_blocking`. Vectors from different `model_id`s are incomparable —
/// the index forces a full rebuild when the id changes.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(std::slice::from_ref(&text.to_string()))?;
        batch
            .pop()
            .context("embedder returned no vector for single input")
    }
}

/// Model2Vec static-embedding implementation (distilled sentence embeddings,
/// no GPU, loads from the HF hub or a local directory).
pub struct Model2VecEmbedder {
    model: StaticModel,
    model_id: String,
    dimension: usize,
}

impl Model2VecEmbedder {
    /// Load a model by HF id or local path. Loading downloads on first use;
    /// call this off the async runtime.
    pub fn load(model_id: &str) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .with_context(|| format!("failed to load embedding model '{model_id}'"))?;
        let probe = model.encode_single("dimension probe");
        Ok(Self {
            model,
            model_id: model_id.to_string(),
            dimension: probe.len(),
        })
    }
}

impl Embedder for Model2VecEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.model.encode_single(t)).collect())
    }
}

/// Deterministic token-hashing embedder.
///
/// A degraded but dependency-free stand-in when no real model is available
/// (and the workhorse of the test suite): each token hashes into a bucket of
/// a fixed-size vector, L2-normalized. Shared tokens produce similar vectors,
/// which is all the index plumbing needs.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vec = vec![0.0f32; self.dimension];
                for token in text.to_lowercase().split_whitespace() {
                    let bucket = fnv1a(token.as_bytes()) as usize % self.dimension;
                    vec[bucket] += 1.0;
                }
                let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for x in &mut vec {
                        *x /= norm;
                    }
                }
                vec
            })
            .collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Cosine similarity between two vectors; 0.0 on shape mismatch or zero
/// magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}
