use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    types::Float32Type, Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lancedb::{
    query::{ExecutableQuery, QueryBase},
    Table,
};

const TABLE_NAME: &str = "chunks";

/// One chunk row to insert: `(chunk_id, relative file path, text)`.
pub type ChunkRow = (String, String, String);

/// A scored hit from similarity search.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub file: String,
    pub text: String,
    pub similarity: f32,
}

/// Per-folder vector store (one LanceDB dataset per indexed folder).
///
/// Rows are `{id, file, text, vector}`; deletion happens by chunk id or by
/// file, which is what incremental re-indexing needs.
pub struct ChunkStore {
    table: Table,
    dimension: usize,
}

impl ChunkStore {
    pub async fn open(dir: &Path, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create index dir {}", dir.display()))?;

        let db = lancedb::connect(&dir.to_string_lossy())
            .execute()
            .await
            .context("failed to connect to vector store")?;

        let schema = Arc::new(Self::chunk_schema(dimension)?);
        let table = match db.open_table(TABLE_NAME).execute().await {
            Ok(table) => table,
            Err(lancedb::Error::TableNotFound { .. }) => db
                .create_empty_table(TABLE_NAME, schema)
                .execute()
                .await
                .context("failed to create chunk table")?,
            Err(e) => return Err(e).context("failed to open chunk table"),
        };

        // Create a vector index if possible (safe to ignore failures; flat
        // search still works).
        if let Err(e) = table
            .create_index(&["vector"], lancedb::index::Index::Auto)
            .execute()
            .await
        {
            tracing::debug!("vector index creation skipped/failed: {e}");
        }

        Ok(Self { table, dimension })
    }

    fn chunk_schema(dimension: usize) -> Result<Schema> {
        let vector_len: i32 = dimension.try_into().context("embedding dimension too large")?;
        Ok(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("file", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    vector_len,
                ),
                true,
            ),
        ]))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn add_chunks(&self, rows: &[ChunkRow], vectors: &[Vec<f32>]) -> Result<()> {
        anyhow::ensure!(
            rows.len() == vectors.len(),
            "chunk/vector count mismatch: {} vs {}",
            rows.len(),
            vectors.len()
        );
        if rows.is_empty() {
            return Ok(());
        }
        for v in vectors {
            anyhow::ensure!(
                v.len() == self.dimension,
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                v.len()
            );
        }

        let schema = Arc::new(Self::chunk_schema(self.dimension)?);
        let vector_len: i32 = self.dimension.try_into().context("dimension too large")?;

        let ids: Vec<String> = rows.iter().map(|(id, _, _)| id.clone()).collect();
        let files: Vec<String> = rows.iter().map(|(_, file, _)| file.clone()).collect();
        let texts: Vec<String> = rows.iter().map(|(_, _, text)| text.clone()).collect();
        let vector_array = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            vectors
                .iter()
                .map(|v| Some(v.iter().map(|x| Some(*x)).collect::<Vec<_>>())),
            vector_len,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(files)),
                Arc::new(StringArray::from(texts)),
                Arc::new(vector_array),
            ],
        )
        .context("failed to build chunk record batch")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema);
        self.table
            .add(batches)
            .execute()
            .await
            .context("failed to add chunks to vector store")?;
        Ok(())
    }

    pub async fn delete_ids(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let list = ids
            .iter()
            .map(|id| format!("'{}'", sql_quote(id)))
            .collect::<Vec<_>>()
            .join(", ");
        self.table
            .delete(&format!("id IN ({list})"))
            .await
            .context("failed to delete chunk ids")?;
        Ok(())
    }

    pub async fn delete_files(&self, files: &[String]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let list = files
            .iter()
            .map(|f| format!("'{}'", sql_quote(f)))
            .collect::<Vec<_>>()
            .join(", ");
        self.table
            .delete(&format!("file IN ({list})"))
            .await
            .context("failed to delete chunks by file")?;
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .context("failed to count chunks")
    }

    /// Every chunk id currently stored. Intended for consistency checks.
    pub async fn all_chunk_ids(&self) -> Result<Vec<String>> {
        let stream = self
            .table
            .query()
            .limit(1_000_000)
            .execute()
            .await
            .context("failed to scan chunk store")?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.context("scan read failed")?;

        let mut out = Vec::new();
        for batch in &batches {
            let ids = string_column(batch, "id")?;
            for row in 0..batch.num_rows() {
                out.push(ids.value(row).to_string());
            }
        }
        Ok(out)
    }

    /// Nearest chunks by cosine similarity (`similarity = 1 − distance`).
    pub async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<ChunkHit>> {
        anyhow::ensure!(
            vector.len() == self.dimension,
            "query dimension mismatch: expected {}, got {}",
            self.dimension,
            vector.len()
        );

        let stream = self
            .table
            .query()
            .nearest_to(vector)
            .context("failed to build vector query")?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(limit)
            .execute()
            .await
            .context("vector search failed")?;
        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .context("failed to read search results")?;

        let mut out = Vec::new();
        for batch in &batches {
            let ids = string_column(batch, "id")?;
            let files = string_column(batch, "file")?;
            let texts = string_column(batch, "text")?;
            let distances: Option<&Float32Array> = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

            for row in 0..batch.num_rows() {
                let distance = distances.map(|d| d.value(row)).unwrap_or(1.0);
                let similarity = (1.0 - distance).clamp(0.0, 1.0);
                out.push(ChunkHit {
                    chunk_id: ids.value(row).to_string(),
                    file: files.value(row).to_string(),
                    text: texts.value(row).to_string(),
                    similarity,
                });
            }
        }

        out.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(out)
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .with_context(|| format!("missing column: {name}"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("invalid type for column: {name}"))
}

fn sql_quote(s: &str) -> String {
    s.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_quoting_doubles_single_quotes() {
        assert_eq!(sql_quote("it's"), "it''s");
        assert_eq!(sql_quote("plain"), "plain");
    }

    #[tokio::test]
    async fn add_search_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), 4).await.unwrap();

        let rows = vec![
            ("c1".to_string(), "a.txt".to_string(), "alpha".to_string()),
            ("c2".to_string(), "a.txt".to_string(), "beta".to_string()),
            ("c3".to_string(), "b.txt".to_string(), "gamma".to_string()),
        ];
        let vectors = vec![
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 0.0],
        ];
        store.add_chunks(&rows, &vectors).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3);

        let hits = store.search(&[1.0, 0.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].similarity > hits[1].similarity);

        store.delete_files(&["a.txt".to_string()]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        store.delete_ids(&["c3".to_string()]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), 4).await.unwrap();
        let rows = vec![("c1".to_string(), "a".to_string(), "t".to_string())];
        assert!(store.add_chunks(&rows, &[vec![1.0, 2.0]]).await.is_err());
        assert!(store.search(&[1.0], 5).await.is_err());
    }
}
