//! Local embedding index: incremental re-indexing, idempotence, config-change
//! rebuilds and folder-scoped search.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use delver::index::embed::HashingEmbedder;
use delver::index::{DocumentIndex, IndexConfig};

fn index_with(cache_dir: &Path, chunk_size: usize) -> DocumentIndex {
    DocumentIndex::new(
        IndexConfig {
            cache_dir: cache_dir.to_path_buf(),
            chunk_size,
            chunk_overlap: chunk_size / 5,
            score_threshold: 0.0,
        },
        Arc::new(HashingEmbedder::new(64)),
    )
}

fn write_docs(dir: &Path) {
    std::fs::write(
        dir.join("rust.md"),
        "Rust is a systems programming language focused on safety and concurrency. \
         The borrow checker enforces ownership rules at compile time.",
    )
    .unwrap();
    std::fs::write(
        dir.join("cooking.txt"),
        "Slow-roasted tomatoes concentrate their sweetness. \
         Basil and olive oil complete the sauce.",
    )
    .unwrap();
}

#[tokio::test]
async fn index_then_search_finds_the_right_document() {
    let docs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_docs(docs.path());

    let index = index_with(cache.path(), 1000);
    let report = index.index_folder(docs.path(), false).await.unwrap();
    assert_eq!(report.files_indexed, 2);
    assert!(report.chunks_added >= 2);

    let hits = index
        .search(
            "rust borrow checker ownership",
            &[docs.path().to_path_buf()],
            5,
            Some(0.0),
        )
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].title, "rust.md");
    assert_eq!(hits[0].engine, "local");
    assert!(hits[0].extra.get("_full_content").is_some());
    assert!(hits[0].score.is_some());
}

#[tokio::test]
async fn reindexing_without_changes_is_a_no_op() {
    let docs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_docs(docs.path());

    let index = index_with(cache.path(), 1000);
    index.index_folder(docs.path(), false).await.unwrap();
    let files_before = index.indexed_files(docs.path()).await.unwrap();
    let ids_before = {
        let mut ids = index.stored_chunk_ids(docs.path()).await.unwrap();
        ids.sort();
        ids
    };

    let report = index.index_folder(docs.path(), false).await.unwrap();
    assert!(!report.did_work(), "second pass should do nothing: {report:?}");

    let files_after = index.indexed_files(docs.path()).await.unwrap();
    assert_eq!(files_before, files_after);
    let mut ids_after = index.stored_chunk_ids(docs.path()).await.unwrap();
    ids_after.sort();
    assert_eq!(ids_before, ids_after);
}

#[tokio::test]
async fn modifying_one_file_reindexes_only_that_file() {
    let docs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_docs(docs.path());

    let index = index_with(cache.path(), 1000);
    index.index_folder(docs.path(), false).await.unwrap();
    let before = index.indexed_files(docs.path()).await.unwrap();

    // mtime granularity can be a full second on some filesystems.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    std::fs::write(
        docs.path().join("rust.md"),
        "Rust now also has async/await. Executors schedule futures cooperatively.",
    )
    .unwrap();

    let report = index.index_folder(docs.path(), false).await.unwrap();
    assert_eq!(report.files_indexed, 1);

    let after = index.indexed_files(docs.path()).await.unwrap();
    assert_ne!(
        before.get("rust.md"),
        after.get("rust.md"),
        "modified file must get fresh chunk ids"
    );
    assert_eq!(
        before.get("cooking.txt"),
        after.get("cooking.txt"),
        "untouched file must keep its chunk ids"
    );

    // Old chunk ids for the modified file are gone from the store.
    let stored = index.stored_chunk_ids(docs.path()).await.unwrap();
    for old_id in before.get("rust.md").unwrap() {
        assert!(!stored.contains(old_id), "stale chunk {old_id} still stored");
    }
}

#[tokio::test]
async fn deleted_files_are_purged_on_the_next_pass() {
    let docs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_docs(docs.path());

    let index = index_with(cache.path(), 1000);
    index.index_folder(docs.path(), false).await.unwrap();
    let before = index.indexed_files(docs.path()).await.unwrap();
    let doomed_ids = before.get("cooking.txt").unwrap().clone();

    std::fs::remove_file(docs.path().join("cooking.txt")).unwrap();
    let report = index.index_folder(docs.path(), false).await.unwrap();
    assert_eq!(report.files_removed, 1);
    assert_eq!(report.chunks_removed, doomed_ids.len());

    let after = index.indexed_files(docs.path()).await.unwrap();
    assert!(!after.contains_key("cooking.txt"));

    let stored = index.stored_chunk_ids(docs.path()).await.unwrap();
    for id in &doomed_ids {
        assert!(!stored.contains(id));
    }
}

#[tokio::test]
async fn store_size_matches_the_metadata_ledger() {
    let docs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_docs(docs.path());

    let index = index_with(cache.path(), 60);
    index.index_folder(docs.path(), false).await.unwrap();

    let files = index.indexed_files(docs.path()).await.unwrap();
    let ledger_total: usize = files.values().map(|ids| ids.len()).sum();
    assert_eq!(index.chunk_count(docs.path()).await.unwrap(), ledger_total);
}

#[tokio::test]
async fn chunk_size_change_forces_a_full_rebuild() {
    let docs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_docs(docs.path());

    let index = index_with(cache.path(), 1000);
    index.index_folder(docs.path(), false).await.unwrap();
    let old_ids = index.stored_chunk_ids(docs.path()).await.unwrap();
    assert!(!old_ids.is_empty());
    drop(index);

    // Same cache dir, different chunking config.
    let index = index_with(cache.path(), 60);
    let report = index.index_folder(docs.path(), false).await.unwrap();
    assert!(report.full_rebuild);
    assert_eq!(report.files_indexed, 2);

    let new_ids = index.stored_chunk_ids(docs.path()).await.unwrap();
    for old_id in &old_ids {
        assert!(
            !new_ids.contains(old_id),
            "chunk {old_id} from the old config survived the rebuild"
        );
    }
}

#[tokio::test]
async fn invalid_search_folders_are_dropped_not_fatal() {
    let docs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_docs(docs.path());

    let index = index_with(cache.path(), 1000);
    index.index_folder(docs.path(), false).await.unwrap();

    let hits = index
        .search(
            "anything",
            &[
                std::path::PathBuf::from("/definitely/not/a/real/folder"),
                docs.path().to_path_buf(),
            ],
            5,
            Some(0.0),
        )
        .await
        .unwrap();
    assert!(!hits.is_empty(), "valid folder should still be searched");
}

#[tokio::test]
async fn hidden_files_are_not_indexed() {
    let docs = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_docs(docs.path());
    std::fs::write(docs.path().join(".secret.txt"), "hidden notes").unwrap();

    let index = index_with(cache.path(), 1000);
    index.index_folder(docs.path(), false).await.unwrap();
    let files = index.indexed_files(docs.path()).await.unwrap();
    assert!(!files.contains_key(".secret.txt"));
    assert_eq!(files.len(), 2);
}
