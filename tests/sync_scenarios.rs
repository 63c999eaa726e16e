//! End-to-end scenarios against two `SyncEngine` instances sharing one
//! in-memory repository, standing in for two peers connected through a
//! relay.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use pushwork::engine::{EngineOptions, SyncEngine};
use pushwork::filters::SyncFilters;
use pushwork::repo::{InMemoryRepo, Repo};
use tempfile::TempDir;

fn engine(root: &Path, repo: Arc<dyn Repo>) -> SyncEngine {
    SyncEngine::new(
        root.to_path_buf(),
        repo,
        SyncFilters::default_for_tests(),
        EngineOptions {
            sync_enabled: false,
            ..Default::default()
        },
    )
}

fn hash_directory(root: &Path) -> BTreeMap<String, String> {
    use sha2::{Digest, Sha256};

    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap();
        if rel.components().next().map(|c| c.as_os_str() == ".pushwork").unwrap_or(false) {
            continue;
        }
        let bytes = std::fs::read(entry.path()).unwrap();
        let digest = Sha256::digest(&bytes);
        out.insert(rel.to_string_lossy().to_string(), format!("{digest:x}"));
    }
    out
}

#[tokio::test]
async fn basic_clone_round_trips_a_file() {
    let repo = InMemoryRepo::new();
    let dir_a = TempDir::new().unwrap();
    let engine_a = engine(dir_a.path(), repo.clone());
    let url = engine_a.init_root(1).await.unwrap();
    std::fs::write(dir_a.path().join("hello.txt"), "Hello from A").unwrap();
    engine_a.sync(2).await.unwrap();

    let dir_b = TempDir::new().unwrap();
    let engine_b = engine(dir_b.path(), repo.clone());
    engine_b.set_root_directory_url(&url, 1).await.unwrap();
    engine_b.sync(2).await.unwrap();

    assert_eq!(hash_directory(dir_a.path()), hash_directory(dir_b.path()));

    let snapshot_a = engine_a.get_status().await.unwrap().snapshot.unwrap();
    let snapshot_b = engine_b.get_status().await.unwrap().snapshot.unwrap();
    let entry_a = snapshot_a.files.get("hello.txt").unwrap();
    let entry_b = snapshot_b.files.get("hello.txt").unwrap();
    assert_eq!(entry_a.url, entry_b.url);
    assert_eq!(entry_a.head, entry_b.head);
}

#[tokio::test]
async fn concurrent_creates_converge_within_three_rounds() {
    let repo = InMemoryRepo::new();
    let dir_a = TempDir::new().unwrap();
    let engine_a = engine(dir_a.path(), repo.clone());
    let url = engine_a.init_root(1).await.unwrap();
    engine_a.sync(2).await.unwrap();

    let dir_b = TempDir::new().unwrap();
    let engine_b = engine(dir_b.path(), repo.clone());
    engine_b.set_root_directory_url(&url, 2).await.unwrap();
    engine_b.sync(2).await.unwrap();

    std::fs::write(dir_a.path().join("file-a.txt"), "From A").unwrap();
    std::fs::write(dir_b.path().join("file-b.txt"), "From B").unwrap();

    let mut now = 3;
    for _ in 0..3 {
        engine_a.sync(now).await.unwrap();
        engine_b.sync(now).await.unwrap();
        now += 1;
    }

    assert!(dir_a.path().join("file-a.txt").exists());
    assert!(dir_a.path().join("file-b.txt").exists());
    assert!(dir_b.path().join("file-a.txt").exists());
    assert!(dir_b.path().join("file-b.txt").exists());
}

#[tokio::test]
async fn rename_with_modification_preserves_document_url() {
    let repo = InMemoryRepo::new();
    let dir_a = TempDir::new().unwrap();
    let engine_a = engine(dir_a.path(), repo.clone());
    let url = engine_a.init_root(1).await.unwrap();

    let long_text = "the quick brown fox jumps over the lazy dog\n".repeat(20);
    std::fs::write(dir_a.path().join("original.txt"), &long_text).unwrap();
    engine_a.sync(2).await.unwrap();

    let dir_b = TempDir::new().unwrap();
    let engine_b = engine(dir_b.path(), repo.clone());
    engine_b.set_root_directory_url(&url, 2).await.unwrap();
    engine_b.sync(3).await.unwrap();

    let original_url = engine_a
        .get_status()
        .await
        .unwrap()
        .snapshot
        .unwrap()
        .files
        .get("original.txt")
        .unwrap()
        .url
        .clone();

    std::fs::remove_file(dir_a.path().join("original.txt")).unwrap();
    std::fs::write(
        dir_a.path().join("renamed.txt"),
        format!("{long_text}one more line\n"),
    )
    .unwrap();
    engine_a.sync(4).await.unwrap();
    engine_b.sync(5).await.unwrap();

    assert!(!dir_b.path().join("original.txt").exists());
    let content = std::fs::read_to_string(dir_b.path().join("renamed.txt")).unwrap();
    assert!(content.ends_with("one more line\n"));

    let renamed_url = engine_b
        .get_status()
        .await
        .unwrap()
        .snapshot
        .unwrap()
        .files
        .get("renamed.txt")
        .unwrap()
        .url
        .clone();
    assert_eq!(original_url, renamed_url);
}

#[tokio::test]
async fn remote_deletion_removes_file_and_snapshot_entry() {
    let repo = InMemoryRepo::new();
    let dir_a = TempDir::new().unwrap();
    let engine_a = engine(dir_a.path(), repo.clone());
    let url = engine_a.init_root(1).await.unwrap();
    std::fs::write(dir_a.path().join("to-delete.txt"), "bye").unwrap();
    engine_a.sync(2).await.unwrap();

    let dir_b = TempDir::new().unwrap();
    let engine_b = engine(dir_b.path(), repo.clone());
    engine_b.set_root_directory_url(&url, 2).await.unwrap();
    engine_b.sync(3).await.unwrap();
    assert!(dir_b.path().join("to-delete.txt").exists());

    std::fs::remove_file(dir_a.path().join("to-delete.txt")).unwrap();
    engine_a.sync(4).await.unwrap();
    engine_b.sync(5).await.unwrap();

    assert!(!dir_b.path().join("to-delete.txt").exists());
    let snapshot_a = engine_a.get_status().await.unwrap().snapshot.unwrap();
    let snapshot_b = engine_b.get_status().await.unwrap().snapshot.unwrap();
    assert!(!snapshot_a.files.contains_key("to-delete.txt"));
    assert!(!snapshot_b.files.contains_key("to-delete.txt"));
}

#[tokio::test]
async fn nested_directory_creation_propagates() {
    let repo = InMemoryRepo::new();
    let dir_a = TempDir::new().unwrap();
    let engine_a = engine(dir_a.path(), repo.clone());
    let url = engine_a.init_root(1).await.unwrap();

    let dir_b = TempDir::new().unwrap();
    let engine_b = engine(dir_b.path(), repo.clone());
    engine_b.set_root_directory_url(&url, 1).await.unwrap();

    std::fs::create_dir_all(dir_a.path().join("subdir")).unwrap();
    std::fs::write(dir_a.path().join("subdir").join("nested.txt"), "deep").unwrap();
    engine_a.sync(2).await.unwrap();
    engine_b.sync(2).await.unwrap();

    assert!(dir_b.path().join("subdir").is_dir());
    let content = std::fs::read_to_string(dir_b.path().join("subdir").join("nested.txt")).unwrap();
    assert_eq!(content, "deep");
}

#[tokio::test]
async fn idempotent_resync_after_clone_reports_no_changes() {
    let repo = InMemoryRepo::new();
    let dir_a = TempDir::new().unwrap();
    let engine_a = engine(dir_a.path(), repo.clone());
    let url = engine_a.init_root(1).await.unwrap();
    std::fs::write(dir_a.path().join("hello.txt"), "Hello from A").unwrap();
    engine_a.sync(2).await.unwrap();

    let dir_b = TempDir::new().unwrap();
    let engine_b = engine(dir_b.path(), repo.clone());
    engine_b.set_root_directory_url(&url, 2).await.unwrap();
    engine_b.sync(3).await.unwrap();

    let result = engine_b.sync(4).await.unwrap();
    assert!(result.success);
    assert_eq!(result.files_changed, 0);
    assert!(result.errors.is_empty());
    assert!(result.warnings.is_empty());
}
