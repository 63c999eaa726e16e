//! The Sync Engine: orchestrates the two-phase push/pull protocol, owns
//! leaf-first directory batching, versioned-URL discipline, and the
//! artifact-vs-collaborative text policy.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use similar::{DiffOp, TextDiff};
use yrs::{Map, Text, TransactionMut};

use crate::change_detector::{ChangeDetector, ChangeType, DetectedChange, hex_sha256};
use crate::error::{ChangeError, EngineError, EngineResult};
use crate::filters::SyncFilters;
use crate::move_detector::{self, MoveCandidate};
use crate::network_barrier::{self, BarrierOutcome};
use crate::path_util::{self, to_rel_string};
use crate::repo::{
    Content, DirEntry, DirectoryDocument, DocBody, DocUrl, EntryKind, FileDocument, Handle, Heads, Repo,
};
use crate::snapshot::{Snapshot, SnapshotDirectoryEntry, SnapshotFileEntry, SnapshotStore};
use crate::workspace::WorkspaceLock;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub artifact_directories: Vec<String>,
    pub move_detection_threshold: f64,
    pub sync_enabled: bool,
    pub relay_id: String,
    pub barrier_timeout: Duration,
    pub pre_pull_timeout: Duration,
    pub stable_checks_required: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            artifact_directories: Vec::new(),
            move_detection_threshold: 0.7,
            sync_enabled: true,
            relay_id: "default".to_string(),
            barrier_timeout: Duration::from_secs(30),
            pre_pull_timeout: Duration::from_millis(500),
            stable_checks_required: 2,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncResult {
    pub success: bool,
    pub files_changed: usize,
    pub directories_changed: usize,
    pub errors: Vec<ChangeError>,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub struct Status {
    pub snapshot: Option<Snapshot>,
    pub has_changes: bool,
    pub change_count: usize,
    pub last_sync: Option<i64>,
}

pub struct SyncEngine {
    root: PathBuf,
    control_dir: PathBuf,
    repo: Arc<dyn Repo>,
    store: SnapshotStore,
    filters: SyncFilters,
    options: EngineOptions,
}

impl SyncEngine {
    pub fn new(
        root: PathBuf,
        repo: Arc<dyn Repo>,
        filters: SyncFilters,
        options: EngineOptions,
    ) -> Self {
        let control_dir = root.join(".pushwork");
        let store = SnapshotStore::new(control_dir.clone());
        Self {
            root,
            control_dir,
            repo,
            store,
            filters,
            options,
        }
    }

    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }

    fn lock(&self) -> EngineResult<WorkspaceLock> {
        WorkspaceLock::try_lock(&self.control_dir).map_err(|_| EngineError::WorkspaceLocked)
    }

    fn require_snapshot(&self) -> EngineResult<Snapshot> {
        self.store
            .load()
            .map_err(|e| EngineError::SnapshotInvalid(e.to_string()))?
            .ok_or_else(|| EngineError::NotInitialized {
                path: self.root.clone(),
            })
    }

    pub async fn set_root_directory_url(&self, url: &str, now: i64) -> EngineResult<()> {
        let mut snapshot = self
            .store
            .load()
            .map_err(|e| EngineError::SnapshotInvalid(e.to_string()))?
            .unwrap_or_else(|| self.store.create_empty(&self.root, url.to_string(), now));
        snapshot.root_directory_url = url.to_string();
        snapshot.timestamp = now;
        self.store
            .save(&snapshot)
            .map_err(|e| EngineError::Other(e))?;
        Ok(())
    }

    pub async fn init_root(&self, now: i64) -> EngineResult<String> {
        if self.store.load().map_err(|e| EngineError::Other(e))?.is_some() {
            return Err(EngineError::AlreadyInitialized {
                path: self.root.clone(),
            });
        }
        let handle = self.repo.create(DocBody::Directory(DirectoryDocument::default())).await?;
        let url = handle.url().to_string();
        self.set_root_directory_url(&url, now).await?;
        Ok(url)
    }

    fn detector(&self) -> ChangeDetector<'_> {
        ChangeDetector {
            repo: self.repo.clone(),
            root: &self.root,
            filters: &self.filters,
            artifact_prefixes: &self.options.artifact_directories,
        }
    }

    pub async fn preview_changes(&self) -> EngineResult<Vec<DetectedChange>> {
        let snapshot = self.require_snapshot()?;
        self.detector().detect(&snapshot).await
    }

    pub async fn get_status(&self) -> EngineResult<Status> {
        let snapshot = self.store.load().map_err(|e| EngineError::Other(e))?;
        match &snapshot {
            Some(s) => {
                let changes = self.detector().detect(s).await?;
                let change_count = changes
                    .iter()
                    .filter(|c| c.change_type != ChangeType::NoChange)
                    .count();
                Ok(Status {
                    has_changes: change_count > 0,
                    change_count,
                    last_sync: Some(s.timestamp),
                    snapshot,
                })
            }
            None => Ok(Status {
                snapshot: None,
                has_changes: false,
                change_count: 0,
                last_sync: None,
            }),
        }
    }

    pub fn reset_snapshot(&self) -> EngineResult<()> {
        let path = self.store.path();
        if path.exists() {
            std::fs::remove_file(&path).map_err(EngineError::Io)?;
        }
        Ok(())
    }

    pub async fn nuclear_reset(&self, now: i64) -> EngineResult<()> {
        if let Some(snapshot) = self.store.load().map_err(|e| EngineError::Other(e))? {
            if let Ok(doc_url) = DocUrl::parse(&snapshot.root_directory_url) {
                if let Ok(handle) = self.repo.find(&doc_url).await {
                    let _ = handle.change(|txn, _meta, _text, docs| {
                        let keys: Vec<String> = docs.iter(txn).map(|(k, _)| k.to_string()).collect();
                        for k in keys {
                            docs.remove(txn, &k);
                        }
                        Ok(())
                    });
                }
            }
        }
        self.reset_snapshot()?;
        let _ = now;
        Ok(())
    }

    /// Push-only: no network barrier. Used by `commit`.
    pub async fn commit_local(&self, now: i64) -> EngineResult<SyncResult> {
        let _lock = self.lock()?;
        let mut snapshot = self.require_snapshot()?;
        let changes = self.detector().detect(&snapshot).await?;
        let mut result = SyncResult::default();
        self.run_push(&mut snapshot, changes, &mut result).await?;
        snapshot.timestamp = now;
        self.store.save(&snapshot).map_err(EngineError::Other)?;
        result.success = result.errors.is_empty();
        Ok(result)
    }

    /// Full two-phase sync: pre-pull barrier, detect, push, barrier, re-detect, pull, persist.
    pub async fn sync(&self, now: i64) -> EngineResult<SyncResult> {
        let _lock = self.lock()?;
        let mut snapshot = self.require_snapshot()?;
        let mut result = SyncResult::default();

        if self.options.sync_enabled {
            let outcome = network_barrier::wait_for_bidirectional_sync(
                &self.repo,
                &snapshot.root_directory_url,
                self.options.pre_pull_timeout,
                Duration::from_millis(50),
                1,
            )
            .await?;
            warn_on_timeout(&mut result, "pre-pull barrier", outcome);
        }

        let changes = self.detector().detect(&snapshot).await?;
        let touched = self.run_push(&mut snapshot, changes, &mut result).await?;

        if self.options.sync_enabled {
            let outgoing = network_barrier::wait_for_sync(
                &self.repo,
                &touched,
                &self.options.relay_id,
                self.options.barrier_timeout,
            )
            .await?;
            warn_on_timeout(&mut result, "outgoing barrier", outgoing);

            let incoming = network_barrier::wait_for_bidirectional_sync(
                &self.repo,
                &snapshot.root_directory_url,
                self.options.barrier_timeout,
                Duration::from_millis(100),
                self.options.stable_checks_required,
            )
            .await?;
            warn_on_timeout(&mut result, "incoming barrier", incoming);
        }

        let changes = self.detector().detect(&snapshot).await?;
        self.run_pull(&mut snapshot, changes, &mut result).await?;

        self.fixup_heads(&mut snapshot).await;
        snapshot.timestamp = now;
        self.store.save(&snapshot).map_err(EngineError::Other)?;
        result.success = result.errors.is_empty();
        Ok(result)
    }

    async fn fixup_heads(&self, snapshot: &mut Snapshot) {
        let file_paths: Vec<String> = snapshot.files.keys().cloned().collect();
        for path in file_paths {
            let Some(entry) = snapshot.files.get(&path).cloned() else {
                continue;
            };
            if let Ok(doc_url) = DocUrl::parse(&entry.url) {
                if let Ok(handle) = self.repo.find(&doc_url).await {
                    let heads = handle.heads();
                    if heads != entry.head {
                        let mut updated = entry;
                        updated.head = heads;
                        snapshot.upsert_file(updated);
                    }
                }
            }
        }
        let dir_paths: Vec<String> = snapshot.directories.keys().cloned().collect();
        for path in dir_paths {
            let Some(entry) = snapshot.directories.get(&path).cloned() else {
                continue;
            };
            if let Ok(doc_url) = DocUrl::parse(&entry.url) {
                if let Ok(handle) = self.repo.find(&doc_url).await {
                    let heads = handle.heads();
                    if heads != entry.head {
                        let mut updated = entry;
                        updated.head = heads;
                        snapshot.upsert_directory(updated);
                    }
                }
            }
        }
    }

    // ---- push phase (§4.4.3) ----

    async fn run_push(
        &self,
        snapshot: &mut Snapshot,
        changes: Vec<DetectedChange>,
        result: &mut SyncResult,
    ) -> EngineResult<Vec<Handle>> {
        let pushable: Vec<DetectedChange> = changes
            .into_iter()
            .filter(|c| matches!(c.change_type, ChangeType::LocalOnly | ChangeType::BothChanged))
            .collect();

        let move_result = move_detector::detect_moves(pushable, self.options.move_detection_threshold);
        for conflict in &move_result.conflicts {
            result.warnings.push(format!(
                "ambiguous move for {}: candidates {:?}",
                conflict.to_path, conflict.candidates
            ));
        }

        let mut touched = Vec::new();
        for mv in &move_result.moves {
            match self.apply_move(snapshot, mv).await {
                Ok(handle) => {
                    result.files_changed += 1;
                    touched.push(handle);
                }
                Err(e) => result.errors.push(ChangeError::recoverable(mv.to_path.clone(), "move", e)),
            }
        }

        let mut by_dir: HashMap<String, Vec<DetectedChange>> = HashMap::new();
        for change in move_result.remaining {
            let dir = path_util::parent(&change.path);
            by_dir.entry(dir).or_default().push(change);
        }

        let mut all_dirs: HashSet<String> = HashSet::new();
        for dir in by_dir.keys() {
            let mut d = dir.clone();
            loop {
                all_dirs.insert(d.clone());
                if d.is_empty() {
                    break;
                }
                d = path_util::parent(&d);
            }
        }
        let mut ordered: Vec<String> = all_dirs.into_iter().collect();
        path_util::sort_deepest_first(&mut ordered);

        let mut new_heads_by_dir: HashMap<String, (String, Heads)> = HashMap::new();

        for dir in ordered {
            let (dir_url, _) = self.ensure_directory_document(snapshot, &dir).await?;
            let dir_handle = self.repo.find(&dir_url).await?;

            let dir_changes = by_dir.remove(&dir).unwrap_or_default();
            let mut deleted_names = Vec::new();
            let mut upserts: Vec<(String, String, Heads)> = Vec::new();

            for change in dir_changes {
                let name = path_util::basename(&change.path).to_string();
                let outcome = if change.local_content.is_none() {
                    deleted_names.push(name.clone());
                    snapshot.remove_file(&change.path);
                    result.files_changed += 1;
                    continue;
                } else if change.is_new {
                    self.create_file(&change).await
                } else {
                    self.update_file(snapshot, &change).await
                };
                match outcome {
                    Ok((url, head)) => {
                        upserts.push((name, url.clone(), head.clone()));
                        let artifact = self
                            .options
                            .artifact_directories
                            .iter()
                            .any(|p| path_util::is_under(&change.path, p));
                        let entry_url = if artifact { url.with_heads(&head) } else { url.plain() };
                        snapshot.upsert_file(SnapshotFileEntry {
                            path: change.path.clone(),
                            url: entry_url.to_string(),
                            head,
                            extension: Path::new(&change.path)
                                .extension()
                                .map(|e| e.to_string_lossy().to_string())
                                .unwrap_or_default(),
                            mime_type: crate::mime::guess(&change.path),
                            content_hash: if artifact {
                                change.local_content.as_ref().map(|b| hex_sha256(b))
                            } else {
                                None
                            },
                        });
                        result.files_changed += 1;
                    }
                    Err(e) => result.errors.push(ChangeError::recoverable(change.path.clone(), "push", e)),
                }
            }

            let subdir_updates: Vec<(String, String)> = new_heads_by_dir
                .iter()
                .filter(|(path, _)| path_util::parent(path) == dir)
                .map(|(path, (url, head))| {
                    let name = path_util::basename(path).to_string();
                    let child_url = DocUrl::parse(url).unwrap_or_else(|_| DocUrl::parse("pushwork:").unwrap());
                    let artifact_child = self
                        .options
                        .artifact_directories
                        .iter()
                        .any(|p| path_util::is_under(path, p));
                    let entry_url = if artifact_child {
                        child_url.with_heads(head)
                    } else {
                        child_url.plain()
                    };
                    (name, entry_url.to_string())
                })
                .collect();

            let new_head = dir_handle.change(|txn, _meta, _text, docs| {
                for name in &deleted_names {
                    docs.remove(txn, &format!("file:{name}"));
                }
                for (name, url, _head) in &upserts {
                    docs.insert(txn, format!("file:{name}"), yrs::Any::String(url.clone().into()));
                }
                for (name, url) in &subdir_updates {
                    docs.insert(txn, format!("folder:{name}"), yrs::Any::String(url.clone().into()));
                }
                Ok(())
            })?;

            new_heads_by_dir.insert(dir.clone(), (dir_url.to_string(), new_head.clone()));
            let artifact_dir = self
                .options
                .artifact_directories
                .iter()
                .any(|p| path_util::is_under(&dir, p));
            let entry_url = if artifact_dir {
                dir_url.with_heads(&new_head)
            } else {
                dir_url.plain()
            };
            snapshot.upsert_directory(SnapshotDirectoryEntry {
                path: dir.clone(),
                url: entry_url.to_string(),
                head: new_head,
                entries: Vec::new(),
            });
            result.directories_changed += 1;
            touched.push(dir_handle);
        }

        Ok(touched)
    }

    async fn create_file(&self, change: &DetectedChange) -> EngineResult<(DocUrl, Heads)> {
        let bytes = change.local_content.clone().unwrap_or_default();
        let name = path_util::basename(&change.path).to_string();
        let artifact = self
            .options
            .artifact_directories
            .iter()
            .any(|p| path_util::is_under(&change.path, p));
        let is_binary = crate::mime::is_binary(&change.path, &bytes);
        let content = if is_binary {
            Content::Bytes(bytes.clone())
        } else if artifact {
            Content::ImmutableText(String::from_utf8_lossy(&bytes).to_string())
        } else {
            Content::Text(String::new())
        };
        let doc = FileDocument {
            name: name.clone(),
            extension: Path::new(&name)
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default(),
            mime_type: crate::mime::guess(&change.path),
            content,
            permissions: 0o644,
        };
        let handle = self.repo.create(DocBody::File(doc)).await?;
        if !is_binary && !artifact {
            let text_content = String::from_utf8_lossy(&bytes).to_string();
            let new_head = handle.change(|txn, _meta, text, _docs| {
                if !text_content.is_empty() {
                    text.insert(txn, 0, &text_content);
                }
                Ok(())
            })?;
            return Ok((handle.url(), new_head));
        }
        Ok((handle.url(), handle.heads()))
    }

    async fn update_file(&self, snapshot: &Snapshot, change: &DetectedChange) -> EngineResult<(DocUrl, Heads)> {
        let entry = snapshot
            .files
            .get(&change.path)
            .ok_or_else(|| EngineError::InvariantViolation(format!("missing snapshot entry for {}", change.path)))?;
        let doc_url = DocUrl::parse(&entry.url)?;
        let handle = self.repo.find(&doc_url).await?;
        let current = handle.doc()?;
        let bytes = change.local_content.clone().unwrap_or_default();
        let artifact = self
            .options
            .artifact_directories
            .iter()
            .any(|p| path_util::is_under(&change.path, p));
        let is_binary = crate::mime::is_binary(&change.path, &bytes);

        let needs_replace = artifact
            || is_binary
            || matches!(current.as_file().map(|f| &f.content), Some(Content::ImmutableText(_)) | Some(Content::Bytes(_)));

        if needs_replace {
            let name = path_util::basename(&change.path).to_string();
            let content = if is_binary {
                Content::Bytes(bytes.clone())
            } else {
                Content::ImmutableText(String::from_utf8_lossy(&bytes).to_string())
            };
            let doc = FileDocument {
                name: name.clone(),
                extension: Path::new(&name)
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_default(),
                mime_type: crate::mime::guess(&change.path),
                content,
                permissions: current.as_file().map(|f| f.permissions).unwrap_or(0o644),
            };
            let new_handle = self.repo.create(DocBody::File(doc)).await?;
            return Ok((new_handle.url(), new_handle.heads()));
        }

        let old_text = current.as_file().map(|f| match &f.content {
            Content::Text(s) => s.clone(),
            _ => String::new(),
        }).unwrap_or_default();
        let new_text = String::from_utf8_lossy(&bytes).to_string();
        let base_heads = entry.head.clone();
        let new_head = handle.change_at(&base_heads, |txn, _meta, text, _docs| {
            splice_text(text, txn, &old_text, &new_text);
            Ok(())
        })?;
        Ok((handle.url(), new_head))
    }

    async fn apply_move(&self, snapshot: &mut Snapshot, mv: &MoveCandidate) -> EngineResult<Handle> {
        let entry = snapshot
            .files
            .get(&mv.from_path)
            .cloned()
            .ok_or_else(|| EngineError::InvariantViolation(format!("missing snapshot entry for {}", mv.from_path)))?;
        let old_parent = path_util::parent(&mv.from_path);
        let new_parent = path_util::parent(&mv.to_path);
        let old_name = path_util::basename(&mv.from_path).to_string();
        let new_name = path_util::basename(&mv.to_path).to_string();

        let (old_dir_url, _) = self.ensure_directory_document(snapshot, &old_parent).await?;
        let (new_dir_url, _) = self.ensure_directory_document(snapshot, &new_parent).await?;

        let doc_url = DocUrl::parse(&entry.url)?;
        let handle = self.repo.find(&doc_url).await?;
        let new_text = mv.new_content.as_ref().map(|b| String::from_utf8_lossy(b).to_string());
        handle.change(|txn, meta, text, _docs| {
            meta.insert(txn, "name", yrs::Any::String(new_name.clone().into()));
            if let Some(new_text) = &new_text {
                let old = text.get_string(txn);
                splice_text(text, txn, &old, new_text);
            }
            Ok(())
        })?;
        let new_heads = handle.heads();

        if old_dir_url != new_dir_url {
            let old_dir_handle = self.repo.find(&old_dir_url).await?;
            old_dir_handle.change(|txn, _meta, _text, docs| {
                docs.remove(txn, &format!("file:{old_name}"));
                Ok(())
            })?;
        }
        let new_dir_handle = self.repo.find(&new_dir_url).await?;
        let url_string = handle.url().to_string();
        new_dir_handle.change(|txn, _meta, _text, docs| {
            if old_dir_url == new_dir_url {
                docs.remove(txn, &format!("file:{old_name}"));
            }
            docs.insert(txn, format!("file:{new_name}"), yrs::Any::String(url_string.clone().into()));
            Ok(())
        })?;

        snapshot.remove_file(&mv.from_path);
        snapshot.upsert_file(SnapshotFileEntry {
            path: mv.to_path.clone(),
            url: handle.url().plain().to_string(),
            head: new_heads,
            extension: Path::new(&new_name)
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default(),
            mime_type: crate::mime::guess(&mv.to_path),
            content_hash: None,
        });

        Ok(handle)
    }

    async fn ensure_directory_document(&self, snapshot: &mut Snapshot, dir_path: &str) -> EngineResult<(DocUrl, Heads)> {
        if dir_path.is_empty() {
            let url = DocUrl::parse(&snapshot.root_directory_url)?;
            let handle = self.repo.find(&url).await?;
            return Ok((handle.url(), handle.heads()));
        }
        if let Some(entry) = snapshot.directories.get(dir_path) {
            let url = DocUrl::parse(&entry.url)?;
            let handle = self.repo.find(&url).await?;
            return Ok((handle.url(), handle.heads()));
        }

        let parent = path_util::parent(dir_path);
        let name = path_util::basename(dir_path).to_string();
        let (parent_url, _) = Box::pin(self.ensure_directory_document(snapshot, &parent)).await?;
        let parent_handle = self.repo.find(&parent_url).await?;
        let parent_body = parent_handle.doc()?;
        let existing = parent_body
            .as_directory()
            .and_then(|d| d.find(&name, EntryKind::Folder).cloned());

        let (url, heads) = if let Some(existing) = existing {
            let url = DocUrl::parse(&existing.url)?;
            let handle = self.repo.find(&url).await?;
            (handle.url(), handle.heads())
        } else {
            let new_dir = self.repo.create(DocBody::Directory(DirectoryDocument::default())).await?;
            let new_url_string = new_dir.url().to_string();
            parent_handle.change(|txn, _meta, _text, docs| {
                docs.insert(txn, format!("folder:{name}"), yrs::Any::String(new_url_string.clone().into()));
                Ok(())
            })?;
            (new_dir.url(), new_dir.heads())
        };

        snapshot.upsert_directory(SnapshotDirectoryEntry {
            path: dir_path.to_string(),
            url: url.to_string(),
            head: heads.clone(),
            entries: Vec::new(),
        });
        Ok((url, heads))
    }

    // ---- pull phase (§4.4.4) ----

    async fn run_pull(
        &self,
        snapshot: &mut Snapshot,
        changes: Vec<DetectedChange>,
        result: &mut SyncResult,
    ) -> EngineResult<()> {
        let mut pullable: Vec<DetectedChange> = changes
            .into_iter()
            .filter(|c| matches!(c.change_type, ChangeType::RemoteOnly | ChangeType::BothChanged))
            .collect();
        let mut order: Vec<String> = pullable.iter().map(|c| c.path.clone()).collect();
        path_util::sort_shallowest_first(&mut order);
        pullable.sort_by_key(|c| order.iter().position(|p| p == &c.path).unwrap_or(usize::MAX));

        for change in pullable {
            let outcome = self.pull_one(snapshot, &change).await;
            match outcome {
                Ok(true) => result.files_changed += 1,
                Ok(false) => {}
                Err(e) => result.errors.push(ChangeError::recoverable(change.path.clone(), "pull", e)),
            }
        }
        Ok(())
    }

    async fn pull_one(&self, snapshot: &mut Snapshot, change: &DetectedChange) -> EngineResult<bool> {
        let abs = self.root.join(&change.path);
        if change.remote_content.is_none() && !change.is_new {
            if abs.exists() {
                std::fs::remove_file(&abs).map_err(EngineError::Io)?;
            }
            snapshot.remove_file(&change.path);
            return Ok(true);
        }
        let Some(bytes) = &change.remote_content else {
            return Ok(false);
        };
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).map_err(EngineError::Io)?;
        }
        std::fs::write(&abs, bytes).map_err(EngineError::Io)?;

        let (url, head) = self.resolve_file_url(snapshot, &change.path).await?;
        let artifact = self
            .options
            .artifact_directories
            .iter()
            .any(|p| path_util::is_under(&change.path, p));
        let entry_url = if artifact { url.with_heads(&head) } else { url.plain() };
        snapshot.upsert_file(SnapshotFileEntry {
            path: change.path.clone(),
            url: entry_url.to_string(),
            head,
            extension: Path::new(&change.path)
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default(),
            mime_type: crate::mime::guess(&change.path),
            content_hash: if artifact { Some(hex_sha256(bytes)) } else { None },
        });
        Ok(true)
    }

    async fn resolve_file_url(&self, snapshot: &mut Snapshot, rel_path: &str) -> EngineResult<(DocUrl, Heads)> {
        if let Some(entry) = snapshot.files.get(rel_path) {
            let url = DocUrl::parse(&entry.url)?;
            let handle = self.repo.find(&url).await?;
            return Ok((handle.url(), handle.heads()));
        }
        let parent = path_util::parent(rel_path);
        let name = path_util::basename(rel_path);
        let (parent_url, _) = self.ensure_directory_document(snapshot, &parent).await?;
        let parent_handle = self.repo.find(&parent_url).await?;
        let body = parent_handle.doc()?;
        let entry = body
            .as_directory()
            .and_then(|d| d.find(name, EntryKind::File))
            .ok_or_else(|| EngineError::InvariantViolation(format!("no remote entry for {rel_path}")))?;
        let url = DocUrl::parse(&entry.url)?;
        let handle = self.repo.find(&url).await?;
        Ok((handle.url(), handle.heads()))
    }
}

fn warn_on_timeout(result: &mut SyncResult, label: &str, outcome: BarrierOutcome) {
    if outcome.timed_out {
        result.warnings.push(format!("{label} timed out before converging"));
    }
}

/// Applies the minimum edit script between `old` and `new` as CRDT splices,
/// instead of clearing and reinserting the whole text.
fn splice_text(text: &yrs::TextRef, txn: &mut TransactionMut, old: &str, new: &str) {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();
    let diff = TextDiff::from_slices(&old_chars, &new_chars);

    let mut edits: Vec<(u32, u32, String)> = Vec::new();
    for op in diff.ops() {
        match *op {
            DiffOp::Equal { .. } => {}
            DiffOp::Delete { old_index, old_len, .. } => {
                edits.push((old_index as u32, old_len as u32, String::new()));
            }
            DiffOp::Insert { old_index, new_index, new_len } => {
                let insert: String = new_chars[new_index..new_index + new_len].iter().collect();
                edits.push((old_index as u32, 0, insert));
            }
            DiffOp::Replace { old_index, old_len, new_index, new_len } => {
                let insert: String = new_chars[new_index..new_index + new_len].iter().collect();
                edits.push((old_index as u32, old_len as u32, insert));
            }
        }
    }
    edits.sort_by(|a, b| b.0.cmp(&a.0));
    for (start, del_len, insert) in edits {
        if del_len > 0 {
            text.remove_range(txn, start, del_len);
        }
        if !insert.is_empty() {
            text.insert(txn, start, &insert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryRepo;
    use tempfile::tempdir;

    fn filters() -> SyncFilters {
        SyncFilters::default_for_tests()
    }

    async fn engine_at(root: &Path, repo: Arc<dyn Repo>) -> SyncEngine {
        SyncEngine::new(root.to_path_buf(), repo, filters(), EngineOptions {
            sync_enabled: false,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn commit_then_sync_round_trips_a_new_file() {
        let tmp = tempdir().unwrap();
        let repo = InMemoryRepo::new();
        let engine = engine_at(tmp.path(), repo).await;
        engine.init_root(1).await.unwrap();

        std::fs::write(tmp.path().join("hello.txt"), "Hello from A").unwrap();
        let result = engine.sync(2).await.unwrap();
        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.files_changed, 1);

        let status = engine.get_status().await.unwrap();
        assert!(!status.has_changes);
    }

    #[tokio::test]
    async fn idempotent_resync_reports_no_changes() {
        let tmp = tempdir().unwrap();
        let repo = InMemoryRepo::new();
        let engine = engine_at(tmp.path(), repo).await;
        engine.init_root(1).await.unwrap();
        std::fs::write(tmp.path().join("a.txt"), "content").unwrap();
        engine.sync(2).await.unwrap();

        let second = engine.sync(3).await.unwrap();
        assert!(second.success);
        assert_eq!(second.files_changed, 0);
        assert_eq!(second.directories_changed, 0);
    }

    #[tokio::test]
    async fn two_peers_share_one_repo_and_converge() {
        let repo = InMemoryRepo::new();
        let tmp_a = tempdir().unwrap();
        let engine_a = engine_at(tmp_a.path(), repo.clone()).await;
        let url = engine_a.init_root(1).await.unwrap();

        let tmp_b = tempdir().unwrap();
        let engine_b = engine_at(tmp_b.path(), repo.clone()).await;
        engine_b.set_root_directory_url(&url, 1).await.unwrap();

        std::fs::write(tmp_a.path().join("hello.txt"), "Hello from A").unwrap();
        engine_a.sync(2).await.unwrap();
        engine_b.sync(2).await.unwrap();

        let content = std::fs::read_to_string(tmp_b.path().join("hello.txt")).unwrap();
        assert_eq!(content, "Hello from A");
    }
}
