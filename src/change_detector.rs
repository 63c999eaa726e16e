//! Diffs the live filesystem and the live CRDT graph against the snapshot
//! and emits one classified [`DetectedChange`] per path that moved.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use crate::error::EngineResult;
use crate::filters::SyncFilters;
use crate::path_util::{self, is_under, to_rel_string};
use crate::repo::{Content, DocUrl, EntryKind, Heads, Repo, heads_equal};
use crate::snapshot::Snapshot;

const MAX_FIND_RETRIES: u32 = 4;
const RETRY_BASE_DELAY_MS: u64 = 50;
const PARALLELISM: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    LocalOnly,
    RemoteOnly,
    BothChanged,
    NoChange,
}

#[derive(Debug, Clone)]
pub struct DetectedChange {
    pub path: String,
    pub change_type: ChangeType,
    /// True when the snapshot had no entry for this path before this detect pass.
    pub is_new: bool,
    /// Current bytes on disk, or `None` if the path no longer exists locally.
    pub local_content: Option<Vec<u8>>,
    /// Bytes last known to be stored in the document (used to score a
    /// deleted file against new files during move detection).
    pub previous_content: Option<Vec<u8>>,
    /// Current bytes in the document, fetched only when a real divergence
    /// from `previous_content` is suspected.
    pub remote_content: Option<Vec<u8>>,
    pub local_head: Option<Heads>,
    pub remote_head: Option<Heads>,
}

pub struct ChangeDetector<'a> {
    pub repo: Arc<dyn Repo>,
    pub root: &'a Path,
    pub filters: &'a SyncFilters,
    pub artifact_prefixes: &'a [String],
}

impl<'a> ChangeDetector<'a> {
    fn is_artifact(&self, rel_path: &str) -> bool {
        self.artifact_prefixes.iter().any(|p| is_under(rel_path, p))
    }

    async fn fetch_remote_bytes(&self, url: &str) -> EngineResult<Option<Vec<u8>>> {
        let doc_url = DocUrl::parse(url)?;
        let mut attempt = 0;
        loop {
            match self.repo.find(&doc_url).await {
                Ok(handle) => {
                    let body = handle.doc()?;
                    return Ok(body.as_file().map(|f| f.content.as_bytes()));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_FIND_RETRIES {
                        crate::logging::error(format!("find {url} unavailable after retries: {e}"));
                        return Ok(None);
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(
                        RETRY_BASE_DELAY_MS * (1 << attempt),
                    ))
                    .await;
                }
            }
        }
    }

    async fn remote_head(&self, url: &str) -> EngineResult<Option<Heads>> {
        let doc_url = DocUrl::parse(url)?;
        match self.repo.find(&doc_url).await {
            Ok(handle) => Ok(Some(handle.heads())),
            Err(_) => Ok(None),
        }
    }

    fn parent_dir_url(&self, snapshot: &Snapshot, rel_path: &str) -> Option<String> {
        let parent = path_util::parent(rel_path);
        if parent.is_empty() {
            Some(snapshot.root_directory_url.clone())
        } else {
            snapshot.directories.get(&parent).map(|e| e.url.clone())
        }
    }

    /// A document can keep its own heads unchanged (or even gain new ones,
    /// e.g. after a rename that mutates the file document in place) while no
    /// longer being reachable from its parent directory's `docs` map — the
    /// only place a remote delete or rename actually shows up. Treats an
    /// undeterminable parent as reachable rather than risk a false delete.
    async fn reachable_via_parent(&self, snapshot: &Snapshot, rel_path: &str) -> bool {
        let Some(parent_url) = self.parent_dir_url(snapshot, rel_path) else {
            return true;
        };
        let Ok(doc_url) = DocUrl::parse(&parent_url) else {
            return true;
        };
        let Ok(handle) = self.repo.find(&doc_url).await else {
            return true;
        };
        let Ok(body) = handle.doc() else {
            return true;
        };
        let Some(dir) = body.as_directory() else {
            return true;
        };
        dir.find(path_util::basename(rel_path), EntryKind::File).is_some()
    }

    fn walk_local_files(&self) -> Vec<(String, std::path::PathBuf)> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(self.root)
            .into_iter()
            .filter_entry(|e| {
                let rel = e
                    .path()
                    .strip_prefix(self.root)
                    .map(to_rel_string)
                    .unwrap_or_default();
                rel.is_empty() || !self.filters.is_excluded(&rel)
            })
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                let rel = to_rel_string(entry.path().strip_prefix(self.root).unwrap());
                out.push((rel, entry.path().to_path_buf()));
            }
        }
        out
    }

    pub async fn detect(&self, snapshot: &Snapshot) -> EngineResult<Vec<DetectedChange>> {
        let mut changes = std::collections::HashMap::new();
        self.local_pass(snapshot, &mut changes).await?;
        self.remote_pass(snapshot, &mut changes).await?;
        self.remote_discovery_pass(snapshot, &mut changes).await?;
        Ok(changes.into_values().collect())
    }

    async fn local_pass(
        &self,
        snapshot: &Snapshot,
        out: &mut std::collections::HashMap<String, DetectedChange>,
    ) -> EngineResult<()> {
        let local_files = self.walk_local_files();
        let sem = Arc::new(Semaphore::new(PARALLELISM));
        let mut tasks = Vec::new();
        for (rel, abs) in local_files {
            let sem = sem.clone();
            let snapshot_entry = snapshot.files.get(&rel).cloned();
            let artifact = self.is_artifact(&rel);
            let repo = self.repo.clone();
            tasks.push(async move {
                let _permit = sem.acquire().await.unwrap();
                let bytes = match tokio::fs::read(&abs).await {
                    Ok(b) => b,
                    Err(e) => {
                        crate::logging::error(format!("read {}: {e}", abs.display()));
                        return None;
                    }
                };
                let Some(entry) = snapshot_entry else {
                    return Some(DetectedChange {
                        path: rel,
                        change_type: ChangeType::LocalOnly,
                        is_new: true,
                        local_content: Some(bytes),
                        previous_content: None,
                        remote_content: None,
                        local_head: None,
                        remote_head: None,
                    });
                };
                if artifact {
                    let hash = hex_sha256(&bytes);
                    let local_changed = entry.content_hash.as_deref() != Some(hash.as_str());
                    let doc_url = match DocUrl::parse(&entry.url) {
                        Ok(u) => u,
                        Err(_) => return None,
                    };
                    let remote_head = repo.find(&doc_url).await.ok().map(|h| h.heads());
                    let remote_changed = remote_head
                        .as_ref()
                        .map(|h| !heads_equal(h, &entry.head))
                        .unwrap_or(false);
                    let change_type = match (local_changed, remote_changed) {
                        (true, true) => ChangeType::BothChanged,
                        (true, false) => ChangeType::LocalOnly,
                        (false, true) => ChangeType::RemoteOnly,
                        (false, false) => ChangeType::NoChange,
                    };
                    if change_type == ChangeType::NoChange {
                        return None;
                    }
                    return Some(DetectedChange {
                        path: rel,
                        change_type,
                        is_new: false,
                        local_content: Some(bytes),
                        previous_content: None,
                        remote_content: None,
                        local_head: None,
                        remote_head,
                    });
                }

                let doc_url = match DocUrl::parse(&entry.url) {
                    Ok(u) => u,
                    Err(_) => return None,
                };
                let handle = repo.find(&doc_url).await.ok()?;
                let content_at_head = handle.view(&entry.head).ok().and_then(|b| b.as_file().map(|f| f.content.as_bytes()));
                let local_matches_snapshot = content_at_head.as_deref() == Some(bytes.as_slice());
                if local_matches_snapshot {
                    return None;
                }
                let current = handle.doc().ok().and_then(|b| b.as_file().map(|f| f.content.as_bytes()));
                let remote_diverged = current != content_at_head;
                let change_type = if remote_diverged {
                    ChangeType::BothChanged
                } else {
                    ChangeType::LocalOnly
                };
                Some(DetectedChange {
                    path: rel,
                    change_type,
                    is_new: false,
                    local_content: Some(bytes),
                    previous_content: content_at_head,
                    remote_content: current,
                    local_head: None,
                    remote_head: Some(handle.heads()),
                })
            });
        }
        for result in futures_util::future::join_all(tasks).await {
            if let Some(change) = result {
                out.insert(change.path.clone(), change);
            }
        }

        // Files tracked in the snapshot that no longer exist on disk.
        for (path, entry) in &snapshot.files {
            if out.contains_key(path) {
                continue;
            }
            let abs = self.root.join(path);
            if abs.exists() {
                continue;
            }
            let doc_url = DocUrl::parse(&entry.url)?;
            let remote_head = self.repo.find(&doc_url).await.ok().map(|h| h.heads());
            let remote_moved = remote_head
                .as_ref()
                .map(|h| !heads_equal(h, &entry.head))
                .unwrap_or(false);
            let previous_content = self.fetch_remote_bytes(&entry.url).await.ok().flatten();
            out.insert(
                path.clone(),
                DetectedChange {
                    path: path.clone(),
                    change_type: if remote_moved {
                        ChangeType::BothChanged
                    } else {
                        ChangeType::LocalOnly
                    },
                    is_new: false,
                    local_content: None,
                    previous_content,
                    remote_content: None,
                    local_head: None,
                    remote_head,
                },
            );
        }
        Ok(())
    }

    async fn remote_pass(
        &self,
        snapshot: &Snapshot,
        out: &mut std::collections::HashMap<String, DetectedChange>,
    ) -> EngineResult<()> {
        for (path, entry) in &snapshot.files {
            if out.contains_key(path) {
                continue;
            }
            let Some(remote_head) = self.remote_head(&entry.url).await? else {
                out.insert(
                    path.clone(),
                    DetectedChange {
                        path: path.clone(),
                        change_type: ChangeType::RemoteOnly,
                        is_new: false,
                        local_content: None,
                        previous_content: None,
                        remote_content: None,
                        local_head: None,
                        remote_head: None,
                    },
                );
                continue;
            };

            // The document itself can still resolve (and its heads can even
            // have moved, e.g. a rename that mutates the file document in
            // place) after it has been unlinked from its parent directory.
            // A remote delete or rename only ever shows up there, never in
            // the document's own heads, so check reachability before (and
            // instead of) a heads comparison.
            if !self.reachable_via_parent(snapshot, path).await {
                out.insert(
                    path.clone(),
                    DetectedChange {
                        path: path.clone(),
                        change_type: ChangeType::RemoteOnly,
                        is_new: false,
                        local_content: None,
                        previous_content: None,
                        remote_content: None,
                        local_head: None,
                        remote_head: Some(remote_head),
                    },
                );
                continue;
            }

            if heads_equal(&remote_head, &entry.head) {
                continue;
            }
            let remote_bytes = self.fetch_remote_bytes(&entry.url).await?;
            let local_bytes = tokio::fs::read(self.root.join(path)).await.ok();
            let change_type = if local_bytes.is_some() && local_bytes != remote_bytes {
                ChangeType::BothChanged
            } else {
                ChangeType::RemoteOnly
            };
            out.insert(
                path.clone(),
                DetectedChange {
                    path: path.clone(),
                    change_type,
                    is_new: false,
                    local_content: local_bytes,
                    previous_content: None,
                    remote_content: remote_bytes,
                    local_head: None,
                    remote_head: Some(remote_head),
                },
            );
        }
        Ok(())
    }

    async fn remote_discovery_pass(
        &self,
        snapshot: &Snapshot,
        out: &mut std::collections::HashMap<String, DetectedChange>,
    ) -> EngineResult<()> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![(String::new(), snapshot.root_directory_url.clone())];
        while let Some((prefix, url)) = stack.pop() {
            if !seen.insert(url.clone()) {
                continue;
            }
            let Ok(doc_url) = DocUrl::parse(&url) else {
                continue;
            };
            let Ok(handle) = self.repo.find(&doc_url).await else {
                continue;
            };
            let Ok(body) = handle.doc() else { continue };
            let Some(dir) = body.as_directory() else {
                continue;
            };
            for entry in &dir.docs {
                let rel = crate::path_util::join_rel(&prefix, &entry.name);
                match entry.kind {
                    crate::repo::EntryKind::Folder => {
                        stack.push((rel, entry.url.clone()));
                    }
                    crate::repo::EntryKind::File => {
                        if snapshot.files.contains_key(&rel) || out.contains_key(&rel) {
                            continue;
                        }
                        let remote_bytes = self.fetch_remote_bytes(&entry.url).await?;
                        let local_bytes = tokio::fs::read(self.root.join(&rel)).await.ok();
                        let change_type = if local_bytes.is_some() {
                            ChangeType::BothChanged
                        } else {
                            ChangeType::RemoteOnly
                        };
                        let remote_head = self.remote_head(&entry.url).await?;
                        out.insert(
                            rel.clone(),
                            DetectedChange {
                                path: rel,
                                change_type,
                                is_new: true,
                                local_content: local_bytes,
                                previous_content: None,
                                remote_content: remote_bytes,
                                local_head: None,
                                remote_head,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_sha256_is_deterministic() {
        let a = hex_sha256(b"hello");
        let b = hex_sha256(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, hex_sha256(b"world"));
    }
}
