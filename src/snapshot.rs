//! The Snapshot Store: the local record of the last-synced mapping between
//! relative paths and CRDT document identity, used as the reference point
//! for change detection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::repo::{Heads, heads_from_string, heads_to_string};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFileEntry {
    pub path: String,
    pub url: String,
    #[serde(with = "heads_as_string")]
    pub head: Heads,
    pub extension: String,
    pub mime_type: String,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDirectoryEntry {
    pub path: String,
    pub url: String,
    #[serde(with = "heads_as_string")]
    pub head: Heads,
    #[serde(default)]
    pub entries: Vec<String>,
}

mod heads_as_string {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(heads: &Heads, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&heads_to_string(heads))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Heads, D::Error> {
        let s = String::deserialize(d)?;
        heads_from_string(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: i64,
    pub root_path: PathBuf,
    pub root_directory_url: String,
    #[serde(default)]
    pub files: BTreeMap<String, SnapshotFileEntry>,
    #[serde(default)]
    pub directories: BTreeMap<String, SnapshotDirectoryEntry>,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Snapshot {
    pub fn new(root_path: PathBuf, root_directory_url: String, now: i64) -> Self {
        Self {
            timestamp: now,
            root_path,
            root_directory_url,
            files: BTreeMap::new(),
            directories: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> ValidationReport {
        let mut errors = Vec::new();
        if self.root_path.as_os_str().is_empty() {
            errors.push("root_path is empty".to_string());
        }
        if self.timestamp <= 0 {
            errors.push("timestamp must be positive".to_string());
        }
        if self.root_directory_url.is_empty() {
            errors.push("root_directory_url is empty".to_string());
        }
        for path in self.files.keys() {
            if self.directories.contains_key(path) {
                errors.push(format!("{path} is both a file and a directory"));
            }
        }
        ValidationReport { errors }
    }

    pub fn upsert_file(&mut self, entry: SnapshotFileEntry) {
        self.files.insert(entry.path.clone(), entry);
    }

    pub fn remove_file(&mut self, path: &str) {
        self.files.remove(path);
    }

    pub fn upsert_directory(&mut self, entry: SnapshotDirectoryEntry) {
        self.directories.insert(entry.path.clone(), entry);
    }

    pub fn remove_directory(&mut self, path: &str) {
        self.directories.remove(path);
    }
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(control_dir: PathBuf) -> Self {
        Self { dir: control_dir }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join("snapshot.json.bak")
    }

    pub fn load(&self) -> Result<Option<Snapshot>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("read snapshot {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&data).context("parse snapshot json")?;
        let report = snapshot.validate();
        if !report.is_valid() {
            anyhow::bail!("snapshot invalid: {}", report.errors.join("; "));
        }
        Ok(Some(snapshot))
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;
        let report = snapshot.validate();
        if !report.is_valid() {
            anyhow::bail!("refusing to persist invalid snapshot: {}", report.errors.join("; "));
        }
        let path = self.path();
        if path.exists() {
            let _ = std::fs::copy(&path, self.backup_path());
        }
        let data = serde_json::to_vec_pretty(snapshot).context("serialize snapshot")?;
        let tmp = self.dir.join(format!("snapshot.json.tmp-{}", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    pub fn create_empty(&self, root_path: &Path, root_directory_url: String, now: i64) -> Snapshot {
        Snapshot::new(root_path.to_path_buf(), root_directory_url, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tmp_dir("pushwork-snapshot-roundtrip");
        let store = SnapshotStore::new(dir.join(".pushwork"));
        let mut snap = Snapshot::new(dir.clone(), "pushwork:root".to_string(), 1);
        snap.upsert_file(SnapshotFileEntry {
            path: "a.txt".to_string(),
            url: "pushwork:abc".to_string(),
            head: vec![1, 2, 3],
            extension: "txt".to_string(),
            mime_type: "text/plain".to_string(),
            content_hash: None,
        });
        store.save(&snap).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.files.get("a.txt").unwrap().url, "pushwork:abc");
        assert_eq!(loaded.files.get("a.txt").unwrap().head, vec![1, 2, 3]);
    }

    #[test]
    fn validate_rejects_path_that_is_both_file_and_directory() {
        let mut snap = Snapshot::new(PathBuf::from("/tmp/x"), "pushwork:root".to_string(), 1);
        snap.upsert_file(SnapshotFileEntry {
            path: "a".to_string(),
            url: "pushwork:1".to_string(),
            head: vec![],
            extension: String::new(),
            mime_type: String::new(),
            content_hash: None,
        });
        snap.upsert_directory(SnapshotDirectoryEntry {
            path: "a".to_string(),
            url: "pushwork:2".to_string(),
            head: vec![],
            entries: vec![],
        });
        let report = snap.validate();
        assert!(!report.is_valid());
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tmp_dir("pushwork-snapshot-missing");
        let store = SnapshotStore::new(dir.join(".pushwork"));
        assert!(store.load().unwrap().is_none());
    }
}
