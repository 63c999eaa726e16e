//! The external CRDT repository contract, and a bundled in-process
//! implementation backed by `yrs` so the engine is runnable without a real
//! relay. Production embedders are expected to implement [`Repo`] against
//! their own storage/relay stack, the same way `syftbox-rs`'s `ApiClient`
//! was a swappable layer behind `Client`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use yrs::{Any, Map, ReadTxn, StateVector, Text, Transact, TransactionMut};

use crate::error::{EngineError, EngineResult};

/// Opaque version identity. Encodes a `yrs` state vector.
pub type Heads = Vec<u8>;

pub fn heads_equal(a: &Heads, b: &Heads) -> bool {
    a == b
}

pub fn heads_to_string(heads: &Heads) -> String {
    base64::engine::general_purpose::STANDARD.encode(heads)
}

pub fn heads_from_string(s: &str) -> EngineResult<Heads> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| EngineError::Other(anyhow::anyhow!("decode heads: {e}")))
}

/// A document URL, optionally pinned to a set of heads ("versioned URL").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocUrl {
    id: String,
    #[serde(default)]
    heads: Option<String>,
}

impl DocUrl {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            heads: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_versioned(&self) -> bool {
        self.heads.is_some()
    }

    pub fn plain(&self) -> DocUrl {
        DocUrl {
            id: self.id.clone(),
            heads: None,
        }
    }

    pub fn with_heads(&self, heads: &Heads) -> DocUrl {
        DocUrl {
            id: self.id.clone(),
            heads: Some(heads_to_string(heads)),
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        let s = s.strip_prefix("pushwork:").unwrap_or(s);
        match s.split_once('#') {
            Some((id, heads)) => Ok(DocUrl {
                id: id.to_string(),
                heads: Some(heads.to_string()),
            }),
            None => Ok(DocUrl::new(s)),
        }
    }
}

impl std::fmt::Display for DocUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.heads {
            Some(h) => write!(f, "pushwork:{}#{}", self.id, h),
            None => write!(f, "pushwork:{}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Collaborative text: spliced character by character via the CRDT.
    Text(String),
    /// Immutable snapshot: replaced wholesale, never spliced.
    ImmutableText(String),
    Bytes(Vec<u8>),
}

impl Content {
    pub fn is_binary(&self) -> bool {
        matches!(self, Content::Bytes(_))
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Content::Text(s) | Content::ImmutableText(s) => s.as_bytes().to_vec(),
            Content::Bytes(b) => b.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileDocument {
    pub name: String,
    pub extension: String,
    pub mime_type: String,
    pub content: Content,
    pub permissions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

impl EntryKind {
    fn as_str(self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Folder => "folder",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DirectoryDocument {
    pub title: Option<String>,
    pub docs: Vec<DirEntry>,
    pub last_sync_at: Option<i64>,
}

impl DirectoryDocument {
    pub fn find(&self, name: &str, kind: EntryKind) -> Option<&DirEntry> {
        self.docs.iter().find(|e| e.name == name && e.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocBody {
    File(FileDocument),
    Directory(DirectoryDocument),
}

impl DocBody {
    pub fn as_file(&self) -> Option<&FileDocument> {
        match self {
            DocBody::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryDocument> {
        match self {
            DocBody::Directory(d) => Some(d),
            _ => None,
        }
    }
}

const META_MAP: &str = "meta";
const BODY_TEXT: &str = "body";
const DOCS_MAP: &str = "docs";

fn write_meta(txn: &mut TransactionMut, map: &yrs::MapRef, body: &FileDocument) {
    map.insert(txn, "kind", Any::String("file".into()));
    map.insert(txn, "name", Any::String(body.name.clone().into()));
    map.insert(txn, "extension", Any::String(body.extension.clone().into()));
    map.insert(txn, "mime_type", Any::String(body.mime_type.clone().into()));
    map.insert(txn, "permissions", Any::BigInt(body.permissions as i64));
    let (kind, immutable, bytes) = match &body.content {
        Content::Text(_) => ("text", None, None),
        Content::ImmutableText(s) => ("immutable_text", Some(s.clone()), None),
        Content::Bytes(b) => ("bytes", None, Some(b.clone())),
    };
    map.insert(txn, "content_kind", Any::String(kind.into()));
    if let Some(s) = immutable {
        map.insert(txn, "immutable_value", Any::String(s.into()));
    } else {
        map.remove(txn, "immutable_value");
    }
    if let Some(b) = bytes {
        map.insert(txn, "bytes_value", Any::Buffer(b.into()));
    } else {
        map.remove(txn, "bytes_value");
    }
}

fn read_meta(txn: &impl ReadTxn, map: &yrs::MapRef, text: &yrs::TextRef) -> EngineResult<FileDocument> {
    let get_str = |k: &str| -> String {
        map.get(txn, k)
            .and_then(|v| v.to_string(txn).into())
            .unwrap_or_default()
    };
    let content_kind = get_str("content_kind");
    let content = match content_kind.as_str() {
        "immutable_text" => Content::ImmutableText(get_str("immutable_value")),
        "bytes" => {
            let v = map.get(txn, "bytes_value");
            let bytes = match v {
                Some(yrs::Out::Any(Any::Buffer(b))) => b.to_vec(),
                _ => Vec::new(),
            };
            Content::Bytes(bytes)
        }
        _ => Content::Text(text.get_string(txn)),
    };
    let permissions = match map.get(txn, "permissions") {
        Some(yrs::Out::Any(Any::BigInt(n))) => n as u32,
        _ => 0o644,
    };
    Ok(FileDocument {
        name: get_str("name"),
        extension: get_str("extension"),
        mime_type: get_str("mime_type"),
        content,
        permissions,
    })
}

fn write_dir_meta(txn: &mut TransactionMut, map: &yrs::MapRef, body: &DirectoryDocument) {
    map.insert(txn, "kind", Any::String("folder".into()));
    if let Some(t) = &body.title {
        map.insert(txn, "title", Any::String(t.clone().into()));
    } else {
        map.remove(txn, "title");
    }
    if let Some(ts) = body.last_sync_at {
        map.insert(txn, "last_sync_at", Any::BigInt(ts));
    } else {
        map.remove(txn, "last_sync_at");
    }
}

fn read_dir_meta(
    txn: &impl ReadTxn,
    map: &yrs::MapRef,
    docs_map: &yrs::MapRef,
) -> EngineResult<DirectoryDocument> {
    let title = match map.get(txn, "title") {
        Some(yrs::Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    };
    let last_sync_at = match map.get(txn, "last_sync_at") {
        Some(yrs::Out::Any(Any::BigInt(n))) => Some(n),
        _ => None,
    };
    let mut docs = Vec::new();
    for (key, value) in docs_map.iter(txn) {
        let Some((kind_str, name)) = key.split_once(':') else {
            continue;
        };
        let kind = if kind_str == "folder" {
            EntryKind::Folder
        } else {
            EntryKind::File
        };
        let url = match value {
            yrs::Out::Any(Any::String(s)) => s.to_string(),
            _ => continue,
        };
        docs.push(DirEntry {
            name: name.to_string(),
            kind,
            url,
        });
    }
    docs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(DirectoryDocument {
        title,
        docs,
        last_sync_at,
    })
}

struct HandleInner {
    doc: Mutex<yrs::Doc>,
    /// Snapshots of full encoded state keyed by the heads observed right
    /// after the change that produced them, so `view(heads)` can answer
    /// historical reads without a branch-capable CRDT backend.
    history: Mutex<Vec<(Heads, Vec<u8>)>>,
    /// When set, every mutation is persisted here as the document's full
    /// encoded state, so a later process can `find` it again. Backs
    /// `<root>/.pushwork/automerge/`.
    persist_path: Option<PathBuf>,
}

const HISTORY_CAP: usize = 256;

/// A live reference to one document. Cheap to clone; clones share the same
/// underlying document.
#[derive(Clone)]
pub struct Handle {
    url: DocUrl,
    inner: Arc<HandleInner>,
}

impl Handle {
    pub fn url(&self) -> DocUrl {
        self.url.clone()
    }

    pub fn heads(&self) -> Heads {
        let doc = self.inner.doc.lock().unwrap();
        encode_heads(&doc)
    }

    pub fn doc(&self) -> EngineResult<DocBody> {
        let doc = self.inner.doc.lock().unwrap();
        materialize(&doc)
    }

    /// Historical read at a previously observed heads value. Falls back to
    /// the current document if the heads are not (or no longer) retained.
    pub fn view(&self, heads: &Heads) -> EngineResult<DocBody> {
        {
            let doc = self.inner.doc.lock().unwrap();
            if encode_heads(&doc) == *heads {
                return materialize(&doc);
            }
        }
        let history = self.inner.history.lock().unwrap();
        if let Some((_, snapshot)) = history.iter().find(|(h, _)| h == heads) {
            let replay = yrs::Doc::new();
            {
                let mut txn = replay.transact_mut();
                let update = yrs::Update::decode_v1(snapshot)
                    .map_err(|e| EngineError::Other(anyhow::anyhow!("decode snapshot: {e}")))?;
                txn.apply_update(update)
                    .map_err(|e| EngineError::Other(anyhow::anyhow!("apply snapshot: {e}")))?;
            }
            return materialize(&replay);
        }
        self.doc()
    }

    pub fn change<F>(&self, f: F) -> EngineResult<Heads>
    where
        F: FnOnce(&mut TransactionMut, &yrs::MapRef, &yrs::TextRef, &yrs::MapRef) -> EngineResult<()>,
    {
        let doc = self.inner.doc.lock().unwrap();
        let meta = doc.get_or_insert_map(META_MAP);
        let text = doc.get_or_insert_text(BODY_TEXT);
        let docs = doc.get_or_insert_map(DOCS_MAP);
        {
            let mut txn = doc.transact_mut();
            f(&mut txn, &meta, &text, &docs)?;
        }
        self.record_history(&doc);
        Ok(encode_heads(&doc))
    }

    /// Equivalent to [`Handle::change`], but asserts the caller's view of the
    /// document was taken at `base_heads`. The bundled in-memory repo has no
    /// branch support, so a mismatch is logged and the mutation is applied
    /// against current state anyway (the CRDT still merges safely).
    pub fn change_at<F>(&self, base_heads: &Heads, f: F) -> EngineResult<Heads>
    where
        F: FnOnce(&mut TransactionMut, &yrs::MapRef, &yrs::TextRef, &yrs::MapRef) -> EngineResult<()>,
    {
        if self.heads() != *base_heads {
            crate::logging::info("change_at base heads stale; applying against current state anyway");
        }
        self.change(f)
    }

    fn record_history(&self, doc: &yrs::Doc) {
        let heads = encode_heads(doc);
        let snapshot = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        if let Some(path) = &self.inner.persist_path {
            if let Err(e) = std::fs::write(path, &snapshot) {
                crate::logging::error(format!("persist {}: {e}", path.display()));
            }
        }
        let mut history = self.inner.history.lock().unwrap();
        history.push((heads, snapshot));
        if history.len() > HISTORY_CAP {
            let excess = history.len() - HISTORY_CAP;
            history.drain(0..excess);
        }
    }
}

fn encode_heads(doc: &yrs::Doc) -> Heads {
    doc.transact().state_vector().encode_v1()
}

fn materialize(doc: &yrs::Doc) -> EngineResult<DocBody> {
    let txn = doc.transact();
    let meta = doc.get_or_insert_map(META_MAP);
    let kind = match meta.get(&txn, "kind") {
        Some(yrs::Out::Any(Any::String(s))) => s.to_string(),
        _ => "file".to_string(),
    };
    if kind == "folder" {
        let docs_map = doc.get_or_insert_map(DOCS_MAP);
        Ok(DocBody::Directory(read_dir_meta(&txn, &meta, &docs_map)?))
    } else {
        let text = doc.get_or_insert_text(BODY_TEXT);
        Ok(DocBody::File(read_meta(&txn, &meta, &text)?))
    }
}

/// The external repository contract. Implementors own document creation,
/// lookup, mutation, and network sync notification.
#[async_trait]
pub trait Repo: Send + Sync {
    async fn create(&self, body: DocBody) -> EngineResult<Handle>;
    async fn find(&self, url: &DocUrl) -> EngineResult<Handle>;
    /// Whether the relay has seen the handle's current heads. The bundled
    /// in-memory repo has no real relay, so this is always true once created.
    async fn is_synced(&self, handle: &Handle, relay_id: &str) -> EngineResult<bool>;
}

/// In-process `Repo` backed by `yrs` documents, shared by reference so
/// multiple [`crate::engine::SyncEngine`] instances pointed at the same
/// `Arc<dyn Repo>` observe each other's writes without a real relay.
#[derive(Default)]
pub struct InMemoryRepo {
    docs: Mutex<HashMap<String, Arc<HandleInner>>>,
    storage_dir: Option<std::path::PathBuf>,
}

impl InMemoryRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Persists every document's full state under `dir` (one file per
    /// document id) so it survives process restarts, backing
    /// `<root>/.pushwork/automerge/`.
    pub fn with_storage(dir: std::path::PathBuf) -> Arc<Self> {
        Arc::new(Self {
            docs: Mutex::new(HashMap::new()),
            storage_dir: Some(dir),
        })
    }

    fn persist_path(&self, id: &str) -> Option<PathBuf> {
        self.storage_dir.as_ref().map(|d| d.join(format!("{id}.bin")))
    }

    /// Loads every `<id>.bin` snapshot under the storage directory so a
    /// fresh `InMemoryRepo` pointed at the same directory can `find()`
    /// documents created by a previous process.
    pub fn load_storage(dir: PathBuf) -> EngineResult<Arc<Self>> {
        let repo = Self {
            docs: Mutex::new(HashMap::new()),
            storage_dir: Some(dir.clone()),
        };
        if dir.exists() {
            for entry in std::fs::read_dir(&dir).map_err(EngineError::Io)? {
                let entry = entry.map_err(EngineError::Io)?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                    continue;
                }
                let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let bytes = std::fs::read(&path).map_err(EngineError::Io)?;
                let update = yrs::Update::decode_v1(&bytes)
                    .map_err(|e| EngineError::Other(anyhow::anyhow!("decode {}: {e}", path.display())))?;
                let doc = yrs::Doc::new();
                {
                    let mut txn = doc.transact_mut();
                    txn.apply_update(update)
                        .map_err(|e| EngineError::Other(anyhow::anyhow!("apply {}: {e}", path.display())))?;
                }
                let heads = encode_heads(&doc);
                let inner = Arc::new(HandleInner {
                    doc: Mutex::new(doc),
                    history: Mutex::new(vec![(heads, bytes)]),
                    persist_path: Some(path.clone()),
                });
                repo.docs.lock().unwrap().insert(id.to_string(), inner);
            }
        }
        Ok(Arc::new(repo))
    }
}

#[async_trait]
impl Repo for InMemoryRepo {
    async fn create(&self, body: DocBody) -> EngineResult<Handle> {
        let id = Uuid::new_v4().to_string();
        let doc = yrs::Doc::new();
        {
            let meta = doc.get_or_insert_map(META_MAP);
            let text = doc.get_or_insert_text(BODY_TEXT);
            let docs_map = doc.get_or_insert_map(DOCS_MAP);
            let mut txn = doc.transact_mut();
            match &body {
                DocBody::File(f) => {
                    write_meta(&mut txn, &meta, f);
                    if let Content::Text(s) = &f.content {
                        if !s.is_empty() {
                            text.insert(&mut txn, 0, s);
                        }
                    }
                    let _ = docs_map;
                }
                DocBody::Directory(d) => {
                    write_dir_meta(&mut txn, &meta, d);
                    for entry in &d.docs {
                        docs_map.insert(
                            &mut txn,
                            format!("{}:{}", entry.kind.as_str(), entry.name),
                            Any::String(entry.url.clone().into()),
                        );
                    }
                    let _ = text;
                }
            }
        }
        let inner = Arc::new(HandleInner {
            doc: Mutex::new(doc),
            history: Mutex::new(Vec::new()),
            persist_path: self.persist_path(&id),
        });
        let handle = Handle {
            url: DocUrl::new(id.clone()),
            inner: inner.clone(),
        };
        handle.record_history(&handle.inner.doc.lock().unwrap());
        self.docs.lock().unwrap().insert(id, inner);
        Ok(handle)
    }

    async fn find(&self, url: &DocUrl) -> EngineResult<Handle> {
        let docs = self.docs.lock().unwrap();
        match docs.get(url.id()) {
            Some(inner) => Ok(Handle {
                url: url.plain(),
                inner: inner.clone(),
            }),
            None => Err(EngineError::Other(anyhow::anyhow!(
                "document {} unavailable",
                url.id()
            ))),
        }
    }

    async fn is_synced(&self, _handle: &Handle, _relay_id: &str) -> EngineResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, text: &str) -> DocBody {
        DocBody::File(FileDocument {
            name: name.to_string(),
            extension: "txt".to_string(),
            mime_type: "text/plain".to_string(),
            content: Content::Text(text.to_string()),
            permissions: 0o644,
        })
    }

    #[tokio::test]
    async fn create_and_find_round_trips_content() {
        let repo = InMemoryRepo::new();
        let handle = repo.create(file("a.txt", "hello")).await.unwrap();
        let found = repo.find(&handle.url().plain()).await.unwrap();
        let body = found.doc().unwrap();
        assert_eq!(body.as_file().unwrap().content, Content::Text("hello".into()));
    }

    #[test]
    fn docs_map_round_trips_directory_entries() {
        let dir = DocBody::Directory(DirectoryDocument {
            title: Some("root".into()),
            docs: vec![DirEntry {
                name: "a.txt".into(),
                kind: EntryKind::File,
                url: "pushwork:abc".into(),
            }],
            last_sync_at: None,
        });
        let doc = yrs::Doc::new();
        let meta = doc.get_or_insert_map(META_MAP);
        let docs_map = doc.get_or_insert_map(DOCS_MAP);
        {
            let mut txn = doc.transact_mut();
            if let DocBody::Directory(d) = &dir {
                write_dir_meta(&mut txn, &meta, d);
                for entry in &d.docs {
                    docs_map.insert(
                        &mut txn,
                        format!("{}:{}", entry.kind.as_str(), entry.name),
                        Any::String(entry.url.clone().into()),
                    );
                }
            }
        }
        let txn = doc.transact();
        let read = read_dir_meta(&txn, &meta, &docs_map).unwrap();
        assert_eq!(read.title.as_deref(), Some("root"));
        assert_eq!(read.docs.len(), 1);
        assert_eq!(read.docs[0].name, "a.txt");
    }

    #[test]
    fn doc_url_parses_plain_and_versioned() {
        let url = DocUrl::parse("pushwork:abc").unwrap();
        assert!(!url.is_versioned());
        let heads: Heads = vec![1, 2, 3];
        let versioned = url.with_heads(&heads);
        let parsed = DocUrl::parse(&versioned.to_string()).unwrap();
        assert!(parsed.is_versioned());
        assert_eq!(parsed.plain(), url);
    }
}
