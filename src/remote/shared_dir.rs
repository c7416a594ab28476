use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use super::{
    Capabilities, ChangeKind, CollectionRef, DocRef, DocumentChange, RemoteBackend, RemoteError,
    StreamMessage, Subscription, SubscriptionSink,
};

const DOC_EXTENSION: &str = "json";

/// One JSON file per document under `<root>/<collection>/`.
#[derive(Debug, Clone)]
pub struct SharedDirRemote {
    root: PathBuf,
    watch_interval: Duration,
}

impl SharedDirRemote {
    pub fn new(root: impl Into<PathBuf>, watch_interval: Duration) -> Self {
        Self {
            root: root.into(),
            watch_interval,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn doc_path(&self, doc: &DocRef) -> PathBuf {
        self.collection_dir(doc.collection())
            .join(format!("{}.{DOC_EXTENSION}", doc.id()))
    }

    fn temp_path(&self, doc: &DocRef) -> PathBuf {
        self.collection_dir(doc.collection())
            .join(format!(".{}.{}.tmp", doc.id(), Uuid::new_v4().simple()))
    }

    fn write_temp(&self, doc: &DocRef, data: &Value) -> Result<PathBuf, RemoteError> {
        let body = serde_json::to_vec_pretty(data).map_err(|source| RemoteError::InvalidDocument {
            id: doc.id().to_string(),
            source,
        })?;
        let tmp = self.temp_path(doc);
        fs::write(&tmp, body).map_err(|source| RemoteError::Io {
            path: tmp.clone(),
            source,
        })?;
        Ok(tmp)
    }
}

impl RemoteBackend for SharedDirRemote {
    fn capabilities(&self) -> Capabilities {
        Capabilities::REQUIRED | Capabilities::CREATE_IF_ABSENT
    }

    fn collection(&self, name: &str) -> Result<CollectionRef, RemoteError> {
        validate_name("collection", name)?;
        let dir = self.collection_dir(name);
        fs::create_dir_all(&dir).map_err(|source| RemoteError::Io { path: dir, source })?;
        Ok(CollectionRef::new(name))
    }

    fn doc(&self, collection: &CollectionRef, id: &str) -> Result<DocRef, RemoteError> {
        validate_name("document", id)?;
        Ok(DocRef::new(collection, id))
    }

    fn get_doc(&self, doc: &DocRef) -> Result<Option<Value>, RemoteError> {
        read_document(&self.doc_path(doc), doc.id())
    }

    fn set_doc(&self, doc: &DocRef, data: &Value) -> Result<(), RemoteError> {
        let tmp = self.write_temp(doc, data)?;
        let path = self.doc_path(doc);
        fs::rename(&tmp, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            RemoteError::Io { path, source }
        })
    }

    fn create_doc(&self, doc: &DocRef, data: &Value) -> Result<(), RemoteError> {
        let tmp = self.write_temp(doc, data)?;
        let path = self.doc_path(doc);
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(RemoteError::AlreadyExists(doc.id().to_string()))
            }
            Err(source) => Err(RemoteError::Io { path, source }),
        }
    }

    fn delete_doc(&self, doc: &DocRef) -> Result<(), RemoteError> {
        let path = self.doc_path(doc);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RemoteError::Io { path, source }),
        }
    }

    fn subscribe(&self, collection: &CollectionRef) -> Result<Subscription, RemoteError> {
        let dir = self.collection_dir(collection.name());
        let initial = scan_collection(&dir, &BTreeMap::new())
            .map_err(|source| RemoteError::Io {
                path: dir.clone(),
                source,
            })?;
        let (sink, subscription) = Subscription::channel();
        sink.send(StreamMessage::Changes(diff(&BTreeMap::new(), &initial)));

        let interval = self.watch_interval;
        thread::Builder::new()
            .name(format!("notecal-watch-{}", collection.name()))
            .spawn(move || watch(dir, initial, interval, sink))
            .map_err(|source| RemoteError::Io {
                path: self.collection_dir(collection.name()),
                source,
            })?;
        Ok(subscription)
    }
}

fn watch(
    dir: PathBuf,
    mut known: BTreeMap<String, Value>,
    interval: Duration,
    sink: SubscriptionSink,
) {
    loop {
        thread::sleep(interval);
        if sink.is_cancelled() {
            tracing::debug!(dir = %dir.display(), "change feed cancelled");
            return;
        }
        match scan_collection(&dir, &known) {
            Ok(current) => {
                let changes = diff(&known, &current);
                if !changes.is_empty() && !sink.send(StreamMessage::Changes(changes)) {
                    return;
                }
                known = current;
            }
            Err(err) => {
                tracing::warn!(?err, dir = %dir.display(), "shared directory became unreadable");
                sink.send(StreamMessage::Error(format!(
                    "cannot read {}: {err}",
                    dir.display()
                )));
                return;
            }
        }
    }
}

/// Reads every document in `dir`. A document that cannot be parsed (for
/// example one caught mid-write) keeps the value last seen in `known`.
fn scan_collection(
    dir: &Path,
    known: &BTreeMap<String, Value>,
) -> io::Result<BTreeMap<String, Value>> {
    let mut docs = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(id) = document_id(&path) else {
            continue;
        };
        match read_document(&path, &id) {
            Ok(Some(value)) => {
                docs.insert(id, value);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(?err, path = %path.display(), "skipping unreadable document");
                if let Some(previous) = known.get(&id) {
                    docs.insert(id, previous.clone());
                }
            }
        }
    }
    Ok(docs)
}

fn diff(known: &BTreeMap<String, Value>, current: &BTreeMap<String, Value>) -> Vec<DocumentChange> {
    let mut changes = Vec::new();
    for (id, value) in current {
        let kind = match known.get(id) {
            None => ChangeKind::Added,
            Some(previous) if previous != value => ChangeKind::Modified,
            Some(_) => continue,
        };
        changes.push(DocumentChange {
            kind,
            id: id.clone(),
            data: Some(value.clone()),
        });
    }
    for id in known.keys().filter(|id| !current.contains_key(*id)) {
        changes.push(DocumentChange {
            kind: ChangeKind::Removed,
            id: id.clone(),
            data: None,
        });
    }
    changes
}

fn document_id(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    name.strip_suffix(&format!(".{DOC_EXTENSION}"))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn read_document(path: &Path, id: &str) -> Result<Option<Value>, RemoteError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RemoteError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| RemoteError::InvalidDocument {
            id: id.to_string(),
            source,
        })
}

fn validate_name(kind: &'static str, name: &str) -> Result<(), RemoteError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RemoteError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}
