use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde_json::Value;
use strum::Display;
use thiserror::Error;

pub mod memory;
pub mod shared_dir;

pub use memory::MemoryRemote;
pub use shared_dir::SharedDirRemote;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const DATABASE = 1 << 0;
        const COLLECTION_REF = 1 << 1;
        const DOC_REF = 1 << 2;
        const SET_DOC = 1 << 3;
        const GET_DOC = 1 << 4;
        const DELETE_DOC = 1 << 5;
        const SUBSCRIBE_SNAPSHOT = 1 << 6;
        /// Atomic create-if-absent; optional.
        const CREATE_IF_ABSENT = 1 << 7;

        const REQUIRED = Self::DATABASE.bits()
            | Self::COLLECTION_REF.bits()
            | Self::DOC_REF.bits()
            | Self::SET_DOC.bits()
            | Self::GET_DOC.bits()
            | Self::DELETE_DOC.bits()
            | Self::SUBSCRIBE_SNAPSHOT.bits();
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("document '{0}' already exists")]
    AlreadyExists(String),
    #[error("backend does not support {0}")]
    Unsupported(&'static str),
    #[error("invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },
    #[error("remote backend unavailable: {0}")]
    Unavailable(String),
    #[error("document '{id}' is not valid JSON")]
    InvalidDocument {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("remote i/o failure at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    name: String,
}

impl CollectionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocRef {
    collection: String,
    id: String,
}

impl DocRef {
    pub fn new(collection: &CollectionRef, id: impl Into<String>) -> Self {
        Self {
            collection: collection.name.clone(),
            id: id.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub id: String,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Changes(Vec<DocumentChange>),
    Error(String),
}

pub trait RemoteBackend: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn collection(&self, name: &str) -> Result<CollectionRef, RemoteError> {
        Ok(CollectionRef::new(name))
    }

    fn doc(&self, collection: &CollectionRef, id: &str) -> Result<DocRef, RemoteError> {
        Ok(DocRef::new(collection, id))
    }

    fn get_doc(&self, doc: &DocRef) -> Result<Option<Value>, RemoteError>;

    fn set_doc(&self, doc: &DocRef, data: &Value) -> Result<(), RemoteError>;

    /// Fails with [`RemoteError::AlreadyExists`] when the document exists.
    fn create_doc(&self, _doc: &DocRef, _data: &Value) -> Result<(), RemoteError> {
        Err(RemoteError::Unsupported("create_doc"))
    }

    fn delete_doc(&self, doc: &DocRef) -> Result<(), RemoteError>;

    fn subscribe(&self, collection: &CollectionRef) -> Result<Subscription, RemoteError>;
}

#[derive(Debug)]
pub struct Subscription {
    events: Receiver<StreamMessage>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionSink {
    events: Sender<StreamMessage>,
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    pub fn channel() -> (SubscriptionSink, Subscription) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            SubscriptionSink {
                events: tx,
                cancelled: cancelled.clone(),
            },
            Subscription {
                events: rx,
                cancelled,
            },
        )
    }

    /// Next pending message without blocking. A feed whose producer went
    /// away reports that as an error.
    pub fn try_recv(&self) -> Option<StreamMessage> {
        if self.is_cancelled() {
            return None;
        }
        match self.events.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(StreamMessage::Error("change feed closed by backend".to_string()))
            }
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl SubscriptionSink {
    pub fn send(&self, message: StreamMessage) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.events.send(message).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
