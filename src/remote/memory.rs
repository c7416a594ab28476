use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::{
    Capabilities, ChangeKind, CollectionRef, DocRef, DocumentChange, RemoteBackend, RemoteError,
    StreamMessage, Subscription, SubscriptionSink,
};

/// In-process document database shared by every handle from [`MemoryRemote::connect`].
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Mutex<Shared>>,
    capabilities: Capabilities,
}

#[derive(Default)]
struct Shared {
    collections: HashMap<String, BTreeMap<String, Value>>,
    subscribers: Vec<(String, SubscriptionSink)>,
    offline: bool,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            capabilities: Capabilities::all(),
        }
    }

    pub fn connect(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            capabilities: Capabilities::all(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Fails every open change feed, as if the connection dropped.
    pub fn disconnect_all(&self, reason: &str) {
        let mut shared = self.shared.lock();
        for (_, sink) in shared.subscribers.drain(..) {
            sink.send(StreamMessage::Error(reason.to_string()));
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.shared.lock().offline = offline;
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.shared
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut shared = self.shared.lock();
        shared.subscribers.retain(|(_, sink)| !sink.is_cancelled());
        shared.subscribers.len()
    }

    fn write(&self, doc: &DocRef, data: &Value, exclusive: bool) -> Result<(), RemoteError> {
        let mut shared = self.shared.lock();
        ensure_online(&shared)?;
        let docs = shared
            .collections
            .entry(doc.collection().to_string())
            .or_default();
        let kind = match docs.get(doc.id()) {
            Some(_) if exclusive => return Err(RemoteError::AlreadyExists(doc.id().to_string())),
            Some(_) => ChangeKind::Modified,
            None => ChangeKind::Added,
        };
        docs.insert(doc.id().to_string(), data.clone());
        broadcast(
            &mut shared,
            doc.collection(),
            DocumentChange {
                kind,
                id: doc.id().to_string(),
                data: Some(data.clone()),
            },
        );
        Ok(())
    }

    fn require(&self, capability: Capabilities, name: &'static str) -> Result<(), RemoteError> {
        if self.capabilities.contains(capability) {
            Ok(())
        } else {
            Err(RemoteError::Unsupported(name))
        }
    }
}

impl RemoteBackend for MemoryRemote {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn get_doc(&self, doc: &DocRef) -> Result<Option<Value>, RemoteError> {
        self.require(Capabilities::GET_DOC, "get_doc")?;
        let shared = self.shared.lock();
        ensure_online(&shared)?;
        Ok(shared
            .collections
            .get(doc.collection())
            .and_then(|docs| docs.get(doc.id()))
            .cloned())
    }

    fn set_doc(&self, doc: &DocRef, data: &Value) -> Result<(), RemoteError> {
        self.require(Capabilities::SET_DOC, "set_doc")?;
        self.write(doc, data, false)
    }

    fn create_doc(&self, doc: &DocRef, data: &Value) -> Result<(), RemoteError> {
        self.require(Capabilities::CREATE_IF_ABSENT, "create_doc")?;
        self.write(doc, data, true)
    }

    fn delete_doc(&self, doc: &DocRef) -> Result<(), RemoteError> {
        self.require(Capabilities::DELETE_DOC, "delete_doc")?;
        let mut shared = self.shared.lock();
        ensure_online(&shared)?;
        let removed = shared
            .collections
            .get_mut(doc.collection())
            .and_then(|docs| docs.remove(doc.id()));
        if removed.is_some() {
            broadcast(
                &mut shared,
                doc.collection(),
                DocumentChange {
                    kind: ChangeKind::Removed,
                    id: doc.id().to_string(),
                    data: None,
                },
            );
        }
        Ok(())
    }

    fn subscribe(&self, collection: &CollectionRef) -> Result<Subscription, RemoteError> {
        self.require(Capabilities::SUBSCRIBE_SNAPSHOT, "subscribe")?;
        let mut shared = self.shared.lock();
        ensure_online(&shared)?;
        let snapshot = shared
            .collections
            .get(collection.name())
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| DocumentChange {
                        kind: ChangeKind::Added,
                        id: id.clone(),
                        data: Some(data.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let (sink, subscription) = Subscription::channel();
        sink.send(StreamMessage::Changes(snapshot));
        shared
            .subscribers
            .push((collection.name().to_string(), sink));
        Ok(subscription)
    }
}

fn ensure_online(shared: &Shared) -> Result<(), RemoteError> {
    if shared.offline {
        Err(RemoteError::Unavailable("backend is offline".to_string()))
    } else {
        Ok(())
    }
}

fn broadcast(shared: &mut Shared, collection: &str, change: DocumentChange) {
    shared.subscribers.retain(|(name, sink)| {
        name != collection || sink.send(StreamMessage::Changes(vec![change.clone()]))
    });
}
