use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use strum::Display;

use crate::calendar::DayKey;
use crate::identity::{wait_for_token, IdentityProvider};
use crate::remote::{
    Capabilities, ChangeKind, CollectionRef, DocRef, DocumentChange, RemoteBackend, RemoteError,
    StreamMessage, Subscription,
};
use crate::storage::{KeyValueStore, KvError};

mod error;
mod record;

pub use error::StoreError;
pub use record::{
    decode_blob, encode_blob, CalendarData, InvalidMessage, MessageRecord, MessageText,
    MAX_MESSAGE_CHARS,
};

pub const CALENDAR_DATA_KEY: &str = "calendar-data";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub collection: String,
    pub poll_interval: Duration,
    pub token_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            collection: "calendar".to_string(),
            poll_interval: Duration::from_millis(100),
            token_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BackendMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BackendState {
    Unstarted,
    ProbingRemote,
    RemoteActive,
    LocalActive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Changed,
    ModeChanged(BackendMode),
    Busy(bool),
    Warning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Declined,
}

struct RemoteLink {
    backend: Arc<dyn RemoteBackend>,
    identity: Arc<dyn IdentityProvider>,
}

#[derive(Clone)]
struct RemoteHandle {
    backend: Arc<dyn RemoteBackend>,
    collection: CollectionRef,
    atomic_create: bool,
}

struct RemoteSession {
    handle: RemoteHandle,
    subscription: Option<Subscription>,
}

enum Target {
    Remote(RemoteHandle),
    Local,
}

pub struct MessageStore {
    entries: CalendarData,
    state: BackendState,
    local: Arc<dyn KeyValueStore>,
    remote: Option<RemoteLink>,
    session: Option<RemoteSession>,
    config: StoreConfig,
    observers: Vec<Sender<StoreEvent>>,
}

impl MessageStore {
    pub fn new(local: Arc<dyn KeyValueStore>, config: StoreConfig) -> Self {
        Self {
            entries: CalendarData::new(),
            state: BackendState::Unstarted,
            local,
            remote: None,
            session: None,
            config,
            observers: Vec::new(),
        }
    }

    pub fn with_remote(
        mut self,
        backend: Arc<dyn RemoteBackend>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        self.remote = Some(RemoteLink { backend, identity });
        self
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn mode(&self) -> Option<BackendMode> {
        match self.state {
            BackendState::RemoteActive => Some(BackendMode::Remote),
            BackendState::LocalActive => Some(BackendMode::Local),
            BackendState::Unstarted | BackendState::ProbingRemote => None,
        }
    }

    pub fn subscribe(&mut self) -> Receiver<StoreEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.observers.push(tx);
        rx
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_message(&self, day: impl Into<DayKey>) -> bool {
        self.entries.contains_key(&day.into())
    }

    pub fn get_message(&self, day: impl Into<DayKey>) -> Option<&MessageRecord> {
        self.entries.get(&day.into())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&DayKey, &MessageRecord)> {
        self.entries.iter()
    }

    pub fn entries_in_month(
        &self,
        year: i32,
        month: i32,
    ) -> impl Iterator<Item = (&DayKey, &MessageRecord)> {
        let (first, last) = DayKey::month_bounds(year, month);
        self.entries.range(first..=last)
    }

    pub fn initialize(&mut self) -> BackendMode {
        if let Some(mode) = self.mode() {
            return mode;
        }
        self.state = BackendState::ProbingRemote;
        match self.probe_remote() {
            Ok(session) => {
                tracing::info!(
                    collection = session.handle.collection.name(),
                    atomic_create = session.handle.atomic_create,
                    "remote backend active"
                );
                self.session = Some(session);
                self.state = BackendState::RemoteActive;
                self.emit(StoreEvent::ModeChanged(BackendMode::Remote));
                if let Err(err) = self.process_remote_events() {
                    tracing::warn!(?err, "remote change feed failed during startup");
                }
            }
            Err(err) => {
                tracing::warn!(?err, "remote backend unavailable, using local storage");
                self.activate_local();
            }
        }
        self.mode().unwrap_or(BackendMode::Local)
    }

    /// Drains the remote feed. A feed error downgrades the store to local storage.
    pub fn process_remote_events(&mut self) -> Result<usize, StoreError> {
        if self.state != BackendState::RemoteActive {
            return Ok(0);
        }
        let messages = match self
            .session
            .as_ref()
            .and_then(|session| session.subscription.as_ref())
        {
            Some(subscription) => drain(subscription),
            None => return Ok(0),
        };

        let mut applied = 0;
        let mut failure = None;
        for message in messages {
            match message {
                StreamMessage::Changes(changes) => {
                    for change in changes {
                        if apply_change(&mut self.entries, change) {
                            applied += 1;
                        }
                    }
                }
                StreamMessage::Error(reason) => {
                    failure = Some(reason);
                    break;
                }
            }
        }
        if applied > 0 {
            self.emit(StoreEvent::Changed);
        }
        if let Some(reason) = failure {
            self.downgrade(&reason);
            return Err(StoreError::StreamDisconnected(reason));
        }
        Ok(applied)
    }

    pub fn create(
        &mut self,
        day: impl Into<DayKey>,
        text: &MessageText,
        author_id: &str,
    ) -> Result<DayKey, StoreError> {
        let key = day.into();
        let record = MessageRecord::new(text, author_id);
        match self.target()? {
            Target::Remote(remote) => {
                self.busy(|| remote.create(&key, &record))?;
                self.entries.insert(key, record);
            }
            Target::Local => {
                if self.entries.contains_key(&key) {
                    return Err(StoreError::AlreadyFilled { key });
                }
                self.entries.insert(key, record);
                if let Err(err) = self.persist_local() {
                    self.entries.remove(&key);
                    return Err(err);
                }
            }
        }
        tracing::debug!(%key, author = author_id, "message created");
        self.emit(StoreEvent::Changed);
        Ok(key)
    }

    pub fn update(
        &mut self,
        day: impl Into<DayKey>,
        text: &MessageText,
        requester_id: &str,
    ) -> Result<(), StoreError> {
        let key = day.into();
        match self.target()? {
            Target::Remote(remote) => {
                let updated = self.busy(|| {
                    let doc = remote.doc(&key)?;
                    let existing = remote
                        .fetch(&doc)?
                        .ok_or(StoreError::NotFound { key })?;
                    if !existing.is_authored_by(requester_id) {
                        return Err(StoreError::Forbidden { key });
                    }
                    let updated = existing.revised(text);
                    remote.store(&doc, &updated)?;
                    Ok(updated)
                })?;
                self.entries.insert(key, updated);
            }
            Target::Local => {
                let existing = self
                    .entries
                    .get(&key)
                    .ok_or(StoreError::NotFound { key })?;
                if !existing.is_authored_by(requester_id) {
                    return Err(StoreError::Forbidden { key });
                }
                let updated = existing.revised(text);
                let previous = self.entries.insert(key, updated);
                if let Err(err) = self.persist_local() {
                    if let Some(previous) = previous {
                        self.entries.insert(key, previous);
                    }
                    return Err(err);
                }
            }
        }
        tracing::debug!(%key, requester = requester_id, "message updated");
        self.emit(StoreEvent::Changed);
        Ok(())
    }

    /// `confirm` runs only after the existence and authorship checks pass.
    pub fn delete<F>(
        &mut self,
        day: impl Into<DayKey>,
        requester_id: &str,
        confirm: F,
    ) -> Result<DeleteOutcome, StoreError>
    where
        F: FnOnce(&DayKey, &MessageRecord) -> bool,
    {
        let key = day.into();
        match self.target()? {
            Target::Remote(remote) => {
                let (doc, existing) = self.busy(|| {
                    let doc = remote.doc(&key)?;
                    let existing = remote
                        .fetch(&doc)?
                        .ok_or(StoreError::NotFound { key })?;
                    Ok((doc, existing))
                })?;
                if !existing.is_authored_by(requester_id) {
                    return Err(StoreError::Forbidden { key });
                }
                if !confirm(&key, &existing) {
                    tracing::debug!(%key, "delete declined");
                    return Ok(DeleteOutcome::Declined);
                }
                self.busy(|| remote.remove(&doc))?;
                self.entries.remove(&key);
            }
            Target::Local => {
                let existing = self
                    .entries
                    .get(&key)
                    .ok_or(StoreError::NotFound { key })?;
                if !existing.is_authored_by(requester_id) {
                    return Err(StoreError::Forbidden { key });
                }
                if !confirm(&key, existing) {
                    tracing::debug!(%key, "delete declined");
                    return Ok(DeleteOutcome::Declined);
                }
                let removed = self.entries.remove(&key);
                if let Err(err) = self.persist_local() {
                    if let Some(removed) = removed {
                        self.entries.insert(key, removed);
                    }
                    return Err(err);
                }
            }
        }
        tracing::debug!(%key, requester = requester_id, "message deleted");
        self.emit(StoreEvent::Changed);
        Ok(DeleteOutcome::Deleted)
    }

    pub fn shutdown(&mut self) {
        let subscription = self
            .session
            .as_mut()
            .and_then(|session| session.subscription.take());
        if let Some(subscription) = subscription {
            subscription.cancel();
            tracing::info!("remote change feed cancelled");
        }
    }

    fn probe_remote(&self) -> Result<RemoteSession, StoreError> {
        let link = self.remote.as_ref().ok_or_else(|| {
            StoreError::BackendUnavailable("no remote backend configured".to_string())
        })?;
        let capabilities = link.backend.capabilities();
        let missing = Capabilities::REQUIRED - capabilities;
        if !missing.is_empty() {
            return Err(StoreError::BackendUnavailable(format!(
                "backend lacks {missing:?}"
            )));
        }
        if wait_for_token(
            link.identity.as_ref(),
            self.config.poll_interval,
            self.config.token_timeout,
        )
        .is_none()
        {
            return Err(StoreError::BackendUnavailable(format!(
                "no identity token within {:?}",
                self.config.token_timeout
            )));
        }

        let unavailable = |err: RemoteError| StoreError::BackendUnavailable(err.to_string());
        let collection = link
            .backend
            .collection(&self.config.collection)
            .map_err(unavailable)?;
        let subscription = link.backend.subscribe(&collection).map_err(unavailable)?;
        Ok(RemoteSession {
            handle: RemoteHandle {
                backend: link.backend.clone(),
                collection,
                atomic_create: capabilities.contains(Capabilities::CREATE_IF_ABSENT),
            },
            subscription: Some(subscription),
        })
    }

    fn activate_local(&mut self) {
        self.state = BackendState::LocalActive;
        if self.entries.is_empty() {
            match self.load_local() {
                Ok(count) => tracing::info!(entries = count, "loaded local calendar data"),
                Err(err) => tracing::warn!(?err, "could not read local calendar data"),
            }
        } else {
            tracing::debug!(
                entries = self.entries.len(),
                "keeping entries already in memory"
            );
        }
        self.emit(StoreEvent::ModeChanged(BackendMode::Local));
        self.emit(StoreEvent::Changed);
    }

    fn downgrade(&mut self, reason: &str) {
        tracing::warn!(%reason, "remote change feed lost, continuing with local storage");
        if let Some(subscription) = self
            .session
            .take()
            .and_then(|session| session.subscription)
        {
            subscription.cancel();
        }
        self.emit(StoreEvent::Warning(format!(
            "Connection to the shared calendar was lost ({reason}). \
             Changes are now saved on this device only."
        )));
        self.activate_local();
    }

    fn load_local(&mut self) -> Result<usize, KvError> {
        let Some(raw) = self.local.get(CALENDAR_DATA_KEY)? else {
            return Ok(0);
        };
        match decode_blob(&raw) {
            Ok(data) => {
                self.entries = data;
                Ok(self.entries.len())
            }
            Err(err) => {
                tracing::warn!(?err, "local calendar data is unreadable, starting empty");
                Ok(0)
            }
        }
    }

    fn persist_local(&self) -> Result<(), StoreError> {
        let blob = encode_blob(&self.entries)?;
        self.local.set(CALENDAR_DATA_KEY, &blob)?;
        Ok(())
    }

    fn target(&self) -> Result<Target, StoreError> {
        match self.state {
            BackendState::RemoteActive => self
                .session
                .as_ref()
                .map(|session| Target::Remote(session.handle.clone()))
                .ok_or_else(|| {
                    StoreError::BackendUnavailable("remote session is gone".to_string())
                }),
            BackendState::LocalActive => Ok(Target::Local),
            BackendState::Unstarted | BackendState::ProbingRemote => Err(
                StoreError::BackendUnavailable("store has not been initialized".to_string()),
            ),
        }
    }

    fn busy<T>(
        &mut self,
        op: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.emit(StoreEvent::Busy(true));
        let result = op();
        self.emit(StoreEvent::Busy(false));
        result
    }

    fn emit(&mut self, event: StoreEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl RemoteHandle {
    fn doc(&self, key: &DayKey) -> Result<DocRef, StoreError> {
        Ok(self.backend.doc(&self.collection, &key.to_string())?)
    }

    fn fetch(&self, doc: &DocRef) -> Result<Option<MessageRecord>, StoreError> {
        let Some(value) = self.backend.get_doc(doc)? else {
            return Ok(None);
        };
        let record =
            serde_json::from_value(value).map_err(|source| RemoteError::InvalidDocument {
                id: doc.id().to_string(),
                source,
            })?;
        Ok(Some(record))
    }

    fn store(&self, doc: &DocRef, record: &MessageRecord) -> Result<(), StoreError> {
        let data = serde_json::to_value(record)?;
        self.backend.set_doc(doc, &data)?;
        Ok(())
    }

    fn remove(&self, doc: &DocRef) -> Result<(), StoreError> {
        self.backend.delete_doc(doc)?;
        Ok(())
    }

    fn create(&self, key: &DayKey, record: &MessageRecord) -> Result<(), StoreError> {
        let doc = self.doc(key)?;
        let data = serde_json::to_value(record)?;
        if self.atomic_create {
            return self.backend.create_doc(&doc, &data).map_err(|err| match err {
                RemoteError::AlreadyExists(_) => StoreError::AlreadyFilled { key: *key },
                other => other.into(),
            });
        }
        // Without an atomic create another client can still write between
        // these two calls; the later write wins.
        if self.backend.get_doc(&doc)?.is_some() {
            return Err(StoreError::AlreadyFilled { key: *key });
        }
        self.backend.set_doc(&doc, &data)?;
        Ok(())
    }
}

fn drain(subscription: &Subscription) -> Vec<StreamMessage> {
    let mut messages = Vec::new();
    while let Some(message) = subscription.try_recv() {
        let failed = matches!(message, StreamMessage::Error(_));
        messages.push(message);
        if failed {
            break;
        }
    }
    messages
}

fn apply_change(entries: &mut CalendarData, change: DocumentChange) -> bool {
    let key: DayKey = match change.id.parse() {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!(id = %change.id, %err, "skipping document with an invalid day key");
            return false;
        }
    };
    match change.kind {
        ChangeKind::Added | ChangeKind::Modified => {
            let Some(data) = change.data else {
                tracing::warn!(%key, kind = %change.kind, "skipping change without a body");
                return false;
            };
            match serde_json::from_value::<MessageRecord>(data) {
                Ok(record) if entries.get(&key) == Some(&record) => false,
                Ok(record) => {
                    entries.insert(key, record);
                    true
                }
                Err(err) => {
                    tracing::warn!(%key, ?err, "skipping malformed message document");
                    false
                }
            }
        }
        ChangeKind::Removed => entries.remove(&key).is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use crate::remote::MemoryRemote;
    use crate::storage::MemoryKeyValueStore;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Instant;

    fn test_config() -> StoreConfig {
        StoreConfig {
            collection: "calendar".to_string(),
            poll_interval: Duration::from_millis(5),
            token_timeout: Duration::from_millis(50),
        }
    }

    fn text(raw: &str) -> MessageText {
        MessageText::parse(raw).expect("valid message text")
    }

    fn local_store() -> (Arc<MemoryKeyValueStore>, MessageStore) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let mut store = MessageStore::new(kv.clone(), test_config());
        assert_eq!(store.initialize(), BackendMode::Local);
        (kv, store)
    }

    fn remote_store(remote: &MemoryRemote) -> MessageStore {
        let mut store = MessageStore::new(Arc::new(MemoryKeyValueStore::new()), test_config())
            .with_remote(
                Arc::new(remote.connect()),
                Arc::new(StaticIdentity::signed_in("token")),
            );
        assert_eq!(store.initialize(), BackendMode::Remote);
        store
    }

    #[test]
    fn local_claim_edit_delete_cycle() -> anyhow::Result<()> {
        let (_kv, mut store) = local_store();
        assert!(!store.has_message((2024, 2, 15)));

        store.create((2024, 2, 15), &text("hello"), "u1")?;
        assert!(store.has_message((2024, 2, 15)));
        let record = store.get_message((2024, 2, 15)).expect("created");
        assert_eq!(record.text, "hello");
        assert!(!record.edited);

        assert_matches!(
            store.update((2024, 2, 15), &text("hi"), "u2"),
            Err(StoreError::Forbidden { .. })
        );
        assert_eq!(store.get_message((2024, 2, 15)).expect("kept").text, "hello");

        store.update((2024, 2, 15), &text("hi"), "u1")?;
        let record = store.get_message((2024, 2, 15)).expect("updated");
        assert_eq!(record.text, "hi");
        assert!(record.edited);
        assert_eq!(record.author_id, "u1");

        let outcome = store.delete((2024, 2, 15), "u1", |_, _| true)?;
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert!(!store.has_message((2024, 2, 15)));
        Ok(())
    }

    #[test]
    fn claiming_a_filled_day_leaves_it_alone() -> anyhow::Result<()> {
        let (_kv, mut store) = local_store();
        store.create((2024, 2, 15), &text("first"), "u1")?;
        assert_matches!(
            store.create((2024, 2, 15), &text("second"), "u2"),
            Err(StoreError::AlreadyFilled { key }) if key.to_string() == "2024-03-15"
        );
        let record = store.get_message((2024, 2, 15)).expect("kept");
        assert_eq!(record.text, "first");
        assert_eq!(record.author_id, "u1");
        Ok(())
    }

    #[test]
    fn rolled_over_dates_address_the_same_day() -> anyhow::Result<()> {
        let (_kv, mut store) = local_store();
        store.create((2024, -1, 1), &text("new year's eve month"), "u1")?;
        assert!(store.has_message((2023, 11, 1)));
        Ok(())
    }

    #[test]
    fn foreign_or_missing_messages_are_never_confirmed() -> anyhow::Result<()> {
        let (_kv, mut store) = local_store();
        store.create((2024, 2, 15), &text("mine"), "u1")?;

        let mut asked = false;
        assert_matches!(
            store.delete((2024, 2, 15), "u2", |_, _| {
                asked = true;
                true
            }),
            Err(StoreError::Forbidden { .. })
        );
        assert_matches!(
            store.delete((2024, 2, 16), "u1", |_, _| {
                asked = true;
                true
            }),
            Err(StoreError::NotFound { .. })
        );
        assert!(!asked);
        assert!(store.has_message((2024, 2, 15)));
        Ok(())
    }

    #[test]
    fn declined_delete_keeps_the_message() -> anyhow::Result<()> {
        let (kv, mut store) = local_store();
        store.create((2024, 2, 15), &text("keep me"), "u1")?;
        let persisted = kv.get(CALENDAR_DATA_KEY)?;

        let outcome = store.delete((2024, 2, 15), "u1", |key, record| {
            assert_eq!(key.to_string(), "2024-03-15");
            assert_eq!(record.text, "keep me");
            false
        })?;
        assert_eq!(outcome, DeleteOutcome::Declined);
        assert!(store.has_message((2024, 2, 15)));
        assert_eq!(kv.get(CALENDAR_DATA_KEY)?, persisted);
        Ok(())
    }

    #[test]
    fn missing_messages_cannot_be_updated() {
        let (_kv, mut store) = local_store();
        assert_matches!(
            store.update((2024, 2, 15), &text("hi"), "u1"),
            Err(StoreError::NotFound { .. })
        );
    }

    #[test]
    fn full_local_storage_rolls_the_change_back() -> anyhow::Result<()> {
        let kv = Arc::new(MemoryKeyValueStore::with_quota(150));
        let mut store = MessageStore::new(kv.clone(), test_config());
        store.initialize();
        store.create((2024, 2, 15), &text("hi"), "u1")?;

        let long = "x".repeat(MAX_MESSAGE_CHARS);
        assert_matches!(
            store.create((2024, 2, 16), &text(&long), "u1"),
            Err(StoreError::StorageQuotaExceeded { limit: 150, .. })
        );
        assert!(!store.has_message((2024, 2, 16)));
        assert_matches!(
            store.update((2024, 2, 15), &text(&long), "u1"),
            Err(StoreError::StorageQuotaExceeded { .. })
        );
        assert_eq!(store.get_message((2024, 2, 15)).expect("kept").text, "hi");
        assert_eq!(decode_blob(&kv.get(CALENDAR_DATA_KEY)?.expect("persisted"))?.len(), 1);
        Ok(())
    }

    #[test]
    fn local_data_survives_a_restart() -> anyhow::Result<()> {
        let (kv, mut first) = local_store();
        first.create((2024, 2, 15), &text("hello"), "u1")?;
        first.create((2024, 11, 31), &text("bye"), "u2")?;
        first.update((2024, 11, 31), &text("bye!"), "u2")?;

        let mut second = MessageStore::new(kv.clone(), test_config());
        second.initialize();
        let before: Vec<_> = first.entries().collect();
        let after: Vec<_> = second.entries().collect();
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn unreadable_local_data_starts_empty() -> anyhow::Result<()> {
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.set(CALENDAR_DATA_KEY, "{not json")?;
        let mut store = MessageStore::new(kv.clone(), test_config());
        assert_eq!(store.initialize(), BackendMode::Local);
        assert!(store.is_empty());
        store.create((2024, 2, 15), &text("fresh start"), "u1")?;
        assert_eq!(decode_blob(&kv.get(CALENDAR_DATA_KEY)?.expect("persisted"))?.len(), 1);
        Ok(())
    }

    #[test]
    fn operations_before_initialize_are_refused() {
        let mut store = MessageStore::new(Arc::new(MemoryKeyValueStore::new()), test_config());
        assert_eq!(store.state(), BackendState::Unstarted);
        assert_matches!(
            store.create((2024, 2, 15), &text("early"), "u1"),
            Err(StoreError::BackendUnavailable(_))
        );
    }

    #[test]
    fn initialize_runs_once() {
        let (_kv, mut store) = local_store();
        let events = store.subscribe();
        assert_eq!(store.initialize(), BackendMode::Local);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn incomplete_backend_goes_local_without_waiting_for_a_token() {
        let remote = MemoryRemote::new()
            .with_capabilities(Capabilities::REQUIRED - Capabilities::SUBSCRIBE_SNAPSHOT);
        let config = StoreConfig {
            token_timeout: Duration::from_secs(10),
            ..test_config()
        };
        let mut store = MessageStore::new(Arc::new(MemoryKeyValueStore::new()), config)
            .with_remote(Arc::new(remote), Arc::new(StaticIdentity::anonymous()));

        let started = Instant::now();
        assert_eq!(store.initialize(), BackendMode::Local);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(store.state(), BackendState::LocalActive);
    }

    #[test]
    fn missing_token_times_out_to_local() {
        let remote = MemoryRemote::new();
        let mut store = MessageStore::new(Arc::new(MemoryKeyValueStore::new()), test_config())
            .with_remote(Arc::new(remote.connect()), Arc::new(StaticIdentity::anonymous()));

        let started = Instant::now();
        assert_eq!(store.initialize(), BackendMode::Local);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(remote.subscriber_count(), 0);
    }

    #[test]
    fn remote_clients_share_messages() -> anyhow::Result<()> {
        let remote = MemoryRemote::new();
        let mut alice = remote_store(&remote);
        let mut bob = remote_store(&remote);

        alice.create((2024, 2, 15), &text("hello"), "alice")?;
        assert_eq!(alice.get_message((2024, 2, 15)).expect("confirmed").text, "hello");
        assert!(!bob.has_message((2024, 2, 15)));

        assert_eq!(bob.process_remote_events()?, 1);
        assert_eq!(bob.get_message((2024, 2, 15)).expect("streamed").author_id, "alice");

        // Our own write echoes back without changing anything.
        assert_eq!(alice.process_remote_events()?, 0);
        Ok(())
    }

    #[test]
    fn remote_checks_use_the_backend_not_the_cache() -> anyhow::Result<()> {
        let remote = MemoryRemote::new();
        let mut alice = remote_store(&remote);
        let mut bob = remote_store(&remote);
        alice.create((2024, 2, 15), &text("hello"), "alice")?;

        // Bob has not seen the change yet but the backend has.
        assert_matches!(
            bob.create((2024, 2, 15), &text("mine now"), "bob"),
            Err(StoreError::AlreadyFilled { .. })
        );
        assert_matches!(
            bob.update((2024, 2, 15), &text("mine now"), "bob"),
            Err(StoreError::Forbidden { .. })
        );
        assert_matches!(
            bob.update((2024, 2, 16), &text("nothing here"), "bob"),
            Err(StoreError::NotFound { .. })
        );
        assert_eq!(remote.document_count("calendar"), 1);
        Ok(())
    }

    #[test]
    fn non_atomic_backends_still_detect_filled_days() -> anyhow::Result<()> {
        let remote = MemoryRemote::new();
        let mut alice = remote_store(&remote);
        let mut bob = MessageStore::new(Arc::new(MemoryKeyValueStore::new()), test_config())
            .with_remote(
                Arc::new(remote.connect().with_capabilities(Capabilities::REQUIRED)),
                Arc::new(StaticIdentity::signed_in("token")),
            );
        assert_eq!(bob.initialize(), BackendMode::Remote);

        alice.create((2024, 2, 15), &text("first"), "alice")?;
        assert_matches!(
            bob.create((2024, 2, 15), &text("second"), "bob"),
            Err(StoreError::AlreadyFilled { .. })
        );
        bob.create((2024, 2, 16), &text("next day"), "bob")?;
        assert_eq!(remote.document_count("calendar"), 2);
        Ok(())
    }

    #[test]
    fn remote_update_and_delete_flow_to_other_clients() -> anyhow::Result<()> {
        let remote = MemoryRemote::new();
        let mut alice = remote_store(&remote);
        let mut bob = remote_store(&remote);
        alice.create((2024, 2, 15), &text("hello"), "alice")?;
        bob.process_remote_events()?;

        alice.update((2024, 2, 15), &text("hello again"), "alice")?;
        bob.process_remote_events()?;
        let seen = bob.get_message((2024, 2, 15)).expect("present");
        assert_eq!(seen.text, "hello again");
        assert!(seen.edited);

        assert_eq!(
            alice.delete((2024, 2, 15), "alice", |_, _| true)?,
            DeleteOutcome::Deleted
        );
        assert!(!alice.has_message((2024, 2, 15)));
        assert_eq!(bob.process_remote_events()?, 1);
        assert!(!bob.has_message((2024, 2, 15)));
        Ok(())
    }

    #[test]
    fn remote_delete_waits_for_confirmation() -> anyhow::Result<()> {
        let remote = MemoryRemote::new();
        let mut alice = remote_store(&remote);
        let mut bob = remote_store(&remote);
        alice.create((2024, 2, 15), &text("keep me"), "alice")?;

        let outcome = alice.delete((2024, 2, 15), "alice", |key, record| {
            assert_eq!(key.to_string(), "2024-03-15");
            assert_eq!(record.text, "keep me");
            false
        })?;
        assert_eq!(outcome, DeleteOutcome::Declined);
        assert!(alice.has_message((2024, 2, 15)));
        assert_eq!(remote.document_count("calendar"), 1);

        let mut asked = false;
        assert_matches!(
            bob.delete((2024, 2, 15), "bob", |_, _| {
                asked = true;
                true
            }),
            Err(StoreError::Forbidden { .. })
        );
        assert_matches!(
            bob.delete((2024, 2, 16), "bob", |_, _| {
                asked = true;
                true
            }),
            Err(StoreError::NotFound { .. })
        );
        assert!(!asked);
        assert_eq!(remote.document_count("calendar"), 1);
        Ok(())
    }

    #[test]
    fn remote_round_trips_are_bracketed_by_busy_events() -> anyhow::Result<()> {
        let remote = MemoryRemote::new();
        let mut store = remote_store(&remote);
        let events = store.subscribe();

        store.create((2024, 2, 15), &text("hello"), "u1")?;
        let seen: Vec<StoreEvent> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                StoreEvent::Busy(true),
                StoreEvent::Busy(false),
                StoreEvent::Changed
            ]
        );
        Ok(())
    }

    #[test]
    fn remote_write_failures_surface_and_change_nothing() {
        let remote = MemoryRemote::new();
        let mut store = remote_store(&remote);
        remote.set_offline(true);

        assert_matches!(
            store.create((2024, 2, 15), &text("hello"), "u1"),
            Err(StoreError::Remote(RemoteError::Unavailable(_)))
        );
        assert!(!store.has_message((2024, 2, 15)));
        assert_eq!(store.mode(), Some(BackendMode::Remote));
    }

    #[test]
    fn lost_feed_downgrades_to_local_for_good() -> anyhow::Result<()> {
        let remote = MemoryRemote::new();
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.set(
            CALENDAR_DATA_KEY,
            r#"{"2020-01-01":{"message":"stale","timestamp":"2020-01-01T00:00:00Z","userId":"old"}}"#,
        )?;
        let mut store = MessageStore::new(kv.clone(), test_config()).with_remote(
            Arc::new(remote.connect()),
            Arc::new(StaticIdentity::signed_in("token")),
        );
        assert_eq!(store.initialize(), BackendMode::Remote);
        store.create((2024, 2, 15), &text("hello"), "u1")?;
        let events = store.subscribe();

        remote.disconnect_all("network unreachable");
        assert_matches!(
            store.process_remote_events(),
            Err(StoreError::StreamDisconnected(reason)) if reason == "network unreachable"
        );
        assert_eq!(store.mode(), Some(BackendMode::Local));
        assert!(store.has_message((2024, 2, 15)));
        assert!(
            !store.has_message((2020, 0, 1)),
            "entries already in memory win over the local copy"
        );
        let seen: Vec<StoreEvent> = events.try_iter().collect();
        assert_matches!(seen.first(), Some(StoreEvent::Warning(_)));
        assert!(seen.contains(&StoreEvent::ModeChanged(BackendMode::Local)));

        store.create((2024, 2, 16), &text("offline note"), "u1")?;
        assert_eq!(remote.document_count("calendar"), 1);
        let persisted = decode_blob(&kv.get(CALENDAR_DATA_KEY)?.expect("persisted"))?;
        assert_eq!(persisted.len(), 2);

        assert_eq!(store.process_remote_events()?, 0);
        assert_eq!(store.mode(), Some(BackendMode::Local));
        Ok(())
    }

    #[test]
    fn shutdown_stops_remote_updates() -> anyhow::Result<()> {
        let remote = MemoryRemote::new();
        let mut alice = remote_store(&remote);
        let mut bob = remote_store(&remote);

        bob.shutdown();
        alice.create((2024, 2, 15), &text("hello"), "alice")?;
        assert_eq!(bob.process_remote_events()?, 0);
        assert!(!bob.has_message((2024, 2, 15)));
        assert_eq!(remote.subscriber_count(), 1);
        Ok(())
    }

    #[test]
    fn malformed_documents_are_skipped() -> anyhow::Result<()> {
        let remote = MemoryRemote::new();
        let mut store = remote_store(&remote);
        let calendar = CollectionRef::new("calendar");
        remote.set_doc(&DocRef::new(&calendar, "not-a-day"), &json!({"message": "x"}))?;
        remote.set_doc(&DocRef::new(&calendar, "2024-03-15"), &json!({"message": 7}))?;
        remote.set_doc(
            &DocRef::new(&calendar, "2024-03-16"),
            &json!({"message": "ok", "timestamp": "2024-03-16T08:00:00Z", "userId": "u1"}),
        )?;

        assert_eq!(store.process_remote_events()?, 1);
        assert_eq!(store.len(), 1);
        assert!(!store.get_message((2024, 2, 16)).expect("valid doc").edited);
        Ok(())
    }

    #[test]
    fn month_listing_uses_date_order() -> anyhow::Result<()> {
        let (_kv, mut store) = local_store();
        store.create((2024, 2, 31), &text("last"), "u1")?;
        store.create((2024, 2, 1), &text("first"), "u1")?;
        store.create((2024, 3, 1), &text("april"), "u1")?;
        store.create((2024, 1, 29), &text("leap"), "u1")?;

        let march: Vec<String> = store
            .entries_in_month(2024, 2)
            .map(|(key, _)| key.to_string())
            .collect();
        assert_eq!(march, ["2024-03-01", "2024-03-31"]);
        Ok(())
    }

    #[test]
    fn month_listing_rolls_over_extreme_months() -> anyhow::Result<()> {
        let (_kv, mut store) = local_store();
        store.create((2024, 2, 15), &text("march"), "u1")?;
        // i32::MAX months past January 2024 lands in August.
        let august = DayKey::from_parts(2024, i32::MAX, 1);
        store.create(august, &text("far future"), "u1")?;

        let listed: Vec<DayKey> = store
            .entries_in_month(2024, i32::MAX)
            .map(|(key, _)| *key)
            .collect();
        assert_eq!(listed, [august]);
        assert_eq!(store.entries_in_month(2024, i32::MIN).count(), 0);
        Ok(())
    }
}
