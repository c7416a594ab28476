use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;

use crate::calendar::DayKey;
use crate::config::AppConfig;
use crate::identity::{local_user_id, StaticIdentity};
use crate::remote::SharedDirRemote;
use crate::storage::{KeyValueStore, StorageHandle};
use crate::store::{
    BackendMode, DeleteOutcome, MessageRecord, MessageStore, MessageText, StoreEvent,
};

pub mod state;

pub use state::{DayCell, MonthView, Navigation};

pub struct App {
    pub config: Arc<AppConfig>,
    store: MessageStore,
    navigation: Navigation,
    user_id: String,
    events: Receiver<StoreEvent>,
    busy: bool,
}

impl App {
    pub fn new(config: Arc<AppConfig>, storage: StorageHandle) -> Result<Self> {
        let local: Arc<dyn KeyValueStore> = Arc::new(storage);
        let user_id = match &config.user_id {
            Some(id) => id.clone(),
            None => local_user_id(local.as_ref()).context("loading local user id")?,
        };

        let mut store = MessageStore::new(local, config.remote.store_config());
        if config.remote.enabled {
            let root = config
                .remote
                .shared_dir
                .clone()
                .context("remote.enabled is set but remote.shared_dir is not")?;
            tracing::debug!(root = %root.display(), "using shared directory remote");
            store = store.with_remote(
                Arc::new(SharedDirRemote::new(root, config.remote.watch_interval())),
                Arc::new(StaticIdentity::signed_in(user_id.clone())),
            );
        }
        Ok(Self::with_store(config, store, user_id))
    }

    pub fn with_store(config: Arc<AppConfig>, mut store: MessageStore, user_id: String) -> Self {
        let events = store.subscribe();
        let mode = store.initialize();
        tracing::info!(%mode, user = %user_id, "calendar ready");
        Self {
            config,
            store,
            navigation: Navigation::current(),
            user_id,
            events,
            busy: false,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn mode(&self) -> BackendMode {
        self.store.mode().unwrap_or(BackendMode::Local)
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn navigation(&self) -> &Navigation {
        &self.navigation
    }

    pub fn navigation_mut(&mut self) -> &mut Navigation {
        &mut self.navigation
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn month_view(&self) -> MonthView {
        MonthView::build(&self.navigation, &self.store, &self.user_id)
    }

    pub fn message(&self, day: DayKey) -> Option<&MessageRecord> {
        self.store.get_message(day)
    }

    pub fn add(&mut self, day: DayKey, raw: &str) -> Result<DayKey> {
        let text = MessageText::parse(raw)?;
        let key = self.store.create(day, &text, &self.user_id)?;
        Ok(key)
    }

    pub fn edit(&mut self, day: DayKey, raw: &str) -> Result<()> {
        let text = MessageText::parse(raw)?;
        self.store.update(day, &text, &self.user_id)?;
        Ok(())
    }

    pub fn remove<F>(&mut self, day: DayKey, confirm: F) -> Result<DeleteOutcome>
    where
        F: FnOnce(&DayKey, &MessageRecord) -> bool,
    {
        Ok(self.store.delete(day, &self.user_id, confirm)?)
    }

    /// Applies pending remote changes and returns warnings meant for the user.
    pub fn sync(&mut self) -> Vec<String> {
        if let Err(err) = self.store.process_remote_events() {
            tracing::debug!(%err, "remote events stopped");
        }
        let mut warnings = Vec::new();
        for event in self.events.try_iter() {
            match event {
                StoreEvent::Busy(busy) => self.busy = busy,
                StoreEvent::Warning(message) => warnings.push(message),
                StoreEvent::ModeChanged(mode) => tracing::debug!(%mode, "backend mode changed"),
                StoreEvent::Changed => {}
            }
        }
        warnings
    }

    pub fn shutdown(&mut self) {
        self.store.shutdown();
    }
}
