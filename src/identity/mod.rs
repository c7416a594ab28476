use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::storage::{KeyValueStore, KvError};

pub const USER_ID_KEY: &str = "user-id";

pub trait IdentityProvider: Send + Sync {
    fn identity_token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(Option<String>);

impl StaticIdentity {
    pub fn signed_in(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn identity_token(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionIdentity {
    token: Arc<OnceCell<String>>,
}

impl SessionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self, token: impl Into<String>) -> bool {
        self.token.set(token.into()).is_ok()
    }
}

impl IdentityProvider for SessionIdentity {
    fn identity_token(&self) -> Option<String> {
        self.token.get().cloned()
    }
}

/// Polls `provider` every `poll` until it yields a token or `timeout` passes.
pub fn wait_for_token(
    provider: &dyn IdentityProvider,
    poll: Duration,
    timeout: Duration,
) -> Option<String> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(token) = provider.identity_token() {
            return Some(token);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::sleep(poll.min(deadline - now));
    }
}

/// Returns this installation's user id, minting and persisting one on first use.
pub fn local_user_id(storage: &dyn KeyValueStore) -> Result<String, KvError> {
    if let Some(existing) = storage.get(USER_ID_KEY)? {
        if !existing.trim().is_empty() {
            return Ok(existing);
        }
    }
    let id = format!("user_{}", Uuid::new_v4().simple());
    storage.set(USER_ID_KEY, &id)?;
    tracing::info!(user_id = %id, "generated new local user id");
    Ok(id)
}
