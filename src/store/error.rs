use thiserror::Error;

use crate::calendar::DayKey;
use crate::remote::RemoteError;
use crate::storage::KvError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{key} already has a message")]
    AlreadyFilled { key: DayKey },
    #[error("no message found for {key}")]
    NotFound { key: DayKey },
    #[error("only the author can change the message for {key}")]
    Forbidden { key: DayKey },
    #[error("remote backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("local storage is full ({needed} bytes needed, {limit} allowed)")]
    StorageQuotaExceeded { needed: usize, limit: usize },
    #[error("remote connection lost: {0}")]
    StreamDisconnected(String),
    #[error("remote backend call failed")]
    Remote(#[from] RemoteError),
    #[error("local storage failure")]
    Storage(#[source] KvError),
    #[error("calendar data could not be encoded")]
    Encode(#[from] serde_json::Error),
}

impl From<KvError> for StoreError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::QuotaExceeded { needed, limit, .. } => {
                StoreError::StorageQuotaExceeded { needed, limit }
            }
            other => StoreError::Storage(other),
        }
    }
}
