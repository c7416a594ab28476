use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use unicode_segmentation::UnicodeSegmentation;

use crate::calendar::DayKey;

pub const MAX_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidMessage {
    #[error("message cannot be empty")]
    Empty,
    #[error("message has {length} characters, the limit is {max}")]
    TooLong { length: usize, max: usize },
}

/// Trimmed note text of 1 to [`MAX_MESSAGE_CHARS`] user-perceived characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageText(String);

impl MessageText {
    pub fn parse(raw: &str) -> Result<Self, InvalidMessage> {
        let trimmed = raw.trim();
        let length = trimmed.graphemes(true).count();
        if length == 0 {
            return Err(InvalidMessage::Empty);
        }
        if length > MAX_MESSAGE_CHARS {
            return Err(InvalidMessage::TooLong {
                length,
                max: MAX_MESSAGE_CHARS,
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(rename = "message")]
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "userId")]
    pub author_id: String,
    #[serde(default)]
    pub edited: bool,
}

impl MessageRecord {
    pub fn new(text: &MessageText, author_id: impl Into<String>) -> Self {
        Self {
            text: text.as_str().to_string(),
            timestamp: OffsetDateTime::now_utc(),
            author_id: author_id.into(),
            edited: false,
        }
    }

    pub fn revised(&self, text: &MessageText) -> Self {
        Self {
            text: text.as_str().to_string(),
            timestamp: OffsetDateTime::now_utc(),
            author_id: self.author_id.clone(),
            edited: true,
        }
    }

    pub fn is_authored_by(&self, user_id: &str) -> bool {
        self.author_id == user_id
    }
}

pub type CalendarData = BTreeMap<DayKey, MessageRecord>;

pub fn encode_blob(entries: &CalendarData) -> serde_json::Result<String> {
    serde_json::to_string(entries)
}

pub fn decode_blob(raw: &str) -> serde_json::Result<CalendarData> {
    serde_json::from_str(raw)
}
