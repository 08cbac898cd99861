//! Message model for one-to-one chat

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque message identifier
///
/// Server-assigned ids and locally generated ids share this type; the
/// merge only ever compares them for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for an optimistic local send
    pub fn local() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Delivery state of a message as seen by the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Sent optimistically, not yet seen in a server fetch
    Pending,
    /// Present in the server's conversation
    #[default]
    Confirmed,
    /// The send request was rejected; can be retried
    Failed,
}

impl DeliveryState {
    pub fn is_confirmed(self) -> bool {
        self == DeliveryState::Confirmed
    }
}

/// A chat message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub text: String,
    pub sender_is_local_user: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery: DeliveryState,
}

impl ChatMessage {
    /// Optimistic message from the local user
    pub fn pending(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::local(),
            text: text.into(),
            sender_is_local_user: true,
            created_at: Utc::now(),
            delivery: DeliveryState::Pending,
        }
    }

    /// Message as reported by the server
    pub fn confirmed(
        id: impl Into<MessageId>,
        text: impl Into<String>,
        sender_is_local_user: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            sender_is_local_user,
            created_at,
            delivery: DeliveryState::Confirmed,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.delivery.is_confirmed()
    }

    pub fn format_timestamp(&self) -> String {
        self.created_at.format("%H:%M").to_string()
    }

    pub fn format_date(&self) -> String {
        self.created_at.format("%Y-%m-%d").to_string()
    }
}
