//! Network protocol message types
//!
//! All envelopes are JSON-serialized and length-prefixed on the wire.

use chrono::{DateTime, Utc};
use duet_core::{ChatMessage, ConversationSummary, MessageId, PeerId, PeerProfile};
use serde::{Deserialize, Serialize};

/// A chat message as sent by the host
///
/// `is_sender` is relative to the user who made the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: MessageId,
    pub text: String,
    pub is_sender: bool,
    pub created_at: DateTime<Utc>,
}

impl From<WireMessage> for ChatMessage {
    fn from(msg: WireMessage) -> Self {
        ChatMessage::confirmed(msg.id, msg.text, msg.is_sender, msg.created_at)
    }
}

/// Client requests, answered by a `Response` with the same request id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Request {
    /// All conversations of the authenticated user
    ChatList,
    /// Profile and messages of the conversation with a peer
    ChatDetails { peer_id: PeerId },
    SendMessage { receiver: PeerId, text: String },
    /// Start receiving `Changed` for the conversation with a peer
    Subscribe { peer_id: PeerId },
    Unsubscribe { peer_id: PeerId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Response {
    ChatList {
        conversations: Vec<ConversationSummary>,
    },
    ChatDetails {
        user: PeerProfile,
        messages: Vec<WireMessage>,
    },
    MessageSent {
        message_id: MessageId,
        created_at: DateTime<Utc>,
    },
    Subscribed,
    Unsubscribed,
    Error {
        reason: String,
    },
}

/// Network protocol envelopes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Client authenticates with its bearer token
    Hello { token: String },

    /// Server accepts the token
    Welcome { user: PeerProfile },

    /// Server rejects the token
    Rejected { reason: String },

    Request { request_id: u64, body: Request },

    Response { request_id: u64, body: Response },

    /// The conversation with `peer_id` may have changed
    Changed { peer_id: PeerId },

    /// Ping to keep connection alive
    Ping,

    /// Pong response to ping
    Pong,

    /// Server is shutting down
    ServerShutdown,
}

impl Envelope {
    /// Serialize envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
