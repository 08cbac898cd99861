//! Duet Network Library
//!
//! Provides the conversation host, its client, and the collaborator
//! traits conversation controllers are written against.
//!
//! # Architecture
//!
//! - **Server**: in-memory conversation host, token authenticated
//! - **Client**: implements `ConversationApi` and `NotificationSource`
//! - **Protocol**: Length-prefixed JSON envelopes
//!
//! # Usage
//!
//! ```ignore
//! let server = ChatServer::start(7440, settings.server.users).await?;
//!
//! let client = ChatClient::connect("127.0.0.1:7440", token, timeout).await?;
//! let mut changes = client.subscribe(&peer).await?;
//! while changes.next().await.is_some() {
//!     let snapshot = client.fetch_conversation(&peer).await?;
//! }
//! ```

pub mod api;
pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;

pub use api::{ConversationApi, NotificationSource, Subscription};
pub use client::ChatClient;
pub use error::{Error, Result};
pub use protocol::{Envelope, Request, Response, WireMessage};
pub use server::ChatServer;
