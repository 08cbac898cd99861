//! Collaborator interfaces consumed by conversation controllers
//!
//! `ChatClient` implements both traits over the wire; tests substitute
//! scripted fakes.

use std::future::Future;

use duet_core::{ConversationSnapshot, ConversationSummary, PeerId, SendAck};
use tokio::sync::mpsc;

use crate::error::Result;

/// Remote conversation API
pub trait ConversationApi: Send + Sync + 'static {
    /// Profile and full message list of the conversation with `peer`
    fn fetch_conversation(
        &self,
        peer: &PeerId,
    ) -> impl Future<Output = Result<ConversationSnapshot>> + Send;

    fn send_message(&self, peer: &PeerId, text: &str) -> impl Future<Output = Result<SendAck>> + Send;

    /// Every conversation of the local user
    fn chat_list(&self) -> impl Future<Output = Result<Vec<ConversationSummary>>> + Send;
}

/// Source of "conversation changed" notifications
pub trait NotificationSource: Send + Sync + 'static {
    fn subscribe(&self, peer: &PeerId) -> impl Future<Output = Result<Subscription>> + Send;
}

/// Handle to an open notification subscription
///
/// Each item is an opaque "re-fetch now" signal. Dropping the handle
/// unsubscribes.
pub struct Subscription {
    signals: mpsc::Receiver<()>,
    on_cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(signals: mpsc::Receiver<()>, on_cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            signals,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// Wait for the next signal; `None` once the source is gone
    pub async fn next(&mut self) -> Option<()> {
        self.signals.recv().await
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
