//! Chat view model

use std::fmt;
use std::sync::Arc;

use duet_core::{ChatMessage, DeliveryState, MessageId, PeerId, PeerProfile};

/// Characters of a message id shown next to a failed message
const SHORT_ID_LEN: usize = 8;

/// Error flag shown to the user; never carries stale-result noise
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFault {
    /// The last conversation fetch failed; the list shown is the last good one
    Fetch(String),
}

impl fmt::Display for SyncFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncFault::Fetch(reason) => write!(f, "could not refresh conversation: {}", reason),
        }
    }
}

/// Immutable snapshot of one conversation, published on every change
#[derive(Debug, Clone)]
pub struct ConversationView {
    pub peer: Option<PeerId>,
    pub profile: Option<PeerProfile>,
    /// Oldest first
    pub messages: Arc<[ChatMessage]>,
    pub loading: bool,
    pub error: Option<SyncFault>,
}

impl Default for ConversationView {
    fn default() -> Self {
        Self {
            peer: None,
            profile: None,
            messages: Arc::from(Vec::new()),
            loading: false,
            error: None,
        }
    }
}

impl ConversationView {
    /// Messages in display order
    pub fn newest_first(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.delivery == DeliveryState::Pending)
            .count()
    }

    /// Display name of the peer, falling back to its id before the first fetch
    pub fn peer_name(&self) -> String {
        match (&self.profile, &self.peer) {
            (Some(profile), _) => profile.name.clone(),
            (None, Some(peer)) => peer.to_string(),
            (None, None) => String::new(),
        }
    }

    /// Failed message whose id starts with `prefix`, if exactly one matches
    pub fn find_failed(&self, prefix: &str) -> Option<MessageId> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return None;
        }
        let mut matches = self
            .messages
            .iter()
            .filter(|m| m.delivery == DeliveryState::Failed && m.id.as_str().starts_with(prefix));
        let first = matches.next()?;
        matches.next().is_none().then(|| first.id.clone())
    }
}

fn short_id(id: &MessageId) -> &str {
    let id = id.as_str();
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Terminal transcript, oldest message at the top
pub fn render_lines(view: &ConversationView) -> Vec<String> {
    let mut lines = Vec::with_capacity(view.len() + 3);

    let status = match &view.profile {
        Some(p) if p.is_live => " (online)",
        _ => "",
    };
    lines.push(format!("== {}{} ==", view.peer_name(), status));

    if view.is_empty() {
        if view.loading {
            lines.push("loading...".to_string());
        } else {
            lines.push("No messages yet. Say hi!".to_string());
        }
    }

    let peer_name = view.peer_name();
    for msg in view.messages.iter() {
        let who = if msg.sender_is_local_user {
            "me"
        } else {
            peer_name.as_str()
        };
        let marker = match msg.delivery {
            DeliveryState::Confirmed => String::new(),
            DeliveryState::Pending => " (sending)".to_string(),
            DeliveryState::Failed => format!(" (failed, /retry {})", short_id(&msg.id)),
        };
        lines.push(format!(
            "[{}] {}: {}{}",
            msg.format_timestamp(),
            who,
            msg.text,
            marker
        ));
    }

    if let Some(error) = &view.error {
        lines.push(format!("! {}", error));
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn view(messages: Vec<ChatMessage>) -> ConversationView {
        ConversationView {
            peer: Some(PeerId::new("u2")),
            profile: Some(PeerProfile {
                is_live: true,
                ..PeerProfile::new("u2", "Bob")
            }),
            messages: Arc::from(messages),
            loading: false,
            error: None,
        }
    }

    fn at(h: u32, m: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_render_transcript() {
        let mut failed = ChatMessage::pending("did this send?");
        failed.id = MessageId::new("0123456789abcdef");
        failed.created_at = at(9, 3);
        failed.delivery = DeliveryState::Failed;

        let mut pending = ChatMessage::pending("on its way");
        pending.created_at = at(9, 4);

        let v = view(vec![
            ChatMessage::confirmed("m1", "hey", false, at(9, 0)),
            ChatMessage::confirmed("m2", "hello", true, at(9, 1)),
            failed,
            pending,
        ]);

        assert_eq!(
            render_lines(&v),
            vec![
                "== Bob (online) ==",
                "[09:00] Bob: hey",
                "[09:01] me: hello",
                "[09:03] me: did this send? (failed, /retry 01234567)",
                "[09:04] me: on its way (sending)",
            ]
        );
        assert_eq!(v.pending_count(), 1);
    }

    #[test]
    fn test_render_loading_and_error() {
        let mut v = ConversationView {
            peer: Some(PeerId::new("u7")),
            loading: true,
            ..Default::default()
        };
        assert_eq!(render_lines(&v), vec!["== u7 ==", "loading..."]);

        v.loading = false;
        v.error = Some(SyncFault::Fetch("timed out".into()));
        assert_eq!(
            render_lines(&v),
            vec![
                "== u7 ==",
                "No messages yet. Say hi!",
                "! could not refresh conversation: timed out",
            ]
        );
    }

    #[test]
    fn test_newest_first() {
        let v = view(vec![
            ChatMessage::confirmed("m1", "a", false, at(1, 0)),
            ChatMessage::confirmed("m2", "b", false, at(2, 0)),
        ]);
        let ids: Vec<_> = v.newest_first().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }

    #[test]
    fn test_find_failed_by_prefix() {
        let mut a = ChatMessage::pending("a");
        a.id = MessageId::new("abc111");
        a.delivery = DeliveryState::Failed;
        let mut b = ChatMessage::pending("b");
        b.id = MessageId::new("abc222");
        b.delivery = DeliveryState::Failed;
        let mut c = ChatMessage::pending("c");
        c.id = MessageId::new("ffff");

        let v = view(vec![a, b, c]);
        assert_eq!(v.find_failed("abc1"), Some(MessageId::new("abc111")));
        assert_eq!(v.find_failed("abc"), None);
        assert_eq!(v.find_failed("ffff"), None);
        assert_eq!(v.find_failed(""), None);
    }
}
