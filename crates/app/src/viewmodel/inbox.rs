//! Inbox (chat list) view model

use duet_core::ConversationSummary;

const NAME_WIDTH: usize = 16;
const PREVIEW_LEN: usize = 48;

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > PREVIEW_LEN || line.len() < text.len() {
        let cut: String = line.chars().take(PREVIEW_LEN).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

/// One line per conversation, most recent first as delivered by the host
pub fn render_inbox(conversations: &[ConversationSummary]) -> Vec<String> {
    if conversations.is_empty() {
        return vec!["No conversations yet".to_string()];
    }

    conversations
        .iter()
        .map(|c| {
            let live = if c.peer.is_live { "*" } else { " " };
            let when = c
                .last_message_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            let last = c.last_message.as_deref().map(preview).unwrap_or_default();
            format!(
                "{}{:<width$} {:<8} {:<16} {}",
                live,
                c.peer.name,
                c.peer.id,
                when,
                last,
                width = NAME_WIDTH
            )
            .trim_end()
            .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use duet_core::PeerProfile;

    #[test]
    fn test_empty_inbox() {
        assert_eq!(render_inbox(&[]), vec!["No conversations yet"]);
    }

    #[test]
    fn test_inbox_rows() {
        let rows = render_inbox(&[
            ConversationSummary {
                peer: PeerProfile {
                    is_live: true,
                    ..PeerProfile::new("u2", "Bob")
                },
                last_message: Some("see you\nat eight".into()),
                last_message_at: Some(Utc.with_ymd_and_hms(2024, 6, 1, 20, 15, 0).unwrap()),
            },
            ConversationSummary {
                peer: PeerProfile::new("u3", "Carol"),
                last_message: None,
                last_message_at: None,
            },
        ]);

        assert_eq!(
            rows,
            vec![
                "*Bob              u2       2024-06-01 20:15 see you...",
                " Carol            u3",
            ]
        );
    }

    #[test]
    fn test_long_preview_truncated() {
        let long = "x".repeat(100);
        assert_eq!(preview(&long).chars().count(), PREVIEW_LEN + 3);
        assert_eq!(preview("short"), "short");
    }
}
