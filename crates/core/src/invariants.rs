//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use std::collections::HashSet;

use crate::models::{ChatMessage, PeerId};

/// Validate that a conversation sequence is ordered and free of duplicate ids
pub fn assert_sequence_invariants(messages: &[ChatMessage]) {
    if cfg!(debug_assertions) {
        let mut ids = HashSet::with_capacity(messages.len());
        for msg in messages {
            debug_assert!(
                ids.insert(&msg.id),
                "Duplicate message id {} in conversation",
                msg.id
            );
        }
    }

    debug_assert!(
        messages
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at),
        "Conversation sequence is not ordered by created_at"
    );
}

/// Validate that a peer ID is not empty
pub fn assert_peer_id_valid(peer_id: &PeerId, context: &str) {
    debug_assert!(!peer_id.is_empty(), "Empty peer_id in context: {}", context);
}
