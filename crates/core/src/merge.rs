//! Reconciliation of fetched conversations with local state
//!
//! A fetch result is authoritative for every confirmed message. Local
//! messages the server has not echoed back yet (pending or failed sends)
//! survive the merge until a fetched message claims them, either by id or
//! by matching sender, text and a timestamp within the tolerance window.

use std::collections::HashSet;

use chrono::Duration;

use crate::models::{ChatMessage, DeliveryState};

/// Whether `remote` is the server's copy of the unconfirmed `local` message
pub fn reconciles(local: &ChatMessage, remote: &ChatMessage, window: Duration) -> bool {
    if local.id == remote.id {
        return true;
    }
    if !(local.sender_is_local_user && remote.sender_is_local_user) || local.text != remote.text {
        return false;
    }
    let delta = remote.created_at.signed_duration_since(local.created_at);
    delta <= window && -delta <= window
}

/// Merge a fetch result into the current local sequence
///
/// Returns the new sequence, oldest first. Ties on `created_at` keep
/// fetch order ahead of local order.
pub fn merge_fetched(
    local: &[ChatMessage],
    fetched: Vec<ChatMessage>,
    window: Duration,
) -> Vec<ChatMessage> {
    let mut seen = HashSet::with_capacity(fetched.len());
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(fetched.len() + local.len());

    for mut msg in fetched {
        if !seen.insert(msg.id.clone()) {
            continue;
        }
        msg.delivery = DeliveryState::Confirmed;
        merged.push(msg);
    }

    // Each fetched message may absorb at most one local entry. Copies the
    // local sequence already shows as confirmed only ever match by id.
    let confirmed: HashSet<_> = local
        .iter()
        .filter(|m| m.is_confirmed())
        .map(|m| &m.id)
        .collect();
    let mut claimed: Vec<bool> = merged.iter().map(|m| confirmed.contains(&m.id)).collect();
    let mut survivors = Vec::new();

    for unconfirmed in local.iter().filter(|m| !m.is_confirmed()) {
        let by_id = merged.iter().position(|m| m.id == unconfirmed.id);
        let slot = by_id.or_else(|| {
            merged
                .iter()
                .enumerate()
                .position(|(i, m)| !claimed[i] && reconciles(unconfirmed, m, window))
        });

        match slot {
            Some(i) => claimed[i] = true,
            None => survivors.push(unconfirmed.clone()),
        }
    }

    merged.extend(survivors);
    merged.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    use crate::models::MessageId;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn remote(id: &str, text: &str, mine: bool, secs: i64) -> ChatMessage {
        ChatMessage::confirmed(id, text, mine, at(secs))
    }

    fn pending(text: &str, secs: i64) -> ChatMessage {
        let mut msg = ChatMessage::pending(text);
        msg.created_at = at(secs);
        msg
    }

    fn window() -> Duration {
        Duration::seconds(10)
    }

    fn texts(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.text.as_str()).collect()
    }

    #[test]
    fn test_sorts_by_created_at() {
        let fetched = vec![
            remote("a", "ten", false, 10),
            remote("b", "thirty", false, 30),
            remote("c", "twenty", false, 20),
        ];
        let merged = merge_fetched(&[], fetched, window());
        let order: Vec<_> = merged.iter().map(|m| m.created_at).collect();
        assert_eq!(order, vec![at(10), at(20), at(30)]);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let fetched = vec![remote("a", "first", false, 5), remote("b", "second", false, 5)];
        let local = vec![pending("third", 5)];
        let merged = merge_fetched(&local, fetched, Duration::zero());
        assert_eq!(texts(&merged), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_pending_replaced_by_id() {
        let mut local = pending("hi", 0);
        local.id = MessageId::new("m1");
        let merged = merge_fetched(&[local], vec![remote("m1", "hi", true, 100)], window());

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id.as_str(), "m1");
        assert_eq!(merged[0].delivery, DeliveryState::Confirmed);
    }

    #[test]
    fn test_pending_replaced_by_heuristic() {
        let local = vec![pending("hi", 0)];
        let merged = merge_fetched(&local, vec![remote("m1", "hi", true, 3)], window());

        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_confirmed());
    }

    #[test]
    fn test_pending_outside_window_survives() {
        let local = vec![pending("hi", 0)];
        let merged = merge_fetched(&local, vec![remote("m1", "hi", true, 60)], window());

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].delivery, DeliveryState::Pending);
    }

    #[test]
    fn test_peer_message_never_claims_local_send() {
        let local = vec![pending("hi", 0)];
        let merged = merge_fetched(&local, vec![remote("m1", "hi", false, 1)], window());
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_duplicate_sends_claim_distinct_copies() {
        let local = vec![pending("ok", 0), pending("ok", 1)];
        let fetched = vec![remote("m1", "ok", true, 1)];
        let merged = merge_fetched(&local, fetched, window());

        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged.iter().filter(|m| m.delivery == DeliveryState::Pending).count(),
            1
        );

        let fetched = vec![remote("m1", "ok", true, 1), remote("m2", "ok", true, 2)];
        let merged = merge_fetched(&merged, fetched, window());
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|m| m.is_confirmed()));
    }

    #[test]
    fn test_confirmed_copy_never_absorbs_repeat_send() {
        let mut failed = pending("ok", 3);
        failed.delivery = DeliveryState::Failed;
        let local = vec![remote("m1", "ok", true, 0), failed.clone(), pending("ok", 4)];

        let merged = merge_fetched(&local, vec![remote("m1", "ok", true, 0)], window());
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id.as_str(), "m1");
        assert_eq!(merged[1].id, failed.id);
        assert_eq!(merged[1].delivery, DeliveryState::Failed);
        assert_eq!(merged[2].delivery, DeliveryState::Pending);

        // Once the host has both repeats, each claims its own local entry
        let fetched = vec![
            remote("m1", "ok", true, 0),
            remote("m2", "ok", true, 3),
            remote("m3", "ok", true, 4),
        ];
        let merged = merge_fetched(&merged, fetched, window());
        let ids: Vec<_> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert!(merged.iter().all(|m| m.is_confirmed()));
    }

    #[test]
    fn test_failed_send_reconciled_when_server_has_it() {
        let mut local = pending("lost ack", 0);
        local.delivery = DeliveryState::Failed;
        let merged = merge_fetched(&[local], vec![remote("m9", "lost ack", true, 2)], window());

        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_confirmed());
    }

    #[test]
    fn test_fetch_drops_stale_confirmed_messages() {
        let local = vec![remote("old", "gone", false, 1)];
        let merged = merge_fetched(&local, vec![remote("new", "here", false, 2)], window());
        assert_eq!(texts(&merged), vec!["here"]);
    }

    #[test]
    fn test_duplicate_fetched_ids_collapse() {
        let fetched = vec![remote("m1", "a", false, 1), remote("m1", "a", false, 1)];
        let merged = merge_fetched(&[], fetched, window());
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_consecutive_fetches_have_unique_ids() {
        let f1 = vec![remote("m1", "a", false, 1), remote("m2", "b", true, 2)];
        let f2 = vec![
            remote("m1", "a", false, 1),
            remote("m2", "b", true, 2),
            remote("m3", "c", false, 3),
        ];
        let local = merge_fetched(&[pending("b", 2)], f1, window());
        let merged = merge_fetched(&local, f2.clone(), window());

        let ids: HashSet<_> = merged.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids.len(), merged.len());
        for m in &f2 {
            assert!(merged.iter().any(|x| x.id == m.id));
        }
    }
}
