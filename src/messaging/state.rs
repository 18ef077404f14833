//! Client-side conversation cache: unread counters and last messages.
//!
//! Fed by two sources that may overlap: REST snapshots of the
//! conversation list and hub pushes. Message ids make the overlap
//! harmless; each conversation remembers only its most recent ids.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::constants::{EVENT_CHANNEL_CAPACITY, SEEN_MESSAGES_PER_CONVERSATION};
use crate::protocol::ChatMessage;

/// One row of the conversation list as returned by the REST layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Conversation id.
    pub id: String,
    /// Unread count as the server sees it.
    #[serde(default)]
    pub unread_count: u32,
    /// Newest message, if any.
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
}

/// Bounded set of message ids, oldest evicted first.
#[derive(Debug, Default)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    /// Returns `false` when `id` is already remembered.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_MESSAGES_PER_CONVERSATION {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_owned());
        self.ids.insert(id.to_owned());
        true
    }
}

#[derive(Debug, Default)]
struct Conversation {
    unread: u32,
    last_message: Option<ChatMessage>,
    seen: SeenIds,
}

#[derive(Debug, Default)]
struct StateInner {
    conversations: HashMap<String, Conversation>,
}

impl StateInner {
    fn total_unread(&self) -> u32 {
        self.conversations.values().map(|c| c.unread).sum()
    }
}

/// Unread counts and last message per conversation.
#[derive(Debug)]
pub struct ConversationState {
    current_user_id: Option<String>,
    inner: Mutex<StateInner>,
    total_unread: watch::Sender<u32>,
    updated: broadcast::Sender<String>,
}

impl ConversationState {
    /// Empty cache for the signed-in user.
    pub fn new(current_user_id: Option<String>) -> Self {
        let (total_unread, _) = watch::channel(0);
        let (updated, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            current_user_id,
            inner: Mutex::new(StateInner::default()),
            total_unread,
            updated,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total unread across all conversations.
    pub fn total_unread(&self) -> u32 {
        *self.total_unread.borrow()
    }

    /// Observe the total unread count (badge).
    pub fn subscribe_total_unread(&self) -> watch::Receiver<u32> {
        self.total_unread.subscribe()
    }

    /// Ids of conversations whose row changed.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<String> {
        self.updated.subscribe()
    }

    /// Unread count for one conversation.
    pub fn unread_count(&self, conversation_id: &str) -> u32 {
        self.lock()
            .conversations
            .get(conversation_id)
            .map_or(0, |c| c.unread)
    }

    /// Latest known message of one conversation.
    pub fn last_message(&self, conversation_id: &str) -> Option<ChatMessage> {
        self.lock()
            .conversations
            .get(conversation_id)
            .and_then(|c| c.last_message.clone())
    }

    /// Replace the cache with a REST snapshot of the conversation list.
    ///
    /// The snapshot is authoritative for unread counts. Last messages
    /// still only move forward in time.
    pub fn apply_conversations(&self, snapshot: Vec<ConversationSummary>) {
        let total = {
            let mut inner = self.lock();
            let mut previous = std::mem::take(&mut inner.conversations);

            for summary in snapshot {
                let mut conversation = previous.remove(&summary.id).unwrap_or_default();
                conversation.unread = summary.unread_count;
                if let Some(message) = summary.last_message {
                    conversation.seen.insert(&message.id);
                    advance_last_message(&mut conversation.last_message, message);
                }
                inner.conversations.insert(summary.id, conversation);
            }
            inner.total_unread()
        };
        self.publish_total(total);
    }

    /// Record a pushed message.
    ///
    /// Returns `false` for a message id already seen. Messages sent by the
    /// current user update the last message but never the unread count.
    pub fn record_incoming(&self, message: ChatMessage) -> bool {
        let conversation_id = message.conversation_id.clone();
        let own = self.current_user_id.as_deref() == Some(message.sender_id.as_str());

        let total = {
            let mut inner = self.lock();
            let conversation = inner
                .conversations
                .entry(conversation_id.clone())
                .or_default();
            if !conversation.seen.insert(&message.id) {
                log::trace!("[Messaging] Duplicate message {} ignored", message.id);
                return false;
            }
            if !own && !message.is_read {
                conversation.unread += 1;
            }
            advance_last_message(&mut conversation.last_message, message);
            inner.total_unread()
        };

        self.publish_total(total);
        self.notify_updated(conversation_id);
        true
    }

    /// One message of the conversation was read by the current user.
    pub fn mark_read(&self, conversation_id: &str) {
        let total = {
            let mut inner = self.lock();
            let Some(conversation) = inner.conversations.get_mut(conversation_id) else {
                return;
            };
            conversation.unread = conversation.unread.saturating_sub(1);
            inner.total_unread()
        };
        self.publish_total(total);
        self.notify_updated(conversation_id.to_string());
    }

    /// Every message of the conversation was read.
    pub fn mark_conversation_read(&self, conversation_id: &str) {
        let total = {
            let mut inner = self.lock();
            let Some(conversation) = inner.conversations.get_mut(conversation_id) else {
                return;
            };
            conversation.unread = 0;
            inner.total_unread()
        };
        self.publish_total(total);
        self.notify_updated(conversation_id.to_string());
    }

    /// Feed the cache from a message stream until the stream closes.
    pub fn follow(self: &Arc<Self>, mut messages: broadcast::Receiver<ChatMessage>) -> JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => {
                        state.record_incoming(message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("[Messaging] Conversation cache lagged by {skipped} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn publish_total(&self, total: u32) {
        self.total_unread.send_if_modified(|current| {
            if *current == total {
                return false;
            }
            *current = total;
            true
        });
    }

    fn notify_updated(&self, conversation_id: String) {
        if self.updated.send(conversation_id).is_err() {
            log::trace!("[Messaging] No conversation subscribers");
        }
    }
}

/// Replace `current` only when `candidate` is not older.
///
/// A message without a timestamp never displaces one that has one.
fn advance_last_message(current: &mut Option<ChatMessage>, candidate: ChatMessage) {
    let newer = match (current.as_ref().and_then(|m| m.sent_at), candidate.sent_at) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(existing), Some(incoming)) => incoming >= existing,
    };
    if newer {
        *current = Some(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, conversation: &str, sender: &str, minute: u32) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            conversation_id: conversation.into(),
            sender_id: sender.into(),
            sender_name: None,
            content: format!("message {id}"),
            sent_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 8, minute, 0).unwrap()),
            is_read: false,
            is_deleted: false,
        }
    }

    fn state() -> ConversationState {
        ConversationState::new(Some("me".into()))
    }

    #[test]
    fn test_incoming_messages_count_unread() {
        let state = state();
        assert!(state.record_incoming(message("m1", "c1", "dispatch", 0)));
        assert!(state.record_incoming(message("m2", "c2", "dispatch", 1)));

        assert_eq!(state.unread_count("c1"), 1);
        assert_eq!(state.total_unread(), 2);
    }

    #[test]
    fn test_duplicate_message_counted_once() {
        let state = state();
        assert!(state.record_incoming(message("m1", "c1", "dispatch", 0)));
        assert!(!state.record_incoming(message("m1", "c1", "dispatch", 0)));

        assert_eq!(state.total_unread(), 1);
    }

    #[test]
    fn test_seen_ids_are_bounded_per_conversation() {
        let state = state();
        for n in 0..=SEEN_MESSAGES_PER_CONVERSATION {
            assert!(state.record_incoming(message(&format!("m{n}"), "c1", "me", 0)));
        }
        assert_eq!(
            state.lock().conversations["c1"].seen.ids.len(),
            SEEN_MESSAGES_PER_CONVERSATION
        );

        // Recent ids still dedup; the oldest has been forgotten.
        let newest = format!("m{SEEN_MESSAGES_PER_CONVERSATION}");
        assert!(!state.record_incoming(message(&newest, "c1", "me", 0)));
        assert!(state.record_incoming(message("m0", "c1", "me", 0)));

        // Other conversations keep their own window.
        assert!(state.record_incoming(message("m1", "c2", "me", 0)));
    }

    #[test]
    fn test_own_message_never_unread() {
        let state = state();
        state.record_incoming(message("m1", "c1", "me", 0));

        assert_eq!(state.total_unread(), 0);
        assert_eq!(state.last_message("c1").unwrap().id, "m1");
    }

    #[test]
    fn test_last_message_is_monotonic() {
        let state = state();
        state.record_incoming(message("late", "c1", "dispatch", 30));
        state.record_incoming(message("early", "c1", "dispatch", 5));

        assert_eq!(state.last_message("c1").unwrap().id, "late");
    }

    #[test]
    fn test_snapshot_is_authoritative_for_unread() {
        let state = state();
        state.record_incoming(message("m1", "c1", "dispatch", 0));
        state.apply_conversations(vec![
            ConversationSummary {
                id: "c1".into(),
                unread_count: 4,
                last_message: None,
            },
            ConversationSummary {
                id: "c3".into(),
                unread_count: 2,
                last_message: Some(message("m7", "c3", "dispatch", 10)),
            },
        ]);

        assert_eq!(state.unread_count("c1"), 4);
        assert_eq!(state.total_unread(), 6);
        assert_eq!(state.last_message("c1").unwrap().id, "m1");

        // Already part of the snapshot.
        assert!(!state.record_incoming(message("m7", "c3", "dispatch", 10)));
        assert_eq!(state.total_unread(), 6);
    }

    #[test]
    fn test_mark_read_decrements_and_saturates() {
        let state = state();
        state.record_incoming(message("m1", "c1", "dispatch", 0));
        state.mark_read("c1");
        state.mark_read("c1");
        state.mark_read("unknown");

        assert_eq!(state.unread_count("c1"), 0);
        assert_eq!(state.total_unread(), 0);
    }

    #[test]
    fn test_mark_conversation_read_clears_count() {
        let state = state();
        state.record_incoming(message("m1", "c1", "dispatch", 0));
        state.record_incoming(message("m2", "c1", "dispatch", 1));
        state.mark_conversation_read("c1");

        assert_eq!(state.total_unread(), 0);
    }

    #[test]
    fn test_updates_are_broadcast() {
        let state = state();
        let mut updates = state.subscribe_updates();
        let mut badge = state.subscribe_total_unread();

        state.record_incoming(message("m1", "c9", "dispatch", 0));

        assert_eq!(updates.try_recv().unwrap(), "c9");
        assert!(badge.has_changed().unwrap());
        assert_eq!(*badge.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn test_follow_consumes_stream() {
        let state = Arc::new(state());
        let (tx, rx) = broadcast::channel(8);
        let task = state.follow(rx);

        tx.send(message("m1", "c1", "dispatch", 0)).unwrap();
        tx.send(message("m1", "c1", "dispatch", 0)).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(state.total_unread(), 1);
    }
}
