//! Visible message list of one open conversation.

use chrono::{DateTime, Utc};

use crate::protocol::ChatMessage;

/// Messages of one conversation ordered by `sent_at`, unique by id.
///
/// Messages without a timestamp sort after every timestamped one, in
/// arrival order.
#[derive(Debug, Clone)]
pub struct ChatTimeline {
    conversation_id: String,
    current_user_id: Option<String>,
    messages: Vec<ChatMessage>,
}

impl ChatTimeline {
    /// Empty timeline for one conversation.
    pub fn new(conversation_id: impl Into<String>, current_user_id: Option<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            current_user_id,
            messages: Vec::new(),
        }
    }

    /// Conversation this timeline shows.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Messages oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of messages held.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing has been loaded or received.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether `message` was sent by the signed-in user.
    pub fn is_own(&self, message: &ChatMessage) -> bool {
        self.current_user_id.as_deref() == Some(message.sender_id.as_str())
    }

    /// Timestamp of the oldest loaded message; the `before` cursor for the
    /// next page.
    pub fn oldest_sent_at(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().find_map(|m| m.sent_at)
    }

    /// Merge a page fetched over REST. Returns how many were new.
    pub fn load_page(&mut self, page: Vec<ChatMessage>) -> usize {
        let mut added = 0;
        for message in page {
            if message.conversation_id == self.conversation_id && self.insert(message) {
                added += 1;
            }
        }
        added
    }

    /// Add a message the current user just sent (REST response).
    pub fn push_local(&mut self, message: ChatMessage) -> bool {
        self.insert(message)
    }

    /// Add a message pushed by the hub.
    ///
    /// Ignored when it belongs to another conversation or was sent by the
    /// current user (the local copy is already shown).
    pub fn push_remote(&mut self, message: ChatMessage) -> bool {
        if message.conversation_id != self.conversation_id || self.is_own(&message) {
            return false;
        }
        self.insert(message)
    }

    /// Flag a message as read. Returns `false` when it is not loaded.
    pub fn mark_read(&mut self, message_id: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.is_read = true;
                true
            }
            None => false,
        }
    }

    /// Unread messages from other participants.
    pub fn unread(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages
            .iter()
            .filter(|m| !m.is_read && !self.is_own(m))
    }

    fn insert(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        let position = match message.sent_at {
            Some(sent_at) => self
                .messages
                .partition_point(|m| m.sent_at.is_some_and(|existing| existing <= sent_at)),
            None => self.messages.len(),
        };
        self.messages.insert(position, message);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(id: &str, conversation: &str, sender: &str, minute: u32) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            conversation_id: conversation.into(),
            sender_id: sender.into(),
            sender_name: None,
            content: String::new(),
            sent_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap()),
            is_read: false,
            is_deleted: false,
        }
    }

    fn ids(timeline: &ChatTimeline) -> Vec<&str> {
        timeline.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_local_send_then_echo_appears_once() {
        let mut timeline = ChatTimeline::new("c1", Some("me".into()));
        assert!(timeline.push_local(message("m1", "c1", "me", 0)));

        let mut echo = message("m1", "c1", "me", 0);
        echo.sender_id = "relay".into();
        assert!(!timeline.push_remote(echo));

        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_remote_filters() {
        let mut timeline = ChatTimeline::new("c1", Some("me".into()));

        assert!(!timeline.push_remote(message("m1", "other", "dispatch", 0)));
        assert!(!timeline.push_remote(message("m2", "c1", "me", 1)));
        assert!(timeline.push_remote(message("m3", "c1", "dispatch", 2)));
        assert!(!timeline.push_remote(message("m3", "c1", "dispatch", 2)));

        assert_eq!(ids(&timeline), vec!["m3"]);
    }

    #[test]
    fn test_ordered_by_sent_at() {
        let mut timeline = ChatTimeline::new("c1", None);
        timeline.push_remote(message("b", "c1", "x", 10));
        timeline.push_remote(message("a", "c1", "x", 5));
        timeline.push_remote(message("c", "c1", "x", 20));

        let mut untimed = message("d", "c1", "x", 0);
        untimed.sent_at = None;
        timeline.push_remote(untimed);

        assert_eq!(ids(&timeline), vec!["a", "b", "c", "d"]);
        assert_eq!(timeline.oldest_sent_at(), timeline.messages()[0].sent_at);
    }

    #[test]
    fn test_load_page_merges_older_messages() {
        let mut timeline = ChatTimeline::new("c1", None);
        timeline.push_remote(message("m20", "c1", "x", 20));

        let added = timeline.load_page(vec![
            message("m10", "c1", "x", 10),
            message("m20", "c1", "x", 20),
            message("stray", "c2", "x", 1),
        ]);

        assert_eq!(added, 1);
        assert_eq!(ids(&timeline), vec!["m10", "m20"]);
    }

    #[test]
    fn test_mark_read() {
        let mut timeline = ChatTimeline::new("c1", Some("me".into()));
        timeline.push_remote(message("m1", "c1", "dispatch", 0));
        timeline.push_local(message("m2", "c1", "me", 1));

        assert_eq!(timeline.unread().count(), 1);
        assert!(timeline.mark_read("m1"));
        assert!(!timeline.mark_read("missing"));
        assert_eq!(timeline.unread().count(), 0);
    }
}
