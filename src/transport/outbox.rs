//! Pending-send queue with a switchable live writer.
//!
//! While no session is attached, encoded frames accumulate in FIFO order.
//! `attach` hands the backlog to the new session and installs its writer
//! channel under the same lock, so every frame pushed afterwards lands
//! behind the backlog.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct OutboxInner {
    pending: VecDeque<String>,
    live: Option<mpsc::UnboundedSender<String>>,
}

/// Ordered buffer of encoded frames awaiting a socket.
#[derive(Debug, Default)]
pub struct Outbox {
    inner: Mutex<OutboxInner>,
}

impl Outbox {
    /// Create an empty, detached outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue or forward an encoded frame.
    ///
    /// Returns `true` when the frame went straight to a live session.
    pub fn push(&self, frame: String) -> bool {
        let mut inner = self.lock();
        if let Some(live) = &inner.live {
            match live.send(frame) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(frame)) => {
                    // Session is gone but has not detached yet.
                    inner.live = None;
                    inner.pending.push_back(frame);
                    return false;
                }
            }
        }
        inner.pending.push_back(frame);
        false
    }

    /// Install a live writer and take the backlog.
    ///
    /// The caller must write the returned frames before anything it
    /// receives on the writer channel.
    pub fn attach(&self, live: mpsc::UnboundedSender<String>) -> Vec<String> {
        let mut inner = self.lock();
        inner.live = Some(live);
        inner.pending.drain(..).collect()
    }

    /// Remove the live writer, re-queueing frames the session never wrote.
    ///
    /// `unsent` (backlog the session failed to write) goes first, then
    /// whatever is still sitting in the writer channel, then frames queued
    /// since, so the original order is kept.
    pub fn detach(
        &self,
        unsent: Vec<String>,
        unconsumed: Option<&mut mpsc::UnboundedReceiver<String>>,
    ) {
        let mut inner = self.lock();
        inner.live = None;
        let mut front = unsent;
        if let Some(rx) = unconsumed {
            while let Ok(frame) = rx.try_recv() {
                front.push(frame);
            }
        }
        for frame in front.into_iter().rev() {
            inner.pending.push_front(frame);
        }
    }

    /// Drop the live writer and every queued frame.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.live = None;
        inner.pending.clear();
    }

    /// Number of frames waiting for a session.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether a live session is attached.
    pub fn is_attached(&self) -> bool {
        self.lock().live.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutboxInner> {
        // A panic while holding the lock cannot leave the queue half-mutated.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_push_queues_in_order() {
        let outbox = Outbox::new();
        assert!(!outbox.push("a".into()));
        assert!(!outbox.push("b".into()));
        assert_eq!(outbox.pending_len(), 2);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(outbox.attach(tx), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(outbox.pending_len(), 0);
    }

    #[test]
    fn test_attached_push_goes_live_after_backlog() {
        let outbox = Outbox::new();
        outbox.push("queued".into());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let backlog = outbox.attach(tx);
        assert!(outbox.push("live".into()));

        assert_eq!(backlog, vec!["queued".to_string()]);
        assert_eq!(rx.try_recv().unwrap(), "live");
        assert_eq!(outbox.pending_len(), 0);
    }

    #[test]
    fn test_detach_requeues_unconsumed_at_front() {
        let outbox = Outbox::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        outbox.push("first".into());
        outbox.push("second".into());

        outbox.detach(vec!["zeroth".into()], Some(&mut rx));
        outbox.push("third".into());
        assert!(!outbox.is_attached());

        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert_eq!(
            outbox.attach(tx2),
            vec![
                "zeroth".to_string(),
                "first".to_string(),
                "second".to_string(),
                "third".to_string()
            ]
        );
    }

    #[test]
    fn test_push_to_dropped_receiver_falls_back_to_queue() {
        let outbox = Outbox::new();
        let (tx, rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        drop(rx);

        assert!(!outbox.push("kept".into()));
        assert_eq!(outbox.pending_len(), 1);
        assert!(!outbox.is_attached());
    }

    #[test]
    fn test_clear_discards_everything() {
        let outbox = Outbox::new();
        outbox.push("x".into());
        let (tx, _rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        outbox.push("y".into());
        outbox.clear();

        assert_eq!(outbox.pending_len(), 0);
        assert!(!outbox.is_attached());
    }
}
