//! Duplicate-message suppression.
//!
//! A SHA-256 over (session, trimmed content, sender, kind) is remembered
//! for a rolling window; a repeat within the window is rejected. Two
//! different senders posting identical text are deliberately *not*
//! deduplicated — the guard exists to stop accidental double-submits, not
//! to police content. Entries are swept by a background timer, never from
//! the send path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::error::{ChatError, Result};
use crate::message::MessageKind;

/// Rolling-window duplicate suppressor.
pub struct MessageDedupe {
    window: Duration,
    seen: Mutex<HashMap<[u8; 32], Instant>>,
}

impl MessageDedupe {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Fail if an identical message is still inside the window. The error
    /// carries the window's remaining lifetime. Read-only: the message is
    /// only recorded by [`Self::remember`], after it has actually been
    /// persisted — a send that dies in storage must not poison the window
    /// against its own retry.
    pub fn probe(
        &self,
        session_id: i64,
        content: &str,
        sender_key: &str,
        kind: MessageKind,
    ) -> Result<()> {
        let hash = message_hash(session_id, content, sender_key, kind);
        let now = Instant::now();

        let seen = self.lock()?;
        if let Some(&first_seen) = seen.get(&hash) {
            let age = now.duration_since(first_seen);
            if age < self.window {
                return Err(ChatError::DuplicateMessage {
                    retry_after: self.window - age,
                });
            }
        }
        Ok(())
    }

    /// Start (or restart) the suppression window for a persisted message.
    pub fn remember(&self, session_id: i64, content: &str, sender_key: &str, kind: MessageKind) {
        let hash = message_hash(session_id, content, sender_key, kind);
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(hash, Instant::now());
        }
    }

    /// Drop entries whose window has expired.
    pub fn sweep(&self) {
        let now = Instant::now();
        if let Ok(mut seen) = self.seen.lock() {
            seen.retain(|_, &mut first_seen| now.duration_since(first_seen) < self.window);
        }
    }

    /// Number of remembered hashes (observability).
    #[must_use]
    pub fn tracked_hashes(&self) -> usize {
        self.seen.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<[u8; 32], Instant>>> {
        self.seen
            .lock()
            .map_err(|_| ChatError::Channel("dedupe mutex poisoned".to_owned()))
    }
}

fn message_hash(session_id: i64, content: &str, sender_key: &str, kind: MessageKind) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(session_id.to_le_bytes());
    hasher.update([0]);
    hasher.update(content.trim().as_bytes());
    hasher.update([0]);
    hasher.update(sender_key.as_bytes());
    hasher.update([0]);
    hasher.update(crate::message::display_message_kind(kind).as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn repeat_within_window_is_rejected() {
        let dedupe = MessageDedupe::new(Duration::from_secs(300));
        dedupe.probe(1, "hello", "u-1", MessageKind::Player).unwrap();
        dedupe.remember(1, "hello", "u-1", MessageKind::Player);

        let err = dedupe
            .probe(1, "hello", "u-1", MessageKind::Player)
            .unwrap_err();
        assert!(matches!(err, ChatError::DuplicateMessage { .. }));
    }

    #[test]
    fn probe_alone_records_nothing() {
        let dedupe = MessageDedupe::new(Duration::from_secs(300));
        dedupe.probe(1, "hello", "u-1", MessageKind::Player).unwrap();
        dedupe.probe(1, "hello", "u-1", MessageKind::Player).unwrap();
        assert_eq!(dedupe.tracked_hashes(), 0);
    }

    #[test]
    fn whitespace_only_differences_still_collide() {
        let dedupe = MessageDedupe::new(Duration::from_secs(300));
        dedupe.remember(1, "hello", "u-1", MessageKind::Player);
        assert!(
            dedupe
                .probe(1, "  hello  ", "u-1", MessageKind::Player)
                .is_err()
        );
    }

    #[test]
    fn different_sender_session_or_kind_is_not_a_duplicate() {
        let dedupe = MessageDedupe::new(Duration::from_secs(300));
        dedupe.remember(1, "hello", "u-1", MessageKind::Player);

        dedupe.probe(1, "hello", "u-2", MessageKind::Player).unwrap();
        dedupe.probe(2, "hello", "u-1", MessageKind::Player).unwrap();
        dedupe
            .probe(1, "hello", "u-1", MessageKind::Narrator)
            .unwrap();
    }

    #[test]
    fn repeat_after_window_expiry_succeeds() {
        let dedupe = MessageDedupe::new(Duration::from_millis(20));
        dedupe.remember(1, "hello", "u-1", MessageKind::Player);
        std::thread::sleep(Duration::from_millis(30));
        dedupe.probe(1, "hello", "u-1", MessageKind::Player).unwrap();
    }

    #[test]
    fn sweep_drops_expired_hashes() {
        let dedupe = MessageDedupe::new(Duration::from_millis(10));
        dedupe.remember(1, "hello", "u-1", MessageKind::Player);
        assert_eq!(dedupe.tracked_hashes(), 1);

        std::thread::sleep(Duration::from_millis(20));
        dedupe.sweep();
        assert_eq!(dedupe.tracked_hashes(), 0);
    }
}
