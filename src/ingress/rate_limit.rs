//! Per-sender send-rate guard.
//!
//! Enforces a minimum interval between sends from the same sender key
//! (stable user id, or display name for anonymous senders). State is an
//! explicitly owned map swept on a timer — never evicted from the hot path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{ChatError, Result};

/// Minimum-interval rate limiter keyed by sender.
pub struct SenderRateLimiter {
    min_interval: Duration,
    last_send: Mutex<HashMap<String, Instant>>,
}

impl SenderRateLimiter {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_send: Mutex::new(HashMap::new()),
        }
    }

    /// Record a send for `sender_key`, or fail with the remaining wait.
    pub fn check(&self, sender_key: &str) -> Result<()> {
        let now = Instant::now();
        let mut map = self.lock()?;
        if let Some(&last) = map.get(sender_key) {
            let elapsed = now.duration_since(last);
            if elapsed < self.min_interval {
                return Err(ChatError::RateLimited {
                    retry_after: self.min_interval - elapsed,
                });
            }
        }
        map.insert(sender_key.to_owned(), now);
        Ok(())
    }

    /// Drop entries old enough that they can no longer limit anything.
    pub fn sweep(&self) {
        let now = Instant::now();
        if let Ok(mut map) = self.last_send.lock() {
            map.retain(|_, &mut last| now.duration_since(last) < self.min_interval);
        }
    }

    /// Number of tracked senders (observability).
    #[must_use]
    pub fn tracked_senders(&self) -> usize {
        self.last_send.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Instant>>> {
        self.last_send
            .lock()
            .map_err(|_| ChatError::Channel("rate limiter mutex poisoned".to_owned()))
    }
}
