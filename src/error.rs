//! Error types for the chat pipeline.

use std::time::Duration;

/// Top-level error type for the session-chat system.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Message content is empty or exceeds the configured length bound.
    #[error("invalid content: {0}")]
    InvalidContent(String),

    /// Sender exceeded the minimum interval between sends.
    ///
    /// Carries the remaining wait before the next send is allowed.
    #[error("rate limited; retry after {}ms", retry_after.as_millis())]
    RateLimited {
        /// Remaining wait before the sender may retry.
        retry_after: Duration,
    },

    /// Identical message already seen within the dedup window.
    #[error("duplicate message; window expires in {}s", retry_after.as_secs())]
    DuplicateMessage {
        /// Remaining lifetime of the duplicate-suppression entry.
        retry_after: Duration,
    },

    /// AI provider call failure (generation, embedding, summary merge).
    #[error("provider error: {0}")]
    Provider(String),

    /// Persistence layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Dice-roll engine error.
    #[error("roll error: {0}")]
    Roll(String),

    /// Caller lacks permission for the session.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Channel send/receive error (queue closed, broker gone).
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ChatError>;
