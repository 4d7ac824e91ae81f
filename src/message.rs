//! Core message types shared across the pipeline.

use serde::{Deserialize, Serialize};

/// Reserved prefix that reclassifies a message as a dice roll.
pub const ROLL_PREFIX: &str = "/roll";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    /// A human player or narrator account.
    User,
    /// A player-controlled character.
    Character,
    /// The system itself (broadcasts, join/leave notices).
    System,
    /// An AI-controlled NPC.
    Ai,
}

/// What kind of message this is within the session transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Free-text from a player.
    Player,
    /// Free-text from the narrator.
    Narrator,
    /// A resolved dice roll.
    DiceRoll,
    /// An AI-generated NPC reply.
    AiReply,
    /// A system notice.
    System,
}

impl MessageKind {
    /// Player/narrator free text is the only kind that triggers NPC selection.
    #[must_use]
    pub fn triggers_npc_selection(self) -> bool {
        matches!(self, Self::Player | Self::Narrator)
    }
}

/// An immutable chat message.
///
/// Within a session, `id` is the sole ordering key: ids are assigned
/// monotonically at insert time, so creation order and id order agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Monotonic message id (SQLite rowid).
    pub id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Message body.
    pub content: String,
    /// Display name of the sender.
    pub sender_name: String,
    /// Stable user id, when the sender is an authenticated user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user_id: Option<String>,
    /// Who authored the message.
    pub sender_kind: SenderKind,
    /// Transcript classification.
    pub kind: MessageKind,
    /// Character id, for character- or NPC-authored messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Opaque AI metadata (model, priority, trigger) for AI replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_metadata: Option<serde_json::Value>,
}

impl Message {
    /// `true` for messages authored by the AI pipeline.
    #[must_use]
    pub fn is_ai(&self) -> bool {
        self.sender_kind == SenderKind::Ai
    }
}

/// A send request, before validation and persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    pub session_id: i64,
    pub content: String,
    pub sender_name: String,
    #[serde(default)]
    pub sender_user_id: Option<String>,
    pub sender_kind: SenderKind,
    pub kind: MessageKind,
    #[serde(default)]
    pub character_id: Option<i64>,
    #[serde(default)]
    pub ai_metadata: Option<serde_json::Value>,
}

impl SendRequest {
    /// The key under which this sender is rate limited: the stable user id
    /// when present, the display name otherwise.
    #[must_use]
    pub fn sender_key(&self) -> &str {
        self.sender_user_id.as_deref().unwrap_or(&self.sender_name)
    }

    /// `true` when the trimmed content carries the dice-roll prefix.
    #[must_use]
    pub fn is_roll_command(&self) -> bool {
        self.content.trim_start().starts_with(ROLL_PREFIX)
    }
}

/// Current epoch time in milliseconds.
#[must_use]
pub fn now_epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn display_sender_kind(kind: SenderKind) -> &'static str {
    match kind {
        SenderKind::User => "user",
        SenderKind::Character => "character",
        SenderKind::System => "system",
        SenderKind::Ai => "ai",
    }
}

pub(crate) fn display_message_kind(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Player => "player",
        MessageKind::Narrator => "narrator",
        MessageKind::DiceRoll => "dice_roll",
        MessageKind::AiReply => "ai_reply",
        MessageKind::System => "system",
    }
}

pub(crate) fn parse_sender_kind(s: &str) -> Option<SenderKind> {
    match s {
        "user" => Some(SenderKind::User),
        "character" => Some(SenderKind::Character),
        "system" => Some(SenderKind::System),
        "ai" => Some(SenderKind::Ai),
        _ => None,
    }
}

pub(crate) fn parse_message_kind(s: &str) -> Option<MessageKind> {
    match s {
        "player" => Some(MessageKind::Player),
        "narrator" => Some(MessageKind::Narrator),
        "dice_roll" => Some(MessageKind::DiceRoll),
        "ai_reply" => Some(MessageKind::AiReply),
        "system" => Some(MessageKind::System),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn request(kind: MessageKind) -> SendRequest {
        SendRequest {
            session_id: 1,
            content: "hello".to_owned(),
            sender_name: "Ayla".to_owned(),
            sender_user_id: None,
            sender_kind: SenderKind::User,
            kind,
            character_id: None,
            ai_metadata: None,
        }
    }

    #[test]
    fn only_free_text_triggers_selection() {
        assert!(MessageKind::Player.triggers_npc_selection());
        assert!(MessageKind::Narrator.triggers_npc_selection());
        assert!(!MessageKind::DiceRoll.triggers_npc_selection());
        assert!(!MessageKind::AiReply.triggers_npc_selection());
        assert!(!MessageKind::System.triggers_npc_selection());
    }

    #[test]
    fn sender_key_prefers_user_id() {
        let mut req = request(MessageKind::Player);
        assert_eq!(req.sender_key(), "Ayla");
        req.sender_user_id = Some("u-42".to_owned());
        assert_eq!(req.sender_key(), "u-42");
    }

    #[test]
    fn roll_prefix_detected_after_leading_whitespace() {
        let mut req = request(MessageKind::Player);
        req.content = "  /roll 2d6+3".to_owned();
        assert!(req.is_roll_command());
        req.content = "rolling along".to_owned();
        assert!(!req.is_roll_command());
    }

    #[test]
    fn kind_round_trips_through_display() {
        for kind in [
            MessageKind::Player,
            MessageKind::Narrator,
            MessageKind::DiceRoll,
            MessageKind::AiReply,
            MessageKind::System,
        ] {
            assert_eq!(parse_message_kind(display_message_kind(kind)), Some(kind));
        }
        for kind in [
            SenderKind::User,
            SenderKind::Character,
            SenderKind::System,
            SenderKind::Ai,
        ] {
            assert_eq!(parse_sender_kind(display_sender_kind(kind)), Some(kind));
        }
    }
}
