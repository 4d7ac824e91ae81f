//! NPC activation state: which NPCs are live in a session and how eager
//! they are to speak.

use serde::{Deserialize, Serialize};

/// Per-(session, NPC) activation record.
///
/// Mutated by narrator actions; cached with a short TTL by
/// [`crate::cache::NpcActivationCache`]. The database row is the source of
/// truth — the cache is a performance layer only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpcActivationState {
    pub session_id: i64,
    pub npc_id: i64,
    /// Display name, matched case-insensitively for mentions.
    pub npc_name: String,
    /// Whether the NPC participates in the session at all.
    pub active: bool,
    /// Whether the NPC is visible to players (hidden NPCs never reply).
    pub visible: bool,
    /// Probability (0–100) that the NPC replies to an ordinary message.
    pub interaction_frequency: u8,
    /// Free-form personality settings fed into the reply prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    /// Who last modified this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,
    /// When this record was last modified, epoch milliseconds.
    pub last_modified_at: i64,
}

impl NpcActivationState {
    /// `true` when the NPC may be selected to respond.
    #[must_use]
    pub fn can_respond(&self) -> bool {
        self.active && self.visible
    }

    /// Interaction frequency clamped to the valid 0–100 range.
    #[must_use]
    pub fn frequency(&self) -> u8 {
        self.interaction_frequency.min(100)
    }
}
