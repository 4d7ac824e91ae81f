//! Persistence traits for messages, NPC activation state, and NPC memory.
//!
//! The pipeline depends on these narrow traits rather than on SQLite
//! directly, so tests run against the bundled in-memory database and the
//! backend stays swappable.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::memory::MemoryEntry;
use crate::message::{Message, MessageKind, SenderKind};
use crate::npc::NpcActivationState;

/// A message ready for insertion (id and timestamp assigned by the store).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: i64,
    pub content: String,
    pub sender_name: String,
    pub sender_user_id: Option<String>,
    pub sender_kind: SenderKind,
    pub kind: MessageKind,
    pub character_id: Option<i64>,
    pub ai_metadata: Option<serde_json::Value>,
}

/// A memory entry ready for insertion.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub npc_id: i64,
    pub session_id: i64,
    pub content: String,
    pub memory_type: String,
    pub importance: u8,
    pub tags: Vec<String>,
    pub related_entities: Vec<String>,
}

/// An in-place merge into an existing memory row.
#[derive(Debug, Clone)]
pub struct MemoryMerge {
    pub target_id: i64,
    /// Fused summary replacing the old content.
    pub content: String,
    /// Case-insensitive union of old and new tags.
    pub tags: Vec<String>,
    /// Max of old and new importance.
    pub importance: u8,
}

/// Message persistence and per-session ordered reads.
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning a monotonic id and creation timestamp.
    fn insert_message(&self, new: &NewMessage) -> Result<Message>;

    /// Messages of a session with id greater than `after_id`, ascending,
    /// capped at `limit`.
    fn messages_after(
        &self,
        session_id: i64,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// The most recent `limit` messages of a session, ascending.
    fn recent_messages(&self, session_id: i64, limit: usize) -> Result<Vec<Message>>;
}

/// NPC activation state persistence.
pub trait NpcStateStore: Send + Sync {
    fn npc_state(&self, session_id: i64, npc_id: i64) -> Result<Option<NpcActivationState>>;

    /// Insert or replace the state row, stamping `last_modified_at`.
    fn upsert_npc_state(&self, state: &NpcActivationState) -> Result<()>;

    /// All active and visible NPCs of a session.
    fn active_visible_npcs(&self, session_id: i64) -> Result<Vec<NpcActivationState>>;
}

/// Long-term NPC memory persistence.
pub trait MemoryStore: Send + Sync {
    fn insert_memory(&self, new: &NewMemory) -> Result<i64>;

    /// Fetch one entry regardless of its active flag.
    fn memory(&self, id: i64) -> Result<Option<MemoryEntry>>;

    /// Mutate an existing entry in place with merged content.
    fn apply_merge(&self, merge: &MemoryMerge) -> Result<()>;

    /// The most recent active entries for an NPC, newest first. Bumps
    /// `access_count` and `last_accessed_at` on every returned row.
    fn recent_memories(
        &self,
        npc_id: i64,
        session_id: i64,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>>;

    /// Soft-deactivate the lowest-importance entries beyond `keep` rows.
    /// Returns the number of rows deactivated.
    fn prune_low_importance(&self, npc_id: i64, session_id: i64, keep: usize) -> Result<usize>;

    /// Number of active entries for an NPC in a session.
    fn active_memory_count(&self, npc_id: i64, session_id: i64) -> Result<usize>;
}
