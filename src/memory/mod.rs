//! Long-term NPC memory: entry shape, the LLM-proposed retention decision,
//! and the pure merge helpers shared by the orchestrator and the store.
//!
//! Rows are never hard-deleted — entries are soft-deactivated and pruned by
//! importance only, so merge targets can always be audited after the fact.

use serde::{Deserialize, Serialize};

/// Importance bounds for a memory entry.
pub const MIN_IMPORTANCE: u8 = 1;
pub const MAX_IMPORTANCE: u8 = 10;

/// A persisted long-term memory owned by one NPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: i64,
    pub npc_id: i64,
    pub session_id: i64,
    /// Free-text summary of the remembered fact or event.
    pub content: String,
    /// Type tag (`fact`, `event`, `relationship`, ...). Free-form.
    pub memory_type: String,
    /// Importance 1–10; used for pruning and prompt ordering.
    pub importance: u8,
    pub tags: Vec<String>,
    pub related_entities: Vec<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds of the last prompt-context fetch.
    pub last_accessed_at: i64,
    pub access_count: i64,
    /// Soft-delete flag; inactive entries are invisible to merge and recall.
    pub active: bool,
}

/// The memory-retention half of a structured generation result.
///
/// Produced by the provider in the same call as the reply text. The dedup
/// fields are LLM-proposed: the orchestrator verifies the merge target
/// before acting on them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryDecision {
    pub should_save: bool,
    pub memory_type: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub related_entities: Vec<String>,
    pub importance: u8,
    /// Model confidence that this is worth remembering (0.0–1.0).
    pub confidence: f32,
    /// Existing memory id the model believes this duplicates.
    pub merge_target_id: Option<i64>,
    /// Model-proposed fusion of old and new summaries.
    pub merged_summary: Option<String>,
    /// Model confidence that the merge target is a near-duplicate (0.0–1.0).
    pub dedupe_score: Option<f32>,
}

/// What the memory path did with a decision. Logged, never user-facing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryAction {
    /// Decision skipped: not worth saving, low confidence, or blank summary.
    Skipped(&'static str),
    /// A new row was inserted.
    Inserted(i64),
    /// An existing row was updated in place.
    Merged(i64),
}

/// Union two tag lists case-insensitively, preserving first-seen casing
/// and order.
#[must_use]
pub fn union_tags(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();
    for tag in existing.iter().chain(incoming.iter()) {
        let folded = tag.trim().to_lowercase();
        if folded.is_empty() || seen.contains(&folded) {
            continue;
        }
        seen.push(folded);
        out.push(tag.trim().to_owned());
    }
    out
}

/// Merged importance: the max of old and new, clamped to the valid range.
#[must_use]
pub fn merged_importance(existing: u8, incoming: u8) -> u8 {
    existing
        .max(incoming)
        .clamp(MIN_IMPORTANCE, MAX_IMPORTANCE)
}

/// Deterministic summary fusion, used when the provider merge call fails.
#[must_use]
pub fn concat_summaries(existing: &str, incoming: &str) -> String {
    let existing = existing.trim();
    let incoming = incoming.trim();
    if existing.is_empty() {
        return incoming.to_owned();
    }
    if incoming.is_empty() || existing == incoming {
        return existing.to_owned();
    }
    format!("{existing} {incoming}")
}
