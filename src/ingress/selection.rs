//! NPC responder selection.
//!
//! For every active + visible NPC in a session, a free-text message
//! triggers a reply when the NPC is named, when the message is a question
//! or addressed to the whole table, or when a per-NPC random draw falls
//! under its interaction frequency. Priority starts at 5, +3 when named,
//! +2 for a question, clamped to 1–10.

use rand::Rng;

use crate::npc::NpcActivationState;

/// Base priority for any selected responder.
const BASE_PRIORITY: u8 = 5;
/// Priority bonus when the NPC is named.
const NAMED_BONUS: u8 = 3;
/// Priority bonus when the message is a question or addresses the table.
const QUESTION_BONUS: u8 = 2;

/// Tokens that address every NPC at the table.
const ADDRESS_ALL_TOKENS: &[&str] = &["everyone", "@all", "all of you"];

/// One NPC chosen to respond, with its generation priority.
#[derive(Debug, Clone)]
pub struct SelectedResponder {
    pub npc: NpcActivationState,
    /// 1–10; higher responds sooner under saturation.
    pub priority: u8,
}

/// Evaluate the selection policy for one message against a session roster.
///
/// The roster is expected to be pre-filtered to active + visible NPCs;
/// entries that are not are skipped defensively anyway.
pub fn select_responders<R: Rng>(
    content: &str,
    roster: &[NpcActivationState],
    rng: &mut R,
) -> Vec<SelectedResponder> {
    let content_lower = content.to_lowercase();
    let question = is_question_or_address_all(&content_lower);

    let mut selected = Vec::new();
    for npc in roster {
        if !npc.can_respond() {
            continue;
        }

        let named = mentions_name(&content_lower, &npc.npc_name);
        let drawn =
            !named && !question && rng.gen_range(0u32..100) < u32::from(npc.frequency());

        if named || question || drawn {
            selected.push(SelectedResponder {
                npc: npc.clone(),
                priority: priority_for(named, question),
            });
        }
    }
    selected
}

/// Priority score for a selected responder.
#[must_use]
pub fn priority_for(named: bool, question: bool) -> u8 {
    let mut priority = BASE_PRIORITY;
    if named {
        priority = priority.saturating_add(NAMED_BONUS);
    }
    if question {
        priority = priority.saturating_add(QUESTION_BONUS);
    }
    priority.clamp(1, 10)
}

/// Whole-word mention check: "Mira?" and "Mira's" count, "admirable" does
/// not. An occurrence matches when neither neighbouring character is
/// alphanumeric.
fn mentions_name(content_lower: &str, name: &str) -> bool {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return false;
    }

    let mut from = 0;
    while let Some(found) = content_lower[from..].find(&name) {
        let start = from + found;
        let end = start + name.len();
        let clear_before = content_lower[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let clear_after = content_lower[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        if clear_before && clear_after {
            return true;
        }
        from = end;
    }
    false
}

fn is_question_or_address_all(content_lower: &str) -> bool {
    content_lower.contains('?')
        || ADDRESS_ALL_TOKENS
            .iter()
            .any(|token| content_lower.contains(token))
}
