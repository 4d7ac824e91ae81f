//! Reply orchestration: prompt assembly, one structured generation call,
//! and memory persistence as a detached, retried background effect.
//!
//! The generation call is expected to return `{reply, memory}` JSON; free
//! text is accepted as a legacy fallback (the raw text becomes the reply
//! and no memory action is taken). The reply is returned synchronously;
//! the memory decision is handled off the caller's path with capped
//! exponential backoff, and memory loss after retry exhaustion is a logged
//! degradation — never a failure of the user-facing reply.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::NpcActivationCache;
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::ingress::ChatService;
use crate::memory::{
    MemoryAction, MemoryDecision, concat_summaries, merged_importance, union_tags,
};
use crate::message::{Message, MessageKind, SendRequest, SenderKind};
use crate::npc::NpcActivationState;
use crate::provider::{AiProvider, GenerationRequest, PromptMessage, PromptRole};
use crate::queue::{JobExecutor, ResponseJob};
use crate::store::{MemoryStore, NewMemory};

/// Active memories kept per NPC per session before importance pruning.
const MEMORY_KEEP_PER_NPC: usize = 200;

/// Builds prompts, calls the provider, and supervises memory persistence.
pub struct AiOrchestrator {
    provider: Arc<dyn AiProvider>,
    memories: Arc<dyn MemoryStore>,
    config: OrchestratorConfig,
    /// Every detached memory task is tracked so shutdown can wait for
    /// writes (and their retries) still in flight.
    memory_tasks: TaskTracker,
}

/// Parsed result of one generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub reply: String,
    /// `None` for legacy free-text output.
    pub memory: Option<MemoryDecision>,
}

#[derive(Debug, Deserialize)]
struct StructuredOutput {
    reply: String,
    #[serde(default)]
    memory: Option<MemoryDecision>,
}

impl AiOrchestrator {
    pub fn new(
        provider: Arc<dyn AiProvider>,
        memories: Arc<dyn MemoryStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            memories,
            config,
            memory_tasks: TaskTracker::new(),
        }
    }

    /// Generate one in-character reply for an NPC.
    ///
    /// Provider failure here surfaces to the caller — there is no silent
    /// fallback reply. On success the memory half of the output is handed
    /// to a detached retried task before returning.
    pub async fn generate_reply(
        &self,
        session_id: i64,
        npc: &NpcActivationState,
        history: &[Message],
    ) -> Result<String> {
        let hints = self
            .memories
            .recent_memories(npc.npc_id, session_id, self.config.memory_hint_count)
            .unwrap_or_else(|e| {
                warn!(npc = npc.npc_name.as_str(), "memory hint fetch failed: {e}");
                Vec::new()
            });

        let request = build_request(npc, history, &hints, self.config.context_window);
        let raw = self.provider.generate_reply(&request).await?;
        let outcome = parse_generation(&raw);

        if let Some(decision) = outcome.memory {
            self.spawn_memory_task(decision, npc.npc_id, session_id);
        }
        Ok(outcome.reply)
    }

    fn spawn_memory_task(&self, decision: MemoryDecision, npc_id: i64, session_id: i64) {
        let provider = Arc::clone(&self.provider);
        let memories = Arc::clone(&self.memories);
        let config = self.config.clone();
        self.memory_tasks.spawn(async move {
            persist_memory_with_retry(provider, memories, config, decision, npc_id, session_id)
                .await;
        });
    }

    /// Wait for every in-flight memory task, retries included.
    ///
    /// Call after the response queue has drained, so no new tasks can be
    /// spawned while this waits.
    pub async fn drain_memory_tasks(&self) {
        self.memory_tasks.close();
        let pending = self.memory_tasks.len();
        if pending > 0 {
            info!(pending, "waiting for in-flight memory writes");
        }
        self.memory_tasks.wait().await;
    }

    /// Apply one memory decision: skip, merge into a verified target, or
    /// insert a new entry.
    pub async fn apply_memory_decision(
        &self,
        decision: &MemoryDecision,
        npc_id: i64,
        session_id: i64,
    ) -> Result<MemoryAction> {
        apply_memory_decision(
            &*self.provider,
            &*self.memories,
            &self.config,
            decision,
            npc_id,
            session_id,
        )
        .await
    }
}

/// Parse raw provider output into a reply and an optional memory decision.
///
/// Accepts plain JSON or JSON inside a Markdown code fence; anything
/// unparseable is treated as a free-text reply.
#[must_use]
pub fn parse_generation(raw: &str) -> GenerationOutcome {
    let candidate = strip_code_fence(raw.trim());
    match serde_json::from_str::<StructuredOutput>(candidate) {
        Ok(parsed) if !parsed.reply.trim().is_empty() => GenerationOutcome {
            reply: parsed.reply.trim().to_owned(),
            memory: parsed.memory,
        },
        _ => GenerationOutcome {
            reply: raw.trim().to_owned(),
            memory: None,
        },
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the optional language tag on the fence line.
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .map_or(text, str::trim_end)
}

/// Assemble the generation request: persona, session summary, memory
/// hints with ids (so the model can propose a merge target), format
/// contract, and the most recent non-dice messages.
fn build_request(
    npc: &NpcActivationState,
    history: &[Message],
    hints: &[crate::memory::MemoryEntry],
    context_window: usize,
) -> GenerationRequest {
    let window: Vec<&Message> = history
        .iter()
        .filter(|m| m.kind != MessageKind::DiceRoll)
        .collect();
    let window = &window[window.len().saturating_sub(context_window)..];

    let mut participants: Vec<&str> = Vec::new();
    for m in window {
        if !participants.contains(&m.sender_name.as_str()) {
            participants.push(&m.sender_name);
        }
    }
    let scene = window
        .iter()
        .rev()
        .find(|m| m.kind == MessageKind::Narrator)
        .map(|m| m.content.as_str())
        .unwrap_or("(no scene set)");

    let mut system = format!(
        "You are {name}, a non-player character in a live tabletop RPG session. \
         Stay in character and answer in {name}'s voice.\n",
        name = npc.npc_name
    );
    if let Some(ref personality) = npc.personality {
        system.push_str(&format!("Personality: {personality}\n"));
    }
    system.push_str(&format!(
        "Session: participants {participants}; time {time}; scene: {scene}\n",
        participants = participants.join(", "),
        time = chrono::Utc::now().to_rfc3339(),
    ));

    if !hints.is_empty() {
        system.push_str("\nYour existing long-term memories (id: content):\n");
        for hint in hints {
            system.push_str(&format!("- {}: {}\n", hint.id, hint.content));
        }
        system.push_str(
            "If the new conversation repeats one of these, propose merging into it \
             instead of saving a duplicate.\n",
        );
    }

    system.push_str(
        "\nRespond with JSON only: {\"reply\": \"<in-character reply>\", \"memory\": \
         {\"should_save\": bool, \"memory_type\": str, \"summary\": str, \"tags\": [str], \
         \"related_entities\": [str], \"importance\": 1-10, \"confidence\": 0.0-1.0, \
         \"merge_target_id\": int?, \"merged_summary\": str?, \"dedupe_score\": 0.0-1.0?}}",
    );

    let transcript = window
        .iter()
        .map(|m| {
            if m.sender_kind == SenderKind::Ai && m.character_id == Some(npc.npc_id) {
                PromptMessage {
                    role: PromptRole::Assistant,
                    content: m.content.clone(),
                }
            } else {
                PromptMessage {
                    role: PromptRole::User,
                    content: format!("{}: {}", m.sender_name, m.content),
                }
            }
        })
        .collect();

    GenerationRequest { system, transcript }
}

async fn persist_memory_with_retry(
    provider: Arc<dyn AiProvider>,
    memories: Arc<dyn MemoryStore>,
    config: OrchestratorConfig,
    decision: MemoryDecision,
    npc_id: i64,
    session_id: i64,
) {
    let max_attempts = config.memory_max_attempts.max(1);
    for attempt in 0..max_attempts {
        match apply_memory_decision(&*provider, &*memories, &config, &decision, npc_id, session_id)
            .await
        {
            Ok(action) => {
                debug!(npc = npc_id, session = session_id, "memory action: {action:?}");
                if matches!(action, MemoryAction::Inserted(_)) {
                    if let Err(e) =
                        memories.prune_low_importance(npc_id, session_id, MEMORY_KEEP_PER_NPC)
                    {
                        warn!(npc = npc_id, "memory pruning failed: {e}");
                    }
                }
                return;
            }
            Err(e) => {
                warn!(
                    npc = npc_id,
                    session = session_id,
                    attempt = attempt + 1,
                    max = max_attempts,
                    "memory persistence failed: {e}"
                );
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(backoff_delay(attempt, config.retry_jitter_ms)).await;
                }
            }
        }
    }
    // Accepted degradation: the reply already went out.
    error!(
        npc = npc_id,
        session = session_id,
        "memory persistence abandoned after {max_attempts} attempts"
    );
}

/// `2^attempt` seconds plus random jitter.
fn backoff_delay(attempt: u32, jitter_ms: u64) -> Duration {
    let base = Duration::from_secs(1u64 << attempt.min(16));
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    };
    base + jitter
}

async fn apply_memory_decision(
    provider: &dyn AiProvider,
    memories: &dyn MemoryStore,
    config: &OrchestratorConfig,
    decision: &MemoryDecision,
    npc_id: i64,
    session_id: i64,
) -> Result<MemoryAction> {
    if !decision.should_save {
        return Ok(MemoryAction::Skipped("should_save is false"));
    }
    if decision.confidence < config.memory_confidence_threshold {
        return Ok(MemoryAction::Skipped("confidence below threshold"));
    }
    let summary = decision.summary.trim();
    if summary.is_empty() {
        return Ok(MemoryAction::Skipped("blank summary"));
    }

    if let (Some(target_id), Some(score)) = (decision.merge_target_id, decision.dedupe_score) {
        if score >= config.dedupe_threshold {
            match memories.memory(target_id)? {
                Some(target)
                    if target.active
                        && target.npc_id == npc_id
                        && target.session_id == session_id =>
                {
                    let fused = fuse_summaries(provider, decision, &target.content, summary).await;
                    memories.apply_merge(&crate::store::MemoryMerge {
                        target_id,
                        content: fused,
                        tags: union_tags(&target.tags, &decision.tags),
                        importance: merged_importance(target.importance, decision.importance),
                    })?;
                    info!(npc = npc_id, target = target_id, "merged memory into existing entry");
                    return Ok(MemoryAction::Merged(target_id));
                }
                _ => {
                    // Proposed target missing, inactive, or owned elsewhere:
                    // fall through to a plain insert rather than failing.
                    debug!(
                        npc = npc_id,
                        target = target_id,
                        "merge target invalid; inserting new memory"
                    );
                }
            }
        }
    }

    let id = memories.insert_memory(&NewMemory {
        npc_id,
        session_id,
        content: summary.to_owned(),
        memory_type: decision.memory_type.clone(),
        importance: decision.importance.clamp(1, 10),
        tags: decision.tags.clone(),
        related_entities: decision.related_entities.clone(),
    })?;
    Ok(MemoryAction::Inserted(id))
}

/// Prefer the model's own fusion; fall back to an LLM merge call, then to
/// deterministic concatenation when the provider fails.
async fn fuse_summaries(
    provider: &dyn AiProvider,
    decision: &MemoryDecision,
    existing: &str,
    incoming: &str,
) -> String {
    if let Some(ref merged) = decision.merged_summary {
        if !merged.trim().is_empty() {
            return merged.trim().to_owned();
        }
    }
    match provider.merge_summaries(existing, incoming).await {
        Ok(fused) if !fused.trim().is_empty() => fused.trim().to_owned(),
        Ok(_) => concat_summaries(existing, incoming),
        Err(e) => {
            warn!("summary merge call failed, using concatenation: {e}");
            concat_summaries(existing, incoming)
        }
    }
}

/// Queue-worker glue: generate a reply for a job and send it back through
/// the normal ingress path as an AI-authored message.
///
/// The orchestrator depends on the ingress, never the reverse — the AI
/// reply gets the exact same validation, persistence, and broadcast as a
/// player message.
pub struct NpcResponder {
    orchestrator: Arc<AiOrchestrator>,
    chat: Arc<ChatService>,
    cache: Arc<NpcActivationCache>,
}

impl NpcResponder {
    pub fn new(
        orchestrator: Arc<AiOrchestrator>,
        chat: Arc<ChatService>,
        cache: Arc<NpcActivationCache>,
    ) -> Self {
        Self {
            orchestrator,
            chat,
            cache,
        }
    }
}

#[async_trait]
impl JobExecutor for NpcResponder {
    async fn execute(&self, job: ResponseJob) -> Result<()> {
        let Some(npc) = self.cache.get(job.session_id, job.npc_id)? else {
            // Deactivated since the worker's own check; drop silently.
            return Ok(());
        };

        let reply = self
            .orchestrator
            .generate_reply(job.session_id, &npc, &job.context)
            .await?;

        self.chat
            .send(SendRequest {
                session_id: job.session_id,
                content: reply,
                sender_name: npc.npc_name.clone(),
                sender_user_id: None,
                sender_kind: SenderKind::Ai,
                kind: MessageKind::AiReply,
                character_id: Some(npc.npc_id),
                ai_metadata: Some(serde_json::json!({
                    "priority": job.priority,
                    "trigger": job.trigger,
                })),
            })
            .await
            // The AI path takes the same guards as everyone else; a
            // rejected reply is reported, not bypassed.
            .map(|_| ())
    }
}
