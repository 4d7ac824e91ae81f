//! Message ingress: the single entry point through which every message —
//! player, narrator, dice, AI reply, system notice — enters a session.
//!
//! One `send` call validates, applies the per-sender guards, resolves
//! `/roll` commands, persists, fans out to live subscribers, and selects
//! NPC responders. AI replies re-enter through the same path, so they get
//! the same persistence and broadcast as everything else.

pub mod dedupe;
pub mod rate_limit;
pub mod selection;

pub use dedupe::MessageDedupe;
pub use rate_limit::SenderRateLimiter;
pub use selection::{SelectedResponder, select_responders};

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::NpcActivationCache;
use crate::config::IngressConfig;
use crate::error::{ChatError, Result};
use crate::message::{Message, MessageKind, ROLL_PREFIX, SendRequest, SenderKind};
use crate::queue::{ResponseJob, ResponseJobQueue};
use crate::roll::RollEngine;
use crate::store::{MessageStore, NewMessage};
use crate::stream::{StreamBroker, StreamEvent};

/// Ruleset handed to the roll engine until per-session rulesets exist.
const DEFAULT_RULESET: &str = "default";

/// The session-chat ingress pipeline.
pub struct ChatService {
    store: Arc<dyn MessageStore>,
    broker: Arc<StreamBroker>,
    queue: Arc<ResponseJobQueue>,
    cache: Arc<NpcActivationCache>,
    roll: Arc<dyn RollEngine>,
    rate_limiter: SenderRateLimiter,
    dedupe: MessageDedupe,
    config: IngressConfig,
    /// Messages snapshotted into each response job's context.
    context_window: usize,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        broker: Arc<StreamBroker>,
        queue: Arc<ResponseJobQueue>,
        cache: Arc<NpcActivationCache>,
        roll: Arc<dyn RollEngine>,
        config: IngressConfig,
        context_window: usize,
    ) -> Self {
        let rate_limiter = SenderRateLimiter::new(config.min_send_interval());
        let dedupe = MessageDedupe::new(config.dedupe_window());
        Self {
            store,
            broker,
            queue,
            cache,
            roll,
            rate_limiter,
            dedupe,
            config,
            context_window,
        }
    }

    /// Accept one message into a session.
    ///
    /// Validation and guard rejections surface as typed errors before
    /// anything is persisted. Once the message is stored and broadcast,
    /// responder dispatch failures are logged, never propagated — the
    /// message itself already succeeded.
    ///
    /// When the response queue is at capacity this call suspends until a
    /// slot frees up; backpressure reaches all the way to the sender.
    pub async fn send(&self, request: SendRequest) -> Result<Message> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(ChatError::InvalidContent(
                "message content is empty".to_owned(),
            ));
        }
        let length = content.chars().count();
        if length > self.config.max_content_len {
            return Err(ChatError::InvalidContent(format!(
                "message is {length} characters; limit is {}",
                self.config.max_content_len
            )));
        }

        // System notices (broadcasts, join/leave) are exempt from rate
        // limiting; duplicates are still suppressed.
        if request.sender_kind != SenderKind::System {
            self.rate_limiter.check(request.sender_key())?;
        }
        self.dedupe.probe(
            request.session_id,
            content,
            request.sender_key(),
            request.kind,
        )?;
        // The window is started only after a successful insert, so a send
        // that fails in storage can be retried verbatim.
        let submitted = content.to_owned();

        // `/roll` reclassifies the message: the stored content is the
        // resolved transcript line, not the raw command.
        let (content, kind) = if request.is_roll_command() {
            let expr = content
                .trim_start()
                .strip_prefix(ROLL_PREFIX)
                .unwrap_or_default();
            let resolved = self
                .roll
                .process_roll(expr, &request.sender_name, DEFAULT_RULESET)
                .await?;
            (resolved.render(&request.sender_name), MessageKind::DiceRoll)
        } else {
            (content.to_owned(), request.kind)
        };

        let message = self.store.insert_message(&NewMessage {
            session_id: request.session_id,
            content,
            sender_name: request.sender_name.clone(),
            sender_user_id: request.sender_user_id.clone(),
            sender_kind: request.sender_kind,
            kind,
            character_id: request.character_id,
            ai_metadata: request.ai_metadata.clone(),
        })?;
        self.dedupe.remember(
            request.session_id,
            &submitted,
            request.sender_key(),
            request.kind,
        );

        self.broker
            .publish(message.session_id, &StreamEvent::Message(message.clone()));

        if message.kind.triggers_npc_selection() {
            self.dispatch_responders(&message).await;
        }
        Ok(message)
    }

    /// Post a system notice to a session.
    pub async fn broadcast_system(&self, session_id: i64, content: &str) -> Result<Message> {
        self.send(SendRequest {
            session_id,
            content: content.to_owned(),
            sender_name: "System".to_owned(),
            sender_user_id: None,
            sender_kind: SenderKind::System,
            kind: MessageKind::System,
            character_id: None,
            ai_metadata: None,
        })
        .await
    }

    /// Evaluate the selection policy and enqueue one response job per
    /// selected NPC.
    async fn dispatch_responders(&self, message: &Message) {
        let roster = match self.cache.list_active_visible(message.session_id) {
            Ok(roster) => roster,
            Err(e) => {
                warn!(session = message.session_id, "roster fetch failed: {e}");
                return;
            }
        };
        if roster.is_empty() {
            return;
        }

        let selected = select_responders(&message.content, &roster, &mut rand::thread_rng());
        if selected.is_empty() {
            return;
        }

        let context = match self
            .store
            .recent_messages(message.session_id, self.context_window)
        {
            Ok(context) => context,
            Err(e) => {
                warn!(session = message.session_id, "context snapshot failed: {e}");
                return;
            }
        };

        for responder in selected {
            debug!(
                session = message.session_id,
                npc = responder.npc.npc_name.as_str(),
                priority = responder.priority,
                "queueing NPC response"
            );
            let job = ResponseJob {
                session_id: message.session_id,
                npc_id: responder.npc.npc_id,
                npc_name: responder.npc.npc_name.clone(),
                trigger: message.content.clone(),
                context: context.clone(),
                priority: responder.priority,
                enqueued_at: Instant::now(),
            };
            if let Err(e) = self.queue.enqueue(job).await {
                warn!(session = message.session_id, "response enqueue failed: {e}");
                break;
            }
        }
    }

    /// Periodic sweep of the rate-limit and dedup maps. Runs until the
    /// token is cancelled.
    pub fn spawn_maintenance(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        service.rate_limiter.sweep();
                        service.dedupe.sweep();
                    }
                }
            }
            info!("ingress maintenance stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::{QueueConfig, StreamConfig};
    use crate::npc::NpcActivationState;
    use crate::roll::PassthroughRollEngine;
    use crate::store::{NpcStateStore, SqliteStore};
    use std::time::Duration;

    struct Fixture {
        service: Arc<ChatService>,
        broker: Arc<StreamBroker>,
        queue: Arc<ResponseJobQueue>,
        store: Arc<SqliteStore>,
    }

    fn fixture(config: IngressConfig) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let broker = Arc::new(StreamBroker::new(StreamConfig::default()));
        let queue = Arc::new(ResponseJobQueue::new(QueueConfig::default()));
        let cache = Arc::new(NpcActivationCache::new(
            store.clone(),
            Duration::from_secs(300),
        ));
        let service = Arc::new(ChatService::new(
            store.clone(),
            broker.clone(),
            queue.clone(),
            cache,
            Arc::new(PassthroughRollEngine),
            config,
            60,
        ));
        Fixture {
            service,
            broker,
            queue,
            store,
        }
    }

    fn relaxed_config() -> IngressConfig {
        IngressConfig {
            min_send_interval_ms: 0,
            ..IngressConfig::default()
        }
    }

    fn player(session_id: i64, content: &str) -> SendRequest {
        SendRequest {
            session_id,
            content: content.to_owned(),
            sender_name: "Ayla".to_owned(),
            sender_user_id: Some("u-1".to_owned()),
            sender_kind: SenderKind::User,
            kind: MessageKind::Player,
            character_id: None,
            ai_metadata: None,
        }
    }

    fn add_npc(store: &SqliteStore, name: &str, frequency: u8) {
        store
            .upsert_npc_state(&NpcActivationState {
                session_id: 1,
                npc_id: 7,
                npc_name: name.to_owned(),
                active: true,
                visible: true,
                interaction_frequency: frequency,
                personality: None,
                last_modified_by: None,
                last_modified_at: 0,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn send_persists_and_broadcasts() {
        let fx = fixture(relaxed_config());
        let mut sub = fx.broker.subscribe(1);

        let message = fx.service.send(player(1, "  hello there  ")).await.unwrap();
        assert_eq!(message.content, "hello there");
        assert!(message.id > 0);

        match sub.recv().await.unwrap() {
            StreamEvent::Message(m) => assert_eq!(m.id, message.id),
            other => unreachable!("unexpected event {other:?}"),
        }

        let stored = fx.store.messages_after(1, None, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "hello there");
    }

    #[tokio::test]
    async fn empty_and_oversized_content_are_rejected() {
        let fx = fixture(IngressConfig {
            max_content_len: 10,
            min_send_interval_ms: 0,
            ..IngressConfig::default()
        });

        let err = fx.service.send(player(1, "   ")).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidContent(_)));

        let err = fx
            .service
            .send(player(1, "this is well past ten characters"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidContent(_)));

        // Nothing reached the store.
        assert!(fx.store.messages_after(1, None, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn rapid_sends_from_one_sender_are_limited() {
        let fx = fixture(IngressConfig::default());
        fx.service.send(player(1, "first")).await.unwrap();

        let err = fx.service.send(player(1, "second")).await.unwrap_err();
        assert!(matches!(err, ChatError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn system_broadcast_bypasses_the_rate_limit() {
        let fx = fixture(IngressConfig::default());
        fx.service.broadcast_system(1, "round one").await.unwrap();
        fx.service.broadcast_system(1, "round two").await.unwrap();

        let stored = fx.store.messages_after(1, None, 10).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|m| m.kind == MessageKind::System));
    }

    #[tokio::test]
    async fn duplicate_message_is_suppressed() {
        let fx = fixture(relaxed_config());
        fx.service.send(player(1, "echo!")).await.unwrap();

        let err = fx.service.send(player(1, "echo!")).await.unwrap_err();
        assert!(matches!(err, ChatError::DuplicateMessage { .. }));
    }

    /// Message store whose first insert fails, as a disk-full stand-in.
    struct FlakyStore {
        inner: Arc<SqliteStore>,
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl MessageStore for FlakyStore {
        fn insert_message(&self, new: &NewMessage) -> crate::error::Result<Message> {
            if self
                .fail_next
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(ChatError::Storage("disk full".to_owned()));
            }
            self.inner.insert_message(new)
        }

        fn messages_after(
            &self,
            session_id: i64,
            after_id: Option<i64>,
            limit: usize,
        ) -> crate::error::Result<Vec<Message>> {
            self.inner.messages_after(session_id, after_id, limit)
        }

        fn recent_messages(
            &self,
            session_id: i64,
            limit: usize,
        ) -> crate::error::Result<Vec<Message>> {
            self.inner.recent_messages(session_id, limit)
        }
    }

    #[tokio::test]
    async fn storage_failure_does_not_poison_the_dedup_window() {
        let inner = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            fail_next: std::sync::atomic::AtomicBool::new(true),
        });
        let broker = Arc::new(StreamBroker::new(StreamConfig::default()));
        let queue = Arc::new(ResponseJobQueue::new(QueueConfig::default()));
        let cache = Arc::new(NpcActivationCache::new(
            inner.clone(),
            Duration::from_secs(300),
        ));
        let service = ChatService::new(
            store,
            broker,
            queue,
            cache,
            Arc::new(PassthroughRollEngine),
            relaxed_config(),
            60,
        );

        let err = service.send(player(1, "echo!")).await.unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));

        // The failed attempt never started a window; the verbatim retry
        // lands, and only then does the suppression kick in.
        service.send(player(1, "echo!")).await.unwrap();
        let err = service.send(player(1, "echo!")).await.unwrap_err();
        assert!(matches!(err, ChatError::DuplicateMessage { .. }));

        assert_eq!(inner.messages_after(1, None, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn roll_command_is_reclassified() {
        let fx = fixture(relaxed_config());
        let message = fx.service.send(player(1, "/roll 2d6+3")).await.unwrap();

        assert_eq!(message.kind, MessageKind::DiceRoll);
        assert_eq!(message.content, "Ayla rolls 2d6+3: (unresolved)");
    }

    #[tokio::test]
    async fn player_message_enqueues_a_response_job() {
        let fx = fixture(relaxed_config());
        add_npc(&fx.store, "Mira", 100);

        fx.service.send(player(1, "We press on.")).await.unwrap();
        assert_eq!(fx.queue.depth(), 1);
    }

    #[tokio::test]
    async fn dice_rolls_and_ai_replies_do_not_trigger_selection() {
        let fx = fixture(relaxed_config());
        add_npc(&fx.store, "Mira", 100);

        fx.service.send(player(1, "/roll 1d20")).await.unwrap();

        let mut reply = player(1, "A voice answers from the dark.");
        reply.sender_name = "Mira".to_owned();
        reply.sender_user_id = None;
        reply.sender_kind = SenderKind::Ai;
        reply.kind = MessageKind::AiReply;
        reply.character_id = Some(7);
        fx.service.send(reply).await.unwrap();

        assert_eq!(fx.queue.depth(), 0);
    }

    #[tokio::test]
    async fn empty_roster_enqueues_nothing() {
        let fx = fixture(relaxed_config());
        fx.service.send(player(1, "Anyone home?")).await.unwrap();
        assert_eq!(fx.queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_sweeps_guard_maps() {
        // Zero-width guard windows: entries are expired the moment they are
        // written, so the first sweep must clear both maps.
        let fx = fixture(IngressConfig {
            min_send_interval_ms: 0,
            dedupe_window_secs: 0,
            sweep_interval_secs: 1,
            ..IngressConfig::default()
        });
        fx.service.send(player(1, "hello")).await.unwrap();
        assert_eq!(fx.service.rate_limiter.tracked_senders(), 1);
        assert_eq!(fx.service.dedupe.tracked_hashes(), 1);

        let token = CancellationToken::new();
        let handle = fx.service.spawn_maintenance(token.clone());

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(fx.service.rate_limiter.tracked_senders(), 0);
        assert_eq!(fx.service.dedupe.tracked_hashes(), 0);

        token.cancel();
        handle.await.unwrap();
    }
}
