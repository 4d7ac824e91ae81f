//! End-to-end pipeline tests: ingress → queue → orchestrator → AI reply
//! re-entering ingress, with in-memory storage and an offline provider.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tavernkeep::cache::NpcActivationCache;
use tavernkeep::config::{ChatConfig, IngressConfig};
use tavernkeep::error::Result;
use tavernkeep::ingress::ChatService;
use tavernkeep::message::{MessageKind, SendRequest, SenderKind};
use tavernkeep::npc::NpcActivationState;
use tavernkeep::orchestrator::{AiOrchestrator, NpcResponder};
use tavernkeep::provider::{AiProvider, GenerationRequest, StubProvider};
use tavernkeep::queue::ResponseJobQueue;
use tavernkeep::roll::PassthroughRollEngine;
use tavernkeep::store::{MemoryStore, MessageStore, NpcStateStore, SqliteStore};
use tavernkeep::stream::{StreamBroker, StreamEvent};

struct Pipeline {
    chat: Arc<ChatService>,
    queue: Arc<ResponseJobQueue>,
    broker: Arc<StreamBroker>,
    store: Arc<SqliteStore>,
}

fn build_pipeline(provider: Arc<dyn AiProvider>) -> Pipeline {
    let config = ChatConfig::default();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let broker = Arc::new(StreamBroker::new(config.stream.clone()));
    let queue = Arc::new(ResponseJobQueue::new(config.queue.clone()));
    let cache = Arc::new(NpcActivationCache::new(store.clone(), config.cache.ttl()));

    let chat = Arc::new(ChatService::new(
        store.clone(),
        broker.clone(),
        queue.clone(),
        cache.clone(),
        Arc::new(PassthroughRollEngine),
        IngressConfig {
            min_send_interval_ms: 0,
            ..IngressConfig::default()
        },
        config.orchestrator.context_window,
    ));
    let orchestrator = Arc::new(AiOrchestrator::new(
        provider,
        store.clone(),
        config.orchestrator.clone(),
    ));
    let responder = Arc::new(NpcResponder::new(orchestrator, chat.clone(), cache.clone()));
    queue.spawn_workers(responder, cache);

    Pipeline {
        chat,
        queue,
        broker,
        store,
    }
}

fn mira() -> NpcActivationState {
    NpcActivationState {
        session_id: 1,
        npc_id: 7,
        npc_name: "Mira".to_owned(),
        active: true,
        visible: true,
        interaction_frequency: 0,
        personality: Some("a weathered mountain guide".to_owned()),
        last_modified_by: None,
        last_modified_at: 0,
    }
}

fn player(content: &str) -> SendRequest {
    SendRequest {
        session_id: 1,
        content: content.to_owned(),
        sender_name: "Ayla".to_owned(),
        sender_user_id: Some("u-1".to_owned()),
        sender_kind: SenderKind::User,
        kind: MessageKind::Player,
        character_id: None,
        ai_metadata: None,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn named_npc_replies_through_the_full_pipeline() {
    let pipeline = build_pipeline(Arc::new(StubProvider::new()));
    pipeline.store.upsert_npc_state(&mira()).unwrap();

    let mut sub = pipeline.broker.subscribe(1);
    pipeline
        .chat
        .send(player("Mira, what do you see ahead?"))
        .await
        .unwrap();

    let store = pipeline.store.clone();
    wait_until("AI reply persisted", || {
        store
            .messages_after(1, None, 10)
            .unwrap()
            .iter()
            .any(|m| m.kind == MessageKind::AiReply)
    })
    .await;

    let messages = pipeline.store.messages_after(1, None, 10).unwrap();
    assert_eq!(messages.len(), 2);

    let reply = &messages[1];
    assert_eq!(reply.sender_name, "Mira");
    assert_eq!(reply.sender_kind, SenderKind::Ai);
    assert_eq!(reply.character_id, Some(7));
    assert!(reply.content.contains("what do you see ahead"));
    assert!(reply.ai_metadata.is_some());

    // The subscriber saw the trigger and the reply, in id order.
    let mut seen = Vec::new();
    while seen.len() < 2 {
        match sub.recv().await.unwrap() {
            StreamEvent::Message(m) => seen.push(m.id),
            _ => {}
        }
    }
    assert!(seen[0] < seen[1]);

    pipeline.queue.shutdown().await;
    assert_eq!(pipeline.queue.depth(), 0);
}

#[tokio::test]
async fn unaddressed_message_with_zero_frequency_gets_no_reply() {
    let pipeline = build_pipeline(Arc::new(StubProvider::new()));
    pipeline.store.upsert_npc_state(&mira()).unwrap();

    pipeline.chat.send(player("We make camp here.")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let messages = pipeline.store.messages_after(1, None, 10).unwrap();
    assert_eq!(messages.len(), 1);
    pipeline.queue.shutdown().await;
}

#[tokio::test]
async fn deactivating_an_npc_drops_queued_jobs() {
    // No workers started yet, so the job sits in the queue while we flip
    // the activation state underneath it.
    let config = ChatConfig::default();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let broker = Arc::new(StreamBroker::new(config.stream.clone()));
    let queue = Arc::new(ResponseJobQueue::new(config.queue.clone()));
    let cache = Arc::new(NpcActivationCache::new(store.clone(), config.cache.ttl()));
    let chat = Arc::new(ChatService::new(
        store.clone(),
        broker,
        queue.clone(),
        cache.clone(),
        Arc::new(PassthroughRollEngine),
        IngressConfig {
            min_send_interval_ms: 0,
            ..IngressConfig::default()
        },
        60,
    ));

    store.upsert_npc_state(&mira()).unwrap();
    chat.send(player("Mira?")).await.unwrap();
    assert_eq!(queue.depth(), 1);

    let mut gone = mira();
    gone.active = false;
    cache.put(&gone).unwrap();

    let orchestrator = Arc::new(AiOrchestrator::new(
        Arc::new(StubProvider::new()),
        store.clone(),
        config.orchestrator.clone(),
    ));
    let responder = Arc::new(NpcResponder::new(orchestrator, chat, cache.clone()));
    queue.spawn_workers(responder, cache);
    queue.shutdown().await;

    // Only the trigger message exists; the stale job was dropped.
    let messages = store.messages_after(1, None, 10).unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn transcript_survives_a_database_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("chat.sqlite3");

    {
        let store = SqliteStore::open(&db_path).unwrap();
        store
            .insert_message(&tavernkeep::store::NewMessage {
                session_id: 1,
                content: "we survive restarts".to_owned(),
                sender_name: "Ayla".to_owned(),
                sender_user_id: None,
                sender_kind: SenderKind::User,
                kind: MessageKind::Player,
                character_id: None,
                ai_metadata: None,
            })
            .unwrap();
    }

    // Reopen: schema application is idempotent and data is intact.
    let store = SqliteStore::open(&db_path).unwrap();
    assert_eq!(store.schema_version().unwrap(), Some(1));
    let messages = store.messages_after(1, None, 10).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "we survive restarts");
}

/// Provider whose reply carries a confident memory decision.
struct RememberingProvider;

#[async_trait]
impl AiProvider for RememberingProvider {
    fn id(&self) -> &'static str {
        "test"
    }

    async fn generate_reply(&self, _request: &GenerationRequest) -> Result<String> {
        Ok(serde_json::json!({
            "reply": "The pass is closed until the thaw.",
            "memory": {
                "should_save": true,
                "memory_type": "fact",
                "summary": "the party asked about the mountain pass",
                "tags": ["travel"],
                "importance": 5,
                "confidence": 0.9,
            }
        })
        .to_string())
    }

    async fn get_embedding(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![0.0])
    }

    async fn merge_summaries(&self, a: &str, b: &str) -> Result<String> {
        Ok(format!("{a} {b}"))
    }
}

#[tokio::test]
async fn confident_memory_decision_is_persisted_off_the_reply_path() {
    let pipeline = build_pipeline(Arc::new(RememberingProvider));
    pipeline.store.upsert_npc_state(&mira()).unwrap();

    pipeline
        .chat
        .send(player("Mira, is the pass open?"))
        .await
        .unwrap();

    let store = pipeline.store.clone();
    wait_until("AI reply persisted", || {
        store
            .messages_after(1, None, 10)
            .unwrap()
            .iter()
            .any(|m| m.content.contains("closed until the thaw"))
    })
    .await;

    // The memory write is detached; it may land after the reply.
    let store = pipeline.store.clone();
    wait_until("memory persisted", || {
        store.active_memory_count(7, 1).unwrap() == 1
    })
    .await;

    let memories = pipeline.store.recent_memories(7, 1, 10).unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].content, "the party asked about the mountain pass");
    assert_eq!(memories[0].importance, 5);

    pipeline.queue.shutdown().await;
}
