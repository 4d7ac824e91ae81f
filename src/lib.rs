//! Tavernkeep: real-time tabletop-RPG session chat with AI-driven NPCs.
//!
//! Every message enters through one ingress pipeline:
//! validate → rate-limit → dedup → resolve `/roll` → persist → broadcast
//!
//! # Architecture
//!
//! The system is built from independent components wired together at
//! startup:
//! - **Ingress**: validation, per-sender guards, dice-roll resolution
//! - **Stream broker**: per-session SSE fan-out with keep-alives
//! - **Response queue**: bounded job queue with a fixed worker pool
//! - **Orchestrator**: structured reply generation + detached memory writes
//! - **Memory store**: long-term NPC memory with LLM-assisted merging
//! - **Activation cache**: TTL cache over NPC activation state
//!
//! AI replies re-enter through the same ingress path as player messages,
//! so persistence, broadcast, and guard behavior are identical for both.

pub mod cache;
pub mod config;
pub mod error;
pub mod ingress;
pub mod memory;
pub mod message;
pub mod npc;
pub mod orchestrator;
pub mod permissions;
pub mod provider;
pub mod queue;
pub mod roll;
pub mod server;
pub mod store;
pub mod stream;

pub use config::ChatConfig;
pub use error::{ChatError, Result};
pub use ingress::ChatService;
pub use message::{Message, MessageKind, SendRequest, SenderKind};
pub use orchestrator::{AiOrchestrator, NpcResponder};
pub use queue::ResponseJobQueue;
pub use stream::{StreamBroker, StreamEvent};
