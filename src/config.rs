//! Configuration types for the session-chat pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChatError, Result};

/// Top-level configuration for the chat server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// HTTP server bind settings.
    pub server: ServerConfig,
    /// Message ingress guards (validation, rate limit, dedup).
    pub ingress: IngressConfig,
    /// Live stream broker settings.
    pub stream: StreamConfig,
    /// AI response job queue settings.
    pub queue: QueueConfig,
    /// Reply orchestration and memory persistence settings.
    pub orchestrator: OrchestratorConfig,
    /// NPC activation cache settings.
    pub cache: CacheConfig,
    /// AI provider selection.
    pub provider: ProviderConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// SQLite database path (None = in-memory, lost on restart).
    pub database_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 4180,
            database_path: None,
        }
    }
}

/// Message ingress guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Maximum message content length in characters.
    pub max_content_len: usize,
    /// Minimum interval between sends from the same sender, in milliseconds.
    pub min_send_interval_ms: u64,
    /// Rolling window during which an identical message is suppressed, in seconds.
    pub dedupe_window_secs: u64,
    /// How often the rate-limit and dedup maps are swept, in seconds.
    pub sweep_interval_secs: u64,
}

impl IngressConfig {
    pub fn min_send_interval(&self) -> Duration {
        Duration::from_millis(self.min_send_interval_ms)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_secs(self.dedupe_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_content_len: 4000,
            min_send_interval_ms: 1000,
            dedupe_window_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

/// Stream broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Interval between keep-alive frames per subscriber, in seconds.
    pub keepalive_interval_secs: u64,
    /// How often stale subscribers are swept, in seconds.
    pub idle_sweep_interval_secs: u64,
    /// Connection age past which a subscriber is considered leaked, in seconds.
    pub stale_after_secs: u64,
}

impl StreamConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 30,
            idle_sweep_interval_secs: 300,
            stale_after_secs: 1800,
        }
    }
}

/// Response job queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bounded queue capacity; producers block when full.
    pub capacity: usize,
    /// Number of worker tasks draining the queue.
    pub workers: usize,
    /// Queue depth at or above which the queue reports unhealthy.
    pub unhealthy_depth: usize,
    /// Seconds without a completed job (while jobs are pending) before
    /// the queue reports unhealthy.
    pub unhealthy_idle_secs: u64,
}

impl QueueConfig {
    pub fn unhealthy_idle(&self) -> Duration {
        Duration::from_secs(self.unhealthy_idle_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            workers: 3,
            unhealthy_depth: 500,
            unhealthy_idle_secs: 300,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of recent non-dice messages included in the prompt context.
    pub context_window: usize,
    /// Number of recent long-term memories included for dedup hinting.
    pub memory_hint_count: usize,
    /// Minimum confidence for a memory decision to be persisted.
    pub memory_confidence_threshold: f32,
    /// Minimum dedup score for a proposed merge to be applied.
    pub dedupe_threshold: f32,
    /// Maximum attempts for the background memory write.
    pub memory_max_attempts: u32,
    /// Upper bound on random jitter added to each retry delay, in milliseconds.
    pub retry_jitter_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            context_window: 60,
            memory_hint_count: 8,
            memory_confidence_threshold: 0.70,
            dedupe_threshold: 0.85,
            memory_max_attempts: 5,
            retry_jitter_ms: 500,
        }
    }
}

/// NPC activation cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry time-to-live in seconds. Hits slide the expiry forward.
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

/// Which AI provider backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Remote OpenAI-compatible cloud API.
    Remote,
    /// Local OpenAI-compatible HTTP server (no API key).
    Local,
    /// Deterministic in-process stub (tests, offline dev).
    Stub,
}

/// AI provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Backend selection.
    pub kind: ProviderKind,
    /// Base URL including the version prefix (e.g. `https://api.openai.com/v1`).
    pub base_url: String,
    /// Environment variable holding the API key for the remote backend.
    pub api_key_env: String,
    /// Model identifier sent in requests.
    pub model: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Stub,
            base_url: "http://127.0.0.1:8080/v1".to_owned(),
            api_key_env: "TAVERNKEEP_API_KEY".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            timeout_secs: 60,
        }
    }
}

impl ChatConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields fall back to defaults via `serde(default)`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))
    }

    /// Load from the path in `TAVERNKEEP_CONFIG`, or defaults if unset.
    pub fn load_from_env() -> Result<Self> {
        match std::env::var("TAVERNKEEP_CONFIG") {
            Ok(path) => Self::load(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }
}
