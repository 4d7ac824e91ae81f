//! AI provider abstraction.
//!
//! One trait covers the three provider calls the pipeline makes: reply
//! generation, text embedding, and summary fusion. Backends are selected by
//! configuration at startup through [`build_provider`] — never by runtime
//! type inspection.

pub mod http;
pub mod stub;

pub use http::HttpProvider;
pub use stub::StubProvider;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::Result;

/// Role of one prompt message, OpenAI wire-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl PromptRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message in a generation prompt.
#[derive(Debug, Clone)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

/// A complete generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// System instruction (persona, format contract).
    pub system: String,
    /// Conversation transcript, oldest first.
    pub transcript: Vec<PromptMessage>,
}

/// Provider contract consumed by the orchestrator.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Stable backend identifier (`remote`, `local`, `stub`).
    fn id(&self) -> &'static str;

    /// One generation call. Returns raw model text; structured-output
    /// parsing is the caller's concern.
    async fn generate_reply(&self, request: &GenerationRequest) -> Result<String>;

    /// Embed a text fragment.
    async fn get_embedding(&self, text: &str) -> Result<Vec<f32>>;

    /// Fuse two memory summaries into one.
    async fn merge_summaries(&self, a: &str, b: &str) -> Result<String>;
}

/// Construct the configured provider.
///
/// A remote selection without a resolvable API key falls back to the stub
/// with a warning rather than failing startup; per-call generation errors
/// are never silently substituted.
pub fn build_provider(config: &ProviderConfig) -> Arc<dyn AiProvider> {
    match config.kind {
        ProviderKind::Stub => {
            info!("using stub AI provider");
            Arc::new(StubProvider::new())
        }
        ProviderKind::Local => {
            info!(base_url = config.base_url.as_str(), "using local AI provider");
            Arc::new(HttpProvider::local(config))
        }
        ProviderKind::Remote => match std::env::var(&config.api_key_env) {
            Ok(key) if !key.trim().is_empty() => {
                info!(base_url = config.base_url.as_str(), "using remote AI provider");
                Arc::new(HttpProvider::remote(config, key.trim().to_owned()))
            }
            _ => {
                warn!(
                    env = config.api_key_env.as_str(),
                    "remote provider selected but API key env is unset; falling back to stub"
                );
                Arc::new(StubProvider::new())
            }
        },
    }
}
