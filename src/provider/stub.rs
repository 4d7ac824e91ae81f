//! Deterministic in-process provider for tests and offline development.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{AiProvider, GenerationRequest, PromptRole};
use crate::error::Result;
use crate::memory::concat_summaries;

/// Dimension of the stub's pseudo-embedding vectors.
const STUB_EMBEDDING_DIM: usize = 64;

/// Offline provider with fixed, deterministic behavior.
///
/// Replies carry the structured `{reply, memory}` shape so the full
/// orchestration path (including the memory decision) is exercised without
/// a model.
pub struct StubProvider;

impl StubProvider {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for StubProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiProvider for StubProvider {
    fn id(&self) -> &'static str {
        "stub"
    }

    async fn generate_reply(&self, request: &GenerationRequest) -> Result<String> {
        let trigger = request
            .transcript
            .iter()
            .rev()
            .find(|m| m.role == PromptRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("...");

        let output = serde_json::json!({
            "reply": format!("(stub) I heard: {}", trigger.chars().take(120).collect::<String>()),
            "memory": {
                "should_save": false,
                "summary": "",
                "confidence": 0.0,
            }
        });
        Ok(output.to_string())
    }

    /// Hash-based pseudo-embedding. NOT semantic — two related texts get
    /// unrelated vectors. Exists only so offline runs exercise the
    /// embedding call path; never rely on it for similarity.
    async fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let digest = Sha256::digest(text.trim().to_lowercase().as_bytes());
        let mut vector = Vec::with_capacity(STUB_EMBEDDING_DIM);
        for i in 0..STUB_EMBEDDING_DIM {
            let byte = digest[i % digest.len()];
            // Map each byte into [-1, 1], perturbed by position so the
            // vector is not periodic.
            let value = f32::from(byte) / 127.5 - 1.0;
            vector.push(value * (1.0 + (i as f32) * 0.001));
        }
        Ok(vector)
    }

    async fn merge_summaries(&self, a: &str, b: &str) -> Result<String> {
        Ok(concat_summaries(a, b))
    }
}
