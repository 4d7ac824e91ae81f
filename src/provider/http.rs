//! OpenAI-compatible HTTP provider.
//!
//! Talks to any server exposing `/chat/completions` and `/embeddings`
//! under the configured base URL — a remote cloud API (with bearer auth)
//! or a local inference server (without).

use async_trait::async_trait;
use serde::Deserialize;

use super::{AiProvider, GenerationRequest};
use crate::config::ProviderConfig;
use crate::error::{ChatError, Result};

/// HTTP-backed provider.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    id: &'static str,
}

impl HttpProvider {
    /// Remote cloud backend with bearer authentication.
    #[must_use]
    pub fn remote(config: &ProviderConfig, api_key: String) -> Self {
        Self::build(config, Some(api_key), "remote")
    }

    /// Local inference server; no credentials.
    #[must_use]
    pub fn local(config: &ProviderConfig) -> Self {
        Self::build(config, None, "local")
    }

    fn build(config: &ProviderConfig, api_key: Option<String>, id: &'static str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key,
            model: config.model.clone(),
            id,
        }
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChatError::Provider(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ChatError::Provider(format!(
                "HTTP {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ChatError::Provider(format!("invalid response body: {e}")))
    }

    async fn chat(&self, messages: serde_json::Value) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        let raw = self.post_json("/chat/completions", &body).await?;
        let parsed: ChatCompletionResponse = serde_json::from_value(raw)
            .map_err(|e| ChatError::Provider(format!("unexpected completion shape: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ChatError::Provider("completion returned no choices".to_owned()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[async_trait]
impl AiProvider for HttpProvider {
    fn id(&self) -> &'static str {
        self.id
    }

    async fn generate_reply(&self, request: &GenerationRequest) -> Result<String> {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system,
        })];
        for msg in &request.transcript {
            messages.push(serde_json::json!({
                "role": msg.role.as_str(),
                "content": msg.content,
            }));
        }
        self.chat(serde_json::Value::Array(messages)).await
    }

    async fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });
        let raw = self.post_json("/embeddings", &body).await?;
        let parsed: EmbeddingResponse = serde_json::from_value(raw)
            .map_err(|e| ChatError::Provider(format!("unexpected embedding shape: {e}")))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| ChatError::Provider("embedding returned no rows".to_owned()))
    }

    async fn merge_summaries(&self, a: &str, b: &str) -> Result<String> {
        let messages = serde_json::json!([
            {
                "role": "system",
                "content": "Fuse the two memory summaries into one concise summary. \
                            Keep every distinct fact. Reply with the fused summary only.",
            },
            {
                "role": "user",
                "content": format!("Summary A: {a}\nSummary B: {b}"),
            },
        ]);
        Ok(self.chat(messages).await?.trim().to_owned())
    }
}
