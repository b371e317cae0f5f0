//! OpenAI-compatible `/v1/chat/completions` backend.
//!
//! Works with any provider speaking the chat-completions wire format. The
//! bearer header is only sent when an API key is configured.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::backend::ProofreadBackend;
use super::error::ProofreadError;
use super::LlmSettings;
use crate::http::{create_client, truncate_body};

pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    settings: LlmSettings,
}

impl OpenAiBackend {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        settings: LlmSettings,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: create_client(request_timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            settings,
        })
    }
}

#[async_trait]
impl ProofreadBackend for OpenAiBackend {
    async fn proofread_chunk(
        &self,
        system_prompt: &str,
        text: &str,
    ) -> Result<String, ProofreadError> {
        let body = serde_json::json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": text }
            ],
            "stream": false,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens
        });

        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            if !key.expose_secret().is_empty() {
                request = request.bearer_auth(key.expose_secret());
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProofreadError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProofreadError::Parse(e.to_string()))?;

        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(ProofreadError::EmptyResponse)?
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(ProofreadError::EmptyResponse);
        }

        debug!(chars = text.len(), "chunk proofread");
        Ok(text)
    }
}
