//! Anthropic Messages API backend (`POST {base_url}/v1/messages`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::backend::ProofreadBackend;
use super::error::ProofreadError;
use super::LlmSettings;
use crate::http::{create_client, truncate_body};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

pub struct AnthropicBackend {
    client: Client,
    base_url: String,
    api_key: SecretString,
    settings: LlmSettings,
}

impl AnthropicBackend {
    pub fn new(
        base_url: Option<&str>,
        api_key: SecretString,
        settings: LlmSettings,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: create_client(request_timeout)?,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            settings,
        })
    }
}

#[async_trait]
impl ProofreadBackend for AnthropicBackend {
    async fn proofread_chunk(
        &self,
        system_prompt: &str,
        text: &str,
    ) -> Result<String, ProofreadError> {
        let request = MessagesRequest {
            model: &self.settings.model,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            system: system_prompt,
            messages: [Message {
                role: "user",
                content: text,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProofreadError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProofreadError::Parse(e.to_string()))?;
        let text = parsed
            .content
            .into_iter()
            .next()
            .and_then(|block| block.text)
            .ok_or(ProofreadError::EmptyResponse)?;
        debug!(chars = text.len(), "chunk proofread");
        Ok(text)
    }
}
