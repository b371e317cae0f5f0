//! HTTP speech-recognition backend.
//!
//! - `POST submit` multipart `{transcription_id, initial_prompt, [language], audio}`
//!   → `200 {message}` | `400 {error}` | other
//! - `POST result` json `{transcription_id}` → `200 application/json {message}`
//!   while running | `200 <transcript bytes>` | `404 {detail}` | other

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use super::backend::{InferenceBackend, ResultPoll, SubmitRequest};
use super::error::InferenceError;
use crate::http::{create_client, truncate_body};

#[derive(Deserialize, Default)]
struct MessageBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

pub struct HttpInferenceBackend {
    client: Client,
    submit_url: String,
    result_url: String,
    api_key: SecretString,
    language: Option<String>,
}

impl HttpInferenceBackend {
    pub fn new(
        submit_url: &str,
        result_url: &str,
        api_key: SecretString,
        language: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: create_client(request_timeout)?,
            submit_url: submit_url.to_string(),
            result_url: result_url.to_string(),
            api_key,
            language,
        })
    }
}

/// MIME type for the audio part, guessed from the file extension.
pub fn audio_content_type(path: &std::path::Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn status_error(status: StatusCode, body: &str) -> InferenceError {
    InferenceError::Status {
        status: status.as_u16(),
        body: truncate_body(body),
    }
}

#[async_trait]
impl InferenceBackend for HttpInferenceBackend {
    async fn submit(&self, request: &SubmitRequest<'_>) -> Result<String, InferenceError> {
        let path = request.audio_path;
        if tokio::fs::metadata(path).await.is_err() {
            return Err(InferenceError::SourceMissing(path.to_path_buf()));
        }
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| InferenceError::SourceRead {
                path: path.to_path_buf(),
                source: e,
            })?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string();
        let audio = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(&audio_content_type(path))?;

        let mut form = Form::new()
            .text("transcription_id", request.job_id.to_string())
            .text("initial_prompt", request.prompt.to_string());
        if let Some(ref language) = self.language {
            form = form.text("language", language.clone());
        }
        let form = form.part("audio", audio);

        let response = self
            .client
            .post(&self.submit_url)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        let body: MessageBody = serde_json::from_str(&text).unwrap_or_default();

        match status {
            StatusCode::OK => {
                let message = body.message.unwrap_or_default();
                info!(job_id = request.job_id, %message, "Inference backend accepted job");
                Ok(message)
            }
            StatusCode::BAD_REQUEST => match body.error {
                Some(error) => Err(InferenceError::Rejected(error)),
                None => Err(status_error(status, &text)),
            },
            _ => Err(status_error(status, &text)),
        }
    }

    async fn fetch_result(&self, job_id: &str) -> Result<ResultPoll, InferenceError> {
        let response = self
            .client
            .post(&self.result_url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({ "transcription_id": job_id }))
            .send()
            .await?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);

        match status {
            StatusCode::OK if is_json => {
                let body: MessageBody = response.json().await.unwrap_or_default();
                let message = body.message.unwrap_or_else(|| "in progress".to_string());
                debug!(job_id, %message, "Transcription still in progress");
                Ok(ResultPoll::InProgress(message))
            }
            StatusCode::OK => Ok(ResultPoll::Ready(response.bytes().await?.to_vec())),
            StatusCode::NOT_FOUND => {
                let text = response.text().await?;
                let body: MessageBody = serde_json::from_str(&text).unwrap_or_default();
                match body.detail.or(body.error) {
                    Some(detail) => Ok(ResultPoll::NotFoundYet(detail)),
                    None => Err(status_error(status, &text)),
                }
            }
            _ => {
                let text = response.text().await?;
                Err(status_error(status, &text))
            }
        }
    }
}
