//! HTTP implementation of the resource control API.
//!
//! `POST start|stop {credentials, resource_id}` answers `{success: true}`,
//! `{error: "already running"}` / `{error: "already stopped"}`, or any other
//! `{error: ...}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::ControlError;
use super::{ControlOutcome, ResourceController};
use crate::http::{create_client, truncate_body};

#[derive(Serialize)]
struct ControlRequest<'a> {
    credentials: &'a str,
    resource_id: &'a str,
}

#[derive(Deserialize, Default)]
struct ControlResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpResourceController {
    client: Client,
    start_url: String,
    stop_url: String,
    resource_id: String,
    credentials: SecretString,
}

impl HttpResourceController {
    pub fn new(
        start_url: &str,
        stop_url: &str,
        resource_id: &str,
        credentials: SecretString,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: create_client(request_timeout)?,
            start_url: start_url.to_string(),
            stop_url: stop_url.to_string(),
            resource_id: resource_id.to_string(),
            credentials,
        })
    }

    /// Posts to `url`; an error containing `already` means the resource was
    /// in the requested state.
    async fn call(&self, url: &str, already: &str) -> Result<ControlOutcome, ControlError> {
        let request = ControlRequest {
            credentials: self.credentials.expose_secret(),
            resource_id: &self.resource_id,
        };
        let response = self.client.post(url).json(&request).send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(%status, "control API answered");

        let parsed: ControlResponse = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Err(ControlError::Status {
                    status: status.as_u16(),
                    body: truncate_body(&text),
                })
            }
        };

        if parsed.success {
            return Ok(ControlOutcome::Applied);
        }
        match parsed.error {
            Some(message) if message.to_lowercase().contains(already) => {
                Ok(ControlOutcome::AlreadyInState)
            }
            Some(message) => Err(ControlError::Refused(message)),
            None => Err(ControlError::Status {
                status: status.as_u16(),
                body: truncate_body(&text),
            }),
        }
    }
}

#[async_trait]
impl ResourceController for HttpResourceController {
    async fn start(&self) -> Result<ControlOutcome, ControlError> {
        self.call(&self.start_url, "already running").await
    }

    async fn stop(&self) -> Result<ControlOutcome, ControlError> {
        self.call(&self.stop_url, "already stopped").await
    }
}
