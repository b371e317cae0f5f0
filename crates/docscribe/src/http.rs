//! Shared HTTP client construction for the remote backends.

use std::time::Duration;

use reqwest::Client;

/// Default connect timeout for HTTP requests.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum length for error bodies kept in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Creates an HTTP client with a connect timeout and a per-request timeout.
pub fn create_client(request_timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .build()
}

/// Truncates a response body for inclusion in an error message.
pub fn truncate_body(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() > MAX_ERROR_BODY_LENGTH {
        let cut: String = body.chars().take(MAX_ERROR_BODY_LENGTH).collect();
        format!("{}... (truncated)", cut)
    } else {
        body.to_string()
    }
}
