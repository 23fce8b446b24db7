//! Short-lived stream tokens for transcription endpoints
//!
//! Tokens are minted server-side: the token endpoint answers a GET with
//! `{"token": "..."}` (or `{"error": "..."}` with a non-2xx status). No
//! provider key is ever held by this process.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use super::StreamingError;

static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            })
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// Fetch a stream token from `token_url`.
pub async fn fetch_stream_token(token_url: &str) -> Result<String, StreamingError> {
    log::info!("Requesting stream token from {}", token_url);

    let response = http_client()
        .get(token_url)
        .send()
        .await
        .map_err(|e| StreamingError::Credentials(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| StreamingError::Credentials(e.to_string()))?;

    if !status.is_success() {
        let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(err) => err.error,
            Err(_) => body,
        };
        log::error!("Token endpoint error ({}): {}", status.as_u16(), message);
        return Err(StreamingError::Credentials(format!(
            "{} ({})",
            message,
            status.as_u16()
        )));
    }

    let parsed: TokenResponse =
        serde_json::from_str(&body).map_err(|e| StreamingError::Credentials(e.to_string()))?;
    if parsed.token.is_empty() {
        return Err(StreamingError::Credentials("empty token".to_string()));
    }

    Ok(parsed.token)
}
