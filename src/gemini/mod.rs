pub mod live;
pub mod protocol;

use crate::error::SessionError;
use serde_json::Value;

pub const REST_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Pull `error.message` out of a Google API error body, falling back to the raw text.
pub fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Cheap authenticated call used before storing a new key.
pub async fn verify_api_key(client: &reqwest::Client, api_key: &str) -> Result<(), SessionError> {
    let key = api_key.trim();
    if key.is_empty() {
        return Err(SessionError::InvalidCredential("API key is empty".into()));
    }
    let resp = client
        .get(format!("{}/models", REST_BASE))
        .query(&[("pageSize", "1")])
        .header("x-goog-api-key", key)
        .send()
        .await
        .map_err(|e| SessionError::Transport(format!("key check failed: {}", e)))?;

    let status = resp.status();
    if status.is_success() {
        log::info!("[live] API key verified ({})", crate::credentials::redact(key));
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    let message = api_error_message(&body);
    match status.as_u16() {
        400 | 401 | 403 => Err(SessionError::InvalidCredential(message)),
        code => Err(SessionError::Transport(format!("key check failed ({}): {}", code, message))),
    }
}
