// ABOUTME: Provider trait, completion request types, and provider errors.
// ABOUTME: Also holds the shared HTTP helper that classifies rate-limit responses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One prior turn of conversation passed along with a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(default)]
    pub from_id: String,
    #[serde(default)]
    pub content: String,
}

impl HistoryEntry {
    pub fn new(from_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            from_id: from_id.into(),
            content: content.into(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.from_id == "user"
    }

    /// Chat-completions role for this entry.
    pub fn role(&self) -> &'static str {
        if self.is_user() { "user" } else { "assistant" }
    }
}

/// A prompt after truncation, ready for a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_context: String,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} is rate limited: {detail}")]
    RateLimited { provider: String, detail: String },

    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} request failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} returned no text")]
    EmptyResponse { provider: String },
}

impl ProviderError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

/// A generative backend: produce text for a request, or fail.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name as used in the priority list (e.g. "anthropic").
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;
}

// =============================================================================
// HTTP helpers
// =============================================================================

const RATE_LIMIT_MARKERS: &[&str] = &[
    "resource_exhausted",
    "rate_limit",
    "rate limit",
    "too many requests",
    "quota",
];

/// Whether an HTTP status/body pair signals rate limiting.
pub fn is_rate_limited(status: u16, body: &str) -> bool {
    if status == 429 {
        return true;
    }
    let lower = body.to_lowercase();
    status >= 400 && RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Send a prepared request and return its JSON body, mapping failures to
/// `ProviderError` and rate-limit signals to `ProviderError::RateLimited`.
pub(crate) async fn send_json(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, ProviderError> {
    let response = request.send().await.map_err(|e| ProviderError::Request {
        provider: provider.to_string(),
        message: e.to_string(),
    })?;

    let status = response.status().as_u16();
    let body = response.text().await.map_err(|e| ProviderError::Request {
        provider: provider.to_string(),
        message: e.to_string(),
    })?;

    if is_rate_limited(status, &body) {
        return Err(ProviderError::RateLimited {
            provider: provider.to_string(),
            detail: truncate_detail(&body),
        });
    }
    if status >= 400 {
        return Err(ProviderError::Http {
            provider: provider.to_string(),
            status,
            body: truncate_detail(&body),
        });
    }

    serde_json::from_str(&body).map_err(|e| ProviderError::Request {
        provider: provider.to_string(),
        message: format!("invalid JSON body: {}", e),
    })
}

/// Pull a non-empty string out of a response body at `pointer`.
pub(crate) fn text_at(
    provider: &str,
    body: &serde_json::Value,
    pointer: &str,
) -> Result<String, ProviderError> {
    body.pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::EmptyResponse {
            provider: provider.to_string(),
        })
}

fn truncate_detail(body: &str) -> String {
    crate::runtime::preview(body.trim(), 200)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_429_is_always_rate_limited() {
        assert!(is_rate_limited(429, ""));
    }

    #[test]
    fn quota_bodies_are_rate_limited_only_on_error_status() {
        let body = r#"{"error":{"status":"RESOURCE_EXHAUSTED","message":"Quota exceeded"}}"#;
        assert!(is_rate_limited(400, body));
        assert!(!is_rate_limited(200, body));
        assert!(!is_rate_limited(500, r#"{"error":"internal"}"#));
    }

    #[test]
    fn text_at_rejects_blank_content() {
        let body = json!({"content": [{"text": "  "}]});
        assert!(matches!(
            text_at("anthropic", &body, "/content/0/text"),
            Err(ProviderError::EmptyResponse { .. })
        ));

        let body = json!({"content": [{"text": " hi "}]});
        assert_eq!(text_at("anthropic", &body, "/content/0/text").unwrap(), "hi");
    }

    #[test]
    fn history_roles_follow_sender() {
        assert_eq!(HistoryEntry::new("user", "q").role(), "user");
        assert_eq!(HistoryEntry::new("pm", "a").role(), "assistant");
    }
}
