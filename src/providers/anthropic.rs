// ABOUTME: Anthropic Messages API backend.

use async_trait::async_trait;

use super::provider::{self, CompletionRequest, Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages: Vec<serde_json::Value> = request
            .history
            .iter()
            .map(|entry| serde_json::json!({ "role": entry.role(), "content": entry.content }))
            .collect();
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": request.system_context,
            "messages": messages
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let http = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.build_request_body(request));

        let body = provider::send_json(self.name(), http).await?;
        provider::text_at(self.name(), &body, "/content/0/text")
    }
}
