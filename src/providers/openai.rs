// ABOUTME: OpenAI chat-completions backend.

use async_trait::async_trait;

use super::provider::{self, CompletionRequest, Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4-turbo";
const MAX_TOKENS: u32 = 1024;

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
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
        let mut messages: Vec<serde_json::Value> = Vec::with_capacity(request.history.len() + 2);
        messages.push(serde_json::json!({
            "role": "system",
            "content": request.system_context
        }));
        for entry in &request.history {
            messages.push(serde_json::json!({ "role": entry.role(), "content": entry.content }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": MAX_TOKENS
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let http = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.build_request_body(request));

        let body = provider::send_json(self.name(), http).await?;
        provider::text_at(self.name(), &body, "/choices/0/message/content")
    }
}
