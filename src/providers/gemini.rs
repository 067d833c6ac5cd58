// ABOUTME: Google Gemini generateContent backend.
// ABOUTME: Tries a list of models in order; a rate limit on the key stops the walk.

use async_trait::async_trait;

use super::provider::{self, CompletionRequest, Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Models tried in order until one produces text.
const MODELS: &[&str] = &[
    "models/gemini-1.5-flash",
    "models/gemini-flash-latest",
    "models/gemini-1.5-pro-latest",
    "models/gemini-pro",
];

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Gemini takes one flattened prompt: system context, transcript, then the ask.
    fn build_prompt(request: &CompletionRequest) -> String {
        let mut parts = vec![
            request.system_context.clone(),
            "\nCONVERSATION HISTORY:".to_string(),
        ];
        for entry in &request.history {
            let sender = if entry.is_user() { "User" } else { "Agent" };
            parts.push(format!("{}: {}", sender, entry.content));
        }
        parts.push(format!("\nUser: {}\nAgent:", request.prompt));
        parts.join("\n")
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": Self::build_prompt(request) }] }]
        });

        let mut last_error = None;
        for model in MODELS {
            let http = self
                .client
                .post(format!("{}/v1beta/{}:generateContent", self.base_url, model))
                .header("x-goog-api-key", &self.api_key)
                .json(&body);

            let result = match provider::send_json(self.name(), http).await {
                Ok(response) => {
                    provider::text_at(self.name(), &response, "/candidates/0/content/parts/0/text")
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_rate_limit() => return Err(e),
                Err(e) => {
                    log::debug!("[Gemini] {} failed: {}", model, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::EmptyResponse {
            provider: self.name().to_string(),
        }))
    }
}
