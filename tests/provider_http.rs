// ABOUTME: HTTP-level tests for the LLM backends against a local mock server.
// ABOUTME: Covers response parsing, rate-limit mapping, dispatcher cooldowns, and Gemini's model walk.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hive_runtime_lib::providers::admission::AdmissionGate;
use hive_runtime_lib::providers::anthropic::AnthropicProvider;
use hive_runtime_lib::providers::gemini::GeminiProvider;
use hive_runtime_lib::providers::{
    CompletionRequest, DispatchLimits, Provider, ProviderDispatcher, ProviderError,
};

fn request(prompt: &str) -> CompletionRequest {
    CompletionRequest {
        prompt: prompt.to_string(),
        system_context: "You are a PM.".to_string(),
        history: vec![],
    }
}

fn gemini_text(text: &str) -> serde_json::Value {
    json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
}

fn gemini_path(model: &str) -> String {
    format!("/v1beta/models/{}:generateContent", model)
}

#[tokio::test]
async fn anthropic_returns_first_content_block() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({ "system": "You are a PM." })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{ "type": "text", "text": "Here is the plan." }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new("test-key").with_base_url(server.uri());
    let text = provider.complete(&request("Plan the login page")).await.unwrap();
    assert_eq!(text, "Here is the plan.");
}

#[tokio::test]
async fn anthropic_429_is_a_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new("test-key").with_base_url(server.uri());
    let err = provider.complete(&request("hi")).await.unwrap_err();
    assert!(err.is_rate_limit(), "got {:?}", err);
    assert!(matches!(err, ProviderError::RateLimited { ref provider, .. } if provider == "anthropic"));
}

#[tokio::test]
async fn rate_limited_backend_cools_down_and_next_one_answers() {
    let anthropic_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limit exceeded"))
        .expect(1)
        .mount(&anthropic_server)
        .await;

    let gemini_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(gemini_path("gemini-1.5-flash")))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text("from gemini")))
        .expect(2)
        .mount(&gemini_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let providers: Vec<Arc<dyn Provider>> = vec![
        Arc::new(AnthropicProvider::new("a-key").with_base_url(anthropic_server.uri())),
        Arc::new(GeminiProvider::new("g-key").with_base_url(gemini_server.uri())),
    ];
    let dispatcher = ProviderDispatcher::new(
        providers,
        AdmissionGate::new(dir.path().join("llm.lock"), Duration::ZERO),
        DispatchLimits::default(),
    );

    let first = dispatcher.complete("Plan it", "ctx", None).await;
    assert_eq!(first.as_deref(), Some("from gemini"));
    assert!(dispatcher.is_cooling_down("anthropic").await);
    assert!(!dispatcher.is_cooling_down("gemini").await);

    // Anthropic is skipped while cooling down: its mock expects one request only.
    let second = dispatcher.complete("Plan it again", "ctx", None).await;
    assert_eq!(second.as_deref(), Some("from gemini"));
}

#[tokio::test]
async fn gemini_moves_to_next_model_after_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(gemini_path("gemini-1.5-flash")))
        .and(header("x-goog-api-key", "g-key"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(gemini_path("gemini-flash-latest")))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text("second model")))
        .expect(1)
        .mount(&server)
        .await;

    let provider = GeminiProvider::new("g-key").with_base_url(server.uri());
    let text = provider.complete(&request("hi")).await.unwrap();
    assert_eq!(text, "second model");
}

#[tokio::test]
async fn gemini_stops_walking_models_on_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(gemini_path("gemini-1.5-flash")))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(gemini_path("gemini-flash-latest")))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
        .expect(1)
        .mount(&server)
        .await;
    for model in ["gemini-1.5-pro-latest", "gemini-pro"] {
        Mock::given(method("POST"))
            .and(path(gemini_path(model)))
            .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text("unreachable")))
            .expect(0)
            .mount(&server)
            .await;
    }

    let provider = GeminiProvider::new("g-key").with_base_url(server.uri());
    let err = provider.complete(&request("hi")).await.unwrap_err();
    assert!(err.is_rate_limit(), "got {:?}", err);
}

#[tokio::test]
async fn gemini_reports_last_error_when_every_model_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(4)
        .mount(&server)
        .await;

    let provider = GeminiProvider::new("g-key").with_base_url(server.uri());
    match provider.complete(&request("hi")).await.unwrap_err() {
        ProviderError::Http { status, .. } => assert_eq!(status, 503),
        other => panic!("Expected HTTP error, got {:?}", other),
    }
}
