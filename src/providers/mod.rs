// ABOUTME: Provider dispatcher: priority fallback across LLM backends with rate-limit cooldowns.
// ABOUTME: Every outbound call passes through the cross-process admission gate.

pub mod admission;
pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod provider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::RuntimeConfig;
use admission::AdmissionGate;
pub use provider::{CompletionRequest, HistoryEntry, Provider, ProviderError};

/// Bounds applied to every request before it leaves the process.
#[derive(Debug, Clone, Copy)]
pub struct DispatchLimits {
    pub history_limit: usize,
    pub prompt_limit: usize,
    pub cooldown: Duration,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            history_limit: 10,
            prompt_limit: 12_000,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Tries backends in priority order until one produces text.
///
/// Cooldowns are tracked per backend name: a backend that signalled a rate
/// limit is skipped until its cooldown elapses, without waiting on it.
pub struct ProviderDispatcher {
    providers: Vec<Arc<dyn Provider>>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    gate: AdmissionGate,
    limits: DispatchLimits,
}

impl ProviderDispatcher {
    /// `providers` must already be in priority order.
    pub fn new(providers: Vec<Arc<dyn Provider>>, gate: AdmissionGate, limits: DispatchLimits) -> Self {
        Self {
            providers,
            cooldowns: Mutex::new(HashMap::new()),
            gate,
            limits,
        }
    }

    /// Build the backends named in `LLM_PRIORITY` that have a credential.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        for name in &config.provider_priority {
            let provider: Option<Arc<dyn Provider>> = match name.as_str() {
                "anthropic" => config
                    .anthropic_api_key
                    .as_ref()
                    .map(|key| Arc::new(anthropic::AnthropicProvider::new(key)) as Arc<dyn Provider>),
                "openai" => config
                    .openai_api_key
                    .as_ref()
                    .map(|key| Arc::new(openai::OpenAiProvider::new(key)) as Arc<dyn Provider>),
                "gemini" => config
                    .gemini_api_key
                    .as_ref()
                    .map(|key| Arc::new(gemini::GeminiProvider::new(key)) as Arc<dyn Provider>),
                other => {
                    log::warn!("[Dispatcher] Unknown provider in priority list: {}", other);
                    continue;
                }
            };
            match provider {
                Some(p) => {
                    log::info!("[Dispatcher] {} initialized", name);
                    providers.push(p);
                }
                None => log::debug!("[Dispatcher] {} has no credential; skipping", name),
            }
        }
        if providers.is_empty() {
            log::warn!("[Dispatcher] No LLM providers configured; callers will use rule-based fallbacks");
        }

        Self::new(
            providers,
            AdmissionGate::new(config.admission_lock_path.clone(), config.admission_jitter),
            DispatchLimits {
                history_limit: config.history_limit,
                prompt_limit: config.prompt_limit,
                cooldown: config.provider_cooldown,
            },
        )
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Generate text from the first backend that succeeds.
    ///
    /// Returns `None` when every backend failed or is cooling down; callers
    /// are expected to have a fallback.
    pub async fn complete(
        &self,
        prompt: &str,
        system_context: &str,
        history: Option<&[HistoryEntry]>,
    ) -> Option<String> {
        self.complete_with(prompt, system_context, history, None).await
    }

    /// Like `complete`, but tries `preferred` first when it is configured.
    pub async fn complete_with(
        &self,
        prompt: &str,
        system_context: &str,
        history: Option<&[HistoryEntry]>,
        preferred: Option<&str>,
    ) -> Option<String> {
        if self.providers.is_empty() {
            return None;
        }

        let request = CompletionRequest {
            prompt: truncate_prompt(prompt, self.limits.prompt_limit),
            system_context: system_context.to_string(),
            history: recent_history(history.unwrap_or_default(), self.limits.history_limit),
        };

        for provider in self.ordered(preferred) {
            let name = provider.name();
            if self.is_cooling_down(name).await {
                log::info!("[Dispatcher] {} is cooling down; trying next provider", name);
                continue;
            }

            log::info!("[Dispatcher] Trying {}...", name);
            let result = {
                let _slot = match self.gate.acquire().await {
                    Ok(slot) => Some(slot),
                    Err(e) => {
                        log::warn!("[Dispatcher] Admission gate unavailable, calling unguarded: {}", e);
                        None
                    }
                };
                provider.complete(&request).await
            };

            match result {
                Ok(text) if !text.trim().is_empty() => return Some(text),
                Ok(_) => log::warn!("[Dispatcher] {} returned empty text", name),
                Err(e) if e.is_rate_limit() => {
                    log::warn!("[Dispatcher] {}", e);
                    self.mark_cooldown(name).await;
                }
                Err(e) => log::warn!("[Dispatcher] {} failed: {}", name, e),
            }
        }

        log::error!("[Dispatcher] All LLM providers failed");
        None
    }

    pub async fn is_cooling_down(&self, name: &str) -> bool {
        let mut cooldowns = self.cooldowns.lock().await;
        match cooldowns.get(name) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                cooldowns.remove(name);
                false
            }
            None => false,
        }
    }

    async fn mark_cooldown(&self, name: &str) {
        let until = Instant::now() + self.limits.cooldown;
        self.cooldowns.lock().await.insert(name.to_string(), until);
        log::info!(
            "[Dispatcher] {} cooling down for {:?}",
            name,
            self.limits.cooldown
        );
    }

    fn ordered(&self, preferred: Option<&str>) -> Vec<Arc<dyn Provider>> {
        let mut ordered = self.providers.clone();
        if let Some(preferred) = preferred {
            if let Some(pos) = ordered.iter().position(|p| p.name() == preferred) {
                let p = ordered.remove(pos);
                ordered.insert(0, p);
            }
        }
        ordered
    }
}

/// Keep the most recent `limit` entries.
fn recent_history(history: &[HistoryEntry], limit: usize) -> Vec<HistoryEntry> {
    let start = history.len().saturating_sub(limit);
    history[start..].to_vec()
}

/// Cut a prompt to at most `limit` characters.
fn truncate_prompt(prompt: &str, limit: usize) -> String {
    match prompt.char_indices().nth(limit) {
        Some((idx, _)) => prompt[..idx].to_string(),
        None => prompt.to_string(),
    }
}
