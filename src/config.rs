// ABOUTME: Runtime configuration read from the process environment.
// ABOUTME: Provider priority, per-provider credentials, timeouts, and admission-gate settings.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PRIORITY: &str = "anthropic,gemini,openai";
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_COOLDOWN_SECS: u64 = 60;
const DEFAULT_JITTER_MS: u64 = 1500;
const DEFAULT_HISTORY_LIMIT: usize = 10;
const DEFAULT_PROMPT_LIMIT: usize = 12_000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidNumber { key: String, value: String },
}

/// Everything the runtime reads from its environment, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Provider names in the order they should be tried.
    pub provider_priority: Vec<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub tool_timeout: Duration,
    pub provider_cooldown: Duration,
    pub admission_lock_path: PathBuf,
    pub admission_jitter: Duration,
    pub history_limit: usize,
    pub prompt_limit: usize,
    /// Directory holding one learned-approach file per agent.
    pub memory_dir: PathBuf,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let priority = get("LLM_PRIORITY").unwrap_or_else(|| DEFAULT_PRIORITY.to_string());
        let provider_priority = priority
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        let admission_lock_path = get("HIVE_ADMISSION_LOCK")
            .map(PathBuf::from)
            .unwrap_or_else(default_lock_path);
        let memory_dir = get("HIVE_MEMORY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_memory_dir);

        Ok(Self {
            provider_priority,
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            openai_api_key: get("OPENAI_API_KEY"),
            gemini_api_key: get("GEMINI_API_KEY"),
            tool_timeout: Duration::from_secs(parse_or(
                &get,
                "HIVE_TOOL_TIMEOUT_SECS",
                DEFAULT_TOOL_TIMEOUT_SECS,
            )?),
            provider_cooldown: Duration::from_secs(parse_or(
                &get,
                "HIVE_PROVIDER_COOLDOWN_SECS",
                DEFAULT_COOLDOWN_SECS,
            )?),
            admission_lock_path,
            admission_jitter: Duration::from_millis(parse_or(
                &get,
                "HIVE_ADMISSION_JITTER_MS",
                DEFAULT_JITTER_MS,
            )?),
            history_limit: parse_or(&get, "HIVE_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)?,
            prompt_limit: parse_or(&get, "HIVE_PROMPT_LIMIT", DEFAULT_PROMPT_LIMIT)?,
            memory_dir,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

/// Lock file shared by every worker process of one user.
fn default_lock_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hive-runtime")
        .join("llm.lock")
}

fn default_memory_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hive-runtime")
        .join("memory")
}
