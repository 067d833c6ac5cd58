// ABOUTME: Worker trait that every capability handler implements.
// ABOUTME: The runtime calls into it once per inbound task, chat, or completion record.

use async_trait::async_trait;

use crate::channel::TaskSpec;
use crate::runtime::HostLink;

/// Terminal signal for a delegated subtask, as reported by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSignal {
    pub subtask_id: String,
    pub from: Option<String>,
    pub outcome: Result<serde_json::Value, String>,
}

/// The Worker trait that all capability handlers implement.
///
/// Handlers run on their own task, so they may block on `HostLink::call`
/// without stalling the receive loop.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Worker identifier (e.g. "pm", "frontend", "qa")
    fn id(&self) -> &str;

    /// Human-readable name used to prefix log records.
    fn name(&self) -> &str;

    /// Execute one task. `Err` becomes an error response for the host.
    async fn execute(&self, task: TaskSpec, host: &HostLink) -> Result<serde_json::Value, String>;

    /// Answer a chat message.
    async fn handle_message(
        &self,
        _message: serde_json::Value,
        _host: &HostLink,
    ) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({ "acknowledged": true, "agent": self.name() }))
    }

    /// A subtask this worker delegated has reached a terminal state.
    async fn on_task_complete(&self, signal: CompletionSignal, _host: &HostLink) {
        log::debug!(
            "[Worker] {} ignoring completion for subtask {}",
            self.id(),
            signal.subtask_id
        );
    }
}
