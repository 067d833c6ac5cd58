// ABOUTME: Worker runtime: the receive loop, per-message handler tasks, and the HostLink.
// ABOUTME: HostLink sends records to the host and issues blocking tool calls with timeouts.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::Mutex;

use crate::channel::{self, ChannelError, Message, RequestId, TaskSpec};
use crate::orchestrator::tool_bridge::{ToolOutcome, ToolResultBridge};
use crate::orchestrator::worker::{CompletionSignal, Worker};

/// Errors surfaced to callers of `HostLink::call`.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Tool call {tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("Tool call {tool} failed: {message}")]
    Remote { tool: String, message: String },

    #[error("Runtime shut down before tool call {tool} completed")]
    Shutdown { tool: String },

    #[error(transparent)]
    Transport(#[from] ChannelError),
}

// =============================================================================
// HostLink
// =============================================================================

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct HostLinkInner {
    agent_id: String,
    display_name: String,
    writer: Mutex<BoxedWriter>,
    bridge: ToolResultBridge,
    default_timeout: Duration,
}

/// Handle to the outbound half of the channel plus the pending-call registry.
/// Cheap to clone; every handler task holds its own copy.
#[derive(Clone)]
pub struct HostLink {
    inner: Arc<HostLinkInner>,
}

impl HostLink {
    pub fn new<W>(
        agent_id: impl Into<String>,
        display_name: impl Into<String>,
        writer: W,
        default_timeout: Duration,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(HostLinkInner {
                agent_id: agent_id.into(),
                display_name: display_name.into(),
                writer: Mutex::new(Box::new(writer)),
                bridge: ToolResultBridge::new(),
                default_timeout,
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    pub(crate) fn bridge(&self) -> &ToolResultBridge {
        &self.inner.bridge
    }

    /// Write one record. Concurrent senders are serialized so lines never interleave.
    pub async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let mut writer = self.inner.writer.lock().await;
        channel::write_message(&mut *writer, message).await
    }

    /// Invoke a named remote operation on the host and wait for its response.
    ///
    /// Only the calling task is suspended; the receive loop keeps running and
    /// resolves the call when the matching `tool_response` arrives.
    pub async fn call(
        &self,
        mcp_name: Option<&str>,
        tool_name: &str,
        args: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RpcError> {
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let pending = self.inner.bridge.register().await;
        let request_id = pending.request_id.clone();

        let request = Message::ToolCall {
            request_id: request_id.clone(),
            mcp_name: mcp_name.map(str::to_string),
            tool_name: tool_name.to_string(),
            args,
        };
        // The budget covers the write as well: a host that stops draining our
        // output must not hold the caller past its deadline.
        let exchange = async {
            self.send(&request).await?;
            let outcome = pending.receiver.await.map_err(|_| RpcError::Shutdown {
                tool: tool_name.to_string(),
            })?;
            Ok::<_, RpcError>(outcome)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(ToolOutcome::Success(value))) => Ok(value),
            Ok(Ok(ToolOutcome::Failure(message))) => Err(RpcError::Remote {
                tool: tool_name.to_string(),
                message,
            }),
            Ok(Err(e)) => {
                self.inner.bridge.abandon(&request_id).await;
                Err(e)
            }
            Err(_) => {
                self.inner.bridge.abandon(&request_id).await;
                log::warn!(
                    "[Runtime] Tool call {} (request {}) timed out after {:?}",
                    tool_name,
                    request_id,
                    timeout
                );
                Err(RpcError::Timeout {
                    tool: tool_name.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Host-side tool without an MCP server name, using the default timeout.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        self.call(None, tool_name, args, None).await
    }

    pub async fn read_file(&self, file_path: &str) -> Result<String, RpcError> {
        let response = self
            .call_tool(
                "file_system_read",
                serde_json::json!({ "agentId": self.agent_id(), "filePath": file_path }),
            )
            .await?;
        Ok(response
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    pub async fn write_file(
        &self,
        file_path: &str,
        content: &str,
    ) -> Result<serde_json::Value, RpcError> {
        self.call_tool(
            "file_system_write",
            serde_json::json!({
                "agentId": self.agent_id(),
                "filePath": file_path,
                "content": content
            }),
        )
        .await
    }

    pub async fn list_files(&self, dir_path: &str) -> Result<Vec<serde_json::Value>, RpcError> {
        let response = self
            .call_tool(
                "file_system_list",
                serde_json::json!({ "agentId": self.agent_id(), "dirPath": dir_path }),
            )
            .await?;
        Ok(response
            .get("files")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Send a log record to the host, prefixed with this worker's name.
    pub async fn log(&self, content: impl AsRef<str>) {
        let message = Message::Log {
            content: format!("[{}] {}", self.display_name(), content.as_ref()),
        };
        self.send_best_effort(&message).await;
    }

    pub async fn update_status(&self, status: &str) {
        self.send_best_effort(&Message::StatusUpdate {
            status: status.to_string(),
        })
        .await;
    }

    /// Report task progress; values outside 0..=100 are clamped.
    pub async fn update_progress(&self, progress: i64, activity: &str) {
        let progress = progress.clamp(0, 100) as u8;
        self.send_best_effort(&Message::ProgressUpdate {
            progress,
            activity: activity.to_string(),
        })
        .await;
    }

    pub async fn log_activity(&self, message: &str) {
        let timestamp = jiff::Timestamp::now().as_millisecond() as f64 / 1000.0;
        self.send_best_effort(&Message::ActivityLog {
            message: message.to_string(),
            timestamp,
        })
        .await;
    }

    async fn send_best_effort(&self, message: &Message) {
        if let Err(e) = self.send(message).await {
            log::error!("[Runtime] Failed to send {} record: {}", message.kind(), e);
        }
    }
}

// =============================================================================
// Worker Runtime
// =============================================================================

/// Lifecycle of one inbound task or chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Received,
    Executing,
    Succeeded,
    Failed,
}

type InFlight = Arc<Mutex<HashMap<u64, (Option<RequestId>, TaskState)>>>;

/// One worker process: a capability handler, the receive loop feeding it,
/// and the set of handler tasks currently in flight.
pub struct WorkerRuntime {
    worker: Arc<dyn Worker>,
    host: HostLink,
    next_ticket: AtomicU64,
    in_flight: InFlight,
}

impl WorkerRuntime {
    pub fn new(worker: Arc<dyn Worker>, host: HostLink) -> Self {
        Self {
            worker,
            host,
            next_ticket: AtomicU64::new(0),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn host(&self) -> &HostLink {
        &self.host
    }

    /// Number of task or chat handlers that have not reported yet.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Request id and lifecycle state of every unreported handler, in arrival order.
    pub async fn task_states(&self) -> Vec<(Option<RequestId>, TaskState)> {
        let in_flight = self.in_flight.lock().await;
        let mut tickets: Vec<_> = in_flight.iter().collect();
        tickets.sort_by_key(|(ticket, _)| **ticket);
        tickets.into_iter().map(|(_, entry)| entry.clone()).collect()
    }

    /// Drain the inbound channel until it closes.
    ///
    /// Malformed lines are logged and skipped. End of stream is returned as
    /// `ChannelError::Closed`; the host is expected to restart the worker.
    pub async fn run<R>(&self, reader: R) -> Result<(), ChannelError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        log::info!(
            "[Runtime] {} ({}) started and waiting for commands",
            self.host.display_name(),
            self.worker.id()
        );
        self.host
            .log(format!("{} started and ready", self.worker.name()))
            .await;

        let result = loop {
            let line = match channel::read_line(&mut reader, &mut buf).await {
                Ok(line) => line,
                Err(e) => break Err(e),
            };
            match channel::decode(&line) {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => {}
                Err(e) => {
                    log::warn!(
                        "[Runtime] Dropping malformed line ({}): {}",
                        e,
                        preview(line.trim(), 200)
                    );
                }
            }
        };

        let abandoned = self.host.bridge().close_all().await;
        match &result {
            Err(ChannelError::Closed) => log::error!(
                "[Runtime] Inbound channel closed; {} pending call(s) abandoned",
                abandoned
            ),
            Err(e) => log::error!("[Runtime] Receive loop failed: {}", e),
            Ok(()) => {}
        }
        result
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::ExecuteTask { request_id, task } => {
                log::info!(
                    "[Runtime] Executing task {}: {}",
                    request_id
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "-".to_string()),
                    preview(&task.description, 80)
                );
                let worker = self.worker.clone();
                self.spawn_handler(request_id, move |host| async move {
                    worker.execute(task, &host).await
                })
                .await;
            }
            Message::HandleMessage {
                request_id,
                message,
            } => {
                let worker = self.worker.clone();
                self.spawn_handler(request_id, move |host| async move {
                    worker.handle_message(message, &host).await
                })
                .await;
            }
            Message::ToolResponse {
                request_id,
                result,
                error,
            } => {
                self.host
                    .bridge()
                    .submit(&request_id, ToolOutcome::from_parts(result, error))
                    .await;
            }
            Message::TaskComplete {
                subtask_id,
                from,
                result,
                error,
            } => {
                let signal = CompletionSignal {
                    subtask_id,
                    from,
                    outcome: match error {
                        Some(message) => Err(message),
                        None => Ok(result.unwrap_or(serde_json::Value::Null)),
                    },
                };
                let worker = self.worker.clone();
                let host = self.host.clone();
                tokio::spawn(async move {
                    worker.on_task_complete(signal, &host).await;
                });
            }
            other => {
                log::warn!(
                    "[Runtime] Unexpected {} record from host; ignoring",
                    other.kind()
                );
            }
        }
    }

    /// Run a handler on its own task and report its outcome exactly once,
    /// tagged with the original request id. Errors and panics both become
    /// error responses.
    async fn spawn_handler<F, Fut>(&self, request_id: Option<RequestId>, handler: F)
    where
        F: FnOnce(HostLink) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.in_flight
            .lock()
            .await
            .insert(ticket, (request_id.clone(), TaskState::Received));

        let host = self.host.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            set_state(&in_flight, ticket, TaskState::Executing).await;

            let outcome = AssertUnwindSafe(handler(host.clone())).catch_unwind().await;
            let (result, error) = match outcome {
                Ok(Ok(value)) => (Some(value), None),
                Ok(Err(message)) => {
                    log::error!("[Runtime] Task execution failed: {}", message);
                    (None, Some(message))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    log::error!("[Runtime] Task handler panicked: {}", message);
                    (None, Some(format!("Task handler panicked: {}", message)))
                }
            };

            let state = if error.is_some() {
                TaskState::Failed
            } else {
                TaskState::Succeeded
            };
            set_state(&in_flight, ticket, state).await;

            let response = Message::Response {
                request_id,
                result,
                error,
            };
            if let Err(e) = host.send(&response).await {
                log::error!("[Runtime] Failed to send task response: {}", e);
            }
            in_flight.lock().await.remove(&ticket);
        });
    }
}

async fn set_state(in_flight: &InFlight, ticket: u64, state: TaskState) {
    if let Some(entry) = in_flight.lock().await.get_mut(&ticket) {
        log::debug!("[Runtime] Task {} {:?} -> {:?}", ticket, entry.1, state);
        entry.1 = state;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// First `max` characters of `text`, for log lines.
pub(crate) fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
