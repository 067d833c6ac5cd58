// ABOUTME: Pending-call registry that correlates outbound tool calls with host responses.
// ABOUTME: Callers register a request id and await a oneshot; the receive loop resolves it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, oneshot};

use crate::channel::RequestId;

/// Outcome of a remote operation as reported by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(serde_json::Value),
    Failure(String),
}

impl ToolOutcome {
    /// Build an outcome from the `result`/`error` pair of a response record.
    /// An `error` wins over a `result`; neither means a null success.
    pub fn from_parts(result: Option<serde_json::Value>, error: Option<String>) -> Self {
        match error {
            Some(message) => ToolOutcome::Failure(message),
            None => ToolOutcome::Success(result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// A registered call waiting for its response.
pub struct PendingCall {
    pub request_id: RequestId,
    pub receiver: oneshot::Receiver<ToolOutcome>,
}

struct PendingEntry {
    created_at: jiff::Timestamp,
    sender: oneshot::Sender<ToolOutcome>,
}

/// Shared registry between callers of `HostLink::call` and the receive loop.
///
/// Ids are allocated from a monotonically increasing counter, so they are
/// unique for the lifetime of the process and in particular while outstanding.
pub struct ToolResultBridge {
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl ToolResultBridge {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh request id and register it. The returned receiver
    /// resolves on `submit`, or errors if the bridge is shut down.
    pub async fn register(&self) -> PendingCall {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        pending.insert(
            id.clone(),
            PendingEntry {
                created_at: jiff::Timestamp::now(),
                sender: tx,
            },
        );
        PendingCall {
            request_id: id,
            receiver: rx,
        }
    }

    /// Deliver a response. Returns true if a pending call was found; late or
    /// unknown responses are dropped.
    pub async fn submit(&self, request_id: &RequestId, outcome: ToolOutcome) -> bool {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.remove(request_id) {
            log::debug!(
                "[Bridge] Resolved request {} after {:?}",
                request_id,
                jiff::Timestamp::now().duration_since(entry.created_at)
            );
            let _ = entry.sender.send(outcome);
            true
        } else {
            log::warn!(
                "[Bridge] No pending request for id {} (late or unknown response)",
                request_id
            );
            false
        }
    }

    /// Forget a call that stopped waiting (timeout). Returns true if it was still pending.
    pub async fn abandon(&self, request_id: &RequestId) -> bool {
        let mut pending = self.pending.lock().await;
        pending.remove(request_id).is_some()
    }

    /// Drop every pending entry so that all waiters observe shutdown.
    pub async fn close_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Default for ToolResultBridge {
    fn default() -> Self {
        Self::new()
    }
}
