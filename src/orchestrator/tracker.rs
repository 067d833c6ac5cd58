// ABOUTME: In-memory tracker for active orchestrations and their delegations.
// ABOUTME: Advances delegations on completion signals and emits the final report once all are terminal.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::router::RoutingTable;
use super::types::{
    Delegation, DelegationStatus, Orchestration, OrchestrationStatus, SubTask,
};
use super::worker::CompletionSignal;
use crate::channel::Message;
use crate::providers::ProviderDispatcher;
use crate::runtime::{HostLink, preview};

const REPORT_SYSTEM_CONTEXT: &str =
    "You are a technical project manager writing a short completion report for stakeholders.";

/// Result of applying one completion signal.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// No active orchestration has an assigned delegation for this subtask.
    Unknown,
    /// The delegation was already terminal; nothing changed.
    AlreadyTerminal { orchestration_id: String },
    /// Recorded; other delegations are still outstanding.
    Progress {
        orchestration_id: String,
        remaining: usize,
    },
    /// Recorded, and every delegation is now terminal. The orchestration has
    /// moved to `Reporting`; the snapshot is what the report is built from.
    ReadyToReport(Orchestration),
}

/// Tracks orchestrations from delegation through their final report.
///
/// State lives only in this process and is dropped once the report is sent.
pub struct OrchestrationTracker {
    orchestrations: Mutex<HashMap<String, Orchestration>>,
    dispatcher: Arc<ProviderDispatcher>,
}

impl OrchestrationTracker {
    pub fn new(dispatcher: Arc<ProviderDispatcher>) -> Self {
        Self {
            orchestrations: Mutex::new(HashMap::new()),
            dispatcher,
        }
    }

    /// Register a new orchestration in `Decomposing` and return its id.
    ///
    /// An id that is already active is never reused: the new orchestration
    /// gets a suffixed id so the earlier one keeps its delegations.
    pub async fn begin(&self, id: Option<String>, title: &str) -> String {
        let mut orchestrations = self.orchestrations.lock().await;
        let requested = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut id = requested.clone();
        while orchestrations.contains_key(&id) {
            id = format!("{}-{}", requested, &Uuid::new_v4().simple().to_string()[..8]);
        }
        if id != requested {
            log::warn!(
                "[Tracker] Orchestration {} is still active; tracking the new one as {}",
                requested,
                id
            );
        }

        orchestrations.insert(
            id.clone(),
            Orchestration {
                id: id.clone(),
                title: title.to_string(),
                subtasks: Vec::new(),
                delegations: Vec::new(),
                undelegated: Vec::new(),
                status: OrchestrationStatus::Decomposing,
                started_at: jiff::Timestamp::now(),
            },
        );
        id
    }

    /// Attach the plan to a begun orchestration and create one delegation per
    /// routable subtask.
    ///
    /// The returned snapshot is `InProgress`, or already `Reporting` when no
    /// subtask could be routed.
    pub async fn delegate(
        &self,
        id: &str,
        title: &str,
        subtasks: Vec<SubTask>,
        router: &RoutingTable,
    ) -> Orchestration {
        let mut orchestrations = self.orchestrations.lock().await;
        let mut orchestration = orchestrations.remove(id).unwrap_or_else(|| Orchestration {
            id: id.to_string(),
            title: title.to_string(),
            subtasks: Vec::new(),
            delegations: Vec::new(),
            undelegated: Vec::new(),
            status: OrchestrationStatus::Decomposing,
            started_at: jiff::Timestamp::now(),
        });
        orchestration.status = OrchestrationStatus::Delegating;

        for subtask in &subtasks {
            match router.route(subtask) {
                Some(worker) => orchestration.delegations.push(Delegation {
                    subtask_id: subtask.id.clone(),
                    target_worker: worker.to_string(),
                    status: DelegationStatus::Assigned,
                    result: None,
                    error: None,
                }),
                None => orchestration.undelegated.push(subtask.id.clone()),
            }
        }
        orchestration.subtasks = subtasks;
        orchestration.status = if orchestration.delegations.is_empty() {
            OrchestrationStatus::Reporting
        } else {
            OrchestrationStatus::InProgress
        };

        log::info!(
            "[Tracker] Orchestration {} '{}': {} delegated, {} undelegated",
            orchestration.id,
            orchestration.title,
            orchestration.delegations.len(),
            orchestration.undelegated.len()
        );

        orchestrations.insert(orchestration.id.clone(), orchestration.clone());
        orchestration
    }

    /// `begin` followed by `delegate`, for a plan that is already known.
    pub async fn start(
        &self,
        id: Option<String>,
        title: &str,
        subtasks: Vec<SubTask>,
        router: &RoutingTable,
    ) -> Orchestration {
        let id = self.begin(id, title).await;
        self.delegate(&id, title, subtasks, router).await
    }

    /// Drop an orchestration that will never report, e.g. because its
    /// assignments could not be sent.
    pub async fn abandon(&self, orchestration_id: &str) -> Option<Orchestration> {
        let removed = self.orchestrations.lock().await.remove(orchestration_id);
        if removed.is_some() {
            log::warn!("[Tracker] Abandoned orchestration {}", orchestration_id);
        }
        removed
    }

    /// Apply a terminal signal to the delegation for `subtask_id`.
    ///
    /// A delegation moves out of `Assigned` at most once. The all-terminal
    /// check counts states, so completions may arrive in any order.
    pub async fn record_completion(
        &self,
        subtask_id: &str,
        outcome: Result<serde_json::Value, String>,
    ) -> CompletionOutcome {
        let mut orchestrations = self.orchestrations.lock().await;

        let owner = orchestrations
            .values()
            .filter(|o| o.status == OrchestrationStatus::InProgress)
            .find(|o| {
                o.delegations
                    .iter()
                    .any(|d| d.subtask_id == subtask_id && !d.status.is_terminal())
            })
            .or_else(|| {
                orchestrations
                    .values()
                    .find(|o| o.delegations.iter().any(|d| d.subtask_id == subtask_id))
            })
            .map(|o| o.id.clone());

        let Some(orchestration_id) = owner else {
            log::warn!("[Tracker] Completion for unknown subtask {}", subtask_id);
            return CompletionOutcome::Unknown;
        };
        let Some(orchestration) = orchestrations.get_mut(&orchestration_id) else {
            return CompletionOutcome::Unknown;
        };
        let Some(delegation) = orchestration
            .delegations
            .iter_mut()
            .find(|d| d.subtask_id == subtask_id)
        else {
            return CompletionOutcome::Unknown;
        };

        if delegation.status.is_terminal() {
            log::warn!(
                "[Tracker] Subtask {} already {:?}; ignoring repeat signal",
                subtask_id,
                delegation.status
            );
            return CompletionOutcome::AlreadyTerminal { orchestration_id };
        }

        match outcome {
            Ok(result) => {
                delegation.status = DelegationStatus::Completed;
                delegation.result = Some(result);
            }
            Err(error) => {
                delegation.status = DelegationStatus::Failed;
                delegation.error = Some(error);
            }
        }
        log::info!(
            "[Tracker] Subtask {} {:?} by {}",
            subtask_id,
            delegation.status,
            delegation.target_worker
        );

        let remaining = orchestration
            .delegations
            .iter()
            .filter(|d| !d.status.is_terminal())
            .count();
        if remaining > 0 {
            return CompletionOutcome::Progress {
                orchestration_id,
                remaining,
            };
        }

        orchestration.status = OrchestrationStatus::Reporting;
        CompletionOutcome::ReadyToReport(orchestration.clone())
    }

    /// Record a completion and, if it was the last one, emit the report.
    pub async fn on_completion(&self, signal: CompletionSignal, host: &HostLink) -> CompletionOutcome {
        let outcome = self
            .record_completion(&signal.subtask_id, signal.outcome)
            .await;
        if let CompletionOutcome::ReadyToReport(snapshot) = &outcome {
            self.report(snapshot, host).await;
        }
        outcome
    }

    /// Synthesize and emit the final report, then mark the orchestration
    /// `Completed` and discard it.
    pub async fn report(&self, snapshot: &Orchestration, host: &HostLink) -> Option<Orchestration> {
        let summary = self.synthesize_summary(snapshot).await;

        let message = Message::OrchestrationReport {
            orchestration_id: snapshot.id.clone(),
            title: snapshot.title.clone(),
            summary: summary.clone(),
            completed: snapshot.count(DelegationStatus::Completed),
            failed: snapshot.count(DelegationStatus::Failed),
            undelegated: snapshot.undelegated.len(),
        };
        if let Err(e) = host.send(&message).await {
            log::error!("[Tracker] Failed to emit report for {}: {}", snapshot.id, e);
        }
        host.log(format!("Orchestration '{}' finished:\n{}", snapshot.title, summary))
            .await;

        self.finish(&snapshot.id).await
    }

    /// Mark `Completed` and drop from the active set.
    pub async fn finish(&self, orchestration_id: &str) -> Option<Orchestration> {
        let mut orchestrations = self.orchestrations.lock().await;
        let mut orchestration = orchestrations.remove(orchestration_id)?;
        orchestration.status = OrchestrationStatus::Completed;
        log::info!(
            "[Tracker] Orchestration {} completed in {:?}",
            orchestration_id,
            jiff::Timestamp::now().duration_since(orchestration.started_at)
        );
        Some(orchestration)
    }

    pub async fn get(&self, orchestration_id: &str) -> Option<Orchestration> {
        self.orchestrations.lock().await.get(orchestration_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.orchestrations.lock().await.len()
    }

    /// LLM-written summary when available, a fixed one otherwise. Failure
    /// and undelegated notes are always appended verbatim.
    async fn synthesize_summary(&self, orchestration: &Orchestration) -> String {
        let mut lines = Vec::new();
        for delegation in &orchestration.delegations {
            let (task_type, description) = orchestration
                .subtask(&delegation.subtask_id)
                .map(|s| (s.task_type.as_str(), s.description.as_str()))
                .unwrap_or(("unknown", ""));
            let detail = match (&delegation.result, &delegation.error) {
                (_, Some(error)) => format!("FAILED: {}", error),
                (Some(result), None) => result_text(result),
                (None, None) => String::new(),
            };
            lines.push(format!(
                "- [{}] {} ({}): {}",
                task_type, description, delegation.target_worker, detail
            ));
        }

        let prompt = format!(
            "Feature: {}\n\nSubtask results:\n{}\n\nWrite a concise summary of what was delivered.",
            orchestration.title,
            lines.join("\n")
        );

        let headline = match self
            .dispatcher
            .complete(&prompt, REPORT_SYSTEM_CONTEXT, None)
            .await
        {
            Some(text) => text.trim().to_string(),
            None => format!(
                "'{}' finished: {} of {} delegated subtasks completed.",
                orchestration.title,
                orchestration.count(DelegationStatus::Completed),
                orchestration.delegations.len()
            ),
        };

        let mut notes = Vec::new();
        for delegation in &orchestration.delegations {
            if let Some(error) = &delegation.error {
                notes.push(format!(
                    "Subtask {} failed on {}: {}",
                    delegation.subtask_id, delegation.target_worker, error
                ));
            }
        }
        for subtask_id in &orchestration.undelegated {
            notes.push(format!(
                "Subtask {} was not delegated: no matching worker",
                subtask_id
            ));
        }

        if notes.is_empty() {
            headline
        } else {
            format!("{}\n\n{}", headline, notes.join("\n"))
        }
    }
}

/// Human-readable text of a worker result: its `message`/`result` string if
/// present, compact JSON otherwise.
fn result_text(result: &serde_json::Value) -> String {
    let text = ["message", "result", "response"]
        .iter()
        .find_map(|key| result.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .or_else(|| result.as_str().map(str::to_string))
        .unwrap_or_else(|| result.to_string());
    preview(&text, 300)
}
