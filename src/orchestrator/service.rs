// ABOUTME: Capability handlers run by the worker binary: the project manager and a general assistant.
// ABOUTME: The project manager decomposes features, delegates sub-tasks, and reports when they finish.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::decomposer::Decomposer;
use super::router::RoutingTable;
use super::tracker::OrchestrationTracker;
use super::types::SubTask;
use super::worker::{CompletionSignal, Worker};
use crate::channel::{Message, TaskSpec};
use crate::memory::AgentMemory;
use crate::providers::{HistoryEntry, ProviderDispatcher};
use crate::runtime::{HostLink, preview};

/// Memory key for past feature orchestrations.
const FEATURE_ORCHESTRATION: &str = "feature_orchestration";

const PM_SYSTEM_CONTEXT: &str = "You are a Project Manager AI that decomposes features, delegates to specialized agents, and coordinates implementation. Be professional, concise, and proactive. Respond in the user's language.";

// =============================================================================
// Project Manager
// =============================================================================

/// What the project manager does with an inbound task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PmAction {
    Orchestrate,
    PlanOnly,
    Direct,
}

fn classify(task: &TaskSpec) -> PmAction {
    let task_type = task
        .task_type
        .as_deref()
        .unwrap_or("general")
        .to_lowercase();
    let description = task.description.to_lowercase();
    match task_type.as_str() {
        "feature" | "create_feature" => PmAction::Orchestrate,
        "decompose_task" => PmAction::PlanOnly,
        _ if description.contains("implement") || description.contains("create") => {
            PmAction::Orchestrate
        }
        _ => PmAction::Direct,
    }
}

/// The orchestrating worker.
pub struct ProjectManagerWorker {
    id: String,
    name: String,
    dispatcher: Arc<ProviderDispatcher>,
    decomposer: Decomposer,
    router: RoutingTable,
    tracker: OrchestrationTracker,
    memory: AgentMemory,
}

impl ProjectManagerWorker {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        dispatcher: Arc<ProviderDispatcher>,
        router: RoutingTable,
        memory: AgentMemory,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            decomposer: Decomposer::new(dispatcher.clone()),
            tracker: OrchestrationTracker::new(dispatcher.clone()),
            dispatcher,
            router,
            memory,
        }
    }

    pub fn tracker(&self) -> &OrchestrationTracker {
        &self.tracker
    }

    pub fn memory(&self) -> &AgentMemory {
        &self.memory
    }

    /// Decompose, delegate every routable sub-task, and return immediately.
    /// Completion is driven later by `task_complete` records.
    async fn orchestrate(&self, task: TaskSpec, host: &HostLink) -> Result<serde_json::Value, String> {
        let title = feature_title(&task);
        let orchestration_id = self.tracker.begin(task.id.clone(), &title).await;

        host.log(format!("Starting orchestration for '{}'", title)).await;
        host.update_status("thinking").await;

        let recalled = self
            .memory
            .best_approach(FEATURE_ORCHESTRATION, Some(title.as_str()))
            .await;
        if let Some(past) = &recalled {
            host.log(format!(
                "Recalled approach from '{}': {}",
                preview(&past.description, 50),
                past.approach
            ))
            .await;
        }

        let subtasks = self.decomposer.decompose(&title, &task.description).await;
        host.log(format!("Decomposed into {} subtasks", subtasks.len()))
            .await;

        let snapshot = self
            .tracker
            .delegate(&orchestration_id, &title, subtasks, &self.router)
            .await;
        let subtask_count = snapshot.subtasks.len();
        let assigned = snapshot.delegations.len();
        let approach = format!(
            "Decomposed into {} subtasks, delegated to {} agents",
            subtask_count, assigned
        );

        for delegation in &snapshot.delegations {
            let Some(subtask) = snapshot.subtask(&delegation.subtask_id) else {
                continue;
            };
            let message = Message::AssignTask {
                target_agent: delegation.target_worker.clone(),
                task: assignment(subtask, Some(&orchestration_id)),
            };
            if let Err(e) = host.send(&message).await {
                let error = format!("Failed to delegate subtask {}: {}", subtask.id, e);
                self.tracker.abandon(&orchestration_id).await;
                if let Err(e) = self
                    .memory
                    .record_failure(FEATURE_ORCHESTRATION, &title, &approach, &error)
                    .await
                {
                    log::warn!("[ProjectManager] Could not record failure: {}", e);
                }
                host.update_status("idle").await;
                return Err(error);
            }
            host.log(format!(
                "Assigned '{}' to {}",
                preview(&subtask.description, 50),
                delegation.target_worker
            ))
            .await;
        }

        host.update_status("idle").await;

        if let Err(e) = self
            .memory
            .record_success(
                FEATURE_ORCHESTRATION,
                &title,
                &approach,
                json!({
                    "orchestration_id": orchestration_id,
                    "subtasks_created": subtask_count,
                    "agents_involved": assigned,
                }),
                None,
            )
            .await
        {
            log::warn!("[ProjectManager] Could not record success: {}", e);
        }

        let status = if assigned == 0 {
            self.tracker.report(&snapshot, host).await;
            "completed"
        } else {
            "in_progress"
        };

        Ok(json!({
            "success": true,
            "orchestrated": true,
            "orchestration_id": orchestration_id,
            "status": status,
            "feature": title,
            "subtasks": subtask_count,
            "agents_assigned": assigned,
            "recalled_approach": recalled.map(|past| past.approach),
            "message": format!(
                "Orchestrated {} with {} subtasks across {} agents",
                title, subtask_count, assigned
            ),
        }))
    }

    async fn plan_only(&self, task: TaskSpec, host: &HostLink) -> Result<serde_json::Value, String> {
        let title = feature_title(&task);
        host.update_status("thinking").await;
        let subtasks = self.decomposer.decompose(&title, &task.description).await;
        host.update_status("idle").await;
        Ok(json!({
            "success": true,
            "feature": title,
            "subtasks": subtasks,
        }))
    }

    /// Route a non-feature task straight to one worker.
    async fn route_direct(&self, task: TaskSpec, host: &HostLink) -> Result<serde_json::Value, String> {
        let task_type = task.task_type.clone().unwrap_or_else(|| "general".to_string());
        let subtask_id = task
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let Some(worker) = self.router.route_parts(&task_type, &task.description) else {
            let title = task.title.as_deref().unwrap_or("Untitled");
            return Ok(json!({
                "success": true,
                "result": format!("PM coordinated task: {}", title),
                "message": format!("Task type '{}' processed by {}", task_type, self.name),
            }));
        };

        let message = Message::AssignTask {
            target_agent: worker.to_string(),
            task: TaskSpec {
                id: Some(subtask_id.clone()),
                task_type: Some(task_type),
                description: task.description.clone(),
                title: task.title.clone(),
                requirements: task.requirements.clone(),
                parent_task_id: task.parent_task_id.clone(),
                priority: task.priority.clone(),
            },
        };
        host.send(&message)
            .await
            .map_err(|e| format!("Failed to assign task {}: {}", subtask_id, e))?;
        host.log(format!(
            "Assigning '{}' to {}",
            preview(&task.description, 50),
            worker
        ))
        .await;

        Ok(json!({
            "subtask_id": subtask_id,
            "assigned_to": worker,
            "status": "assigned",
        }))
    }
}

#[async_trait]
impl Worker for ProjectManagerWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: TaskSpec, host: &HostLink) -> Result<serde_json::Value, String> {
        let action = classify(&task);
        log::info!(
            "[ProjectManager] Task {:?} ({:?}) -> {:?}",
            task.id,
            task.task_type,
            action
        );
        match action {
            PmAction::Orchestrate => self.orchestrate(task, host).await,
            PmAction::PlanOnly => self.plan_only(task, host).await,
            PmAction::Direct => self.route_direct(task, host).await,
        }
    }

    async fn handle_message(
        &self,
        message: serde_json::Value,
        _host: &HostLink,
    ) -> Result<serde_json::Value, String> {
        chat(&self.dispatcher, &message, PM_SYSTEM_CONTEXT).await
    }

    async fn on_task_complete(&self, signal: CompletionSignal, host: &HostLink) {
        self.tracker.on_completion(signal, host).await;
    }
}

/// Title for a feature task; `create_feature` tasks carry it in the description.
fn feature_title(task: &TaskSpec) -> String {
    match task.title.as_deref().map(str::trim) {
        Some(title) if !title.is_empty() => title.to_string(),
        _ if !task.description.trim().is_empty() => preview(task.description.trim(), 80),
        _ => "Untitled Feature".to_string(),
    }
}

/// Payload of the `assign_task` record for one planned sub-task.
fn assignment(subtask: &SubTask, parent_task_id: Option<&str>) -> TaskSpec {
    TaskSpec {
        id: Some(subtask.id.clone()),
        task_type: Some(subtask.task_type.clone()),
        description: subtask.description.clone(),
        title: None,
        requirements: None,
        parent_task_id: parent_task_id.map(str::to_string),
        priority: Some(subtask.priority.as_str().to_string()),
    }
}

// =============================================================================
// General assistant
// =============================================================================

/// Default capability handler: answers tasks and chat with a completion.
pub struct AssistantWorker {
    id: String,
    name: String,
    dispatcher: Arc<ProviderDispatcher>,
}

impl AssistantWorker {
    pub fn new(id: impl Into<String>, name: impl Into<String>, dispatcher: Arc<ProviderDispatcher>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dispatcher,
        }
    }

    fn system_context(&self) -> String {
        format!(
            "You are {}, a specialized agent ({}) in a multi-agent team. Be concise and concrete.",
            self.name, self.id
        )
    }
}

#[async_trait]
impl Worker for AssistantWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: TaskSpec, host: &HostLink) -> Result<serde_json::Value, String> {
        let task_type = task.task_type.as_deref().unwrap_or("general");
        host.update_progress(10, &format!("Working on {} task", task_type))
            .await;

        let mut prompt = String::new();
        if let Some(title) = &task.title {
            prompt.push_str(title);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&task.description);
        if let Some(requirements) = &task.requirements {
            prompt.push_str(&format!("\n\nRequirements: {}", requirements));
        }

        let text = self
            .dispatcher
            .complete(&prompt, &self.system_context(), None)
            .await
            .ok_or_else(|| format!("{} could not produce a result: no LLM provider available", self.name))?;

        host.update_progress(100, "Done").await;
        host.log_activity(&format!("Completed {} task", task_type)).await;

        Ok(json!({
            "success": true,
            "task_id": task.id,
            "result": text,
        }))
    }

    async fn handle_message(
        &self,
        message: serde_json::Value,
        _host: &HostLink,
    ) -> Result<serde_json::Value, String> {
        chat(&self.dispatcher, &message, &self.system_context()).await
    }
}

// =============================================================================
// Chat
// =============================================================================

/// Answer a chat message. The message may be a bare string or an object
/// with `content` (or `message`/`text`), optional `history`, and an
/// optional preferred `provider`.
async fn chat(
    dispatcher: &ProviderDispatcher,
    message: &serde_json::Value,
    system_context: &str,
) -> Result<serde_json::Value, String> {
    let text = message
        .as_str()
        .or_else(|| {
            ["content", "message", "text"]
                .iter()
                .find_map(|key| message.get(*key).and_then(|v| v.as_str()))
        })
        .ok_or_else(|| "Chat message has no text".to_string())?;

    let history: Vec<HistoryEntry> = message
        .get("history")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| format!("Invalid chat history: {}", e))?
        .unwrap_or_default();
    let preferred = message.get("provider").and_then(|v| v.as_str());

    let response = dispatcher
        .complete_with(text, system_context, Some(history.as_slice()), preferred)
        .await
        .ok_or_else(|| "No LLM provider produced a reply".to_string())?;

    Ok(json!({ "success": true, "response": response }))
}
