// ABOUTME: Core orchestration types: subtasks, delegations, and orchestration records.
// ABOUTME: Defines the data that flows between the decomposer, router, and tracker.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Lenient parse for model output; anything unrecognized is `Medium`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "high" | "urgent" | "critical" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// One decomposed unit of work. Immutable once the planner has produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubTask {
    /// Unique within its orchestration.
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    pub priority: Priority,
    /// IDs of sub-tasks expected to finish first. Informational only.
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Assigned,
    Completed,
    Failed,
}

impl DelegationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DelegationStatus::Assigned)
    }
}

/// Links a subtask to the worker it was routed to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delegation {
    pub subtask_id: String,
    pub target_worker: String,
    pub status: DelegationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Decomposing,
    Delegating,
    InProgress,
    Reporting,
    Completed,
}

/// One top-level unit of work, held in memory until its report is emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Orchestration {
    pub id: String,
    pub title: String,
    pub subtasks: Vec<SubTask>,
    pub delegations: Vec<Delegation>,
    /// Subtasks no worker could be routed to; they stay pending forever.
    pub undelegated: Vec<String>,
    pub status: OrchestrationStatus,
    pub started_at: jiff::Timestamp,
}

impl Orchestration {
    pub fn all_terminal(&self) -> bool {
        self.delegations.iter().all(|d| d.status.is_terminal())
    }

    pub fn count(&self, status: DelegationStatus) -> usize {
        self.delegations.iter().filter(|d| d.status == status).count()
    }

    pub fn subtask(&self, id: &str) -> Option<&SubTask> {
        self.subtasks.iter().find(|s| s.id == id)
    }
}
