//! Objective / SubTask model

use crate::spoke::SpokeStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tandem_foundation::{Error, Result};
use tandem_task::{AgentId, TaskId, TaskPriority, WorkflowId};
use uuid::Uuid;

// ============================================================================
// Ids
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectiveId(pub Uuid);

impl ObjectiveId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectiveId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectiveId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::InvalidInput(format!("Invalid objective id: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubTaskId(pub Uuid);

impl SubTaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Objective
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl ObjectiveStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ObjectiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-supplied goal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Objective {
    pub id: ObjectiveId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Capabilities the work as a whole needs
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Name of the decomposition strategy
    pub strategy: String,
    #[serde(default)]
    pub priority: TaskPriority,
    pub status: ObjectiveStatus,
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
    /// In creation order; refinements are appended
    #[serde(default)]
    pub subtasks: Vec<SubTaskId>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Objective {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ObjectiveId::new(),
            title: title.into(),
            description: String::new(),
            capabilities: Vec::new(),
            strategy: "capability".to_string(),
            priority: TaskPriority::Medium,
            status: ObjectiveStatus::Pending,
            workflow_id: None,
            subtasks: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        let capability = capability.into();
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation("Objective title is empty".to_string()));
        }
        if let Some(bad) = self.capabilities.iter().find(|c| c.trim().is_empty()) {
            return Err(Error::Validation(format!("Invalid capability '{}'", bad)));
        }
        Ok(())
    }
}

// ============================================================================
// SubTask
// ============================================================================

/// Decomposition output; immutable once submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskSpec {
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub input: serde_json::Value,
    /// Indexes of earlier specs in the same batch
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

fn default_required() -> bool {
    true
}

impl SubTaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            capabilities: Vec::new(),
            required: true,
            input: serde_json::Value::Null,
            depends_on: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn after(mut self, index: usize) -> Self {
        self.depends_on.push(index);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// A redelegation away from an unreachable spoke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redelegation {
    pub from: AgentId,
    pub to: AgentId,
    pub at: DateTime<Utc>,
}

/// One unit of an objective, 1:1 with an orchestrator task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub id: SubTaskId,
    pub objective_id: ObjectiveId,
    pub task_id: TaskId,
    pub spec: SubTaskSpec,
    /// 0 for the initial decomposition, +1 per refinement
    pub depth: u32,
    /// Lifecycle of the spoke currently (or last) working on it
    pub status: SpokeStatus,
    #[serde(default)]
    pub spoke: Option<AgentId>,
    /// Spoke declared unreachable while holding this subtask
    #[serde(default)]
    pub lost_from: Option<AgentId>,
    #[serde(default)]
    pub redelegations: Vec<Redelegation>,
    /// Refinement already applied
    #[serde(default)]
    pub refined: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl SubTask {
    pub fn new(objective_id: ObjectiveId, task_id: TaskId, spec: SubTaskSpec, depth: u32) -> Self {
        Self {
            id: SubTaskId::new(),
            objective_id,
            task_id,
            spec,
            depth,
            status: SpokeStatus::Idle,
            spoke: None,
            lost_from: None,
            redelegations: Vec::new(),
            refined: false,
            created_at: Utc::now(),
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objective_validation() {
        assert!(Objective::new("ship it").validate().is_ok());
        assert!(matches!(Objective::new("  ").validate(), Err(Error::Validation(_))));
        assert!(Objective::new("x").with_capability(" ").validate().is_err());
    }

    #[test]
    fn test_capabilities_deduplicated() {
        let objective = Objective::new("x").with_capability("rust").with_capability("rust");
        assert_eq!(objective.capabilities, vec!["rust"]);
    }

    #[test]
    fn test_subtask_spec_defaults_required() {
        let spec: SubTaskSpec = serde_json::from_value(serde_json::json!({
            "description": "lint"
        }))
        .unwrap();
        assert!(spec.required);
        assert!(spec.depends_on.is_empty());
    }
}
