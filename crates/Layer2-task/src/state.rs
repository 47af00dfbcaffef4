//! Task and workflow state machines

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tandem_foundation::Error;

/// Lifecycle of a task
///
/// ```text
/// PENDING ──► ASSIGNED ──► RUNNING ──► SUCCEEDED
///    ▲           │           │  ▲
///    └───────────┴───────────┘  └── handoff (RUNNING ─► RUNNING)
///                            └────► FAILED / CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for an agent
    Pending,

    /// Agent chosen, not yet started
    Assigned,

    /// Agent is working on it
    Running,

    Succeeded,

    Failed,

    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Holds (or is about to hold) an agent
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// Legal edges of the state machine.
    ///
    /// `Running -> Running` is only legal as a handoff commit; the orchestrator
    /// enforces that distinction.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Assigned) | (Pending, Cancelled) => true,
            (Assigned, Running)
            | (Assigned, Pending)
            | (Assigned, Failed)
            | (Assigned, Cancelled) => true,
            (Running, Running)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Pending) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Symbol for CLI listings
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Pending => "◯",
            Self::Assigned => "◎",
            Self::Running => "⟳",
            Self::Succeeded => "✓",
            Self::Failed => "✗",
            Self::Cancelled => "⊘",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(Error::Validation(format!("Unknown task status: {}", other))),
        }
    }
}

/// Lifecycle of a workflow, derived from its tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
