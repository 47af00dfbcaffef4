//! Task definition and types

use crate::agent::AgentId;
use crate::retry::RetryPolicy;
use crate::state::TaskStatus;
use crate::workflow::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tandem_foundation::Error;
use uuid::Uuid;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in logs
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Validation(format!("Invalid task id '{}': {}", s, e)))
    }
}

// ============================================================================
// Priority / Limits
// ============================================================================

/// Scheduling priority. Higher variants win allocation and may preempt lower ones.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(Error::Validation(format!("Unknown priority: {}", other))),
        }
    }
}

/// Resources a task needs while it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Concurrency units reserved from the allocator
    pub units: u32,

    /// Upper bound on the cost an agent may report for one attempt
    #[serde(default)]
    pub max_budget: Option<f64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            units: 1,
            max_budget: None,
        }
    }
}

impl ResourceLimits {
    pub fn units(units: u32) -> Self {
        Self {
            units,
            ..Default::default()
        }
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.max_budget = Some(budget);
        self
    }
}

// ============================================================================
// Result / History
// ============================================================================

/// Request from an agent to continue the task under another agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRequest {
    /// Explicit target; `None` lets delegation pick the best other agent
    pub to: Option<AgentId>,
    pub reason: String,
}

/// Output of one successful agent invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Human readable output
    pub output: String,

    /// Structured output, read by branch conditions
    #[serde(default)]
    pub data: serde_json::Value,

    /// Cost reported by the agent
    #[serde(default)]
    pub cost: Option<f64>,

    /// Partial completion: hand the context to another agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffRequest>,
}

impl TaskResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Partial result asking to continue elsewhere
    pub fn handoff(reason: impl Into<String>, to: Option<AgentId>) -> Self {
        Self {
            handoff: Some(HandoffRequest {
                to,
                reason: reason.into(),
            }),
            ..Default::default()
        }
    }

    pub fn is_partial(&self) -> bool {
        self.handoff.is_some()
    }
}

/// One failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt: u32,
    pub agent: Option<AgentId>,
    pub error: String,
    /// Backoff applied before the next attempt
    pub delay_ms: u64,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Task
// ============================================================================

/// A unit of work tracked by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// Owning workflow
    pub workflow_id: Option<WorkflowId>,

    /// Template step this task was instantiated from
    #[serde(default)]
    pub step: Option<String>,

    pub description: String,

    /// Required capability names (sorted, unique)
    pub capabilities: Vec<String>,

    pub priority: TaskPriority,

    pub status: TaskStatus,

    /// A failed mandatory task fails its workflow
    pub mandatory: bool,

    pub resource_limits: ResourceLimits,

    /// Overrides the orchestrator default when set
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    /// Input handed to the agent
    #[serde(default)]
    pub input: serde_json::Value,

    pub retry_count: u32,

    #[serde(default)]
    pub retry_history: Vec<RetryRecord>,

    pub assigned_agent: Option<AgentId>,

    /// Last committed handoff sequence
    #[serde(default)]
    pub handoff_sequence: u64,

    pub last_error: Option<String>,

    pub result: Option<TaskResult>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Store version of this record
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// Create a pending task from a spec
    pub fn from_spec(spec: TaskSpec, workflow_id: Option<WorkflowId>) -> Self {
        let now = Utc::now();
        let mut capabilities = spec.capabilities;
        capabilities.sort();
        capabilities.dedup();

        Self {
            id: TaskId::new(),
            workflow_id,
            step: spec.step,
            description: spec.description,
            capabilities,
            priority: spec.priority,
            status: TaskStatus::Pending,
            mandatory: spec.mandatory,
            resource_limits: spec.resource_limits,
            retry_policy: spec.retry_policy,
            input: spec.input,
            retry_count: 0,
            retry_history: Vec::new(),
            assigned_agent: None,
            handoff_sequence: 0,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Structured output field of the committed result
    pub fn output_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.result.as_ref().and_then(|r| r.data.get(key))
    }
}

/// Everything needed to add a task to a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    pub capabilities: Vec<String>,
    pub priority: TaskPriority,
    pub mandatory: bool,
    pub resource_limits: ResourceLimits,
    pub retry_policy: Option<RetryPolicy>,
    pub input: serde_json::Value,
    /// Parallel mode only; sequential workflows run in insertion order
    pub depends_on: Vec<TaskId>,
    pub step: Option<String>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            capabilities: Vec::new(),
            priority: TaskPriority::Medium,
            mandatory: true,
            resource_limits: ResourceLimits::default(),
            retry_policy: None,
            input: serde_json::Value::Null,
            depends_on: Vec::new(),
            step: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        self.depends_on.push(task_id);
        self
    }

    /// Failure does not fail the workflow
    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }
}
