//! Workflow template model
//!
//! 템플릿은 단계(step) 목록을 만들어내는 팩토리입니다. 단계는 작업이거나
//! 분기점(`ConditionalBranch`)이며, 분기점의 조건은 앞선 단계의 출력으로
//! 결정적으로 평가됩니다.

use crate::retry::RetryPolicy;
use crate::state::TaskStatus;
use crate::task::{ResourceLimits, Task, TaskPriority, TaskSpec};
use crate::workflow::ExecutionMode;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// ============================================================================
// Steps
// ============================================================================

/// A task step identified by a template-local id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    /// Step ids this step waits for (parallel mode)
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub task: TaskSpec,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            task: TaskSpec::new(description).with_step(id.clone()),
            id,
            depends_on: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.task = self.task.with_capability(capability);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.task = self.task.with_priority(priority);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.task = self.task.with_limits(limits);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.task = self.task.with_retry_policy(policy);
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.task = self.task.with_input(input);
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.task = self.task.optional();
        self
    }
}

/// One element of a template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowStep {
    Task(StepSpec),
    Branch(ConditionalBranch),
}

impl From<StepSpec> for WorkflowStep {
    fn from(step: StepSpec) -> Self {
        Self::Task(step)
    }
}

impl From<ConditionalBranch> for WorkflowStep {
    fn from(branch: ConditionalBranch) -> Self {
        Self::Branch(branch)
    }
}

// ============================================================================
// Branches
// ============================================================================

/// Latest task instantiated for each step id
pub type StepOutcomes = HashMap<String, Task>;

/// Predicate over the outputs of earlier steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BranchCondition {
    /// `step` succeeded and its result data has `key == value`
    OutputEquals {
        step: String,
        key: String,
        value: serde_json::Value,
    },
    StepSucceeded(String),
    All(Vec<BranchCondition>),
    Any(Vec<BranchCondition>),
    Not(Box<BranchCondition>),
}

impl BranchCondition {
    pub fn output_equals(
        step: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self::OutputEquals {
            step: step.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn succeeded(step: impl Into<String>) -> Self {
        Self::StepSucceeded(step.into())
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Pure function of `outcomes`. Unknown steps evaluate as not satisfied.
    pub fn evaluate(&self, outcomes: &StepOutcomes) -> bool {
        match self {
            Self::OutputEquals { step, key, value } => outcomes.get(step).is_some_and(|t| {
                t.status == TaskStatus::Succeeded && t.output_field(key) == Some(value)
            }),
            Self::StepSucceeded(step) => outcomes
                .get(step)
                .is_some_and(|t| t.status == TaskStatus::Succeeded),
            Self::All(conditions) => conditions.iter().all(|c| c.evaluate(outcomes)),
            Self::Any(conditions) => conditions.iter().any(|c| c.evaluate(outcomes)),
            Self::Not(condition) => !condition.evaluate(outcomes),
        }
    }
}

/// Branch point: exactly one arm is ever instantiated
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalBranch {
    pub name: String,
    pub condition: BranchCondition,
    pub then_steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub else_steps: Vec<WorkflowStep>,
}

impl ConditionalBranch {
    pub fn new(name: impl Into<String>, condition: BranchCondition) -> Self {
        Self {
            name: name.into(),
            condition,
            then_steps: Vec::new(),
            else_steps: Vec::new(),
        }
    }

    pub fn then(mut self, step: impl Into<WorkflowStep>) -> Self {
        self.then_steps.push(step.into());
        self
    }

    pub fn otherwise(mut self, step: impl Into<WorkflowStep>) -> Self {
        self.else_steps.push(step.into());
        self
    }
}

// ============================================================================
// Template trait & registry
// ============================================================================

/// Factory for workflow definitions
pub trait WorkflowTemplate: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn mode(&self) -> ExecutionMode;

    fn steps(&self) -> Vec<WorkflowStep>;
}

/// Templates by name
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<BTreeMap<String, Arc<dyn WorkflowTemplate>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the TDD, bug-fix and feature-development templates
    pub fn builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(super::TddWorkflow::default()));
        registry.register(Arc::new(super::BugFixWorkflow::default()));
        registry.register(Arc::new(super::FeatureDevelopmentWorkflow::default()));
        registry
    }

    /// Register, replacing any template with the same name
    pub fn register(&self, template: Arc<dyn WorkflowTemplate>) {
        self.templates
            .write()
            .insert(template.name().to_string(), template);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkflowTemplate>> {
        self.templates.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.read().keys().cloned().collect()
    }
}
