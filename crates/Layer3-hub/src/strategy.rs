//! Decomposition strategies - Objective를 SubTask 목록으로 분해
//!
//! - `capability`: 필요한 역량마다 하나의 SubTask
//! - `fixed`: 고정 템플릿 (기본: plan → execute → verify)
//! - `recursive`: 다른 전략을 감싸고, 완료된 결과의 `subtasks` 배열로 추가 분해

use crate::objective::{Objective, SubTask, SubTaskSpec};
use std::sync::Arc;
use tandem_foundation::{Error, Result};
use tandem_task::TaskResult;
use tracing::debug;

/// Turns an objective into sub-tasks
pub trait DecompositionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Called once at submission
    fn decompose(&self, objective: &Objective) -> Result<Vec<SubTaskSpec>>;

    /// Extra sub-tasks spawned by a finished one. Appended, never replacing.
    fn refine(
        &self,
        _objective: &Objective,
        _subtask: &SubTask,
        _result: &TaskResult,
    ) -> Result<Vec<SubTaskSpec>> {
        Ok(Vec::new())
    }

    fn supports_refinement(&self) -> bool {
        false
    }
}

// ============================================================================
// Capability-driven
// ============================================================================

/// One sub-task per required capability
#[derive(Debug, Clone, Default)]
pub struct CapabilityDrivenStrategy;

impl DecompositionStrategy for CapabilityDrivenStrategy {
    fn name(&self) -> &str {
        "capability"
    }

    fn decompose(&self, objective: &Objective) -> Result<Vec<SubTaskSpec>> {
        if objective.capabilities.is_empty() {
            return Err(Error::Validation(
                "Capability-driven decomposition needs at least one capability".to_string(),
            ));
        }
        Ok(objective
            .capabilities
            .iter()
            .map(|capability| {
                SubTaskSpec::new(format!("{} [{}]", objective.title, capability))
                    .with_capability(capability.clone())
            })
            .collect())
    }
}

// ============================================================================
// Fixed template
// ============================================================================

/// Static list of sub-tasks. Specs without capabilities inherit the objective's.
#[derive(Debug, Clone)]
pub struct FixedTemplateStrategy {
    name: String,
    template: Vec<SubTaskSpec>,
}

impl Default for FixedTemplateStrategy {
    fn default() -> Self {
        Self::new(
            "fixed",
            vec![
                SubTaskSpec::new("Plan"),
                SubTaskSpec::new("Execute").after(0),
                SubTaskSpec::new("Verify").after(1),
            ],
        )
    }
}

impl FixedTemplateStrategy {
    pub fn new(name: impl Into<String>, template: Vec<SubTaskSpec>) -> Self {
        Self {
            name: name.into(),
            template,
        }
    }
}

impl DecompositionStrategy for FixedTemplateStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn decompose(&self, objective: &Objective) -> Result<Vec<SubTaskSpec>> {
        Ok(self
            .template
            .iter()
            .map(|spec| {
                let mut spec = spec.clone();
                spec.description = format!("{}: {}", spec.description, objective.title);
                if spec.capabilities.is_empty() {
                    spec.capabilities = objective.capabilities.clone();
                }
                spec
            })
            .collect())
    }
}

// ============================================================================
// Recursive
// ============================================================================

/// Wraps another strategy and reads follow-up work from results:
///
/// ```json
/// { "subtasks": [ { "description": "...", "capabilities": ["rust"] } ] }
/// ```
pub struct RecursiveStrategy {
    inner: Arc<dyn DecompositionStrategy>,
    max_depth: u32,
}

impl RecursiveStrategy {
    pub fn new(inner: Arc<dyn DecompositionStrategy>) -> Self {
        Self {
            inner,
            max_depth: 3,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }
}

impl DecompositionStrategy for RecursiveStrategy {
    fn name(&self) -> &str {
        "recursive"
    }

    fn decompose(&self, objective: &Objective) -> Result<Vec<SubTaskSpec>> {
        self.inner.decompose(objective)
    }

    fn refine(
        &self,
        _objective: &Objective,
        subtask: &SubTask,
        result: &TaskResult,
    ) -> Result<Vec<SubTaskSpec>> {
        if subtask.depth >= self.max_depth {
            return Ok(Vec::new());
        }
        let Some(raw) = result.data.get("subtasks") else {
            return Ok(Vec::new());
        };
        let specs: Vec<SubTaskSpec> = serde_json::from_value(raw.clone()).map_err(|e| {
            Error::Validation(format!("Sub-task {} returned malformed subtasks: {}", subtask.id, e))
        })?;
        if let Some((i, bad)) = specs
            .iter()
            .enumerate()
            .find(|(i, s)| s.depends_on.iter().any(|d| d >= i))
        {
            return Err(Error::Validation(format!(
                "Refined sub-task {} ('{}') depends on a later entry",
                i, bad.description
            )));
        }
        debug!(subtask_id = %subtask.id, count = specs.len(), depth = subtask.depth, "Refined");
        Ok(specs)
    }

    fn supports_refinement(&self) -> bool {
        true
    }
}
