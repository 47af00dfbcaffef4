//! Workflow Engine - 템플릿을 실행 가능한 워크플로로 컴파일
//!
//! 분기점 이전의 단계만 작업으로 등록하고, 실행 후 분기 조건을 한 번만
//! 평가하여 선택된 가지의 작업만 생성합니다. 선택되지 않은 가지의 단계는
//! 작업 레코드로 만들어지지 않습니다.
//!
//! ```text
//!   write-tests → implement → run-tests ─┬─ tests_pass ──▶ review
//!                                        └─ else ───────▶ fix-1 → run-tests-1 → ...
//! ```

pub mod template;
pub mod templates;

pub use template::{
    BranchCondition, ConditionalBranch, StepOutcomes, StepSpec, TemplateRegistry, WorkflowStep,
    WorkflowTemplate,
};
pub use templates::{BugFixWorkflow, FeatureDevelopmentWorkflow, TddWorkflow};

use crate::orchestrator::{TaskOrchestrator, WorkflowReport};
use crate::task::TaskId;
use crate::workflow::{Workflow, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tandem_foundation::event::workflow as workflow_events;
use tandem_foundation::{Error, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchArm {
    Then,
    Else,
}

impl BranchArm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Then => "then",
            Self::Else => "else",
        }
    }
}

/// Audit record of one evaluated branch point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchDecision {
    pub branch: String,
    pub selected: BranchArm,
    /// Top-level step ids of the selected arm
    pub steps: Vec<String>,
    pub decided_at: DateTime<Utc>,
}

/// Result of running a template
#[derive(Debug, Clone)]
pub struct TemplateReport {
    pub template: String,
    pub workflow: WorkflowReport,
    pub decisions: Vec<BranchDecision>,
}

/// Per-workflow progress through a template
struct TemplateRun {
    template: String,
    /// Steps not yet instantiated; the front is a branch point when non-empty
    remaining: VecDeque<WorkflowStep>,
    steps: HashMap<String, TaskId>,
    decisions: Vec<BranchDecision>,
}

/// Branch decisions of finished runs, oldest first
#[derive(Default)]
struct FinishedRuns {
    order: VecDeque<WorkflowId>,
    decisions: HashMap<WorkflowId, Vec<BranchDecision>>,
}

const DEFAULT_RETAINED_RUNS: usize = 256;

// ============================================================================
// WorkflowEngine
// ============================================================================

/// Instantiates templates on a `TaskOrchestrator` and evaluates their branches
pub struct WorkflowEngine {
    orchestrator: TaskOrchestrator,
    registry: Arc<TemplateRegistry>,
    /// Runs still being driven
    runs: Mutex<HashMap<WorkflowId, Arc<Mutex<TemplateRun>>>>,
    finished: Mutex<FinishedRuns>,
    retained_runs: usize,
}

impl WorkflowEngine {
    pub fn new(orchestrator: TaskOrchestrator) -> Self {
        Self::with_registry(orchestrator, Arc::new(TemplateRegistry::builtins()))
    }

    pub fn with_registry(orchestrator: TaskOrchestrator, registry: Arc<TemplateRegistry>) -> Self {
        Self {
            orchestrator,
            registry,
            runs: Mutex::new(HashMap::new()),
            finished: Mutex::new(FinishedRuns::default()),
            retained_runs: DEFAULT_RETAINED_RUNS,
        }
    }

    /// How many finished runs keep their branch decisions queryable
    pub fn with_retained_runs(mut self, retained: usize) -> Self {
        self.retained_runs = retained;
        self
    }

    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    /// Create the workflow and register the steps before the first branch point
    pub async fn instantiate(&self, template: &dyn WorkflowTemplate) -> Result<WorkflowId> {
        let steps = template.steps();
        if steps.is_empty() {
            return Err(Error::Validation(format!(
                "Template '{}' has no steps",
                template.name()
            )));
        }

        let workflow =
            Workflow::new(template.name(), template.mode()).with_template(template.name());
        let workflow_id = self.orchestrator.create_workflow_from(workflow).await?;

        let mut run = TemplateRun {
            template: template.name().to_string(),
            remaining: steps.into(),
            steps: HashMap::new(),
            decisions: Vec::new(),
        };
        self.expand(workflow_id, &mut run).await?;

        info!(
            workflow_id = %workflow_id,
            template = %run.template,
            tasks = run.steps.len(),
            "Template instantiated"
        );
        self.runs
            .lock()
            .await
            .insert(workflow_id, Arc::new(Mutex::new(run)));
        Ok(workflow_id)
    }

    /// Instantiate and drive to completion
    pub async fn run(&self, template: &dyn WorkflowTemplate) -> Result<TemplateReport> {
        let workflow_id = self.instantiate(template).await?;
        self.resume(workflow_id).await
    }

    /// Run a registered template by name
    pub async fn run_named(&self, name: &str) -> Result<TemplateReport> {
        let template = self
            .registry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Template '{}'", name)))?;
        self.run(template.as_ref()).await
    }

    /// Drive an instantiated workflow, evaluating branch points as they are reached
    pub async fn resume(&self, workflow_id: WorkflowId) -> Result<TemplateReport> {
        let run = self
            .runs
            .lock()
            .await
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Template run for workflow {}", workflow_id)))?;
        // One driver per workflow; a second caller waits and sees the decisions made
        let mut run = run.lock().await;

        loop {
            let report = self.orchestrator.drive(workflow_id).await?;
            if report.status.is_terminal() {
                self.retire(workflow_id, &run).await;
                return Ok(self.report(&run, report));
            }
            if !report.blocked.is_empty() {
                warn!(
                    workflow_id = %workflow_id,
                    blocked = report.blocked.len(),
                    "Workflow blocked before branch evaluation"
                );
                return Ok(self.report(&run, report));
            }

            match run.remaining.pop_front() {
                None => {
                    self.orchestrator.seal_workflow(workflow_id).await?;
                    let report = self.orchestrator.drive(workflow_id).await?;
                    if report.status.is_terminal() {
                        self.retire(workflow_id, &run).await;
                    }
                    return Ok(self.report(&run, report));
                }
                Some(WorkflowStep::Branch(branch)) => {
                    self.decide(workflow_id, &mut run, branch).await?;
                    self.expand(workflow_id, &mut run).await?;
                }
                Some(WorkflowStep::Task(step)) => {
                    // expand() always stops at a branch point
                    run.remaining.push_front(WorkflowStep::Task(step));
                    self.expand(workflow_id, &mut run).await?;
                }
            }
        }
    }

    /// Branch decisions made so far
    pub async fn branch_decisions(&self, workflow_id: WorkflowId) -> Result<Vec<BranchDecision>> {
        let active = self.runs.lock().await.get(&workflow_id).cloned();
        if let Some(run) = active {
            return Ok(run.lock().await.decisions.clone());
        }
        self.finished
            .lock()
            .await
            .decisions
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Template run for workflow {}", workflow_id)))
    }

    /// Runs still being driven
    pub async fn active_runs(&self) -> usize {
        self.runs.lock().await.len()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Register task steps from the front of `remaining` up to the next branch
    async fn expand(&self, workflow_id: WorkflowId, run: &mut TemplateRun) -> Result<()> {
        while let Some(step) = run.remaining.pop_front() {
            let step = match step {
                WorkflowStep::Task(step) => step,
                branch @ WorkflowStep::Branch(_) => {
                    run.remaining.push_front(branch);
                    break;
                }
            };

            if run.steps.contains_key(&step.id) {
                return Err(Error::Validation(format!(
                    "Step '{}' instantiated twice in template '{}'",
                    step.id, run.template
                )));
            }
            let mut spec = step.task;
            for dependency in &step.depends_on {
                let task_id = run.steps.get(dependency).ok_or_else(|| {
                    Error::Validation(format!(
                        "Step '{}' depends on unknown step '{}'",
                        step.id, dependency
                    ))
                })?;
                spec = spec.depends_on(*task_id);
            }

            let task_id = self.orchestrator.add_task(workflow_id, spec).await?;
            debug!(workflow_id = %workflow_id, step = %step.id, task_id = %task_id, "Step instantiated");
            run.steps.insert(step.id, task_id);
        }
        Ok(())
    }

    async fn decide(
        &self,
        workflow_id: WorkflowId,
        run: &mut TemplateRun,
        branch: ConditionalBranch,
    ) -> Result<()> {
        let mut outcomes = StepOutcomes::new();
        for (step, task_id) in &run.steps {
            outcomes.insert(step.clone(), self.orchestrator.task(*task_id).await?);
        }

        let (selected, steps) = if branch.condition.evaluate(&outcomes) {
            (BranchArm::Then, branch.then_steps)
        } else {
            (BranchArm::Else, branch.else_steps)
        };
        let decision = BranchDecision {
            branch: branch.name,
            selected,
            steps: steps
                .iter()
                .filter_map(|s| match s {
                    WorkflowStep::Task(t) => Some(t.id.clone()),
                    WorkflowStep::Branch(_) => None,
                })
                .collect(),
            decided_at: Utc::now(),
        };

        info!(
            workflow_id = %workflow_id,
            branch = %decision.branch,
            selected = selected.as_str(),
            "Branch selected"
        );
        self.orchestrator
            .events()
            .publish(workflow_events::branch_selected(
                &workflow_id.to_string(),
                &decision.branch,
                selected.as_str(),
            ))
            .await;

        for step in steps.into_iter().rev() {
            run.remaining.push_front(step);
        }
        run.decisions.push(decision);
        Ok(())
    }

    /// Drop a terminal run, keeping its decisions within retention
    async fn retire(&self, workflow_id: WorkflowId, run: &TemplateRun) {
        if self.runs.lock().await.remove(&workflow_id).is_none() {
            return;
        }

        let mut finished = self.finished.lock().await;
        finished.order.push_back(workflow_id);
        finished.decisions.insert(workflow_id, run.decisions.clone());
        while finished.order.len() > self.retained_runs {
            if let Some(evicted) = finished.order.pop_front() {
                finished.decisions.remove(&evicted);
            }
        }
        debug!(workflow_id = %workflow_id, "Template run retired");
    }

    fn report(&self, run: &TemplateRun, workflow: WorkflowReport) -> TemplateReport {
        TemplateReport {
            template: run.template.clone(),
            workflow,
            decisions: run.decisions.clone(),
        }
    }
}
