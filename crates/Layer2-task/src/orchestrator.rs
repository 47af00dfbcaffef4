//! Task Orchestrator - 작업/워크플로 상태의 단일 소유자
//!
//! 모든 상태 전이는 여기서 커밋됩니다.
//!
//! ## 전이 커밋 (한 임계 구역 안에서)
//! 1. 상태 기계 검사 (`TaskStatus::can_transition_to`)
//! 2. 저장소 CAS 쓰기 (버전 충돌 시 `Conflict`)
//! 3. 소속 워크플로 상태 재계산 및 연쇄 취소
//! 4. 감사 이벤트 발행 (커밋 순서 유지)
//!
//! ## 사용 예시
//!
//! ```ignore
//! let orchestrator = TaskOrchestrator::assemble(&config, store, events);
//! orchestrator.delegation().register_agent(coder).await?;
//!
//! let wf = orchestrator.create_workflow("release", ExecutionMode::Sequential).await?;
//! orchestrator.add_task(wf, TaskSpec::new("build").with_capability("rust")).await?;
//! orchestrator.add_task(wf, TaskSpec::new("test").with_capability("rust")).await?;
//!
//! let report = orchestrator.run_workflow(wf).await?;
//! assert_eq!(report.status, WorkflowStatus::Completed);
//! ```

use crate::agent::AgentId;
use crate::allocator::{AllocatorConfig, ResourceAllocator};
use crate::cancel::CancelToken;
use crate::context::AgentContext;
use crate::delegation::{
    AgentMatch, DelegationConfig, DelegationManager, DelegationOutcome, ExecutionHooks, TaskRequest,
};
use crate::handoff::{
    ContextLease, HandoffConfig, HandoffManager, HandoffResult, TARGET_AGENT_CAPABLE,
};
use crate::retry::RetryPolicy;
use crate::state::{TaskStatus, WorkflowStatus};
use crate::task::{HandoffRequest, RetryRecord, Task, TaskId, TaskResult, TaskSpec};
use crate::workflow::{ExecutionMode, MemberState, Workflow, WorkflowId};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tandem_foundation::event::{
    handoff as handoff_events, system, task as task_events, workflow as workflow_events,
};
use tandem_foundation::storage::kv::{cas_json, scan_json};
use tandem_foundation::{
    keys, Error, EventBus, KvStore, OrchestrationConfig, OrchestrationEvent, Result,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// ============================================================================
// Types
// ============================================================================

/// Orchestrator configuration
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Used by tasks without their own policy
    pub default_retry_policy: RetryPolicy,
}

impl From<&OrchestrationConfig> for OrchestratorConfig {
    fn from(config: &OrchestrationConfig) -> Self {
        Self {
            default_retry_policy: RetryPolicy::from_settings(&config.delegation),
        }
    }
}

/// A requested state change
#[derive(Debug, Clone)]
pub enum Transition {
    Assign(AgentId),
    Start,
    Succeed(TaskResult),
    Fail {
        error: String,
        record: Option<RetryRecord>,
    },
    Cancel,
    /// Back to PENDING; `Some` records a failed attempt
    Requeue(Option<RetryRecord>),
    Handoff(HandoffResult),
}

impl Transition {
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Assign(_) => TaskStatus::Assigned,
            Self::Start | Self::Handoff(_) => TaskStatus::Running,
            Self::Succeed(_) => TaskStatus::Succeeded,
            Self::Fail { .. } => TaskStatus::Failed,
            Self::Cancel => TaskStatus::Cancelled,
            Self::Requeue(_) => TaskStatus::Pending,
        }
    }
}

/// Broadcast on every committed task transition
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusChange {
    pub task_id: TaskId,
    pub workflow_id: Option<WorkflowId>,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub agent: Option<AgentId>,
}

/// Result of driving a workflow
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub tasks: Vec<Task>,
    /// Tasks left PENDING with the reason (e.g. no eligible agent)
    pub blocked: Vec<(TaskId, String)>,
}

impl WorkflowReport {
    pub fn task_by_step(&self, step: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.step.as_deref() == Some(step))
    }
}

/// Summary of crash recovery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub tasks: usize,
    pub workflows: usize,
    /// ASSIGNED/RUNNING tasks returned to PENDING
    pub requeued: usize,
    pub purged_allocations: usize,
}

#[derive(Default)]
struct Tables {
    tasks: HashMap<TaskId, Task>,
    workflows: HashMap<WorkflowId, Workflow>,
}

/// Side effects collected inside a critical section
#[derive(Default)]
struct Commit {
    events: Vec<OrchestrationEvent>,
    changes: Vec<TaskStatusChange>,
    /// Tasks whose in-flight work must stop
    cancelled: Vec<TaskId>,
}

fn member(task: &Task) -> MemberState {
    MemberState {
        status: task.status,
        mandatory: task.mandatory,
    }
}

// ============================================================================
// TaskOrchestrator
// ============================================================================

/// Owns task and workflow state; drives execution
#[derive(Clone)]
pub struct TaskOrchestrator {
    tables: Arc<RwLock<Tables>>,
    /// Held from commit until events are published, to keep audit order
    publish_order: Arc<Mutex<()>>,
    delegation: Arc<DelegationManager>,
    handoff: Arc<HandoffManager>,
    allocator: Arc<ResourceAllocator>,
    events: Arc<EventBus>,
    store: Arc<dyn KvStore>,
    tokens: Arc<parking_lot::Mutex<HashMap<TaskId, CancelToken>>>,
    status_tx: broadcast::Sender<TaskStatusChange>,
    config: OrchestratorConfig,
}

impl TaskOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        delegation: Arc<DelegationManager>,
        handoff: Arc<HandoffManager>,
        store: Arc<dyn KvStore>,
        events: Arc<EventBus>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(1024);
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            publish_order: Arc::new(Mutex::new(())),
            allocator: Arc::clone(delegation.allocator()),
            delegation,
            handoff,
            events,
            store,
            tokens: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            status_tx,
            config,
        }
    }

    /// Build allocator, delegation and handoff managers from settings
    pub fn assemble(
        config: &OrchestrationConfig,
        store: Arc<dyn KvStore>,
        events: Arc<EventBus>,
    ) -> Self {
        let allocator = Arc::new(
            ResourceAllocator::new(AllocatorConfig::from(&config.allocator), events.clone())
                .with_store(store.clone()),
        );
        let delegation = Arc::new(DelegationManager::new(
            DelegationConfig::from(&config.delegation),
            allocator,
            events.clone(),
        ));
        let handoff = Arc::new(HandoffManager::new(
            HandoffConfig::from(&config.handoff),
            events.clone(),
        ));
        Self::new(
            OrchestratorConfig::from(config),
            delegation,
            handoff,
            store,
            events,
        )
    }

    pub fn delegation(&self) -> &Arc<DelegationManager> {
        &self.delegation
    }

    pub fn handoff_manager(&self) -> &Arc<HandoffManager> {
        &self.handoff
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Stream of committed task transitions
    pub fn subscribe_status(&self) -> broadcast::Receiver<TaskStatusChange> {
        self.status_tx.subscribe()
    }

    // ========================================================================
    // Workflows
    // ========================================================================

    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        mode: ExecutionMode,
    ) -> Result<WorkflowId> {
        self.create_workflow_from(Workflow::new(name, mode)).await
    }

    /// Register a prepared (empty) workflow
    pub async fn create_workflow_from(&self, mut workflow: Workflow) -> Result<WorkflowId> {
        if !workflow.tasks.is_empty() {
            return Err(Error::InvalidInput(
                "Workflow must be created empty; use add_task".to_string(),
            ));
        }
        let mut tables = self.tables.write().await;
        workflow.version = 1;
        cas_json(self.store.as_ref(), &keys::workflow(workflow.id), 0, &workflow)?;
        let id = workflow.id;
        info!(workflow_id = %id, name = %workflow.name, mode = ?workflow.mode, "Workflow created");
        tables.workflows.insert(id, workflow);
        Ok(id)
    }

    /// Add a PENDING task to an open workflow
    pub async fn add_task(&self, workflow_id: WorkflowId, spec: TaskSpec) -> Result<TaskId> {
        let mut tables = self.tables.write().await;
        let workflow = tables
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", workflow_id)))?;

        if workflow.status.is_terminal() || workflow.sealed {
            return Err(Error::InvalidInput(format!(
                "Workflow {} is closed ({})",
                workflow_id, workflow.status
            )));
        }
        if let Some(missing) = spec.depends_on.iter().find(|d| !workflow.contains(d)) {
            return Err(Error::InvalidInput(format!(
                "Dependency {} is not part of workflow {}",
                missing, workflow_id
            )));
        }

        let depends_on = spec.depends_on.clone();
        let mut task = Task::from_spec(spec, Some(workflow_id));
        task.version = 1;
        cas_json(self.store.as_ref(), &keys::task(task.id), 0, &task)?;

        let mut next = workflow;
        next.tasks.push(task.id);
        if !depends_on.is_empty() {
            next.dependencies.insert(task.id, depends_on);
        }
        self.persist_workflow(&mut next)?;

        debug!(task_id = %task.id, workflow_id = %workflow_id, description = %task.description, "Task added");
        let id = task.id;
        tables.tasks.insert(id, task);
        tables.workflows.insert(workflow_id, next);
        Ok(id)
    }

    /// No more tasks will be added; the workflow may now complete
    pub async fn seal_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowStatus> {
        let mut tables = self.tables.write().await;
        let mut commit = Commit::default();
        let mut workflow = tables
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", workflow_id)))?;
        if !workflow.sealed {
            workflow.sealed = true;
            self.persist_workflow(&mut workflow)?;
            tables.workflows.insert(workflow_id, workflow);
        }
        let status = self.recompute_locked(&mut tables, workflow_id, &mut commit)?;
        self.finish(tables, commit).await;
        Ok(status)
    }

    /// Tasks of a workflow that may start now
    pub async fn ready_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<TaskId>> {
        let tables = self.tables.read().await;
        let workflow = tables
            .workflows
            .get(&workflow_id)
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", workflow_id)))?;
        Ok(workflow.ready(|id| tables.tasks.get(id).map(member)))
    }

    /// Seal and drive to completion
    pub async fn run_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowReport> {
        self.seal_workflow(workflow_id).await?;
        self.drive(workflow_id).await
    }

    /// Like `run_workflow`, seeding every task context with `seed` (a JSON object)
    pub async fn run_workflow_seeded(
        &self,
        workflow_id: WorkflowId,
        seed: serde_json::Value,
    ) -> Result<WorkflowReport> {
        self.set_seed(workflow_id, seed).await?;
        self.run_workflow(workflow_id).await
    }

    /// Set the context seed for tasks that have not started yet
    pub async fn set_seed(&self, workflow_id: WorkflowId, seed: serde_json::Value) -> Result<()> {
        if !(seed.is_object() || seed.is_null()) {
            return Err(Error::Validation("Context seed must be a JSON object".to_string()));
        }
        let mut tables = self.tables.write().await;
        let mut workflow = tables
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", workflow_id)))?;
        workflow.seed = seed;
        self.persist_workflow(&mut workflow)?;
        tables.workflows.insert(workflow_id, workflow);
        Ok(())
    }

    /// Run ready tasks until nothing is ready or in flight. Does not seal.
    pub async fn drive(&self, workflow_id: WorkflowId) -> Result<WorkflowReport> {
        let mut running: JoinSet<(TaskId, Result<Task>)> = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, TaskId> = HashMap::new();
        let mut in_flight: HashSet<TaskId> = HashSet::new();
        let mut blocked: HashMap<TaskId, String> = HashMap::new();

        loop {
            for task_id in self.ready_tasks(workflow_id).await? {
                if in_flight.contains(&task_id) || blocked.contains_key(&task_id) {
                    continue;
                }
                let this = self.clone();
                let handle = running.spawn(async move { (task_id, this.run_task(task_id).await) });
                spawned.insert(handle.id(), task_id);
                in_flight.insert(task_id);
            }

            match running.join_next().await {
                None => break,
                Some(Ok((task_id, outcome))) => {
                    in_flight.remove(&task_id);
                    if let Err(e) = outcome {
                        warn!(task_id = %task_id, error = %e, "Task left pending");
                        blocked.insert(task_id, e.to_string());
                    }
                }
                Some(Err(join_error)) => {
                    if let Some(task_id) = spawned.get(&join_error.id()).copied() {
                        in_flight.remove(&task_id);
                        error!(task_id = %task_id, error = %join_error, "Task worker aborted");
                        blocked.insert(task_id, join_error.to_string());
                    }
                }
            }
        }

        let workflow = self.workflow(workflow_id).await?;
        let tasks = self.workflow_tasks(workflow_id).await?;
        let mut blocked: Vec<(TaskId, String)> = blocked
            .into_iter()
            .filter(|(id, _)| tasks.iter().any(|t| &t.id == id && !t.is_terminal()))
            .collect();
        blocked.sort_by_key(|(id, _)| workflow.tasks.iter().position(|t| t == id));

        Ok(WorkflowReport {
            workflow_id,
            status: workflow.status,
            tasks,
            blocked,
        })
    }

    /// Cancel every non-terminal task and stop in-flight work
    pub async fn cancel_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowStatus> {
        let mut tables = self.tables.write().await;
        let mut commit = Commit::default();
        let workflow = tables
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", workflow_id)))?;

        for task_id in &workflow.tasks {
            let active = tables.tasks.get(task_id).is_some_and(|t| !t.is_terminal());
            if active {
                self.commit_locked(&mut tables, *task_id, Transition::Cancel, &mut commit)?;
            }
        }

        let mut status = self.recompute_locked(&mut tables, workflow_id, &mut commit)?;
        if !status.is_terminal() {
            status = self.set_workflow_status_locked(
                &mut tables,
                workflow_id,
                WorkflowStatus::Cancelled,
                &mut commit,
            )?;
        }
        info!(workflow_id = %workflow_id, status = %status, "Workflow cancelled");
        self.finish(tables, commit).await;
        Ok(status)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    pub async fn assign(&self, task_id: TaskId, agent: &AgentId) -> Result<Task> {
        self.apply(task_id, Transition::Assign(agent.clone())).await
    }

    pub async fn start(&self, task_id: TaskId) -> Result<Task> {
        self.apply(task_id, Transition::Start).await
    }

    pub async fn succeed(&self, task_id: TaskId, result: TaskResult) -> Result<Task> {
        self.apply(task_id, Transition::Succeed(result)).await
    }

    pub async fn fail(&self, task_id: TaskId, error: impl Into<String>) -> Result<Task> {
        self.apply(
            task_id,
            Transition::Fail {
                error: error.into(),
                record: None,
            },
        )
        .await
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> Result<Task> {
        self.apply(task_id, Transition::Cancel).await
    }

    pub async fn requeue(&self, task_id: TaskId, retry: Option<RetryRecord>) -> Result<Task> {
        self.apply(task_id, Transition::Requeue(retry)).await
    }

    /// Record a committed handoff on the task (RUNNING → RUNNING). Idempotent.
    pub async fn commit_handoff(&self, task_id: TaskId, result: &HandoffResult) -> Result<Task> {
        self.apply(task_id, Transition::Handoff(result.clone())).await
    }

    /// Commit one transition atomically
    pub async fn apply(&self, task_id: TaskId, transition: Transition) -> Result<Task> {
        let mut tables = self.tables.write().await;
        let mut commit = Commit::default();
        let task = self.commit_locked(&mut tables, task_id, transition, &mut commit)?;
        if let Some(workflow_id) = task.workflow_id {
            self.recompute_locked(&mut tables, workflow_id, &mut commit)?;
        }
        self.finish(tables, commit).await;
        Ok(task)
    }

    /// Move the task's context from its current agent to `to`
    pub async fn handoff(
        &self,
        task_id: TaskId,
        sequence: u64,
        to: &AgentId,
    ) -> Result<HandoffResult> {
        let task = self.task(task_id).await?;
        let replay = sequence <= self.handoff.last_sequence(task_id).await;

        if !replay {
            if task.status != TaskStatus::Running {
                return Err(Error::invalid_transition("task", task.status, "handoff"));
            }
            if !self.delegation.is_capable(to, &task.capabilities).await {
                let failed = vec![TARGET_AGENT_CAPABLE.to_string()];
                warn!(task_id = %task_id, to = %to, "Handoff target lacks capabilities");
                self.events
                    .publish(handoff_events::rejected(&task_id.to_string(), sequence, &failed))
                    .await;
                return Err(Error::PreconditionFailed { failed });
            }
        }

        let from = task
            .assigned_agent
            .clone()
            .ok_or_else(|| Error::InvalidInput(format!("Task {} has no agent", task_id)))?;
        if !replay && self.handoff.owner(task_id).await.is_none() {
            self.handoff.acquire(task_id, &from).await;
        }

        let result = self.handoff.handoff(task_id, sequence, &from, to).await?;
        self.commit_handoff(task_id, &result).await?;
        Ok(result)
    }

    /// Interrupt the task's current attempt and requeue it to another agent
    pub fn redelegate(&self, task_id: TaskId) -> bool {
        match self.tokens.lock().get(&task_id) {
            Some(token) => {
                token.redelegate();
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Supervise one PENDING task until it reaches an outcome
    pub async fn run_task(&self, task_id: TaskId) -> Result<Task> {
        let task = self.task(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(Error::invalid_transition("task", task.status, "run"));
        }

        let request = TaskRequest::for_task(&task, &self.config.default_retry_policy);
        let token = CancelToken::new();
        self.tokens.lock().insert(task_id, token.clone());
        let outcome = self.delegation.execute(&task, &request, self, &token).await;
        self.tokens.lock().remove(&task_id);

        let finished = match outcome {
            Ok(DelegationOutcome::Succeeded { result, agent, attempts }) => {
                debug!(task_id = %task_id, agent = %agent, attempts, "Task succeeded");
                self.settle(task_id, Transition::Succeed(result), Some(&agent)).await
            }
            Ok(DelegationOutcome::Failed { error, last, .. }) => {
                let agent = last.agent.clone();
                self.settle(
                    task_id,
                    Transition::Fail {
                        error,
                        record: Some(last),
                    },
                    agent.as_ref(),
                )
                .await
            }
            Ok(DelegationOutcome::Cancelled) => {
                let current = self.task(task_id).await?;
                if current.is_terminal() {
                    Ok(current)
                } else {
                    self.cancel_task(task_id).await
                }
            }
            Err(e) => {
                // Leave the task claimable again
                if let Ok(current) = self.task(task_id).await {
                    if current.status.is_active() {
                        self.requeue(task_id, None).await?;
                    }
                }
                Err(e)
            }
        };

        if finished.as_ref().is_ok_and(|t| t.is_terminal()) {
            self.handoff.release(task_id).await;
        }
        finished
    }

    /// Terminal commit that tolerates a concurrent cancellation
    async fn settle(
        &self,
        task_id: TaskId,
        transition: Transition,
        agent: Option<&AgentId>,
    ) -> Result<Task> {
        match self.apply(task_id, transition).await {
            Err(Error::InvalidTransition { .. }) => {
                let current = self.task(task_id).await?;
                if current.status == TaskStatus::Cancelled {
                    let agent = agent.map(|a| a.as_str()).unwrap_or("unknown");
                    info!(task_id = %task_id, agent, "Result arrived after cancellation; discarded");
                    self.events
                        .publish(task_events::result_discarded(&task_id.to_string(), agent))
                        .await;
                    Ok(current)
                } else {
                    Err(Error::invalid_transition("task", current.status, "terminal"))
                }
            }
            other => other,
        }
    }

    /// Requeue tasks whose reservation was revoked
    pub fn spawn_preemption_listener(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.allocator.subscribe_preemptions();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(preemption) => this.on_preempted(preemption.allocation.task_id).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Preemption listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn on_preempted(&self, task_id: TaskId) {
        let token = self.tokens.lock().get(&task_id).cloned();
        if let Some(token) = token {
            token.preempt();
            return;
        }
        // No supervising worker; requeue directly
        if let Ok(task) = self.task(task_id).await {
            if task.status.is_active() {
                if let Err(e) = self.requeue(task_id, None).await {
                    warn!(task_id = %task_id, error = %e, "Failed to requeue preempted task");
                }
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn task(&self, task_id: TaskId) -> Result<Task> {
        self.tables
            .read()
            .await
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))
    }

    pub async fn workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        self.tables
            .read()
            .await
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", workflow_id)))
    }

    pub async fn workflows(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> =
            self.tables.read().await.workflows.values().cloned().collect();
        workflows.sort_by_key(|w| w.created_at);
        workflows
    }

    /// All tasks, oldest first, optionally filtered by status
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Member tasks in workflow order
    pub async fn workflow_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>> {
        let tables = self.tables.read().await;
        let workflow = tables
            .workflows
            .get(&workflow_id)
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", workflow_id)))?;
        Ok(workflow
            .tasks
            .iter()
            .filter_map(|id| tables.tasks.get(id).cloned())
            .collect())
    }

    /// Tasks instantiated from a template step
    pub async fn tasks_for_step(&self, workflow_id: WorkflowId, step: &str) -> Result<Vec<Task>> {
        Ok(self
            .workflow_tasks(workflow_id)
            .await?
            .into_iter()
            .filter(|t| t.step.as_deref() == Some(step))
            .collect())
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Reload state from the store. In-flight work did not survive, so
    /// ASSIGNED/RUNNING tasks are requeued and stale allocations purged.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let workflows: Vec<(u64, Workflow)> = scan_json(self.store.as_ref(), keys::WORKFLOW)?;
        let tasks: Vec<(u64, Task)> = scan_json(self.store.as_ref(), keys::TASK)?;
        let purged_allocations = self.allocator.purge_persisted()?;

        let mut tables = self.tables.write().await;
        let mut commit = Commit::default();
        let mut report = RestoreReport {
            tasks: tasks.len(),
            workflows: workflows.len(),
            purged_allocations,
            ..Default::default()
        };

        for (version, mut workflow) in workflows {
            workflow.version = version;
            tables.workflows.insert(workflow.id, workflow);
        }
        let mut interrupted = Vec::new();
        for (version, mut task) in tasks {
            task.version = version;
            if task.status.is_active() {
                interrupted.push(task.id);
            }
            tables.tasks.insert(task.id, task);
        }

        for task_id in interrupted {
            self.commit_locked(&mut tables, task_id, Transition::Requeue(None), &mut commit)?;
            report.requeued += 1;
        }
        let workflow_ids: Vec<WorkflowId> = tables.workflows.keys().copied().collect();
        for workflow_id in workflow_ids {
            self.recompute_locked(&mut tables, workflow_id, &mut commit)?;
        }

        info!(
            tasks = report.tasks,
            workflows = report.workflows,
            requeued = report.requeued,
            store = self.store.name(),
            "State restored"
        );
        commit
            .events
            .push(system::restored(report.tasks, report.workflows, report.requeued));
        self.finish(tables, commit).await;
        Ok(report)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn commit_locked(
        &self,
        tables: &mut Tables,
        task_id: TaskId,
        transition: Transition,
        commit: &mut Commit,
    ) -> Result<Task> {
        let current = tables
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))?;
        let target = transition.target();

        // An already committed (or superseded) sequence never moves ownership back
        if let Transition::Handoff(result) = &transition {
            if result.sequence <= current.handoff_sequence {
                return Ok(current);
            }
        }

        let legal = match (&transition, current.status) {
            (Transition::Handoff(_), from) => from == TaskStatus::Running,
            // Failed reservation before assignment: record only
            (Transition::Requeue(Some(_)), TaskStatus::Pending) => true,
            (_, from) => from != target && from.can_transition_to(target),
        };
        if !legal {
            return Err(Error::invalid_transition(
                "task",
                current.status,
                target,
            ));
        }

        let now = Utc::now();
        let mut next = current.clone();
        next.status = target;
        next.updated_at = now;
        match transition {
            Transition::Assign(agent) => next.assigned_agent = Some(agent),
            Transition::Start => {
                next.started_at.get_or_insert(now);
            }
            Transition::Succeed(result) => {
                next.result = Some(result);
                next.completed_at = Some(now);
            }
            Transition::Fail { error, record } => {
                next.last_error = Some(error);
                if let Some(record) = record {
                    next.retry_count = next.retry_count.max(record.attempt);
                    next.retry_history.push(record);
                }
                next.completed_at = Some(now);
            }
            Transition::Cancel => next.completed_at = Some(now),
            Transition::Requeue(record) => {
                next.assigned_agent = None;
                if let Some(record) = record {
                    next.retry_count = next.retry_count.max(record.attempt);
                    next.last_error = Some(record.error.clone());
                    next.retry_history.push(record);
                }
            }
            Transition::Handoff(result) => {
                next.assigned_agent = Some(result.to);
                next.handoff_sequence = next.handoff_sequence.max(result.sequence);
            }
        }

        next.version = current.version + 1;
        cas_json(self.store.as_ref(), &keys::task(task_id), current.version, &next)?;

        let agent = next.assigned_agent.clone().or(current.assigned_agent.clone());
        if current.status != next.status {
            commit.events.push(task_events::status_changed(
                &task_id.to_string(),
                current.status.as_str(),
                next.status.as_str(),
                agent.as_ref().map(|a| a.as_str()),
            ));
            commit.changes.push(TaskStatusChange {
                task_id,
                workflow_id: next.workflow_id,
                from: current.status,
                to: next.status,
                agent,
            });
        }
        if next.status == TaskStatus::Cancelled {
            commit.cancelled.push(task_id);
        }

        tables.tasks.insert(task_id, next.clone());
        Ok(next)
    }

    /// Re-derive workflow status, cascading cancellations
    fn recompute_locked(
        &self,
        tables: &mut Tables,
        workflow_id: WorkflowId,
        commit: &mut Commit,
    ) -> Result<WorkflowStatus> {
        let Some(workflow) = tables.workflows.get(&workflow_id) else {
            return Err(Error::NotFound(format!("Workflow {}", workflow_id)));
        };
        let outcome = workflow.fold(|id| tables.tasks.get(id).map(member));

        for task_id in outcome.cancel {
            debug!(task_id = %task_id, workflow_id = %workflow_id, "Cascading cancellation");
            self.commit_locked(tables, task_id, Transition::Cancel, commit)?;
        }
        self.set_workflow_status_locked(tables, workflow_id, outcome.status, commit)
    }

    fn set_workflow_status_locked(
        &self,
        tables: &mut Tables,
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        commit: &mut Commit,
    ) -> Result<WorkflowStatus> {
        let Some(current) = tables.workflows.get(&workflow_id).cloned() else {
            return Err(Error::NotFound(format!("Workflow {}", workflow_id)));
        };
        if current.status == status {
            return Ok(status);
        }

        let mut next = current.clone();
        next.status = status;
        if status.is_terminal() {
            next.sealed = true;
        }
        self.persist_workflow(&mut next)?;

        info!(workflow_id = %workflow_id, from = %current.status, to = %status, "Workflow status changed");
        commit.events.push(workflow_events::status_changed(
            &workflow_id.to_string(),
            current.status.as_str(),
            status.as_str(),
        ));
        tables.workflows.insert(workflow_id, next);
        Ok(status)
    }

    async fn apply_seed(&self, task_id: TaskId, lease: &ContextLease) -> Result<()> {
        let seed = {
            let tables = self.tables.read().await;
            tables
                .tasks
                .get(&task_id)
                .and_then(|t| t.workflow_id)
                .and_then(|wf| tables.workflows.get(&wf))
                .and_then(|wf| wf.seed.as_object().cloned())
        };
        if let Some(seed) = seed {
            self.handoff
                .with_context(lease, |ctx| {
                    for (key, value) in seed {
                        ctx.set_output(key, value);
                    }
                })
                .await?;
        }
        Ok(())
    }

    fn persist_workflow(&self, workflow: &mut Workflow) -> Result<()> {
        let expected = workflow.version;
        workflow.version = expected + 1;
        workflow.updated_at = Utc::now();
        if let Err(e) = cas_json(
            self.store.as_ref(),
            &keys::workflow(workflow.id),
            expected,
            &*workflow,
        ) {
            workflow.version = expected;
            return Err(e);
        }
        Ok(())
    }

    /// Release the table lock, then publish in commit order and signal workers
    async fn finish(&self, tables: tokio::sync::RwLockWriteGuard<'_, Tables>, commit: Commit) {
        let order = self.publish_order.lock().await;
        drop(tables);

        for change in commit.changes {
            let _ = self.status_tx.send(change);
        }
        for event in commit.events {
            self.events.publish(event).await;
        }
        drop(order);

        if !commit.cancelled.is_empty() {
            let tokens = self.tokens.lock();
            for task_id in &commit.cancelled {
                if let Some(token) = tokens.get(task_id) {
                    token.cancel();
                }
            }
        }
    }
}

// ============================================================================
// ExecutionHooks - 감독 루프의 각 단계를 커밋된 전이로 연결
// ============================================================================

#[async_trait]
impl ExecutionHooks for TaskOrchestrator {
    async fn on_assigned(&self, task_id: TaskId, agent: &AgentMatch) -> Result<()> {
        self.assign(task_id, &agent.agent_id).await.map(|_| ())
    }

    async fn on_started(&self, task_id: TaskId) -> Result<Task> {
        self.start(task_id).await
    }

    async fn on_requeued(&self, task_id: TaskId, retry: Option<&RetryRecord>) -> Result<()> {
        self.requeue(task_id, retry.cloned()).await.map(|_| ())
    }

    async fn checkout_context(
        &self,
        task_id: TaskId,
        agent: &AgentId,
    ) -> Result<(ContextLease, AgentContext)> {
        let lease = match self.handoff.current_lease(task_id).await {
            Some(lease) if &lease.agent == agent => lease,
            Some(_) => self.handoff.acquire(task_id, agent).await,
            None => {
                let lease = self.handoff.acquire(task_id, agent).await;
                self.apply_seed(task_id, &lease).await?;
                lease
            }
        };
        let context = self.handoff.checkout(&lease).await?;
        Ok((lease, context))
    }

    async fn checkin_context(&self, lease: &ContextLease, context: AgentContext) -> Result<bool> {
        Ok(self.handoff.checkin(lease, context).await)
    }

    async fn current_agent(&self, task_id: TaskId) -> Result<Option<AgentId>> {
        Ok(self.handoff.owner(task_id).await)
    }

    async fn on_handoff_requested(
        &self,
        task_id: TaskId,
        from: &AgentId,
        request: &HandoffRequest,
    ) -> Result<Option<AgentId>> {
        let task = self.task(task_id).await?;
        let target = match &request.to {
            Some(to) => to.clone(),
            None => {
                let task_request = TaskRequest::for_task(&task, &self.config.default_retry_policy);
                match self
                    .delegation
                    .delegate_excluding(&task_request, std::slice::from_ref(from))
                    .await
                {
                    Ok(found) => found.agent_id,
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "No handoff target; continuing with current agent");
                        return Ok(None);
                    }
                }
            }
        };

        let sequence = self.handoff.last_sequence(task_id).await + 1;
        match self.handoff(task_id, sequence, &target).await {
            Ok(result) => Ok(Some(result.to)),
            Err(Error::PreconditionFailed { failed }) => {
                warn!(
                    task_id = %task_id,
                    from = %from,
                    to = %target,
                    failed = ?failed,
                    reason = %request.reason,
                    "Handoff rejected; task stays with current agent"
                );
                Ok(None)
            }
            Err(Error::Timeout(reason)) => {
                warn!(task_id = %task_id, to = %target, reason = %reason, "Handoff timed out; task stays with current agent");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_foundation::MemoryKvStore;

    fn orchestrator() -> TaskOrchestrator {
        TaskOrchestrator::assemble(
            &OrchestrationConfig::default(),
            Arc::new(MemoryKvStore::new()),
            Arc::new(EventBus::new()),
        )
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let orch = orchestrator();
        let wf = orch.create_workflow("wf", ExecutionMode::Sequential).await.unwrap();
        let task = orch.add_task(wf, TaskSpec::new("t")).await.unwrap();

        let err = orch.start(task).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(orch.task(task).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_terminal_tasks_stay_terminal() {
        let orch = orchestrator();
        let wf = orch.create_workflow("wf", ExecutionMode::Sequential).await.unwrap();
        let task = orch.add_task(wf, TaskSpec::new("t")).await.unwrap();

        orch.cancel_task(task).await.unwrap();
        assert!(orch.assign(task, &AgentId::new("a")).await.is_err());
        assert!(orch.requeue(task, None).await.is_err());
    }

    #[tokio::test]
    async fn test_transitions_persist_with_versions() {
        let orch = orchestrator();
        let wf = orch.create_workflow("wf", ExecutionMode::Sequential).await.unwrap();
        let task = orch.add_task(wf, TaskSpec::new("t")).await.unwrap();

        orch.assign(task, &AgentId::new("a")).await.unwrap();
        let running = orch.start(task).await.unwrap();

        let stored = orch.store().get(&keys::task(task)).unwrap().unwrap();
        assert_eq!(stored.version, running.version);
        assert_eq!(stored.value["status"], "running");
    }

    #[tokio::test]
    async fn test_external_write_causes_conflict() {
        let orch = orchestrator();
        let wf = orch.create_workflow("wf", ExecutionMode::Sequential).await.unwrap();
        let task = orch.add_task(wf, TaskSpec::new("t")).await.unwrap();

        // Another writer bumps the stored version
        let stored = orch.store().get(&keys::task(task)).unwrap().unwrap();
        orch.store().put(&keys::task(task), stored.value).unwrap();

        let err = orch.assign(task, &AgentId::new("a")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(orch.task(task).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_sequential_failure_cascades() {
        let orch = orchestrator();
        let wf = orch.create_workflow("wf", ExecutionMode::Sequential).await.unwrap();
        let t1 = orch.add_task(wf, TaskSpec::new("1")).await.unwrap();
        let t2 = orch.add_task(wf, TaskSpec::new("2")).await.unwrap();
        let t3 = orch.add_task(wf, TaskSpec::new("3")).await.unwrap();
        orch.seal_workflow(wf).await.unwrap();

        let a = AgentId::new("a");
        for t in [t1, t2] {
            orch.assign(t, &a).await.unwrap();
            orch.start(t).await.unwrap();
        }
        orch.succeed(t1, TaskResult::success("ok")).await.unwrap();
        orch.fail(t2, "boom").await.unwrap();

        assert_eq!(orch.task(t3).await.unwrap().status, TaskStatus::Cancelled);
        assert_eq!(orch.workflow(wf).await.unwrap().status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_add_task_validates_dependencies() {
        let orch = orchestrator();
        let wf = orch.create_workflow("wf", ExecutionMode::Parallel).await.unwrap();
        let err = orch
            .add_task(wf, TaskSpec::new("t").depends_on(TaskId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        orch.seal_workflow(wf).await.unwrap();
        assert!(orch.add_task(wf, TaskSpec::new("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_status_changes_broadcast() {
        let orch = orchestrator();
        let mut rx = orch.subscribe_status();
        let wf = orch.create_workflow("wf", ExecutionMode::Sequential).await.unwrap();
        let task = orch.add_task(wf, TaskSpec::new("t")).await.unwrap();

        orch.assign(task, &AgentId::new("a")).await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.from, TaskStatus::Pending);
        assert_eq!(change.to, TaskStatus::Assigned);
        assert_eq!(change.agent, Some(AgentId::new("a")));
    }

    #[tokio::test]
    async fn test_restore_requeues_in_flight_tasks() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let events = Arc::new(EventBus::new());
        let config = OrchestrationConfig::default();

        let (wf, running, done) = {
            let orch = TaskOrchestrator::assemble(&config, store.clone(), events.clone());
            let wf = orch.create_workflow("wf", ExecutionMode::Parallel).await.unwrap();
            let running = orch.add_task(wf, TaskSpec::new("r")).await.unwrap();
            let done = orch.add_task(wf, TaskSpec::new("d")).await.unwrap();
            let a = AgentId::new("a");
            for t in [running, done] {
                orch.assign(t, &a).await.unwrap();
                orch.start(t).await.unwrap();
            }
            orch.succeed(done, TaskResult::success("ok")).await.unwrap();
            (wf, running, done)
        };

        let orch = TaskOrchestrator::assemble(&config, store, events);
        let report = orch.restore().await.unwrap();
        assert_eq!(report.tasks, 2);
        assert_eq!(report.workflows, 1);
        assert_eq!(report.requeued, 1);

        let task = orch.task(running).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent.is_none());
        assert_eq!(orch.task(done).await.unwrap().status, TaskStatus::Succeeded);
        assert_eq!(orch.ready_tasks(wf).await.unwrap(), vec![running]);
    }
}
