//! HubSpokeCoordinator - Objective 분해와 스포크 감독
//!
//! ## 흐름
//!
//! ```text
//! submit(Objective)
//!   └─ DecompositionStrategy::decompose ─▶ SubTask × N ─▶ Task × N (workflow)
//! run(ObjectiveId)
//!   └─ drive ─▶ DelegationManager ─▶ SpokeAdapter ─▶ worker.invoke
//!        └─ refine (재귀 전략) ─▶ SubTask 추가 ─▶ drive ...
//!   └─ seal ─▶ Objective DONE / FAILED
//! ```
//!
//! 백그라운드 liveness 모니터는 heartbeat가 끊긴 스포크를 UNREACHABLE로
//! 표시하고 해당 SubTask를 다른 스포크로 재위임합니다.

use crate::objective::{
    Objective, ObjectiveId, ObjectiveStatus, Redelegation, SubTask, SubTaskId, SubTaskSpec,
};
use crate::spoke::{publish_change, SpokeAdapter, SpokeAgent, SpokeInfo, SpokeStatus, SpokeTable};
use crate::strategy::{
    CapabilityDrivenStrategy, DecompositionStrategy, FixedTemplateStrategy, RecursiveStrategy,
};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tandem_foundation::event::{objective as objective_events, spoke as spoke_events};
use tandem_foundation::storage::kv::{cas_json, scan_json};
use tandem_foundation::{
    keys, Error, EventBus, HubSettings, KvStore, OrchestrationConfig, Result,
};
use tandem_task::{
    AgentId, ExecutionMode, RetryPolicy, Task, TaskId, TaskOrchestrator, TaskSpec, TaskStatus,
    Workflow, WorkflowId, WorkflowStatus,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

// ============================================================================
// Reports
// ============================================================================

/// One sub-task with the state of its orchestrator task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskReport {
    pub subtask: SubTask,
    pub task_status: TaskStatus,
    /// Failed attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveReport {
    pub objective: Objective,
    pub subtasks: Vec<SubTaskReport>,
}

impl ObjectiveReport {
    pub fn status(&self) -> ObjectiveStatus {
        self.objective.status
    }

    /// Every redelegation across sub-tasks, in sub-task order
    pub fn redelegations(&self) -> Vec<&Redelegation> {
        self.subtasks
            .iter()
            .flat_map(|r| r.subtask.redelegations.iter())
            .collect()
    }

    /// Sub-tasks that ended without success
    pub fn unsuccessful(&self) -> impl Iterator<Item = &SubTaskReport> {
        self.subtasks
            .iter()
            .filter(|r| matches!(r.task_status, TaskStatus::Failed | TaskStatus::Cancelled))
    }
}

// ============================================================================
// Shared hub state
// ============================================================================

#[derive(Default)]
struct HubState {
    objectives: HashMap<ObjectiveId, Objective>,
    subtasks: HashMap<SubTaskId, SubTask>,
    by_task: HashMap<TaskId, SubTaskId>,
}

/// Objective and sub-task records, shared with spoke adapters
pub(crate) struct HubShared {
    state: RwLock<HubState>,
    store: Arc<dyn KvStore>,
    events: Arc<EventBus>,
}

impl HubShared {
    fn new(store: Arc<dyn KvStore>, events: Arc<EventBus>) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            store,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn persist_objective(&self, objective: &mut Objective) -> Result<()> {
        let expected = objective.version;
        objective.version = expected + 1;
        objective.updated_at = Utc::now();
        if let Err(e) = cas_json(
            self.store.as_ref(),
            &keys::objective(objective.id),
            expected,
            &*objective,
        ) {
            objective.version = expected;
            return Err(e);
        }
        Ok(())
    }

    fn persist_subtask(&self, subtask: &mut SubTask) -> Result<()> {
        let expected = subtask.version;
        subtask.version = expected + 1;
        if let Err(e) = cas_json(
            self.store.as_ref(),
            &keys::subtask(subtask.id),
            expected,
            &*subtask,
        ) {
            subtask.version = expected;
            return Err(e);
        }
        Ok(())
    }

    /// Apply `f` to the sub-task behind `task_id` and persist it
    async fn update_subtask<F>(&self, task_id: TaskId, f: F) -> Result<Option<SubTask>>
    where
        F: FnOnce(&mut SubTask) -> bool,
    {
        let mut state = self.state.write().await;
        let Some(id) = state.by_task.get(&task_id).copied() else {
            return Ok(None);
        };
        let Some(mut subtask) = state.subtasks.get(&id).cloned() else {
            return Ok(None);
        };
        if !f(&mut subtask) {
            return Ok(None);
        }
        self.persist_subtask(&mut subtask)?;
        state.subtasks.insert(id, subtask.clone());
        Ok(Some(subtask))
    }

    /// A spoke claimed the sub-task; records a redelegation if it moved
    pub async fn spoke_assigned(&self, task_id: TaskId, spoke: &AgentId) {
        let mut moved_from = None;
        let updated = self
            .update_subtask(task_id, |subtask| {
                if let Some(from) = subtask.lost_from.take() {
                    if &from != spoke {
                        subtask.redelegations.push(Redelegation {
                            from: from.clone(),
                            to: spoke.clone(),
                            at: Utc::now(),
                        });
                        moved_from = Some(from);
                    }
                }
                subtask.spoke = Some(spoke.clone());
                subtask.status = SpokeStatus::Assigned;
                true
            })
            .await;

        match updated {
            Ok(Some(subtask)) => {
                if let Some(from) = moved_from {
                    info!(subtask_id = %subtask.id, from = %from, to = %spoke, "Redelegated");
                    self.events
                        .publish(spoke_events::redelegated(
                            &subtask.id.to_string(),
                            from.as_str(),
                            spoke.as_str(),
                        ))
                        .await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "Failed to record spoke assignment"),
        }
    }

    /// Progress reported by the spoke currently holding the sub-task
    pub async fn subtask_status(&self, task_id: TaskId, spoke: &AgentId, status: SpokeStatus) {
        let result = self
            .update_subtask(task_id, |subtask| {
                if subtask.spoke.as_ref() != Some(spoke) || subtask.status == status {
                    return false;
                }
                subtask.status = status;
                true
            })
            .await;
        if let Err(e) = result {
            warn!(task_id = %task_id, spoke = %spoke, error = %e, "Failed to record sub-task status");
        }
    }

    /// The holding spoke went silent
    async fn spoke_lost(&self, task_id: TaskId, spoke: &AgentId) {
        let result = self
            .update_subtask(task_id, |subtask| {
                subtask.lost_from = Some(spoke.clone());
                subtask.status = SpokeStatus::Unreachable;
                true
            })
            .await;
        if let Err(e) = result {
            warn!(task_id = %task_id, spoke = %spoke, error = %e, "Failed to record lost spoke");
        }
    }
}

// ============================================================================
// HubSpokeCoordinator
// ============================================================================

/// Removes an objective from the active set when its run ends
struct ActiveRun<'a> {
    active: &'a parking_lot::Mutex<HashSet<ObjectiveId>>,
    id: ObjectiveId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.id);
    }
}

/// Decomposes objectives and supervises spokes
pub struct HubSpokeCoordinator {
    orchestrator: TaskOrchestrator,
    shared: Arc<HubShared>,
    spokes: Arc<SpokeTable>,
    strategies: parking_lot::RwLock<HashMap<String, Arc<dyn DecompositionStrategy>>>,
    settings: HubSettings,
    retry_policy: RetryPolicy,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    active: parking_lot::Mutex<HashSet<ObjectiveId>>,
}

impl HubSpokeCoordinator {
    pub fn new(orchestrator: TaskOrchestrator, settings: HubSettings) -> Self {
        let shared = Arc::new(HubShared::new(
            Arc::clone(orchestrator.store()),
            Arc::clone(orchestrator.events()),
        ));
        let retry_policy = RetryPolicy {
            max_attempts: settings.max_subtask_attempts.max(1),
            ..RetryPolicy::default()
        };

        let capability: Arc<dyn DecompositionStrategy> = Arc::new(CapabilityDrivenStrategy);
        let mut strategies: HashMap<String, Arc<dyn DecompositionStrategy>> = HashMap::new();
        strategies.insert(
            "recursive".to_string(),
            Arc::new(
                RecursiveStrategy::new(Arc::clone(&capability))
                    .with_max_depth(settings.max_refinement_depth),
            ),
        );
        strategies.insert("capability".to_string(), capability);
        strategies.insert("fixed".to_string(), Arc::new(FixedTemplateStrategy::default()));

        Self {
            orchestrator,
            shared,
            spokes: Arc::new(SpokeTable::default()),
            strategies: parking_lot::RwLock::new(strategies),
            settings,
            retry_policy,
            monitor: parking_lot::Mutex::new(None),
            active: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Assemble the whole stack from settings
    pub fn from_config(
        config: &OrchestrationConfig,
        store: Arc<dyn KvStore>,
        events: Arc<EventBus>,
    ) -> Self {
        let orchestrator = TaskOrchestrator::assemble(config, store, events);
        Self::new(orchestrator, config.hub.clone())
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Add or replace a strategy under its name
    pub fn register_strategy(&self, strategy: Arc<dyn DecompositionStrategy>) {
        let name = strategy.name().to_string();
        debug!(strategy = %name, "Strategy registered");
        self.strategies.write().insert(name, strategy);
    }

    pub fn strategy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn strategy(&self, name: &str) -> Result<Arc<dyn DecompositionStrategy>> {
        self.strategies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("Unknown decomposition strategy '{}'", name)))
    }

    // ========================================================================
    // Spokes
    // ========================================================================

    pub async fn register_spoke(&self, spoke: SpokeAgent) -> Result<()> {
        let id = spoke.id();
        self.spokes.insert(&spoke)?;
        let adapter = SpokeAdapter::new(spoke, Arc::clone(&self.spokes), Arc::clone(&self.shared));
        if let Err(e) = self
            .orchestrator
            .delegation()
            .register_agent(Arc::new(adapter))
            .await
        {
            self.spokes.remove(&id);
            return Err(e);
        }
        self.ensure_monitor();
        info!(spoke = %id, "Spoke registered");
        Ok(())
    }

    /// Liveness signal from a spoke. Revives an unreachable spoke.
    pub async fn heartbeat(&self, spoke: &AgentId) -> Result<()> {
        let change = self.spokes.heartbeat(spoke)?;
        if change.is_some() {
            info!(spoke = %spoke, "Spoke reachable again");
        }
        publish_change(self.shared.events(), change).await;
        Ok(())
    }

    pub fn spokes(&self) -> Vec<SpokeInfo> {
        self.spokes.snapshot()
    }

    fn ensure_monitor(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        *monitor = Some(runtime.spawn(liveness_loop(
            Arc::clone(&self.spokes),
            Arc::clone(&self.shared),
            self.orchestrator.clone(),
            self.settings.clone(),
        )));
    }

    // ========================================================================
    // Objectives
    // ========================================================================

    /// Validate, decompose and persist an objective. Nothing runs yet.
    pub async fn submit(&self, mut objective: Objective) -> Result<ObjectiveId> {
        objective.validate()?;
        let strategy = self.strategy(&objective.strategy)?;
        let specs = strategy.decompose(&objective)?;
        if specs.is_empty() {
            return Err(Error::Validation(format!(
                "Strategy '{}' produced no sub-tasks",
                strategy.name()
            )));
        }
        check_batch(&specs)?;

        let name = format!("objective: {}", objective.title);
        let workflow = Workflow::new(name, ExecutionMode::Parallel)
            .with_template(strategy.name())
            .with_owner(objective.id.to_string());
        let workflow_id = self.orchestrator.create_workflow_from(workflow).await?;

        objective.workflow_id = Some(workflow_id);
        objective.status = ObjectiveStatus::Pending;
        objective.subtasks.clear();
        objective.version = 0;
        let objective_id = objective.id;

        {
            let mut state = self.shared.state.write().await;
            if state.objectives.contains_key(&objective_id) {
                return Err(Error::InvalidInput(format!(
                    "Objective {} already submitted",
                    objective_id
                )));
            }
            self.shared.persist_objective(&mut objective)?;
            state.objectives.insert(objective_id, objective.clone());
        }

        let count = self.attach_subtasks(&objective, workflow_id, specs, 0).await?;
        info!(
            objective_id = %objective_id,
            strategy = %objective.strategy,
            subtasks = count,
            "Objective submitted"
        );
        self.shared
            .events
            .publish(objective_events::submitted(
                &objective_id.to_string(),
                count,
                &objective.strategy,
            ))
            .await;
        Ok(objective_id)
    }

    /// Create tasks for `specs` and append them to the objective
    async fn attach_subtasks(
        &self,
        objective: &Objective,
        workflow_id: WorkflowId,
        specs: Vec<SubTaskSpec>,
        depth: u32,
    ) -> Result<usize> {
        let offset = {
            let state = self.shared.state.read().await;
            state
                .objectives
                .get(&objective.id)
                .map_or(0, |o| o.subtasks.len())
        };

        let mut created: Vec<SubTask> = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let mut task_spec = TaskSpec::new(spec.description.clone())
                .with_capabilities(spec.capabilities.iter().cloned())
                .with_priority(objective.priority)
                .with_input(spec.input.clone())
                .with_retry_policy(self.retry_policy.clone())
                .with_step(format!("subtask-{}", offset + index));
            for dep in &spec.depends_on {
                task_spec = task_spec.depends_on(created[*dep].task_id);
            }
            if !spec.required {
                task_spec = task_spec.optional();
            }
            let task_id = self.orchestrator.add_task(workflow_id, task_spec).await?;
            created.push(SubTask::new(objective.id, task_id, spec, depth));
        }

        let count = created.len();
        let mut state = self.shared.state.write().await;
        let mut next = state
            .objectives
            .get(&objective.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Objective {}", objective.id)))?;
        for mut subtask in created {
            self.shared.persist_subtask(&mut subtask)?;
            next.subtasks.push(subtask.id);
            state.by_task.insert(subtask.task_id, subtask.id);
            state.subtasks.insert(subtask.id, subtask);
        }
        self.shared.persist_objective(&mut next)?;
        state.objectives.insert(objective.id, next);
        Ok(count)
    }

    /// Execute the objective until its workflow settles
    pub async fn run(&self, objective_id: ObjectiveId) -> Result<ObjectiveReport> {
        let objective = self.objective(objective_id).await?;
        if objective.status.is_terminal() {
            return self.status(objective_id).await;
        }
        let workflow_id = objective
            .workflow_id
            .ok_or_else(|| Error::Internal(format!("Objective {} has no workflow", objective_id)))?;
        let strategy = self.strategy(&objective.strategy)?;

        if !self.active.lock().insert(objective_id) {
            return Err(Error::invalid_transition("objective", "running", "run"));
        }
        let _active = ActiveRun {
            active: &self.active,
            id: objective_id,
        };
        self.ensure_monitor();
        self.set_status(objective_id, ObjectiveStatus::Running, None).await?;

        let (status, tasks, blocked) = loop {
            let report = self.orchestrator.drive(workflow_id).await?;
            if report.status.is_terminal() {
                break (report.status, report.tasks, report.blocked);
            }
            if strategy.supports_refinement()
                && self.refine(&objective, strategy.as_ref(), &report.tasks).await? > 0
            {
                continue;
            }
            let status = self.orchestrator.seal_workflow(workflow_id).await?;
            break (status, report.tasks, report.blocked);
        };

        let (next, last_error) = match status {
            WorkflowStatus::Completed => (ObjectiveStatus::Done, None),
            WorkflowStatus::Failed => (ObjectiveStatus::Failed, first_failure(&tasks)),
            WorkflowStatus::Cancelled => (ObjectiveStatus::Cancelled, None),
            _ => (
                ObjectiveStatus::Running,
                blocked.first().map(|(_, error)| error.clone()),
            ),
        };
        if let Some(error) = &last_error {
            warn!(objective_id = %objective_id, status = %next, error = %error, "Objective did not complete");
        }
        self.set_status(objective_id, next, last_error).await?;
        self.status(objective_id).await
    }

    /// Append refined sub-tasks for finished ones. Returns how many were added.
    async fn refine(
        &self,
        objective: &Objective,
        strategy: &dyn DecompositionStrategy,
        tasks: &[Task],
    ) -> Result<usize> {
        let Some(workflow_id) = objective.workflow_id else {
            return Ok(0);
        };
        let candidates: Vec<SubTask> = {
            let state = self.shared.state.read().await;
            state
                .subtasks
                .values()
                .filter(|s| s.objective_id == objective.id && !s.refined)
                .cloned()
                .collect()
        };

        let mut added = 0;
        for subtask in candidates {
            let Some(task) = tasks.iter().find(|t| t.id == subtask.task_id) else {
                continue;
            };
            if task.status != TaskStatus::Succeeded {
                continue;
            }
            let specs = match &task.result {
                Some(result) => strategy
                    .refine(objective, &subtask, result)
                    .and_then(|specs| check_batch(&specs).map(|_| specs))
                    .unwrap_or_else(|e| {
                        warn!(subtask_id = %subtask.id, error = %e, "Refinement ignored");
                        Vec::new()
                    }),
                None => Vec::new(),
            };

            self.shared
                .update_subtask(subtask.task_id, |s| {
                    s.refined = true;
                    true
                })
                .await?;
            if specs.is_empty() {
                continue;
            }
            added += self
                .attach_subtasks(objective, workflow_id, specs, subtask.depth + 1)
                .await?;
        }
        if added > 0 {
            info!(objective_id = %objective.id, added, "Objective refined");
        }
        Ok(added)
    }

    /// Stop an objective: its workflow, tasks and in-flight spoke calls
    pub async fn cancel(&self, objective_id: ObjectiveId) -> Result<ObjectiveStatus> {
        let objective = self.objective(objective_id).await?;
        if objective.status.is_terminal() {
            return Ok(objective.status);
        }
        self.set_status(objective_id, ObjectiveStatus::Cancelled, None)
            .await?;
        if let Some(workflow_id) = objective.workflow_id {
            self.orchestrator.cancel_workflow(workflow_id).await?;
        }
        info!(objective_id = %objective_id, "Objective cancelled");
        Ok(ObjectiveStatus::Cancelled)
    }

    /// Terminal statuses are final
    async fn set_status(
        &self,
        objective_id: ObjectiveId,
        status: ObjectiveStatus,
        last_error: Option<String>,
    ) -> Result<ObjectiveStatus> {
        let from = {
            let mut state = self.shared.state.write().await;
            let mut objective = state
                .objectives
                .get(&objective_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("Objective {}", objective_id)))?;
            let from = objective.status;
            if from.is_terminal() || (from == status && last_error.is_none()) {
                return Ok(from);
            }
            objective.status = status;
            if last_error.is_some() {
                objective.last_error = last_error;
            }
            self.shared.persist_objective(&mut objective)?;
            state.objectives.insert(objective_id, objective);
            from
        };

        if from != status {
            debug!(objective_id = %objective_id, from = %from, to = %status, "Objective status changed");
            self.shared
                .events
                .publish(objective_events::status_changed(
                    &objective_id.to_string(),
                    from.as_str(),
                    status.as_str(),
                ))
                .await;
        }
        Ok(status)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn objective(&self, objective_id: ObjectiveId) -> Result<Objective> {
        self.shared
            .state
            .read()
            .await
            .objectives
            .get(&objective_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Objective {}", objective_id)))
    }

    /// All objectives, oldest first
    pub async fn objectives(&self) -> Vec<Objective> {
        let mut objectives: Vec<Objective> = self
            .shared
            .state
            .read()
            .await
            .objectives
            .values()
            .cloned()
            .collect();
        objectives.sort_by_key(|o| o.created_at);
        objectives
    }

    /// Objective owning a task, if any
    pub async fn objective_for_task(&self, task_id: TaskId) -> Option<ObjectiveId> {
        let state = self.shared.state.read().await;
        let subtask = state.by_task.get(&task_id)?;
        state.subtasks.get(subtask).map(|s| s.objective_id)
    }

    pub async fn status(&self, objective_id: ObjectiveId) -> Result<ObjectiveReport> {
        let objective = self.objective(objective_id).await?;
        let subtasks = self.subtasks(objective_id).await?;
        Ok(ObjectiveReport {
            objective,
            subtasks,
        })
    }

    /// Per-sub-task report in creation order
    pub async fn subtasks(&self, objective_id: ObjectiveId) -> Result<Vec<SubTaskReport>> {
        let subtasks: Vec<SubTask> = {
            let state = self.shared.state.read().await;
            let objective = state
                .objectives
                .get(&objective_id)
                .ok_or_else(|| Error::NotFound(format!("Objective {}", objective_id)))?;
            objective
                .subtasks
                .iter()
                .filter_map(|id| state.subtasks.get(id).cloned())
                .collect()
        };

        let tasks = join_all(subtasks.iter().map(|s| self.orchestrator.task(s.task_id))).await;
        let mut reports = Vec::with_capacity(subtasks.len());
        for (subtask, task) in subtasks.into_iter().zip(tasks) {
            let task = task?;
            reports.push(SubTaskReport {
                task_status: task.status,
                attempts: task.retry_count,
                last_error: task.last_error.clone(),
                output: task.result.as_ref().map(|r| r.output.clone()),
                subtask,
            });
        }
        Ok(reports)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Reload objective and sub-task records. Call after `TaskOrchestrator::restore`.
    pub async fn restore(&self) -> Result<usize> {
        let store = self.shared.store.as_ref();
        let objectives: Vec<(u64, Objective)> = scan_json(store, keys::OBJECTIVE)?;
        let subtasks: Vec<(u64, SubTask)> = scan_json(store, keys::SUBTASK)?;

        let mut state = self.shared.state.write().await;
        for (version, mut subtask) in subtasks {
            subtask.version = version;
            // Spokes do not survive a restart
            if subtask.status.is_working() || subtask.status == SpokeStatus::Unreachable {
                subtask.status = SpokeStatus::Idle;
                subtask.lost_from = None;
                self.shared.persist_subtask(&mut subtask)?;
            }
            state.by_task.insert(subtask.task_id, subtask.id);
            state.subtasks.insert(subtask.id, subtask);
        }
        let count = objectives.len();
        for (version, mut objective) in objectives {
            objective.version = version;
            state.objectives.insert(objective.id, objective);
        }
        info!(objectives = count, subtasks = state.subtasks.len(), "Hub state restored");
        Ok(count)
    }
}

impl Drop for HubSpokeCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Dependencies must point at earlier entries of the same batch
fn check_batch(specs: &[SubTaskSpec]) -> Result<()> {
    for (index, spec) in specs.iter().enumerate() {
        if spec.description.trim().is_empty() {
            return Err(Error::Validation(format!("Sub-task {} has no description", index)));
        }
        if let Some(dep) = spec.depends_on.iter().find(|d| **d >= index) {
            return Err(Error::Validation(format!(
                "Sub-task {} depends on {}, which is not an earlier sub-task",
                index, dep
            )));
        }
    }
    Ok(())
}

fn first_failure(tasks: &[Task]) -> Option<String> {
    tasks
        .iter()
        .filter(|t| t.mandatory && t.status == TaskStatus::Failed)
        .find_map(|t| {
            t.last_error
                .as_ref()
                .map(|e| format!("{} (after {} retries): {}", t.description, t.retry_count, e))
        })
}

/// Expire silent spokes and redelegate what they held
async fn liveness_loop(
    spokes: Arc<SpokeTable>,
    shared: Arc<HubShared>,
    orchestrator: TaskOrchestrator,
    settings: HubSettings,
) {
    let timeout = settings.liveness_timeout();
    let mut ticker = tokio::time::interval(settings.liveness_check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        for lost in spokes.expire(timeout) {
            warn!(
                spoke = %lost.spoke,
                task_id = %lost.task_id,
                silent_ms = lost.silent_for.as_millis() as u64,
                "Spoke unreachable"
            );
            publish_change(
                shared.events(),
                Some((lost.spoke.clone(), lost.from, SpokeStatus::Unreachable)),
            )
            .await;
            shared.spoke_lost(lost.task_id, &lost.spoke).await;
            if !orchestrator.redelegate(lost.task_id) {
                debug!(task_id = %lost.task_id, "No supervisor for lost task");
            }
        }
    }
}
