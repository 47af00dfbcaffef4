//! Delegation Manager - 에이전트 선택 및 감독 실행
//!
//! ## 매칭
//! 요구 capability를 모두 가진(available) 에이전트 중 점수가 가장 높은 에이전트를 고릅니다.
//!
//! ```text
//! score = coverage - load_weight * in_flight + success_weight * success_rate
//! ```
//!
//! 동점이면 agent id 오름차순. 후보가 없으면 `NoEligibleAgent`.
//!
//! ## 감독 루프 (`execute`)
//! ```text
//! match → assign → reserve → start → invoke ─┬─ Success   → 반환
//!   ▲                                          ├─ Terminal  → 반환 (재시도 없음)
//!   └──────── requeue + backoff ◄──────────────┴─ Retryable → 재시도 예산 내에서 반복
//! ```
//! 모든 경로에서 예약은 해제됩니다.

use crate::agent::{covers, Agent, AgentError, AgentId};
use crate::allocator::ResourceAllocator;
use crate::cancel::{CancelToken, Interrupt};
use crate::context::AgentContext;
use crate::handoff::ContextLease;
use crate::retry::RetryPolicy;
use crate::task::{
    HandoffRequest, ResourceLimits, RetryRecord, Task, TaskId, TaskPriority, TaskResult,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tandem_foundation::event::delegation as delegation_events;
use tandem_foundation::{DelegationSettings, Error, EventBus, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// ============================================================================
// Types
// ============================================================================

/// What a task needs from an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub capabilities: Vec<String>,
    pub priority: TaskPriority,
    pub limits: ResourceLimits,
    pub retry_policy: RetryPolicy,
}

impl TaskRequest {
    pub fn for_task(task: &Task, default_policy: &RetryPolicy) -> Self {
        Self {
            task_id: task.id,
            capabilities: task.capabilities.clone(),
            priority: task.priority,
            limits: task.resource_limits.clone(),
            retry_policy: task
                .retry_policy
                .clone()
                .unwrap_or_else(|| default_policy.clone()),
        }
    }
}

/// A scored candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMatch {
    pub agent_id: AgentId,
    pub score: f64,
    pub coverage: f64,
    pub in_flight: u32,
    pub success_rate: f64,
}

/// Per-agent counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub in_flight: u32,
    pub successes: u64,
    pub failures: u64,
}

impl AgentStats {
    /// Laplace-smoothed: an unknown agent starts at 0.5
    pub fn success_rate(&self) -> f64 {
        (self.successes as f64 + 1.0) / ((self.successes + self.failures) as f64 + 2.0)
    }
}

/// Result of a single agent attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(TaskResult),
    Retryable(String),
    Terminal(String),
}

impl From<AgentError> for AttemptOutcome {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Retryable(m) => Self::Retryable(m),
            AgentError::Terminal(m) => Self::Terminal(m),
        }
    }
}

/// Final result of a supervised execution
#[derive(Debug, Clone, PartialEq)]
pub enum DelegationOutcome {
    Succeeded {
        result: TaskResult,
        agent: AgentId,
        attempts: u32,
    },
    Failed {
        error: String,
        attempts: u32,
        /// The failure that ended execution
        last: RetryRecord,
    },
    Cancelled,
}

/// Delegation configuration
#[derive(Debug, Clone)]
pub struct DelegationConfig {
    pub load_weight: f64,
    pub success_weight: f64,
    pub attempt_timeout: Duration,
    /// Handoffs allowed within one attempt
    pub max_handoffs_per_attempt: u32,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self::from(&DelegationSettings::default())
    }
}

impl From<&DelegationSettings> for DelegationConfig {
    fn from(settings: &DelegationSettings) -> Self {
        Self {
            load_weight: settings.load_weight,
            success_weight: settings.success_weight,
            attempt_timeout: settings.attempt_timeout(),
            max_handoffs_per_attempt: settings.max_handoffs_per_attempt,
        }
    }
}

impl DelegationConfig {
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

/// Callbacks into the owner of task state. The orchestrator implements this
/// so every step of the loop is a committed transition.
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    /// PENDING → ASSIGNED
    async fn on_assigned(&self, task_id: TaskId, agent: &AgentMatch) -> Result<()>;

    /// ASSIGNED → RUNNING. Returns the committed task the agent will see.
    async fn on_started(&self, task_id: TaskId) -> Result<Task>;

    /// Back to PENDING. `retry` is `None` for preemption / re-delegation.
    async fn on_requeued(&self, task_id: TaskId, retry: Option<&RetryRecord>) -> Result<()>;

    async fn checkout_context(
        &self,
        task_id: TaskId,
        agent: &AgentId,
    ) -> Result<(ContextLease, AgentContext)>;

    /// Returns false when the lease was invalidated (context moved on)
    async fn checkin_context(&self, lease: &ContextLease, context: AgentContext) -> Result<bool>;

    /// Agent currently owning the task
    async fn current_agent(&self, task_id: TaskId) -> Result<Option<AgentId>>;

    /// Perform a handoff; `None` if it was rejected and the current agent keeps the task
    async fn on_handoff_requested(
        &self,
        task_id: TaskId,
        from: &AgentId,
        request: &HandoffRequest,
    ) -> Result<Option<AgentId>>;
}

type AgentReply = std::result::Result<TaskResult, AgentError>;

enum Invocation {
    Finished(std::result::Result<AgentReply, tokio::time::error::Elapsed>),
    Interrupted(Interrupt),
}

// ============================================================================
// DelegationManager
// ============================================================================

/// Matches tasks to agents and supervises their attempts
pub struct DelegationManager {
    /// Ordered by id for deterministic tie-breaks
    agents: RwLock<BTreeMap<AgentId, Arc<dyn Agent>>>,
    stats: SyncRwLock<HashMap<AgentId, AgentStats>>,
    allocator: Arc<ResourceAllocator>,
    events: Arc<EventBus>,
    config: DelegationConfig,
}

impl DelegationManager {
    pub fn new(
        config: DelegationConfig,
        allocator: Arc<ResourceAllocator>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            stats: SyncRwLock::new(HashMap::new()),
            allocator,
            events,
            config,
        }
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let id = agent.id();
        let mut agents = self.agents.write().await;
        if agents.contains_key(&id) {
            return Err(Error::InvalidInput(format!("Agent already registered: {}", id)));
        }
        info!(
            agent = %id,
            capabilities = ?agent.capabilities().iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Agent registered"
        );
        agents.insert(id, agent);
        Ok(())
    }

    pub async fn unregister_agent(&self, id: &AgentId) -> bool {
        let removed = self.agents.write().await.remove(id).is_some();
        if removed {
            info!(agent = %id, "Agent unregistered");
        }
        removed
    }

    pub async fn agent(&self, id: &AgentId) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.read().await.keys().cloned().collect()
    }

    /// Whether `id` is registered, available and has every capability
    pub async fn is_capable(&self, id: &AgentId, capabilities: &[String]) -> bool {
        match self.agents.read().await.get(id) {
            Some(agent) => agent.is_available() && covers(&agent.capabilities(), capabilities),
            None => false,
        }
    }

    pub fn stats(&self, id: &AgentId) -> AgentStats {
        self.stats.read().get(id).cloned().unwrap_or_default()
    }

    pub fn all_stats(&self) -> HashMap<AgentId, AgentStats> {
        self.stats.read().clone()
    }

    // ------------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------------

    /// Best eligible agent for `request`
    pub async fn delegate(&self, request: &TaskRequest) -> Result<AgentMatch> {
        self.delegate_excluding(request, &[]).await
    }

    /// Best eligible agent not in `exclude`
    pub async fn delegate_excluding(
        &self,
        request: &TaskRequest,
        exclude: &[AgentId],
    ) -> Result<AgentMatch> {
        let best = {
            let agents = self.agents.read().await;
            let stats = self.stats.read();
            self.best_match(&agents, &stats, request, exclude)
        };

        match best {
            Some(m) => {
                debug!(task_id = %request.task_id, agent = %m.agent_id, score = m.score, "Matched");
                self.events
                    .publish(delegation_events::matched(
                        &request.task_id.to_string(),
                        m.agent_id.as_str(),
                        m.score,
                    ))
                    .await;
                Ok(m)
            }
            None => Err(Error::NoEligibleAgent(request.capabilities.clone())),
        }
    }

    fn best_match(
        &self,
        agents: &BTreeMap<AgentId, Arc<dyn Agent>>,
        stats: &HashMap<AgentId, AgentStats>,
        request: &TaskRequest,
        exclude: &[AgentId],
    ) -> Option<AgentMatch> {
        let mut best: Option<AgentMatch> = None;
        for (id, agent) in agents.iter() {
            if exclude.contains(id) || !agent.is_available() {
                continue;
            }
            let capabilities = agent.capabilities();
            if !covers(&capabilities, &request.capabilities) {
                continue;
            }

            let coverage = if request.capabilities.is_empty() {
                1.0
            } else {
                let total: f64 = request
                    .capabilities
                    .iter()
                    .filter_map(|r| capabilities.iter().find(|c| &c.name == r))
                    .map(|c| c.proficiency.unwrap_or(1.0))
                    .sum();
                total / request.capabilities.len() as f64
            };
            let agent_stats = stats.get(id).cloned().unwrap_or_default();
            let success_rate = agent_stats.success_rate();
            let score = coverage - self.config.load_weight * agent_stats.in_flight as f64
                + self.config.success_weight * success_rate;

            // Strictly greater keeps the lowest id on ties
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(AgentMatch {
                    agent_id: id.clone(),
                    score,
                    coverage,
                    in_flight: agent_stats.in_flight,
                    success_rate,
                });
            }
        }
        best
    }

    // ------------------------------------------------------------------------
    // Supervised execution
    // ------------------------------------------------------------------------

    /// Run `task` to an outcome. `NoEligibleAgent` is returned as an error and
    /// leaves the task PENDING.
    pub async fn execute(
        &self,
        task: &Task,
        request: &TaskRequest,
        hooks: &dyn ExecutionHooks,
        cancel: &CancelToken,
    ) -> Result<DelegationOutcome> {
        let policy = &request.retry_policy;
        let mut failed_attempts = task.retry_count;

        loop {
            if cancel.is_cancelled() {
                return Ok(DelegationOutcome::Cancelled);
            }
            cancel.clear();

            let matched = self.delegate(request).await?;
            if let Err(e) = hooks.on_assigned(task.id, &matched).await {
                return self.abort(cancel, e);
            }

            let attempt = failed_attempts + 1;
            let allocation = tokio::select! {
                r = self.allocator.reserve_blocking(
                    task.id,
                    request.limits.units,
                    request.priority,
                    None,
                ) => r,
                signal = cancel.interrupted() => {
                    if signal == Interrupt::Cancelled {
                        return Ok(DelegationOutcome::Cancelled);
                    }
                    hooks.on_requeued(task.id, None).await?;
                    continue;
                }
            };

            // Reservation timeouts are not the agent's fault
            let (outcome, agent_id, charge_agent) = match allocation {
                Ok(allocation) => {
                    let guard = self.allocator.guard(allocation);
                    let running = match hooks.on_started(task.id).await {
                        Ok(running) => running,
                        Err(e) => {
                            drop(guard);
                            return self.abort(cancel, e);
                        }
                    };

                    let run = self
                        .run_attempt(running, request, matched.agent_id.clone(), hooks, cancel)
                        .await;
                    if let Err(e) = guard.release().await {
                        warn!(task_id = %task.id, error = %e, "Release after attempt failed");
                    }

                    match run? {
                        AttemptRun::Outcome(outcome, agent) => (outcome, agent, true),
                        AttemptRun::Interrupted(Interrupt::Cancelled) => {
                            return Ok(DelegationOutcome::Cancelled)
                        }
                        AttemptRun::Interrupted(signal) => {
                            info!(task_id = %task.id, signal = ?signal, "Attempt interrupted; requeueing");
                            hooks.on_requeued(task.id, None).await?;
                            continue;
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    (AttemptOutcome::Retryable(e.to_string()), matched.agent_id, false)
                }
                Err(e) => return Err(e),
            };

            match outcome {
                AttemptOutcome::Success(result) => {
                    self.record(&agent_id, Some(true));
                    return Ok(DelegationOutcome::Succeeded {
                        result,
                        agent: agent_id,
                        attempts: attempt,
                    });
                }
                AttemptOutcome::Terminal(error) => {
                    self.record(&agent_id, charge_agent.then_some(false));
                    return Ok(self.failed(task.id, attempt, Some(agent_id), error).await);
                }
                AttemptOutcome::Retryable(error) => {
                    self.record(&agent_id, charge_agent.then_some(false));
                    failed_attempts = attempt;
                    if !policy.allows_retry(failed_attempts) {
                        return Ok(self.failed(task.id, attempt, Some(agent_id), error).await);
                    }

                    let delay = policy.delay_for_attempt(failed_attempts);
                    let record = RetryRecord {
                        attempt,
                        agent: Some(agent_id),
                        error: error.clone(),
                        delay_ms: delay.as_millis() as u64,
                        at: Utc::now(),
                    };
                    warn!(
                        task_id = %task.id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = record.delay_ms,
                        error = %error,
                        "Retrying after error"
                    );
                    hooks.on_requeued(task.id, Some(&record)).await?;
                    self.events
                        .publish(delegation_events::retry(
                            &task.id.to_string(),
                            attempt,
                            record.delay_ms,
                            &error,
                        ))
                        .await;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        signal = cancel.interrupted() => {
                            if signal == Interrupt::Cancelled {
                                return Ok(DelegationOutcome::Cancelled);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Invoke agents for one attempt, following handoffs
    async fn run_attempt(
        &self,
        mut task: Task,
        request: &TaskRequest,
        mut agent_id: AgentId,
        hooks: &dyn ExecutionHooks,
        cancel: &CancelToken,
    ) -> Result<AttemptRun> {
        let mut handoffs = 0u32;

        loop {
            let Some(agent) = self.agent(&agent_id).await else {
                return Ok(AttemptRun::Outcome(
                    AttemptOutcome::Retryable(format!("agent {} is no longer registered", agent_id)),
                    agent_id,
                ));
            };

            let (lease, mut context) = hooks.checkout_context(task.id, &agent_id).await?;
            self.adjust_in_flight(&agent_id, 1);
            let invocation = {
                let call = tokio::time::timeout(
                    self.config.attempt_timeout,
                    agent.invoke(&task, &mut context),
                );
                tokio::select! {
                    r = call => Invocation::Finished(r),
                    signal = cancel.interrupted() => Invocation::Interrupted(signal),
                }
            };
            self.adjust_in_flight(&agent_id, -1);

            let result = match invocation {
                Invocation::Interrupted(signal) => return Ok(AttemptRun::Interrupted(signal)),
                Invocation::Finished(Err(_)) => {
                    return Ok(AttemptRun::Outcome(
                        AttemptOutcome::Retryable(format!(
                            "attempt timed out after {:?}",
                            self.config.attempt_timeout
                        )),
                        agent_id,
                    ))
                }
                Invocation::Finished(Ok(result)) => result,
            };

            if !hooks.checkin_context(&lease, context).await? {
                // Ownership moved while this agent worked; its output is stale
                match hooks.current_agent(task.id).await? {
                    Some(owner) if owner != agent_id => {
                        info!(task_id = %task.id, from = %agent_id, to = %owner, "Lease superseded");
                        task.assigned_agent = Some(owner.clone());
                        agent_id = owner;
                        continue;
                    }
                    _ => {
                        return Ok(AttemptRun::Outcome(
                            AttemptOutcome::Retryable("context lease lost".to_string()),
                            agent_id,
                        ))
                    }
                }
            }

            let result = match result {
                Ok(result) => result,
                Err(e) => return Ok(AttemptRun::Outcome(e.into(), agent_id)),
            };

            if let (Some(max), Some(cost)) = (request.limits.max_budget, result.cost) {
                if cost > max {
                    return Ok(AttemptRun::Outcome(
                        AttemptOutcome::Terminal(format!("budget exceeded: {:.2} > {:.2}", cost, max)),
                        agent_id,
                    ));
                }
            }

            let Some(handoff) = result.handoff.clone() else {
                return Ok(AttemptRun::Outcome(AttemptOutcome::Success(result), agent_id));
            };

            handoffs += 1;
            if handoffs > self.config.max_handoffs_per_attempt {
                return Ok(AttemptRun::Outcome(
                    AttemptOutcome::Terminal(format!(
                        "handoff limit of {} exceeded",
                        self.config.max_handoffs_per_attempt
                    )),
                    agent_id,
                ));
            }

            match hooks.on_handoff_requested(task.id, &agent_id, &handoff).await? {
                Some(next) => {
                    task.assigned_agent = Some(next.clone());
                    task.handoff_sequence += 1;
                    agent_id = next;
                }
                None => debug!(task_id = %task.id, agent = %agent_id, "Handoff declined; continuing"),
            }
        }
    }

    fn abort(&self, cancel: &CancelToken, error: Error) -> Result<DelegationOutcome> {
        if cancel.is_cancelled() {
            Ok(DelegationOutcome::Cancelled)
        } else {
            Err(error)
        }
    }

    async fn failed(
        &self,
        task_id: TaskId,
        attempts: u32,
        agent: Option<AgentId>,
        error: String,
    ) -> DelegationOutcome {
        warn!(task_id = %task_id, attempts, error = %error, "Delegation failed");
        self.events
            .publish(delegation_events::failed(&task_id.to_string(), attempts, &error))
            .await;
        DelegationOutcome::Failed {
            last: RetryRecord {
                attempt: attempts,
                agent,
                error: error.clone(),
                delay_ms: 0,
                at: Utc::now(),
            },
            error,
            attempts,
        }
    }

    fn adjust_in_flight(&self, id: &AgentId, delta: i32) {
        let mut stats = self.stats.write();
        let entry = stats.entry(id.clone()).or_default();
        entry.in_flight = entry.in_flight.saturating_add_signed(delta);
    }

    fn record(&self, id: &AgentId, success: Option<bool>) {
        let Some(success) = success else {
            return;
        };
        let mut stats = self.stats.write();
        let entry = stats.entry(id.clone()).or_default();
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }
}

enum AttemptRun {
    Outcome(AttemptOutcome, AgentId),
    Interrupted(Interrupt),
}
