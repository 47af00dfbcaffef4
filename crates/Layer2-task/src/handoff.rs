//! Handoff System - 작업 컨텍스트의 에이전트 간 이전
//!
//! ## 핵심 개념
//! - Context ownership: 작업당 컨텍스트는 하나, 쓰기 가능한 소유자도 하나
//! - Lease: 소유권 증표. 소유권이 바뀔 때마다 epoch가 증가하여 이전 lease는 무효화됩니다
//! - Sequence: 핸드오프 요청 번호. 같은 (task, sequence) 재요청은 저장된 결과를 그대로 돌려줍니다
//! - Precondition: 이전 전에 모두 통과해야 하는 검사들
//!
//! ## Usage
//! ```ignore
//! let lease = handoff_mgr.acquire(task_id, &coder).await;
//! let result = handoff_mgr.handoff(task_id, 1, &coder, &reviewer).await?;
//! assert!(!handoff_mgr.validate(&lease).await);
//! ```

use crate::agent::AgentId;
use crate::context::AgentContext;
use crate::task::TaskId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tandem_foundation::event::handoff as handoff_events;
use tandem_foundation::{Error, EventBus, HandoffSettings, Result};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Types
// ============================================================================

/// Proof of context ownership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLease {
    pub task_id: TaskId,
    pub agent: AgentId,
    pub epoch: u64,
}

/// A committed handoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffResult {
    pub id: Uuid,
    pub task_id: TaskId,
    pub sequence: u64,
    pub from: AgentId,
    pub to: AgentId,
    /// Lease epoch granted to `to`
    pub epoch: u64,
    pub context_bytes: usize,
    pub timestamp: DateTime<Utc>,
}

/// Handoff statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffStats {
    pub total_handoffs: usize,
    pub rejected: usize,
    pub replayed: usize,
    /// Rejections by precondition name
    pub by_precondition: HashMap<String, usize>,
}

/// Input to precondition checks
#[derive(Debug)]
pub struct HandoffCheck<'a> {
    pub task_id: TaskId,
    pub from: &'a AgentId,
    pub to: &'a AgentId,
    pub context: &'a AgentContext,
}

/// A condition that must hold before context moves
#[async_trait]
pub trait HandoffPrecondition: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, check: &HandoffCheck<'_>) -> bool;
}

/// Serialized context must fit the receiving agent
#[derive(Debug, Clone)]
pub struct ContextSizeLimit {
    pub max_bytes: usize,
}

#[async_trait]
impl HandoffPrecondition for ContextSizeLimit {
    fn name(&self) -> &str {
        "context_size_limit"
    }

    async fn check(&self, check: &HandoffCheck<'_>) -> bool {
        check.context.size_bytes() <= self.max_bytes
    }
}

/// The sender may not leave tool calls in flight
#[derive(Debug, Clone, Default)]
pub struct NoPendingToolCalls;

#[async_trait]
impl HandoffPrecondition for NoPendingToolCalls {
    fn name(&self) -> &str {
        "no_pending_tool_calls"
    }

    async fn check(&self, check: &HandoffCheck<'_>) -> bool {
        check.context.pending_tool_calls().next().is_none()
    }
}

/// Name used when the target lacks the task's capabilities
pub const TARGET_AGENT_CAPABLE: &str = "target_agent_capable";

/// Handoff configuration
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Upper bound on precondition evaluation
    pub timeout: Duration,
    pub max_context_bytes: usize,
    /// Released tasks whose handoff records are kept for replay
    pub retained_tasks: usize,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self::from(&HandoffSettings::default())
    }
}

impl From<&HandoffSettings> for HandoffConfig {
    fn from(settings: &HandoffSettings) -> Self {
        Self {
            timeout: settings.timeout(),
            max_context_bytes: settings.max_context_bytes,
            retained_tasks: settings.retained_tasks,
        }
    }
}

// ============================================================================
// HandoffManager
// ============================================================================

struct OwnedContext {
    owner: AgentId,
    epoch: u64,
    context: AgentContext,
}

/// Committed handoffs of one task, keyed by sequence for idempotent replay
#[derive(Default)]
struct HandoffLedger {
    last_sequence: u64,
    results: BTreeMap<u64, HandoffResult>,
}

#[derive(Default)]
struct HandoffState {
    contexts: HashMap<TaskId, OwnedContext>,
    ledgers: HashMap<TaskId, HandoffLedger>,
    /// Released tasks, oldest first; their ledgers are evicted past retention
    released: VecDeque<TaskId>,
    stats: HandoffStats,
}

impl HandoffState {
    fn last_sequence(&self, task_id: TaskId) -> u64 {
        self.ledgers.get(&task_id).map_or(0, |l| l.last_sequence)
    }

    fn replay(&mut self, task_id: TaskId, sequence: u64) -> Option<HandoffResult> {
        let previous = self.ledgers.get(&task_id)?.results.get(&sequence).cloned()?;
        self.stats.replayed += 1;
        Some(previous)
    }
}

/// Owns task contexts and moves them between agents
pub struct HandoffManager {
    state: Mutex<HandoffState>,
    preconditions: RwLock<Vec<Arc<dyn HandoffPrecondition>>>,
    events: Arc<EventBus>,
    config: HandoffConfig,
}

impl HandoffManager {
    /// Create a manager with the built-in preconditions installed
    pub fn new(config: HandoffConfig, events: Arc<EventBus>) -> Self {
        let builtins: Vec<Arc<dyn HandoffPrecondition>> = vec![
            Arc::new(ContextSizeLimit {
                max_bytes: config.max_context_bytes,
            }),
            Arc::new(NoPendingToolCalls),
        ];
        Self {
            state: Mutex::new(HandoffState::default()),
            preconditions: RwLock::new(builtins),
            events,
            config,
        }
    }

    pub async fn register_precondition(&self, precondition: Arc<dyn HandoffPrecondition>) {
        debug!(name = precondition.name(), "Handoff precondition registered");
        self.preconditions.write().await.push(precondition);
    }

    pub async fn precondition_names(&self) -> Vec<String> {
        self.preconditions
            .read()
            .await
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------------

    /// Attach an existing context to a task. Fails if one is already attached.
    pub async fn attach(
        &self,
        task_id: TaskId,
        agent: &AgentId,
        mut context: AgentContext,
    ) -> Result<ContextLease> {
        let mut state = self.state.lock().await;
        if state.contexts.contains_key(&task_id) {
            return Err(Error::InvalidInput(format!(
                "Context already attached to task {}",
                task_id
            )));
        }
        context.record_owner(agent);
        state.contexts.insert(
            task_id,
            OwnedContext {
                owner: agent.clone(),
                epoch: 1,
                context,
            },
        );
        Ok(ContextLease {
            task_id,
            agent: agent.clone(),
            epoch: 1,
        })
    }

    /// Take ownership for a new attempt. Creates an empty context on first use;
    /// otherwise bumps the epoch so leases from earlier attempts go stale.
    pub async fn acquire(&self, task_id: TaskId, agent: &AgentId) -> ContextLease {
        let mut state = self.state.lock().await;
        let entry = state.contexts.entry(task_id).or_insert_with(|| OwnedContext {
            owner: agent.clone(),
            epoch: 0,
            context: AgentContext::new(task_id),
        });
        entry.owner = agent.clone();
        entry.epoch += 1;
        entry.context.record_owner(agent);
        ContextLease {
            task_id,
            agent: agent.clone(),
            epoch: entry.epoch,
        }
    }

    /// Lease for the current owner without bumping the epoch
    pub async fn current_lease(&self, task_id: TaskId) -> Option<ContextLease> {
        let state = self.state.lock().await;
        state.contexts.get(&task_id).map(|e| ContextLease {
            task_id,
            agent: e.owner.clone(),
            epoch: e.epoch,
        })
    }

    pub async fn validate(&self, lease: &ContextLease) -> bool {
        let state = self.state.lock().await;
        Self::is_valid(&state, lease)
    }

    fn is_valid(state: &HandoffState, lease: &ContextLease) -> bool {
        state
            .contexts
            .get(&lease.task_id)
            .is_some_and(|e| e.epoch == lease.epoch && e.owner == lease.agent)
    }

    pub async fn owner(&self, task_id: TaskId) -> Option<AgentId> {
        let state = self.state.lock().await;
        state.contexts.get(&task_id).map(|e| e.owner.clone())
    }

    /// Copy of the context for the lease holder
    pub async fn checkout(&self, lease: &ContextLease) -> Result<AgentContext> {
        let state = self.state.lock().await;
        if !Self::is_valid(&state, lease) {
            return Err(Error::InvalidInput(format!(
                "Stale context lease for task {} (agent {}, epoch {})",
                lease.task_id, lease.agent, lease.epoch
            )));
        }
        state
            .contexts
            .get(&lease.task_id)
            .map(|e| e.context.clone())
            .ok_or_else(|| Error::NotFound(format!("Context for task {}", lease.task_id)))
    }

    /// Write back a context. Returns false (discarding it) if the lease is stale.
    pub async fn checkin(&self, lease: &ContextLease, context: AgentContext) -> bool {
        let mut state = self.state.lock().await;
        if !Self::is_valid(&state, lease) {
            warn!(task_id = %lease.task_id, agent = %lease.agent, epoch = lease.epoch, "Discarding write from stale lease");
            return false;
        }
        if let Some(entry) = state.contexts.get_mut(&lease.task_id) {
            entry.context = context;
        }
        true
    }

    /// Mutate the context in place under a valid lease
    pub async fn with_context<R>(
        &self,
        lease: &ContextLease,
        f: impl FnOnce(&mut AgentContext) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock().await;
        if !Self::is_valid(&state, lease) {
            return Err(Error::InvalidInput(format!(
                "Stale context lease for task {}",
                lease.task_id
            )));
        }
        match state.contexts.get_mut(&lease.task_id) {
            Some(entry) => Ok(f(&mut entry.context)),
            None => Err(Error::NotFound(format!("Context for task {}", lease.task_id))),
        }
    }

    pub async fn snapshot(&self, task_id: TaskId) -> Option<AgentContext> {
        let state = self.state.lock().await;
        state.contexts.get(&task_id).map(|e| e.context.clone())
    }

    /// Drop the context of a finished task. Its handoff records stay
    /// replayable until `retained_tasks` newer tasks have been released.
    pub async fn release(&self, task_id: TaskId) -> Option<AgentContext> {
        let mut state = self.state.lock().await;
        let context = state.contexts.remove(&task_id).map(|e| e.context);

        if state.ledgers.contains_key(&task_id) && !state.released.contains(&task_id) {
            state.released.push_back(task_id);
        }
        while state.released.len() > self.config.retained_tasks {
            if let Some(evicted) = state.released.pop_front() {
                state.ledgers.remove(&evicted);
                debug!(task_id = %evicted, "Handoff records evicted");
            }
        }
        context
    }

    // ------------------------------------------------------------------------
    // Handoff
    // ------------------------------------------------------------------------

    /// Move ownership from `from` to `to`.
    ///
    /// `sequence` must be the task's last committed sequence + 1. Re-sending an
    /// already committed sequence returns the stored result without side effects.
    /// On precondition failure nothing changes and every failed precondition is named.
    pub async fn handoff(
        &self,
        task_id: TaskId,
        sequence: u64,
        from: &AgentId,
        to: &AgentId,
    ) -> Result<HandoffResult> {
        let (snapshot, epoch_seen) = {
            let mut state = self.state.lock().await;
            if let Some(previous) = state.replay(task_id, sequence) {
                debug!(task_id = %task_id, sequence, "Handoff replayed");
                return Ok(previous);
            }

            let last_sequence = state.last_sequence(task_id);
            let entry = state
                .contexts
                .get(&task_id)
                .ok_or_else(|| Error::NotFound(format!("Context for task {}", task_id)))?;
            if &entry.owner != from {
                return Err(Error::InvalidInput(format!(
                    "Agent {} does not own task {} (owner: {})",
                    from, task_id, entry.owner
                )));
            }
            if from == to {
                return Err(Error::InvalidInput("Handoff to the current owner".to_string()));
            }
            if sequence != last_sequence + 1 {
                return Err(Error::InvalidInput(format!(
                    "Handoff sequence {} out of order (expected {})",
                    sequence,
                    last_sequence + 1
                )));
            }
            (entry.context.clone(), entry.epoch)
        };

        let failed = self.evaluate(task_id, from, to, &snapshot).await?;
        if !failed.is_empty() {
            {
                let mut state = self.state.lock().await;
                state.stats.rejected += 1;
                for name in &failed {
                    *state.stats.by_precondition.entry(name.clone()).or_default() += 1;
                }
            }
            warn!(task_id = %task_id, sequence, failed = ?failed, "Handoff rejected");
            self.events
                .publish(handoff_events::rejected(&task_id.to_string(), sequence, &failed))
                .await;
            return Err(Error::PreconditionFailed { failed });
        }

        let result = {
            let mut state = self.state.lock().await;
            if let Some(previous) = state.replay(task_id, sequence) {
                return Ok(previous);
            }
            if state.last_sequence(task_id) + 1 != sequence {
                return Err(Error::InvalidInput(format!(
                    "Handoff sequence {} of task {} was overtaken",
                    sequence, task_id
                )));
            }

            let entry = state
                .contexts
                .get_mut(&task_id)
                .ok_or_else(|| Error::NotFound(format!("Context for task {}", task_id)))?;
            if entry.epoch != epoch_seen || &entry.owner != from {
                return Err(Error::InvalidInput(format!(
                    "Context of task {} changed during handoff",
                    task_id
                )));
            }

            entry.owner = to.clone();
            entry.epoch += 1;
            entry.context.record_owner(to);

            let result = HandoffResult {
                id: Uuid::new_v4(),
                task_id,
                sequence,
                from: from.clone(),
                to: to.clone(),
                epoch: entry.epoch,
                context_bytes: snapshot.size_bytes(),
                timestamp: Utc::now(),
            };
            let ledger = state.ledgers.entry(task_id).or_default();
            ledger.last_sequence = sequence;
            ledger.results.insert(sequence, result.clone());
            state.stats.total_handoffs += 1;
            result
        };

        info!(task_id = %task_id, sequence, from = %from, to = %to, "Handoff committed");
        self.events
            .publish(handoff_events::completed(
                &task_id.to_string(),
                sequence,
                from.as_str(),
                to.as_str(),
            ))
            .await;
        Ok(result)
    }

    /// Names of the preconditions that failed (empty = all passed)
    async fn evaluate(
        &self,
        task_id: TaskId,
        from: &AgentId,
        to: &AgentId,
        context: &AgentContext,
    ) -> Result<Vec<String>> {
        let preconditions = self.preconditions.read().await.clone();
        let check = HandoffCheck {
            task_id,
            from,
            to,
            context,
        };

        let evaluation = async {
            let mut failed = Vec::new();
            for precondition in &preconditions {
                if !precondition.check(&check).await {
                    failed.push(precondition.name().to_string());
                }
            }
            failed
        };

        tokio::time::timeout(self.config.timeout, evaluation)
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "Handoff preconditions for task {} did not settle within {:?}",
                    task_id, self.config.timeout
                ))
            })
    }

    /// Committed handoffs of a task, oldest first
    pub async fn history(&self, task_id: TaskId) -> Vec<HandoffResult> {
        let state = self.state.lock().await;
        state
            .ledgers
            .get(&task_id)
            .map(|l| l.results.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Last committed sequence for a task (0 = none)
    pub async fn last_sequence(&self, task_id: TaskId) -> u64 {
        self.state.lock().await.last_sequence(task_id)
    }

    pub async fn stats(&self) -> HandoffStats {
        self.state.lock().await.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> HandoffManager {
        HandoffManager::new(HandoffConfig::default(), Arc::new(EventBus::new()))
    }

    struct Never;

    #[async_trait]
    impl HandoffPrecondition for Never {
        fn name(&self) -> &str {
            "never"
        }

        async fn check(&self, _check: &HandoffCheck<'_>) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_handoff_moves_ownership_and_invalidates_lease() {
        let mgr = manager();
        let task = TaskId::new();
        let coder = AgentId::new("coder");
        let reviewer = AgentId::new("reviewer");

        let lease = mgr.acquire(task, &coder).await;
        mgr.with_context(&lease, |ctx| ctx.add_reasoning(&coder, "wrote the parser"))
            .await
            .unwrap();

        let result = mgr.handoff(task, 1, &coder, &reviewer).await.unwrap();
        assert_eq!(result.to, reviewer);
        assert_eq!(mgr.owner(task).await, Some(reviewer.clone()));

        // The old lease can neither read nor write
        assert!(!mgr.validate(&lease).await);
        assert!(mgr.checkout(&lease).await.is_err());
        assert!(!mgr.checkin(&lease, AgentContext::new(task)).await);

        // Context survived intact
        let snapshot = mgr.snapshot(task).await.unwrap();
        assert_eq!(snapshot.reasoning.len(), 1);
        assert_eq!(snapshot.owners, vec![coder, reviewer]);
    }

    #[tokio::test]
    async fn test_replayed_sequence_is_idempotent() {
        let mgr = manager();
        let task = TaskId::new();
        let a = AgentId::new("a");
        let b = AgentId::new("b");
        mgr.acquire(task, &a).await;

        let first = mgr.handoff(task, 1, &a, &b).await.unwrap();
        let second = mgr.handoff(task, 1, &a, &b).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(mgr.history(task).await.len(), 1);
        let stats = mgr.stats().await;
        assert_eq!(stats.total_handoffs, 1);
        assert_eq!(stats.replayed, 1);
    }

    #[tokio::test]
    async fn test_sequence_must_advance_by_one() {
        let mgr = manager();
        let task = TaskId::new();
        let a = AgentId::new("a");
        mgr.acquire(task, &a).await;

        let err = mgr.handoff(task, 2, &a, &AgentId::new("b")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_only_owner_may_hand_off() {
        let mgr = manager();
        let task = TaskId::new();
        mgr.acquire(task, &AgentId::new("a")).await;

        let err = mgr
            .handoff(task, 1, &AgentId::new("intruder"), &AgentId::new("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_failed_preconditions_are_all_named() {
        let mgr = manager();
        mgr.register_precondition(Arc::new(Never)).await;

        let task = TaskId::new();
        let a = AgentId::new("a");
        let lease = mgr.acquire(task, &a).await;
        mgr.with_context(&lease, |ctx| {
            ctx.begin_tool_call(&a, "shell", serde_json::json!({"cmd": "make"}));
        })
        .await
        .unwrap();

        let err = mgr.handoff(task, 1, &a, &AgentId::new("b")).await.unwrap_err();
        match err {
            Error::PreconditionFailed { failed } => {
                assert_eq!(failed, vec!["no_pending_tool_calls", "never"]);
            }
            other => panic!("unexpected: {other}"),
        }

        // Ownership unchanged; the lease still works
        assert!(mgr.validate(&lease).await);
        assert_eq!(mgr.stats().await.rejected, 1);
        // The rejected sequence was not consumed
        assert_eq!(mgr.last_sequence(task).await, 0);
    }

    #[tokio::test]
    async fn test_context_size_limit() {
        let mgr = HandoffManager::new(
            HandoffConfig {
                max_context_bytes: 64,
                ..Default::default()
            },
            Arc::new(EventBus::new()),
        );
        let task = TaskId::new();
        let a = AgentId::new("a");
        let lease = mgr.acquire(task, &a).await;
        mgr.with_context(&lease, |ctx| ctx.set_output("blob", serde_json::json!("x".repeat(128))))
            .await
            .unwrap();

        let err = mgr.handoff(task, 1, &a, &AgentId::new("b")).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { ref failed } if failed == &vec!["context_size_limit".to_string()]));
    }

    #[tokio::test]
    async fn test_acquire_invalidates_previous_attempt() {
        let mgr = manager();
        let task = TaskId::new();
        let first = mgr.acquire(task, &AgentId::new("a")).await;
        let second = mgr.acquire(task, &AgentId::new("b")).await;

        assert!(!mgr.validate(&first).await);
        assert!(mgr.validate(&second).await);
        assert_eq!(second.epoch, first.epoch + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_precondition_times_out() {
        struct Stuck;

        #[async_trait]
        impl HandoffPrecondition for Stuck {
            fn name(&self) -> &str {
                "stuck"
            }

            async fn check(&self, _check: &HandoffCheck<'_>) -> bool {
                std::future::pending::<()>().await;
                true
            }
        }

        let mgr = HandoffManager::new(
            HandoffConfig {
                timeout: Duration::from_secs(2),
                ..Default::default()
            },
            Arc::new(EventBus::new()),
        );
        mgr.register_precondition(Arc::new(Stuck)).await;

        let task = TaskId::new();
        let a = AgentId::new("a");
        let lease = mgr.acquire(task, &a).await;

        let err = mgr.handoff(task, 1, &a, &AgentId::new("b")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_retryable());
        assert!(mgr.validate(&lease).await);
        assert_eq!(mgr.last_sequence(task).await, 0);
    }

    #[tokio::test]
    async fn test_released_records_evicted_past_retention() {
        let mgr = HandoffManager::new(
            HandoffConfig {
                retained_tasks: 1,
                ..Default::default()
            },
            Arc::new(EventBus::new()),
        );
        let a = AgentId::new("a");
        let b = AgentId::new("b");

        let first = TaskId::new();
        mgr.acquire(first, &a).await;
        mgr.handoff(first, 1, &a, &b).await.unwrap();
        mgr.release(first).await;
        // Still replayable while retained
        assert_eq!(mgr.handoff(first, 1, &a, &b).await.unwrap().to, b);

        let second = TaskId::new();
        mgr.acquire(second, &a).await;
        mgr.handoff(second, 1, &a, &b).await.unwrap();
        mgr.release(second).await;

        assert!(mgr.history(first).await.is_empty());
        assert_eq!(mgr.last_sequence(first).await, 0);
        assert_eq!(mgr.history(second).await.len(), 1);
    }

    #[tokio::test]
    async fn test_attach_rejects_duplicate() {
        let mgr = manager();
        let task = TaskId::new();
        let a = AgentId::new("a");
        mgr.attach(task, &a, AgentContext::new(task)).await.unwrap();
        assert!(mgr.attach(task, &a, AgentContext::new(task)).await.is_err());
        assert!(mgr.release(task).await.is_some());
        assert!(mgr.owner(task).await.is_none());
    }
}
