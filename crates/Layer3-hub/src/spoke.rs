//! Spoke agents - 허브가 SubTask를 맡기는 작업자
//!
//! 스포크는 실제 작업을 수행하는 `Agent`를 감싸고 다음을 추적합니다:
//! - 상태 (IDLE → ASSIGNED → BUSY → DONE/FAILED, 무응답 시 UNREACHABLE)
//! - 마지막 heartbeat 시각 (liveness 판정)
//! - 현재 처리 중인 작업
//!
//! 스포크는 한 번에 하나의 SubTask만 처리합니다. 동시에 배정된 작업은
//! 스포크의 작업 잠금에서 순서대로 대기합니다.

use crate::coordinator::HubShared;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tandem_foundation::event::spoke as spoke_events;
use tandem_foundation::{Error, EventBus, Result};
use tandem_task::{
    Agent, AgentCapability, AgentContext, AgentError, AgentId, Task, TaskId, TaskResult,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpokeStatus {
    #[default]
    Idle,
    Assigned,
    Busy,
    Done,
    Failed,
    Unreachable,
}

impl SpokeStatus {
    /// Holding a sub-task
    pub fn is_working(&self) -> bool {
        matches!(self, Self::Assigned | Self::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Assigned => "assigned",
            Self::Busy => "busy",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Unreachable => "unreachable",
        }
    }
}

impl std::fmt::Display for SpokeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SpokeAgent
// ============================================================================

/// A worker registered with the hub
#[derive(Clone)]
pub struct SpokeAgent {
    worker: Arc<dyn Agent>,
}

impl SpokeAgent {
    pub fn new(worker: Arc<dyn Agent>) -> Self {
        Self { worker }
    }

    pub fn id(&self) -> AgentId {
        self.worker.id()
    }

    pub fn capabilities(&self) -> Vec<AgentCapability> {
        self.worker.capabilities()
    }
}

impl std::fmt::Debug for SpokeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpokeAgent").field("id", &self.id()).finish()
    }
}

/// Snapshot of a spoke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokeInfo {
    pub id: AgentId,
    pub capabilities: Vec<String>,
    pub status: SpokeStatus,
    pub current: Option<TaskId>,
    pub completed: u32,
    pub failed: u32,
    pub silent_for_ms: u64,
}

/// A working spoke that stopped reporting
#[derive(Debug, Clone, PartialEq)]
pub struct LostSpoke {
    pub spoke: AgentId,
    pub task_id: TaskId,
    pub from: SpokeStatus,
    pub silent_for: Duration,
}

// ============================================================================
// SpokeTable
// ============================================================================

struct SpokeState {
    capabilities: Vec<String>,
    status: SpokeStatus,
    current: Option<TaskId>,
    last_heartbeat: Instant,
    completed: u32,
    failed: u32,
}

/// Status transition to publish: (spoke, from, to)
pub(crate) type SpokeChange = (AgentId, SpokeStatus, SpokeStatus);

/// Liveness and status of every spoke
#[derive(Default)]
pub(crate) struct SpokeTable {
    spokes: RwLock<BTreeMap<AgentId, SpokeState>>,
}

impl SpokeTable {
    pub fn insert(&self, spoke: &SpokeAgent) -> Result<()> {
        let id = spoke.id();
        let mut spokes = self.spokes.write();
        if spokes.contains_key(&id) {
            return Err(Error::InvalidInput(format!("Spoke {} already registered", id)));
        }
        spokes.insert(
            id,
            SpokeState {
                capabilities: spoke.capabilities().into_iter().map(|c| c.name).collect(),
                status: SpokeStatus::Idle,
                current: None,
                last_heartbeat: Instant::now(),
                completed: 0,
                failed: 0,
            },
        );
        Ok(())
    }

    pub fn remove(&self, id: &AgentId) {
        self.spokes.write().remove(id);
    }

    pub fn status(&self, id: &AgentId) -> Option<SpokeStatus> {
        self.spokes.read().get(id).map(|s| s.status)
    }

    /// Reachable spokes may be matched; busy ones queue work
    pub fn is_reachable(&self, id: &AgentId) -> bool {
        self.status(id).is_some_and(|s| s != SpokeStatus::Unreachable)
    }

    /// Start work on `task_id`. None if the spoke is unreachable or unknown.
    pub fn claim(&self, id: &AgentId, task_id: TaskId) -> Option<SpokeChange> {
        let mut spokes = self.spokes.write();
        let spoke = spokes.get_mut(id)?;
        if spoke.status == SpokeStatus::Unreachable || spoke.status.is_working() {
            return None;
        }
        let from = spoke.status;
        spoke.status = SpokeStatus::Assigned;
        spoke.current = Some(task_id);
        spoke.last_heartbeat = Instant::now();
        Some((id.clone(), from, SpokeStatus::Assigned))
    }

    /// Move a spoke still working on `task_id` to `to`
    pub fn advance(&self, id: &AgentId, task_id: TaskId, to: SpokeStatus) -> Option<SpokeChange> {
        let mut spokes = self.spokes.write();
        let spoke = spokes.get_mut(id)?;
        if spoke.current != Some(task_id) || !spoke.status.is_working() {
            return None;
        }
        let from = spoke.status;
        spoke.status = to;
        spoke.last_heartbeat = Instant::now();
        match to {
            SpokeStatus::Done => spoke.completed += 1,
            SpokeStatus::Failed => spoke.failed += 1,
            _ => {}
        }
        if !to.is_working() {
            spoke.current = None;
        }
        Some((id.clone(), from, to))
    }

    /// Work on `task_id` was dropped without an outcome
    pub fn abandon(&self, id: &AgentId, task_id: TaskId) -> Option<SpokeChange> {
        let mut spokes = self.spokes.write();
        let spoke = spokes.get_mut(id)?;
        if spoke.current != Some(task_id) {
            return None;
        }
        spoke.current = None;
        if !spoke.status.is_working() {
            return None;
        }
        let from = spoke.status;
        spoke.status = SpokeStatus::Idle;
        Some((id.clone(), from, SpokeStatus::Idle))
    }

    /// Record a heartbeat; an unreachable spoke becomes idle again
    pub fn heartbeat(&self, id: &AgentId) -> Result<Option<SpokeChange>> {
        let mut spokes = self.spokes.write();
        let spoke = spokes
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Spoke {}", id)))?;
        spoke.last_heartbeat = Instant::now();
        if spoke.status == SpokeStatus::Unreachable {
            spoke.status = SpokeStatus::Idle;
            return Ok(Some((id.clone(), SpokeStatus::Unreachable, SpokeStatus::Idle)));
        }
        Ok(None)
    }

    /// Mark working spokes silent for longer than `timeout` unreachable
    pub fn expire(&self, timeout: Duration) -> Vec<LostSpoke> {
        let now = Instant::now();
        let mut lost = Vec::new();
        let mut spokes = self.spokes.write();
        for (id, spoke) in spokes.iter_mut() {
            let silent_for = now.saturating_duration_since(spoke.last_heartbeat);
            if !spoke.status.is_working() || silent_for <= timeout {
                continue;
            }
            if let Some(task_id) = spoke.current.take() {
                lost.push(LostSpoke {
                    spoke: id.clone(),
                    task_id,
                    from: spoke.status,
                    silent_for,
                });
            }
            spoke.status = SpokeStatus::Unreachable;
        }
        lost
    }

    pub fn snapshot(&self) -> Vec<SpokeInfo> {
        let now = Instant::now();
        self.spokes
            .read()
            .iter()
            .map(|(id, s)| SpokeInfo {
                id: id.clone(),
                capabilities: s.capabilities.clone(),
                status: s.status,
                current: s.current,
                completed: s.completed,
                failed: s.failed,
                silent_for_ms: now.saturating_duration_since(s.last_heartbeat).as_millis() as u64,
            })
            .collect()
    }
}

// ============================================================================
// SpokeAdapter - DelegationManager에 등록되는 Agent
// ============================================================================

/// Presents a spoke to the delegation layer
pub(crate) struct SpokeAdapter {
    id: AgentId,
    worker: Arc<dyn Agent>,
    table: Arc<SpokeTable>,
    hub: Arc<HubShared>,
    /// One sub-task at a time
    work: Mutex<()>,
}

impl SpokeAdapter {
    pub fn new(spoke: SpokeAgent, table: Arc<SpokeTable>, hub: Arc<HubShared>) -> Self {
        Self {
            id: spoke.id(),
            worker: spoke.worker,
            table,
            hub,
            work: Mutex::new(()),
        }
    }
}

pub(crate) async fn publish_change(events: &EventBus, change: Option<SpokeChange>) {
    if let Some((id, from, to)) = change {
        debug!(spoke = %id, from = %from, to = %to, "Spoke status changed");
        events
            .publish(spoke_events::status_changed(id.as_str(), from.as_str(), to.as_str()))
            .await;
    }
}

/// Resets the spoke if the invocation is dropped mid-flight
struct ClaimGuard {
    id: AgentId,
    task_id: TaskId,
    table: Arc<SpokeTable>,
    hub: Arc<HubShared>,
    armed: bool,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Already expired by the liveness monitor
        let Some(change) = self.table.abandon(&self.id, self.task_id) else {
            return;
        };
        info!(spoke = %self.id, task_id = %self.task_id, "Spoke work interrupted");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let hub = Arc::clone(&self.hub);
            let (id, task_id) = (self.id.clone(), self.task_id);
            handle.spawn(async move {
                publish_change(hub.events(), Some(change)).await;
                hub.subtask_status(task_id, &id, SpokeStatus::Idle).await;
            });
        }
    }
}

#[async_trait]
impl Agent for SpokeAdapter {
    fn id(&self) -> AgentId {
        self.id.clone()
    }

    fn capabilities(&self) -> Vec<AgentCapability> {
        self.worker.capabilities()
    }

    fn is_available(&self) -> bool {
        self.table.is_reachable(&self.id) && self.worker.is_available()
    }

    async fn invoke(
        &self,
        task: &Task,
        context: &mut AgentContext,
    ) -> std::result::Result<TaskResult, AgentError> {
        let _turn = self.work.lock().await;

        let Some(change) = self.table.claim(&self.id, task.id) else {
            return Err(AgentError::Retryable(format!("spoke {} is unreachable", self.id)));
        };
        let mut guard = ClaimGuard {
            id: self.id.clone(),
            task_id: task.id,
            table: Arc::clone(&self.table),
            hub: Arc::clone(&self.hub),
            armed: true,
        };
        publish_change(self.hub.events(), Some(change)).await;
        self.hub.spoke_assigned(task.id, &self.id).await;

        let busy = self.table.advance(&self.id, task.id, SpokeStatus::Busy);
        publish_change(self.hub.events(), busy).await;
        self.hub.subtask_status(task.id, &self.id, SpokeStatus::Busy).await;

        let outcome = self.worker.invoke(task, context).await;
        guard.armed = false;

        let status = if outcome.is_ok() {
            SpokeStatus::Done
        } else {
            SpokeStatus::Failed
        };
        let change = self.table.advance(&self.id, task.id, status);
        publish_change(self.hub.events(), change).await;
        self.hub.subtask_status(task.id, &self.id, status).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Agent for Noop {
        fn id(&self) -> AgentId {
            AgentId::new("noop")
        }
        fn capabilities(&self) -> Vec<AgentCapability> {
            vec![AgentCapability::new("any")]
        }
        async fn invoke(
            &self,
            _task: &Task,
            _ctx: &mut AgentContext,
        ) -> std::result::Result<TaskResult, AgentError> {
            Ok(TaskResult::success("ok"))
        }
    }

    fn table() -> (SpokeTable, AgentId) {
        let table = SpokeTable::default();
        table.insert(&SpokeAgent::new(Arc::new(Noop))).unwrap();
        (table, AgentId::new("noop"))
    }

    #[test]
    fn test_lifecycle() {
        let (table, id) = table();
        let task = TaskId::new();

        assert_eq!(table.claim(&id, task).map(|c| c.2), Some(SpokeStatus::Assigned));
        assert!(table.claim(&id, TaskId::new()).is_none());
        table.advance(&id, task, SpokeStatus::Busy);
        table.advance(&id, task, SpokeStatus::Done);

        let info = &table.snapshot()[0];
        assert_eq!(info.status, SpokeStatus::Done);
        assert_eq!(info.completed, 1);
        assert!(info.current.is_none());
        assert!(table.insert(&SpokeAgent::new(Arc::new(Noop))).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_working_spoke_expires() {
        let (table, id) = table();
        let task = TaskId::new();
        table.claim(&id, task);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(table.expire(Duration::from_secs(10)).is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let lost = table.expire(Duration::from_secs(10));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].task_id, task);
        assert_eq!(table.status(&id), Some(SpokeStatus::Unreachable));
        assert!(!table.is_reachable(&id));

        // The dropped invocation must not resurrect the spoke
        assert!(table.abandon(&id, task).is_none());

        let change = table.heartbeat(&id).unwrap();
        assert_eq!(change.map(|c| c.2), Some(SpokeStatus::Idle));
        assert!(table.is_reachable(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_spokes_never_expire() {
        let (table, id) = table();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(table.expire(Duration::from_secs(1)).is_empty());
        assert_eq!(table.status(&id), Some(SpokeStatus::Idle));
    }
}
