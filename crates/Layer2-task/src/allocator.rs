//! Resource Allocator - 동시 실행 단위 관리
//!
//! 고정 용량(capacity)의 실행 단위를 작업에 예약/해제합니다.
//!
//! ## 보장
//! - 항상 `in_use <= capacity`
//! - 모든 예약은 정확히 한 번 해제됩니다 (완료 시 또는 선점으로 회수될 때)
//! - 대기열은 우선순위 순, 같은 우선순위는 FIFO
//! - 대기자는 oneshot 채널로 깨어나며 폴링하지 않습니다
//!
//! ## 선점
//! 더 높은 우선순위의 요청이 용량 부족으로 막히면, 유예 시간(grace)을 넘긴
//! 낮은 우선순위 예약을 회수합니다. 회수된 예약은 `subscribe_preemptions`로
//! 알려지며, 오케스트레이터가 해당 작업을 PENDING으로 되돌립니다.
//!
//! 대기 중인 요청은 막고 있는 예약의 유예 시간이 끝나는 시점에 다시 깨어나
//! 선점을 재시도합니다.

use crate::task::{TaskId, TaskPriority};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_foundation::event::allocation as alloc_events;
use tandem_foundation::storage::kv::put_json;
use tandem_foundation::{
    keys, AllocatorSettings, Error, EventBus, KvStore, OrchestrationEvent, Result,
};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique identifier for an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId(pub Uuid);

impl AllocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A granted reservation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAllocation {
    pub id: AllocationId,
    pub task_id: TaskId,
    pub units: u32,
    pub priority: TaskPriority,
    pub granted_at: DateTime<Utc>,
}

/// Snapshot of allocator state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub capacity: u32,
    pub in_use: u32,
    pub available: u32,
    pub allocations: usize,
    pub waiting: usize,
    pub total_granted: u64,
    pub total_released: u64,
    pub total_preemptions: u64,
}

/// A revoked reservation
#[derive(Debug, Clone, PartialEq)]
pub struct Preemption {
    pub allocation: TaskAllocation,
    /// Task whose request triggered the revocation
    pub by_task: TaskId,
}

/// Allocator configuration
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub capacity: u32,

    /// Minimum hold time before an allocation may be preempted
    pub preemption_grace: Duration,

    /// Default wait limit for blocking reservations
    pub reserve_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::from(&AllocatorSettings::default())
    }
}

impl From<&AllocatorSettings> for AllocatorConfig {
    fn from(settings: &AllocatorSettings) -> Self {
        Self {
            capacity: settings.capacity,
            preemption_grace: settings.preemption_grace(),
            reserve_timeout: settings.reserve_timeout(),
        }
    }
}

impl AllocatorConfig {
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_preemption_grace(mut self, grace: Duration) -> Self {
        self.preemption_grace = grace;
        self
    }

    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }
}

// ============================================================================
// Internal state
// ============================================================================

struct Held {
    allocation: TaskAllocation,
    since: Instant,
}

struct Waiter {
    id: u64,
    task_id: TaskId,
    units: u32,
    priority: TaskPriority,
    tx: oneshot::Sender<TaskAllocation>,
}

#[derive(Default)]
struct AllocatorState {
    in_use: u32,
    held: HashMap<AllocationId, Held>,
    /// Preempted allocations whose owner has not released them yet
    revoked: HashSet<AllocationId>,
    /// Priority sorted, FIFO within a priority
    waiting: VecDeque<Waiter>,
    total_granted: u64,
    total_released: u64,
    total_preemptions: u64,
}

impl AllocatorState {
    /// A waiter at equal or higher priority is ahead of `priority`
    fn has_waiter_at_or_above(&self, priority: TaskPriority) -> bool {
        self.waiting.iter().any(|w| w.priority >= priority)
    }

    fn enqueue(&mut self, waiter: Waiter) {
        let pos = self
            .waiting
            .iter()
            .position(|w| w.priority < waiter.priority)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(pos, waiter);
    }
}

// ============================================================================
// ResourceAllocator
// ============================================================================

/// Grants bounded concurrency units to tasks
pub struct ResourceAllocator {
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
    waiter_counter: AtomicU64,
    preemption_tx: broadcast::Sender<Preemption>,
    events: Arc<EventBus>,
    store: Option<Arc<dyn KvStore>>,
}

impl ResourceAllocator {
    pub fn new(config: AllocatorConfig, events: Arc<EventBus>) -> Self {
        let (preemption_tx, _) = broadcast::channel(256);
        Self {
            config,
            state: Mutex::new(AllocatorState::default()),
            waiter_counter: AtomicU64::new(0),
            preemption_tx,
            events,
            store: None,
        }
    }

    /// Mirror outstanding allocations to `allocation/<id>` records
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Non-blocking reservation. Fails with `ResourceExhausted` when the
    /// request neither fits nor can be satisfied by preemption.
    pub async fn reserve(
        &self,
        task_id: TaskId,
        units: u32,
        priority: TaskPriority,
    ) -> Result<TaskAllocation> {
        self.validate_units(units)?;

        let mut events = Vec::new();
        let granted = {
            let mut state = self.state.lock();
            self.try_reserve_locked(&mut state, task_id, units, priority, &mut events)
        };
        self.emit(events).await;

        granted.ok_or_else(|| self.exhausted(units))
    }

    /// Reservation that waits (without polling) until units are free,
    /// `timeout` elapses, or the future is dropped.
    pub async fn reserve_blocking(
        &self,
        task_id: TaskId,
        units: u32,
        priority: TaskPriority,
        timeout: Option<Duration>,
    ) -> Result<TaskAllocation> {
        self.validate_units(units)?;

        let mut events = Vec::new();
        let waiter_id = self.waiter_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();

        let immediate = {
            let mut state = self.state.lock();
            match self.try_reserve_locked(&mut state, task_id, units, priority, &mut events) {
                Some(allocation) => Some(allocation),
                None => {
                    state.enqueue(Waiter {
                        id: waiter_id,
                        task_id,
                        units,
                        priority,
                        tx,
                    });
                    debug!(
                        task_id = %task_id,
                        units,
                        priority = %priority,
                        waiting = state.waiting.len(),
                        "Reservation queued"
                    );
                    None
                }
            }
        };
        self.emit(events).await;
        if let Some(allocation) = immediate {
            return Ok(allocation);
        }

        let deadline = Instant::now() + timeout.unwrap_or(self.config.reserve_timeout);
        loop {
            let recheck = self.next_preemption_at(priority);
            tokio::select! {
                granted = &mut rx => {
                    return granted
                        .map_err(|_| Error::Internal("Allocator dropped waiter".to_string()));
                }
                _ = tokio::time::sleep_until(deadline) => break,
                _ = sleep_until_opt(recheck) => {
                    let mut events = Vec::new();
                    {
                        let mut state = self.state.lock();
                        self.preempt_for_head_locked(&mut state, &mut events);
                        self.pump_locked(&mut state, &mut events);
                    }
                    self.emit(events).await;
                }
            }
        }

        let mut events = Vec::new();
        let still_waiting = {
            let mut state = self.state.lock();
            let pos = state.waiting.iter().position(|w| w.id == waiter_id);
            if let Some(pos) = pos {
                state.waiting.remove(pos);
                // A large head-of-line request leaving may unblock others
                self.pump_locked(&mut state, &mut events);
            }
            pos.is_some()
        };
        self.emit(events).await;

        if still_waiting {
            warn!(task_id = %task_id, units, "Reservation timed out");
            Err(self.exhausted(units))
        } else {
            // Granted between the timeout firing and us taking the lock
            rx.try_recv()
                .map_err(|_| Error::Internal("Lost granted allocation".to_string()))
        }
    }

    /// Return units to the pool. Releasing twice is an error; releasing a
    /// preempted allocation acknowledges the revocation.
    pub async fn release(&self, allocation: &TaskAllocation) -> Result<()> {
        let events = self.release_inner(allocation.id)?;
        self.emit(events).await;
        Ok(())
    }

    fn release_inner(&self, id: AllocationId) -> Result<Vec<OrchestrationEvent>> {
        let mut events = Vec::new();
        let mut state = self.state.lock();

        if let Some(held) = state.held.remove(&id) {
            let alloc = held.allocation;
            state.in_use -= alloc.units;
            state.total_released += 1;
            self.forget(&alloc.id);
            events.push(alloc_events::released(
                &alloc.id.to_string(),
                &alloc.task_id.to_string(),
                alloc.units,
            ));
            debug!(allocation = %alloc.id, task_id = %alloc.task_id, units = alloc.units, "Released");
            self.pump_locked(&mut state, &mut events);
            return Ok(events);
        }

        if state.revoked.remove(&id) {
            state.total_released += 1;
            return Ok(events);
        }

        Err(Error::InvalidInput(format!(
            "Allocation {} is not outstanding",
            id
        )))
    }

    /// Wrap an allocation so it is released on drop
    pub fn guard(self: &Arc<Self>, allocation: TaskAllocation) -> AllocationGuard {
        AllocationGuard {
            allocator: Arc::clone(self),
            allocation: Some(allocation),
        }
    }

    pub fn usage(&self) -> ResourceUsage {
        let state = self.state.lock();
        ResourceUsage {
            capacity: self.config.capacity,
            in_use: state.in_use,
            available: self.config.capacity - state.in_use,
            allocations: state.held.len(),
            waiting: state.waiting.len(),
            total_granted: state.total_granted,
            total_released: state.total_released,
            total_preemptions: state.total_preemptions,
        }
    }

    pub fn is_outstanding(&self, id: AllocationId) -> bool {
        self.state.lock().held.contains_key(&id)
    }

    /// Outstanding allocation of a task, if any
    pub fn allocation_for(&self, task_id: TaskId) -> Option<TaskAllocation> {
        self.state
            .lock()
            .held
            .values()
            .find(|h| h.allocation.task_id == task_id)
            .map(|h| h.allocation.clone())
    }

    pub fn subscribe_preemptions(&self) -> broadcast::Receiver<Preemption> {
        self.preemption_tx.subscribe()
    }

    /// Drop `allocation/` records left by a previous process
    pub fn purge_persisted(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let stale = store.scan_prefix(keys::ALLOCATION)?;
        for (key, _) in &stale {
            store.delete(key)?;
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "Purged stale allocation records");
        }
        Ok(stale.len())
    }

    // ------------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------------

    fn validate_units(&self, units: u32) -> Result<()> {
        if units == 0 {
            return Err(Error::InvalidInput("Reservation of 0 units".to_string()));
        }
        if units > self.config.capacity {
            debug!(units, capacity = self.config.capacity, "Reservation can never fit");
            return Err(self.exhausted(units));
        }
        Ok(())
    }

    fn exhausted(&self, units: u32) -> Error {
        let usage = self.usage();
        Error::ResourceExhausted {
            requested: units,
            available: usage.available,
            capacity: usage.capacity,
        }
    }

    /// Grant directly, or by preemption. Never jumps ahead of a waiter at
    /// equal or higher priority.
    fn try_reserve_locked(
        &self,
        state: &mut AllocatorState,
        task_id: TaskId,
        units: u32,
        priority: TaskPriority,
        events: &mut Vec<OrchestrationEvent>,
    ) -> Option<TaskAllocation> {
        if state.has_waiter_at_or_above(priority) {
            return None;
        }

        if self.config.capacity - state.in_use >= units {
            return Some(self.grant_locked(state, task_id, units, priority, events));
        }

        let victims = self.plan_preemption(state, units, priority)?;
        for victim in victims {
            self.revoke_locked(state, victim, task_id, events);
        }
        Some(self.grant_locked(state, task_id, units, priority, events))
    }

    /// Lowest priority first; within a priority, the oldest grant.
    /// `None` if preemption cannot free enough.
    fn plan_preemption(
        &self,
        state: &AllocatorState,
        units: u32,
        priority: TaskPriority,
    ) -> Option<Vec<AllocationId>> {
        let now = Instant::now();
        let mut candidates: Vec<&Held> = state
            .held
            .values()
            .filter(|h| h.allocation.priority < priority)
            .filter(|h| now.duration_since(h.since) >= self.config.preemption_grace)
            .collect();
        candidates.sort_by(|a, b| {
            a.allocation
                .priority
                .cmp(&b.allocation.priority)
                .then(a.since.cmp(&b.since))
        });

        let mut available = self.config.capacity - state.in_use;
        let mut victims = Vec::new();
        for held in candidates {
            if available >= units {
                break;
            }
            available += held.allocation.units;
            victims.push(held.allocation.id);
        }

        (available >= units).then_some(victims)
    }

    /// Earliest instant a holding below `priority` leaves its grace period
    fn next_preemption_at(&self, priority: TaskPriority) -> Option<Instant> {
        let now = Instant::now();
        self.state
            .lock()
            .held
            .values()
            .filter(|h| h.allocation.priority < priority)
            .map(|h| h.since + self.config.preemption_grace)
            .filter(|at| *at > now)
            .min()
    }

    /// Preempt on behalf of the head waiter once enough victims are past grace
    fn preempt_for_head_locked(
        &self,
        state: &mut AllocatorState,
        events: &mut Vec<OrchestrationEvent>,
    ) {
        let Some(head) = state.waiting.front() else {
            return;
        };
        if head.tx.is_closed() || self.config.capacity - state.in_use >= head.units {
            return;
        }
        let (task_id, units, priority) = (head.task_id, head.units, head.priority);
        let Some(victims) = self.plan_preemption(state, units, priority) else {
            return;
        };
        for victim in victims {
            self.revoke_locked(state, victim, task_id, events);
        }
    }

    fn revoke_locked(
        &self,
        state: &mut AllocatorState,
        id: AllocationId,
        by_task: TaskId,
        events: &mut Vec<OrchestrationEvent>,
    ) {
        let Some(held) = state.held.remove(&id) else {
            return;
        };
        let allocation = held.allocation;
        state.in_use -= allocation.units;
        state.revoked.insert(id);
        state.total_preemptions += 1;
        self.forget(&id);

        warn!(
            allocation = %id,
            task_id = %allocation.task_id,
            by_task = %by_task,
            "Allocation preempted"
        );
        events.push(alloc_events::preempted(
            &id.to_string(),
            &allocation.task_id.to_string(),
            &by_task.to_string(),
        ));
        // No subscribers is fine; the owner still acknowledges on release
        let _ = self.preemption_tx.send(Preemption {
            allocation,
            by_task,
        });
    }

    fn grant_locked(
        &self,
        state: &mut AllocatorState,
        task_id: TaskId,
        units: u32,
        priority: TaskPriority,
        events: &mut Vec<OrchestrationEvent>,
    ) -> TaskAllocation {
        let allocation = TaskAllocation {
            id: AllocationId::new(),
            task_id,
            units,
            priority,
            granted_at: Utc::now(),
        };
        state.in_use += units;
        state.total_granted += 1;
        state.held.insert(
            allocation.id,
            Held {
                allocation: allocation.clone(),
                since: Instant::now(),
            },
        );
        self.remember(&allocation);

        debug!(allocation = %allocation.id, task_id = %task_id, units, in_use = state.in_use, "Granted");
        events.push(alloc_events::granted(
            &allocation.id.to_string(),
            &task_id.to_string(),
            units,
            priority.as_str(),
        ));
        allocation
    }

    /// Hand freed units to waiters in queue order. Strict head-of-line:
    /// a large request at the head is not starved by smaller ones behind it.
    fn pump_locked(&self, state: &mut AllocatorState, events: &mut Vec<OrchestrationEvent>) {
        while let Some(head) = state.waiting.front() {
            if head.tx.is_closed() {
                state.waiting.pop_front();
                continue;
            }
            if self.config.capacity - state.in_use < head.units {
                break;
            }
            let Some(waiter) = state.waiting.pop_front() else {
                break;
            };

            let mut granted = Vec::new();
            let allocation =
                self.grant_locked(state, waiter.task_id, waiter.units, waiter.priority, &mut granted);
            if let Err(allocation) = waiter.tx.send(allocation) {
                // Waiter went away after the closed check; undo
                state.held.remove(&allocation.id);
                state.in_use -= allocation.units;
                state.total_granted -= 1;
                self.forget(&allocation.id);
                continue;
            }
            events.extend(granted);
        }
    }

    fn remember(&self, allocation: &TaskAllocation) {
        if let Some(store) = &self.store {
            if let Err(e) = put_json(store.as_ref(), &keys::allocation(allocation.id), allocation) {
                warn!(allocation = %allocation.id, error = %e, "Failed to persist allocation");
            }
        }
    }

    fn forget(&self, id: &AllocationId) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&keys::allocation(id)) {
                warn!(allocation = %id, error = %e, "Failed to delete allocation record");
            }
        }
    }

    async fn emit(&self, events: Vec<OrchestrationEvent>) {
        for event in events {
            self.events.publish(event).await;
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// AllocationGuard
// ============================================================================

/// Releases its allocation when dropped
pub struct AllocationGuard {
    allocator: Arc<ResourceAllocator>,
    allocation: Option<TaskAllocation>,
}

impl AllocationGuard {
    pub fn allocation(&self) -> Option<&TaskAllocation> {
        self.allocation.as_ref()
    }

    /// Explicit release with in-order event publication
    pub async fn release(mut self) -> Result<()> {
        match self.allocation.take() {
            Some(allocation) => self.allocator.release(&allocation).await,
            None => Ok(()),
        }
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };
        match self.allocator.release_inner(allocation.id) {
            Ok(events) if !events.is_empty() => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let bus = Arc::clone(&self.allocator.events);
                    handle.spawn(async move {
                        for event in events {
                            bus.publish(event).await;
                        }
                    });
                }
            }
            Ok(_) => {}
            Err(e) => warn!(allocation = %allocation.id, error = %e, "Guard release failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_foundation::MemoryKvStore;

    fn allocator(capacity: u32) -> Arc<ResourceAllocator> {
        Arc::new(ResourceAllocator::new(
            AllocatorConfig::default()
                .with_capacity(capacity)
                .with_preemption_grace(Duration::ZERO)
                .with_reserve_timeout(Duration::from_secs(5)),
            Arc::new(EventBus::new()),
        ))
    }

    #[tokio::test]
    async fn test_reserve_within_capacity() {
        let alloc = allocator(4);
        let a = alloc.reserve(TaskId::new(), 3, TaskPriority::Medium).await.unwrap();
        assert_eq!(alloc.usage().in_use, 3);

        let err = alloc
            .reserve(TaskId::new(), 2, TaskPriority::Medium)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { requested: 2, available: 1, capacity: 4 }));

        alloc.release(&a).await.unwrap();
        assert_eq!(alloc.usage().in_use, 0);
    }

    #[tokio::test]
    async fn test_double_release_rejected() {
        let alloc = allocator(2);
        let a = alloc.reserve(TaskId::new(), 1, TaskPriority::Medium).await.unwrap();
        alloc.release(&a).await.unwrap();
        assert!(matches!(alloc.release(&a).await, Err(Error::InvalidInput(_))));
        assert_eq!(alloc.usage().in_use, 0);
    }

    #[tokio::test]
    async fn test_invalid_sizes() {
        let alloc = allocator(2);
        assert!(matches!(
            alloc.reserve(TaskId::new(), 0, TaskPriority::Low).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            alloc.reserve(TaskId::new(), 3, TaskPriority::Low).await,
            Err(Error::ResourceExhausted { requested: 3, available: 2, capacity: 2 })
        ));
        assert!(matches!(
            alloc
                .reserve_blocking(TaskId::new(), 3, TaskPriority::Critical, None)
                .await,
            Err(Error::ResourceExhausted { requested: 3, .. })
        ));
        assert_eq!(alloc.usage().waiting, 0);
    }

    #[tokio::test]
    async fn test_blocking_waiters_priority_then_fifo() {
        let alloc = allocator(1);
        let holder = alloc.reserve(TaskId::new(), 1, TaskPriority::Critical).await.unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (label, priority) in [
            ("medium-1", TaskPriority::Medium),
            ("medium-2", TaskPriority::Medium),
            ("high", TaskPriority::High),
        ] {
            let alloc = alloc.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let a = alloc
                    .reserve_blocking(TaskId::new(), 1, priority, None)
                    .await
                    .unwrap();
                order.lock().push(label);
                alloc.release(&a).await.unwrap();
            }));
            // Deterministic enqueue order
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(alloc.usage().waiting, 3);
        alloc.release(&holder).await.unwrap();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock(), vec!["high", "medium-1", "medium-2"]);
        assert_eq!(alloc.usage().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_timeout_leaves_queue_clean() {
        let alloc = allocator(1);
        let _holder = alloc.reserve(TaskId::new(), 1, TaskPriority::Critical).await.unwrap();

        let err = alloc
            .reserve_blocking(TaskId::new(), 1, TaskPriority::Medium, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(alloc.usage().waiting, 0);
    }

    #[tokio::test]
    async fn test_preempts_lower_priority_after_grace() {
        let alloc = allocator(2);
        let mut preemptions = alloc.subscribe_preemptions();

        let low = alloc.reserve(TaskId::new(), 2, TaskPriority::Low).await.unwrap();
        let high_task = TaskId::new();
        let high = alloc.reserve(high_task, 1, TaskPriority::High).await.unwrap();

        let p = preemptions.recv().await.unwrap();
        assert_eq!(p.allocation.id, low.id);
        assert_eq!(p.by_task, high_task);
        assert_eq!(alloc.usage().in_use, 1);
        assert_eq!(alloc.usage().total_preemptions, 1);

        // Owner acknowledges once; second release is a double release
        alloc.release(&low).await.unwrap();
        assert!(alloc.release(&low).await.is_err());
        alloc.release(&high).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_protects_recent_allocations() {
        let alloc = Arc::new(ResourceAllocator::new(
            AllocatorConfig::default()
                .with_capacity(1)
                .with_preemption_grace(Duration::from_secs(30)),
            Arc::new(EventBus::new()),
        ));

        let _low = alloc.reserve(TaskId::new(), 1, TaskPriority::Low).await.unwrap();
        assert!(alloc.reserve(TaskId::new(), 1, TaskPriority::High).await.is_err());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(alloc.reserve(TaskId::new(), 1, TaskPriority::High).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_preempts_once_grace_expires() {
        let alloc = Arc::new(ResourceAllocator::new(
            AllocatorConfig::default()
                .with_capacity(1)
                .with_preemption_grace(Duration::from_secs(30)),
            Arc::new(EventBus::new()),
        ));
        let mut preemptions = alloc.subscribe_preemptions();

        let low = alloc.reserve(TaskId::new(), 1, TaskPriority::Low).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let started = Instant::now();
        let critical = alloc
            .reserve_blocking(TaskId::new(), 1, TaskPriority::Critical, Some(Duration::from_secs(120)))
            .await
            .unwrap();

        // Woken when the low holding left its grace period, not at the timeout
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(25));
        assert!(waited < Duration::from_secs(26));
        assert_eq!(preemptions.recv().await.unwrap().allocation.id, low.id);

        let usage = alloc.usage();
        assert_eq!(usage.in_use, 1);
        assert_eq!(usage.waiting, 0);
        assert_eq!(usage.total_preemptions, 1);

        alloc.release(&low).await.unwrap();
        alloc.release(&critical).await.unwrap();
        assert_eq!(alloc.usage().total_released, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oldest_equal_priority_victim_first() {
        let alloc = Arc::new(ResourceAllocator::new(
            AllocatorConfig::default()
                .with_capacity(2)
                .with_preemption_grace(Duration::from_secs(1)),
            Arc::new(EventBus::new()),
        ));
        let mut preemptions = alloc.subscribe_preemptions();

        let older = alloc.reserve(TaskId::new(), 1, TaskPriority::Low).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let _newer = alloc.reserve(TaskId::new(), 1, TaskPriority::Low).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let _high = alloc.reserve(TaskId::new(), 1, TaskPriority::High).await.unwrap();
        assert_eq!(preemptions.recv().await.unwrap().allocation.id, older.id);
        assert_eq!(alloc.usage().total_preemptions, 1);
    }

    #[tokio::test]
    async fn test_equal_priority_never_preempts() {
        let alloc = allocator(1);
        let _a = alloc.reserve(TaskId::new(), 1, TaskPriority::High).await.unwrap();
        assert!(alloc.reserve(TaskId::new(), 1, TaskPriority::High).await.is_err());
        assert_eq!(alloc.usage().total_preemptions, 0);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let alloc = allocator(1);
        {
            let a = alloc.reserve(TaskId::new(), 1, TaskPriority::Medium).await.unwrap();
            let _guard = alloc.guard(a);
            assert_eq!(alloc.usage().in_use, 1);
        }
        assert_eq!(alloc.usage().in_use, 0);
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded_under_contention() {
        let alloc = allocator(3);
        let peak = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for i in 0..24u32 {
            let alloc = alloc.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let units = 1 + (i % 2);
                let a = alloc
                    .reserve_blocking(TaskId::new(), units, TaskPriority::Medium, None)
                    .await
                    .unwrap();
                let in_use = alloc.usage().in_use as u64;
                peak.fetch_max(in_use, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                alloc.release(&a).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(alloc.usage().in_use, 0);
    }

    #[tokio::test]
    async fn test_store_mirror_and_purge() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let alloc = ResourceAllocator::new(AllocatorConfig::default(), Arc::new(EventBus::new()))
            .with_store(store.clone());

        let a = alloc.reserve(TaskId::new(), 1, TaskPriority::Medium).await.unwrap();
        assert_eq!(store.scan_prefix(keys::ALLOCATION).unwrap().len(), 1);
        alloc.release(&a).await.unwrap();
        assert!(store.scan_prefix(keys::ALLOCATION).unwrap().is_empty());

        store.put(&keys::allocation("stale"), serde_json::json!({})).unwrap();
        assert_eq!(alloc.purge_persisted().unwrap(), 1);
    }
}
