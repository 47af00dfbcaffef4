//! Event Bus - 감사(audit) 스트림
//!
//! 발행된 이벤트마다 단조 증가하는 순번(sequence)을 붙여 보관합니다.
//! 소비 방식은 세 가지입니다:
//! - `receiver()`: broadcast 스트림 (느린 수신자는 Lagged)
//! - `subscribe*()`: 필터가 걸린 비동기 리스너
//! - `since()` / `trail()`: 보관된 기록 재생
//!
//! 순번은 발행 순서와 같으므로, 오케스트레이터가 커밋 순서대로 발행하면
//! 감사 기록도 커밋 순서를 따릅니다.

use super::types::{EventCategory, EventSeverity, OrchestrationEvent};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

// ============================================================================
// Listener
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Push-style consumer of the audit stream
#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;

    /// Default filter when subscribed without one
    fn filter(&self) -> EventFilter {
        EventFilter::default()
    }

    async fn on_event(&self, event: &OrchestrationEvent);
}

// ============================================================================
// EventFilter
// ============================================================================

/// All set criteria must hold; an empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub categories: Vec<EventCategory>,
    /// `event_type` prefixes, e.g. `"task."`
    pub type_prefixes: Vec<String>,
    pub subject: Option<String>,
    pub min_severity: Option<EventSeverity>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: EventCategory) -> Self {
        self.categories.push(category);
        self
    }

    pub fn type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.type_prefixes.push(prefix.into());
        self
    }

    pub fn subject(mut self, subject: impl ToString) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn min_severity(mut self, severity: EventSeverity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn matches(&self, event: &OrchestrationEvent) -> bool {
        (self.categories.is_empty() || self.categories.contains(&event.category))
            && (self.type_prefixes.is_empty()
                || self
                    .type_prefixes
                    .iter()
                    .any(|p| event.event_type.starts_with(p.as_str())))
            && self
                .subject
                .as_deref()
                .map_or(true, |s| event.subject.as_deref() == Some(s))
            && self.min_severity.map_or(true, |min| event.severity >= min)
    }
}

// ============================================================================
// EventBus
// ============================================================================

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast buffer per receiver
    pub channel_capacity: usize,
    /// Records kept for replay
    pub retention: usize,
    /// Emit a `debug!` line per event
    pub log_events: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            retention: 4096,
            log_events: false,
        }
    }
}

/// A retained event with its position in the stream
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub sequence: u64,
    pub event: OrchestrationEvent,
}

struct Registration {
    listener: Arc<dyn EventListener>,
    filter: EventFilter,
}

/// Shared by constructor injection; there is no global bus.
pub struct EventBus {
    config: EventBusConfig,
    sender: broadcast::Sender<OrchestrationEvent>,
    listeners: RwLock<BTreeMap<ListenerId, Registration>>,
    next_listener: AtomicU64,
    retained: RwLock<VecDeque<AuditRecord>>,
    /// Last assigned sequence; 0 before the first event
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            config,
            sender,
            listeners: RwLock::new(BTreeMap::new()),
            next_listener: AtomicU64::new(1),
            retained: RwLock::new(VecDeque::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Register with the listener's own filter
    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let filter = listener.filter();
        self.subscribe_filtered(listener, filter).await
    }

    pub async fn subscribe_filtered(
        &self,
        listener: Arc<dyn EventListener>,
        filter: EventFilter,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        debug!(listener = listener.name(), listener_id = %id, "Audit listener registered");
        self.listeners
            .write()
            .await
            .insert(id, Registration { listener, filter });
        id
    }

    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.write().await.remove(&id).is_some()
    }

    /// Append to the stream and deliver. Returns the event's sequence.
    pub async fn publish(&self, event: OrchestrationEvent) -> u64 {
        // Sequence is taken under the retention lock so records stay ordered
        let sequence = {
            let mut retained = self.retained.write().await;
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            retained.push_back(AuditRecord {
                sequence,
                event: event.clone(),
            });
            while retained.len() > self.config.retention {
                retained.pop_front();
            }
            sequence
        };

        if self.config.log_events {
            debug!(
                sequence,
                event_type = %event.event_type,
                subject = event.subject.as_deref().unwrap_or("-"),
                "Audit event"
            );
        }

        // No receivers is fine
        let _ = self.sender.send(event.clone());

        // Deliver outside the lock so listeners may (un)subscribe
        let targets: Vec<(ListenerId, Arc<dyn EventListener>)> = self
            .listeners
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.filter.matches(&event))
            .map(|(id, r)| (*id, Arc::clone(&r.listener)))
            .collect();
        for (id, listener) in targets {
            trace!(listener_id = %id, event_type = %event.event_type, "Delivering");
            listener.on_event(&event).await;
        }
        sequence
    }

    pub fn receiver(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    /// Most recent `limit` events (all retained when `None`), oldest first
    pub async fn history(&self, limit: Option<usize>) -> Vec<OrchestrationEvent> {
        let retained = self.retained.read().await;
        let skip = limit.map_or(0, |l| retained.len().saturating_sub(l));
        retained.iter().skip(skip).map(|r| r.event.clone()).collect()
    }

    /// Retained records after `sequence`, for consumers resuming a stream
    pub async fn since(&self, sequence: u64) -> Vec<AuditRecord> {
        self.retained
            .read()
            .await
            .iter()
            .filter(|r| r.sequence > sequence)
            .cloned()
            .collect()
    }

    /// Retained events matching `filter`, oldest first
    pub async fn search(&self, filter: &EventFilter) -> Vec<OrchestrationEvent> {
        self.retained
            .read()
            .await
            .iter()
            .filter(|r| filter.matches(&r.event))
            .map(|r| r.event.clone())
            .collect()
    }

    /// Everything retained about one entity
    pub async fn trail(&self, subject: &str) -> Vec<OrchestrationEvent> {
        self.search(&EventFilter::new().subject(subject)).await
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TaskCounter {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventListener for TaskCounter {
        fn name(&self) -> &str {
            "task-counter"
        }

        fn filter(&self) -> EventFilter {
            EventFilter::new().category(EventCategory::Task)
        }

        async fn on_event(&self, _event: &OrchestrationEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn event(event_type: &str, category: EventCategory) -> OrchestrationEvent {
        OrchestrationEvent::new(event_type, category)
    }

    #[tokio::test]
    async fn test_listener_uses_its_filter() {
        let bus = EventBus::new();
        let counter = Arc::new(TaskCounter {
            seen: AtomicUsize::new(0),
        });
        let id = bus.subscribe(counter.clone()).await;

        bus.publish(event("task.status_changed", EventCategory::Task)).await;
        bus.publish(event("allocation.granted", EventCategory::Allocation)).await;
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id).await);
        bus.publish(event("task.status_changed", EventCategory::Task)).await;
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_sequences_and_replay() {
        let bus = EventBus::new();
        assert_eq!(bus.last_sequence(), 0);
        let first = bus.publish(event("task.a", EventCategory::Task)).await;
        let second = bus.publish(event("task.b", EventCategory::Task)).await;
        assert_eq!((first, second), (1, 2));

        let replay = bus.since(first).await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].event.event_type, "task.b");
    }

    #[tokio::test]
    async fn test_trail_and_filters() {
        let bus = EventBus::new();
        bus.publish(event("task.status_changed", EventCategory::Task).with_subject("t1"))
            .await;
        bus.publish(event("handoff.completed", EventCategory::Handoff).with_subject("t1"))
            .await;
        bus.publish(event("task.status_changed", EventCategory::Task).with_subject("t2"))
            .await;

        let trail = bus.trail("t1").await;
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[1].event_type, "handoff.completed");

        let warnings = bus
            .search(&EventFilter::new().type_prefix("task.").min_severity(EventSeverity::Warning))
            .await;
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() {
        let bus = EventBus::with_config(EventBusConfig {
            retention: 3,
            ..Default::default()
        });
        for i in 0..10 {
            bus.publish(event(&format!("system.tick.{}", i), EventCategory::System))
                .await;
        }

        let history = bus.history(None).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].event_type, "system.tick.7");
        assert_eq!(history[2].event_type, "system.tick.9");
        assert_eq!(bus.history(Some(1)).await[0].event_type, "system.tick.9");
        assert_eq!(bus.last_sequence(), 10);
    }

    #[tokio::test]
    async fn test_broadcast_receiver() {
        let bus = EventBus::new();
        let mut rx = bus.receiver();
        bus.publish(event("objective.submitted", EventCategory::Objective)).await;
        assert_eq!(rx.recv().await.unwrap().event_type, "objective.submitted");
    }
}
