//! Event System - 감사(audit) 이벤트 발행/구독
//!
//! Task 상태 전이, 핸드오프, 할당/해제, 재시도 등 모든 상태 변화를
//! append-only 스트림으로 외부 관측 도구에 노출합니다.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        EventBus                           │
//! │   publish(event) ─┬──────────────┬──────────────┐         │
//! │                   ▼              ▼              ▼         │
//! │            broadcast rx     listeners     sequenced records│
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{AuditRecord, EventBus, EventBusConfig, EventFilter, EventListener, ListenerId};

pub use types::{
    // Event constructors
    allocation,
    delegation,
    handoff,
    objective,
    spoke,
    system,
    task,
    workflow,
    // Core types
    EventCategory,
    EventId,
    EventSeverity,
    OrchestrationEvent,
};
