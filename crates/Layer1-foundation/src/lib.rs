//! # tandem-foundation
//!
//! Foundation layer for Tandem:
//! - Error: 중앙 에러 타입 (`Error`, `Result`)
//! - Event: 감사(audit) 이벤트 버스
//! - Storage: 키-값 레코드 저장소 (Memory, SQLite), JSON 설정 저장소
//! - Config: 오케스트레이션 설정 (글로벌 + 프로젝트 병합)
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  tandem-hub (Objective → SubTask → Spoke)               │
//! │                     │                                   │
//! │  tandem-task (Allocator, Delegation, Handoff,           │
//! │               Orchestrator, WorkflowEngine)             │
//! │                     │                                   │
//! │          ┌──────────┴──────────┐                        │
//! │          ▼                     ▼                        │
//! │     KvStore (CAS)          EventBus (audit)             │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    AllocatorSettings, DelegationSettings, HandoffSettings, HubSettings, OrchestrationConfig,
    ORCHESTRATION_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::{keys, ConfigScope, JsonStore, KvStore, MemoryKvStore, SqliteKvStore, Versioned};

// ============================================================================
// Event (이벤트 시스템)
// ============================================================================
pub use event::{
    AuditRecord, EventBus, EventBusConfig, EventCategory, EventFilter, EventId, EventListener,
    EventSeverity, ListenerId, OrchestrationEvent,
};
