//! # tandem-hub
//!
//! Hub-and-spoke coordination on top of `tandem-task`.
//!
//! 운영자가 제출한 Objective를 전략(`DecompositionStrategy`)으로 SubTask들로
//! 분해하고, 역량을 가진 스포크 에이전트에게 배정합니다.
//! 응답이 끊긴 스포크의 작업은 다른 스포크로 재위임됩니다.
//!
//! ```text
//!                 ┌──────────────────────┐
//!   Objective ──▶ │ HubSpokeCoordinator  │ ── liveness monitor
//!                 └──────────┬───────────┘
//!                            │ SubTask = Task
//!              ┌─────────────┼─────────────┐
//!              ▼             ▼             ▼
//!          spoke-a       spoke-b       spoke-c
//! ```

pub mod coordinator;
pub mod objective;
pub mod spoke;
pub mod strategy;

pub use coordinator::{HubSpokeCoordinator, ObjectiveReport, SubTaskReport};
pub use objective::{
    Objective, ObjectiveId, ObjectiveStatus, Redelegation, SubTask, SubTaskId, SubTaskSpec,
};
pub use spoke::{LostSpoke, SpokeAgent, SpokeInfo, SpokeStatus};
pub use strategy::{
    CapabilityDrivenStrategy, DecompositionStrategy, FixedTemplateStrategy, RecursiveStrategy,
};
