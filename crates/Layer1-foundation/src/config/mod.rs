//! Config - 오케스트레이션 설정 관리
//!
//! - `orchestration.rs` - 할당기/위임/핸드오프/허브 설정 (JSON, 글로벌 + 프로젝트 병합)

mod orchestration;

pub use orchestration::{
    AllocatorSettings, DelegationSettings, HandoffSettings, HubSettings, OrchestrationConfig,
    ORCHESTRATION_CONFIG_FILE,
};
