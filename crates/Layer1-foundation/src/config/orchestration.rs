//! Orchestration Config - 통합 설정
//!
//! ```json
//! {
//!   "allocator": { "capacity": 8, "preemptionGraceSecs": 30 },
//!   "delegation": { "attemptTimeoutSecs": 300, "backoffBaseMs": 1000 },
//!   "handoff": { "maxContextBytes": 262144 },
//!   "hub": { "livenessTimeoutSecs": 60 }
//! }
//! ```
//!
//! 글로벌(`~/.config/tandem/`) 설정 위에 프로젝트(`.tandem/`) 설정을 덮어씁니다.
//! 프로젝트 파일에 적힌 키만 덮어쓰고 나머지는 글로벌 값을 유지합니다.

use crate::storage::JsonStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// 설정 파일명
pub const ORCHESTRATION_CONFIG_FILE: &str = "orchestration.json";

// ============================================================================
// OrchestrationConfig (통합)
// ============================================================================

/// Top-level orchestration settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationConfig {
    #[serde(default)]
    pub allocator: AllocatorSettings,

    #[serde(default)]
    pub delegation: DelegationSettings,

    #[serde(default)]
    pub handoff: HandoffSettings,

    #[serde(default)]
    pub hub: HubSettings,
}

impl OrchestrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 글로벌 + 프로젝트 병합 로드
    pub fn load() -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        if let Ok(global) = JsonStore::global() {
            if let Some(value) = global.load_optional::<Value>(ORCHESTRATION_CONFIG_FILE)? {
                debug!(path = %global.file_path(ORCHESTRATION_CONFIG_FILE).display(), "Loaded global config");
                merge_values(&mut merged, value);
            }
        }

        if let Ok(project) = JsonStore::current_project() {
            if let Some(value) = project.load_optional::<Value>(ORCHESTRATION_CONFIG_FILE)? {
                debug!(path = %project.file_path(ORCHESTRATION_CONFIG_FILE).display(), "Loaded project config");
                merge_values(&mut merged, value);
            }
        }

        Ok(serde_json::from_value(merged)?)
    }

    /// 특정 저장소에서만 로드 (없으면 기본값)
    pub fn load_from(store: &JsonStore) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        if let Some(value) = store.load_optional::<Value>(ORCHESTRATION_CONFIG_FILE)? {
            merge_values(&mut merged, value);
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// 프로젝트 설정 저장
    pub fn save_project(&self) -> Result<()> {
        JsonStore::current_project()?.save(ORCHESTRATION_CONFIG_FILE, self)
    }
}

/// Recursive object overlay: keys present in `overlay` win
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// ============================================================================
// Sections
// ============================================================================

/// 리소스 할당기 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocatorSettings {
    /// 총 동시 실행 단위
    pub capacity: u32,
    /// 선점 대상이 되기 전 최소 보유 시간
    pub preemption_grace_secs: u64,
    /// 블로킹 예약 대기 한도
    pub reserve_timeout_secs: u64,
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self {
            capacity: 8,
            preemption_grace_secs: 30,
            reserve_timeout_secs: 120,
        }
    }
}

impl AllocatorSettings {
    pub fn preemption_grace(&self) -> Duration {
        Duration::from_secs(self.preemption_grace_secs)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_secs)
    }
}

/// 위임/재시도 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelegationSettings {
    /// 실행 중인 작업 1개당 감점
    pub load_weight: f64,
    /// 성공률 가산점 가중치
    pub success_weight: f64,
    /// 에이전트 호출 1회 시간 한도
    pub attempt_timeout_secs: u64,
    pub default_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// 0.0 - 1.0
    pub jitter: f64,
    /// 시도 1회 안에서 따라갈 수 있는 핸드오프 수
    pub max_handoffs_per_attempt: u32,
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self {
            load_weight: 0.1,
            success_weight: 0.5,
            attempt_timeout_secs: 300,
            default_max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            jitter: 0.2,
            max_handoffs_per_attempt: 8,
        }
    }
}

impl DelegationSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// 핸드오프 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandoffSettings {
    pub timeout_secs: u64,
    /// 컨텍스트 직렬화 크기 한도
    pub max_context_bytes: usize,
    /// 종료된 작업의 핸드오프 기록을 보관할 개수 (오래된 것부터 삭제)
    pub retained_tasks: usize,
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_context_bytes: 256 * 1024,
            retained_tasks: 1024,
        }
    }
}

impl HandoffSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 허브/스포크 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// 이 시간 동안 heartbeat가 없으면 UNREACHABLE
    pub liveness_timeout_secs: u64,
    pub liveness_check_interval_ms: u64,
    /// SubTask 하나당 최대 실행 시도
    pub max_subtask_attempts: u32,
    /// 재귀 분해 최대 깊이
    pub max_refinement_depth: u32,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: 60,
            liveness_check_interval_ms: 1000,
            max_subtask_attempts: 3,
            max_refinement_depth: 3,
        }
    }
}

impl HubSettings {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }
}
