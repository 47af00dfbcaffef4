//! Event Types - 오케스트레이션 전반에서 사용되는 이벤트 타입 정의
//!
//! 상태 전이, 할당/해제, 재시도, 핸드오프 등 감사(audit) 스트림에 기록되는
//! 모든 이벤트를 정의합니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ============================================================================
// Event ID
// ============================================================================

/// 이벤트 고유 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// 새 이벤트 ID 생성
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event Category
// ============================================================================

/// 이벤트 카테고리
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// 시스템 이벤트 (시작, 복구)
    System,
    /// Task 상태 전이
    Task,
    /// Workflow 상태 전이 및 분기 결정
    Workflow,
    /// 리소스 할당/해제/선점
    Allocation,
    /// 에이전트 매칭 및 재시도
    Delegation,
    /// 컨텍스트 핸드오프
    Handoff,
    /// Objective 수명주기
    Objective,
    /// Spoke 상태 변경
    Spoke,
}

impl EventCategory {
    /// 카테고리 문자열 반환
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Task => "task",
            Self::Workflow => "workflow",
            Self::Allocation => "allocation",
            Self::Delegation => "delegation",
            Self::Handoff => "handoff",
            Self::Objective => "objective",
            Self::Spoke => "spoke",
        }
    }
}

// ============================================================================
// Event Severity
// ============================================================================

/// 이벤트 심각도
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

// ============================================================================
// OrchestrationEvent - 핵심 이벤트 타입
// ============================================================================

/// Append-only audit record for one state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    /// 이벤트 ID
    pub id: EventId,

    /// 이벤트 타입 (예: "task.status_changed", "handoff.completed")
    pub event_type: String,

    /// 이벤트 카테고리
    pub category: EventCategory,

    /// 심각도
    pub severity: EventSeverity,

    /// 이벤트 발생 시간
    pub timestamp: DateTime<Utc>,

    /// 이벤트 소스 (컴포넌트)
    pub source: String,

    /// 대상 엔티티 ID (task, workflow, objective ...)
    pub subject: Option<String>,

    /// 이벤트 데이터
    pub data: Value,

    /// 추가 메타데이터
    pub metadata: HashMap<String, Value>,
}

impl OrchestrationEvent {
    /// 새 이벤트 생성
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            category,
            severity: EventSeverity::Info,
            timestamp: Utc::now(),
            source: String::new(),
            subject: None,
            data: Value::Null,
            metadata: HashMap::new(),
        }
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_subject(mut self, subject: impl ToString) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ============================================================================
// 사전 정의된 이벤트 타입들
// ============================================================================

/// 시스템 이벤트
pub mod system {
    use super::*;

    /// 저장소에서 상태 복구 완료
    pub fn restored(tasks: usize, workflows: usize, requeued: usize) -> OrchestrationEvent {
        OrchestrationEvent::new("system.restored", EventCategory::System)
            .with_source("orchestrator")
            .with_data(serde_json::json!({
                "tasks": tasks,
                "workflows": workflows,
                "requeued": requeued,
            }))
    }
}

/// Task 이벤트
pub mod task {
    use super::*;

    pub fn status_changed(
        task_id: &str,
        from: &str,
        to: &str,
        agent: Option<&str>,
    ) -> OrchestrationEvent {
        let severity = if to == "failed" {
            EventSeverity::Error
        } else {
            EventSeverity::Info
        };
        OrchestrationEvent::new("task.status_changed", EventCategory::Task)
            .with_severity(severity)
            .with_source("orchestrator")
            .with_subject(task_id)
            .with_data(serde_json::json!({
                "from": from,
                "to": to,
                "agent": agent,
            }))
    }

    /// 취소 이후 도착한 결과 폐기
    pub fn result_discarded(task_id: &str, agent: &str) -> OrchestrationEvent {
        OrchestrationEvent::new("task.result_discarded", EventCategory::Task)
            .with_severity(EventSeverity::Warning)
            .with_source("orchestrator")
            .with_subject(task_id)
            .with_data(serde_json::json!({ "agent": agent }))
    }
}

/// Workflow 이벤트
pub mod workflow {
    use super::*;

    pub fn status_changed(workflow_id: &str, from: &str, to: &str) -> OrchestrationEvent {
        OrchestrationEvent::new("workflow.status_changed", EventCategory::Workflow)
            .with_source("orchestrator")
            .with_subject(workflow_id)
            .with_data(serde_json::json!({ "from": from, "to": to }))
    }

    pub fn branch_selected(workflow_id: &str, branch: &str, selected: &str) -> OrchestrationEvent {
        OrchestrationEvent::new("workflow.branch_selected", EventCategory::Workflow)
            .with_source("engine")
            .with_subject(workflow_id)
            .with_data(serde_json::json!({ "branch": branch, "selected": selected }))
    }
}

/// 리소스 할당 이벤트
pub mod allocation {
    use super::*;

    pub fn granted(
        allocation_id: &str,
        task_id: &str,
        units: u32,
        priority: &str,
    ) -> OrchestrationEvent {
        OrchestrationEvent::new("allocation.granted", EventCategory::Allocation)
            .with_severity(EventSeverity::Debug)
            .with_source("allocator")
            .with_subject(allocation_id)
            .with_data(serde_json::json!({
                "task_id": task_id,
                "units": units,
                "priority": priority,
            }))
    }

    pub fn released(allocation_id: &str, task_id: &str, units: u32) -> OrchestrationEvent {
        OrchestrationEvent::new("allocation.released", EventCategory::Allocation)
            .with_severity(EventSeverity::Debug)
            .with_source("allocator")
            .with_subject(allocation_id)
            .with_data(serde_json::json!({ "task_id": task_id, "units": units }))
    }

    pub fn preempted(allocation_id: &str, task_id: &str, by_task: &str) -> OrchestrationEvent {
        OrchestrationEvent::new("allocation.preempted", EventCategory::Allocation)
            .with_severity(EventSeverity::Warning)
            .with_source("allocator")
            .with_subject(allocation_id)
            .with_data(serde_json::json!({ "task_id": task_id, "by_task": by_task }))
    }
}

/// 위임(delegation) 이벤트
pub mod delegation {
    use super::*;

    pub fn matched(task_id: &str, agent: &str, score: f64) -> OrchestrationEvent {
        OrchestrationEvent::new("delegation.matched", EventCategory::Delegation)
            .with_source("delegation")
            .with_subject(task_id)
            .with_data(serde_json::json!({ "agent": agent, "score": score }))
    }

    pub fn retry(task_id: &str, attempt: u32, delay_ms: u64, error: &str) -> OrchestrationEvent {
        OrchestrationEvent::new("delegation.retry", EventCategory::Delegation)
            .with_severity(EventSeverity::Warning)
            .with_source("delegation")
            .with_subject(task_id)
            .with_data(serde_json::json!({
                "attempt": attempt,
                "delay_ms": delay_ms,
                "error": error,
            }))
    }

    pub fn failed(task_id: &str, attempts: u32, error: &str) -> OrchestrationEvent {
        OrchestrationEvent::new("delegation.failed", EventCategory::Delegation)
            .with_severity(EventSeverity::Error)
            .with_source("delegation")
            .with_subject(task_id)
            .with_data(serde_json::json!({ "attempts": attempts, "error": error }))
    }
}

/// 핸드오프 이벤트
pub mod handoff {
    use super::*;

    pub fn completed(task_id: &str, sequence: u64, from: &str, to: &str) -> OrchestrationEvent {
        OrchestrationEvent::new("handoff.completed", EventCategory::Handoff)
            .with_source("handoff")
            .with_subject(task_id)
            .with_data(serde_json::json!({
                "sequence": sequence,
                "from": from,
                "to": to,
            }))
    }

    pub fn rejected(task_id: &str, sequence: u64, failed: &[String]) -> OrchestrationEvent {
        OrchestrationEvent::new("handoff.rejected", EventCategory::Handoff)
            .with_severity(EventSeverity::Warning)
            .with_source("handoff")
            .with_subject(task_id)
            .with_data(serde_json::json!({ "sequence": sequence, "failed": failed }))
    }
}

/// Objective 이벤트
pub mod objective {
    use super::*;

    pub fn submitted(objective_id: &str, subtasks: usize, strategy: &str) -> OrchestrationEvent {
        OrchestrationEvent::new("objective.submitted", EventCategory::Objective)
            .with_source("hub")
            .with_subject(objective_id)
            .with_data(serde_json::json!({ "subtasks": subtasks, "strategy": strategy }))
    }

    pub fn status_changed(objective_id: &str, from: &str, to: &str) -> OrchestrationEvent {
        OrchestrationEvent::new("objective.status_changed", EventCategory::Objective)
            .with_source("hub")
            .with_subject(objective_id)
            .with_data(serde_json::json!({ "from": from, "to": to }))
    }
}

/// Spoke 이벤트
pub mod spoke {
    use super::*;

    pub fn status_changed(spoke_id: &str, from: &str, to: &str) -> OrchestrationEvent {
        let severity = if to == "unreachable" {
            EventSeverity::Warning
        } else {
            EventSeverity::Debug
        };
        OrchestrationEvent::new("spoke.status_changed", EventCategory::Spoke)
            .with_severity(severity)
            .with_source("hub")
            .with_subject(spoke_id)
            .with_data(serde_json::json!({ "from": from, "to": to }))
    }

    pub fn redelegated(subtask_id: &str, from_spoke: &str, to_spoke: &str) -> OrchestrationEvent {
        OrchestrationEvent::new("spoke.redelegated", EventCategory::Spoke)
            .with_severity(EventSeverity::Warning)
            .with_source("hub")
            .with_subject(subtask_id)
            .with_data(serde_json::json!({ "from": from_spoke, "to": to_spoke }))
    }
}

// ============================================================================
// 테스트
// ============================================================================
