//! # tandem-task
//!
//! Task orchestration core for Tandem.
//! Places tasks on capable agents, arbitrates shared capacity and moves
//! execution context between agents.
//!
//! ## Components
//!
//! - **ResourceAllocator**: 우선순위 기반 용량 예약/해제, 선점(preemption)
//! - **DelegationManager**: 역량 매칭, 점수화, 재시도/백오프 감독 루프
//! - **HandoffManager**: 컨텍스트 소유권 이전 (lease/epoch, 사전 조건, 멱등 재전송)
//! - **TaskOrchestrator**: Task/Workflow 상태 기계, CAS 영속화, 복구
//! - **WorkflowEngine**: TDD/버그 수정/기능 개발 템플릿과 조건 분기
//!
//! ## 흐름
//!
//! ```text
//! WorkflowEngine ──▶ TaskOrchestrator ──▶ DelegationManager ──▶ Agent
//!                          │                  │
//!                          ▼                  ▼
//!                    HandoffManager    ResourceAllocator
//! ```

pub mod agent;
pub mod allocator;
pub mod cancel;
pub mod context;
pub mod delegation;
pub mod engine;
pub mod handoff;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod task;
pub mod workflow;

// Task model
pub use state::{TaskStatus, WorkflowStatus};
pub use task::{
    HandoffRequest, ResourceLimits, RetryRecord, Task, TaskId, TaskPriority, TaskResult, TaskSpec,
};
pub use workflow::{ExecutionMode, Workflow, WorkflowId};

// Agents
pub use agent::{Agent, AgentCapability, AgentError, AgentId};
pub use context::{AgentContext, ToolCallRecord};

// Allocation
pub use allocator::{
    AllocationGuard, AllocationId, AllocatorConfig, Preemption, ResourceAllocator, ResourceUsage,
    TaskAllocation,
};

// Delegation & retry
pub use cancel::{CancelToken, Interrupt};
pub use delegation::{
    AgentMatch, AgentStats, AttemptOutcome, DelegationConfig, DelegationManager,
    DelegationOutcome, ExecutionHooks, TaskRequest,
};
pub use retry::{RetryBackoff, RetryPolicy};

// Handoff
pub use handoff::{
    ContextLease, ContextSizeLimit, HandoffCheck, HandoffConfig, HandoffManager,
    HandoffPrecondition, HandoffResult, HandoffStats, NoPendingToolCalls,
};

// Orchestration
pub use engine::{
    BranchArm, BranchCondition, BranchDecision, BugFixWorkflow, ConditionalBranch,
    FeatureDevelopmentWorkflow, StepSpec, TddWorkflow, TemplateRegistry, TemplateReport,
    WorkflowEngine, WorkflowStep, WorkflowTemplate,
};
pub use orchestrator::{
    OrchestratorConfig, RestoreReport, TaskOrchestrator, TaskStatusChange, Transition,
    WorkflowReport,
};
