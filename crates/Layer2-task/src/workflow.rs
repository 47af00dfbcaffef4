//! Workflow - 작업 묶음과 상태 도출
//!
//! 워크플로 상태는 저장된 값이 아니라 구성 작업들의 상태로부터 도출(fold)됩니다.
//!
//! - Sequential: 작업은 추가된 순서대로 하나씩 실행. 필수 작업이 실패하면
//!   이후 PENDING 작업은 모두 취소되고 워크플로는 FAILED.
//! - Parallel: 의존성이 충족된 작업은 동시에 실행. 모든 작업이 끝날 때까지
//!   기다리며, 실패한 필수 작업에 (전이적으로) 의존하는 작업은 취소됩니다.
//!
//! 선택(optional) 작업의 실패/취소는 의존성 충족으로 간주합니다.

use crate::state::{TaskStatus, WorkflowStatus};
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tandem_foundation::Error;
use uuid::Uuid;

/// Unique identifier for a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Validation(format!("Invalid workflow id '{}': {}", s, e)))
    }
}

/// How tasks in a workflow are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Status and mandatory flag of one member task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberState {
    pub status: TaskStatus,
    pub mandatory: bool,
}

impl MemberState {
    /// Counts as done for dependency purposes
    fn satisfies_dependents(&self) -> bool {
        match self.status {
            TaskStatus::Succeeded => true,
            TaskStatus::Failed | TaskStatus::Cancelled => !self.mandatory,
            _ => false,
        }
    }

    fn is_blocking_failure(&self) -> bool {
        self.mandatory && matches!(self.status, TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// Derived status plus the pending tasks that can no longer run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldOutcome {
    pub status: WorkflowStatus,
    pub cancel: Vec<TaskId>,
}

/// A named group of tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub mode: ExecutionMode,

    /// Member tasks in insertion order
    pub tasks: Vec<TaskId>,

    /// Parallel mode: task → tasks it waits for
    #[serde(default)]
    pub dependencies: HashMap<TaskId, Vec<TaskId>>,

    pub status: WorkflowStatus,

    /// Template that produced this workflow, if any
    #[serde(default)]
    pub template: Option<String>,

    /// Owning entity (e.g. an objective id)
    #[serde(default)]
    pub owner: Option<String>,

    /// No more tasks will be added; required before COMPLETED
    #[serde(default)]
    pub sealed: bool,

    /// Initial outputs copied into each task's context on first checkout
    #[serde(default)]
    pub seed: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub version: u64,
}

impl Workflow {
    pub fn new(name: impl Into<String>, mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            mode,
            tasks: Vec::new(),
            dependencies: HashMap::new(),
            status: WorkflowStatus::Pending,
            template: None,
            owner: None,
            sealed: false,
            seed: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains(task_id)
    }

    /// Tasks that may start now
    pub fn ready(&self, lookup: impl Fn(&TaskId) -> Option<MemberState>) -> Vec<TaskId> {
        if self.status.is_terminal() {
            return Vec::new();
        }

        match self.mode {
            ExecutionMode::Sequential => {
                for id in &self.tasks {
                    let Some(member) = lookup(id) else {
                        continue;
                    };
                    if member.satisfies_dependents() {
                        continue;
                    }
                    return if member.status == TaskStatus::Pending {
                        vec![*id]
                    } else {
                        Vec::new()
                    };
                }
                Vec::new()
            }
            ExecutionMode::Parallel => self
                .tasks
                .iter()
                .filter(|id| lookup(id).is_some_and(|m| m.status == TaskStatus::Pending))
                .filter(|id| {
                    self.dependencies.get(id).map_or(true, |deps| {
                        deps.iter()
                            .all(|d| lookup(d).is_some_and(|m| m.satisfies_dependents()))
                    })
                })
                .copied()
                .collect(),
        }
    }

    /// Derive workflow status from member states. Terminal workflows stay terminal.
    pub fn fold(&self, lookup: impl Fn(&TaskId) -> Option<MemberState>) -> FoldOutcome {
        if self.status.is_terminal() {
            return FoldOutcome {
                status: self.status,
                cancel: Vec::new(),
            };
        }

        let members: Vec<(TaskId, MemberState)> = self
            .tasks
            .iter()
            .filter_map(|id| lookup(id).map(|m| (*id, m)))
            .collect();

        let cancel = match self.mode {
            ExecutionMode::Sequential => {
                let failed_at = members.iter().position(|(_, m)| m.is_blocking_failure());
                match failed_at {
                    Some(pos) => members[pos + 1..]
                        .iter()
                        .filter(|(_, m)| m.status == TaskStatus::Pending)
                        .map(|(id, _)| *id)
                        .collect(),
                    None => Vec::new(),
                }
            }
            ExecutionMode::Parallel => self.blocked_dependents(&members),
        };

        // Status after the cascade is applied
        let cancelled: HashSet<TaskId> = cancel.iter().copied().collect();
        let effective = |id: &TaskId, m: &MemberState| {
            if cancelled.contains(id) {
                TaskStatus::Cancelled
            } else {
                m.status
            }
        };

        let all_terminal = members.iter().all(|(id, m)| effective(id, m).is_terminal());
        let any_failed = members
            .iter()
            .any(|(_, m)| m.mandatory && m.status == TaskStatus::Failed);
        let any_cancelled = members
            .iter()
            .any(|(id, m)| m.mandatory && effective(id, m) == TaskStatus::Cancelled);
        let any_started = members.iter().any(|(_, m)| m.status != TaskStatus::Pending);

        let status = if all_terminal && any_failed {
            WorkflowStatus::Failed
        } else if all_terminal && any_cancelled {
            WorkflowStatus::Cancelled
        } else if all_terminal && self.sealed {
            WorkflowStatus::Completed
        } else if any_started || self.status == WorkflowStatus::Running {
            WorkflowStatus::Running
        } else {
            WorkflowStatus::Pending
        };

        FoldOutcome { status, cancel }
    }

    /// Pending tasks that transitively depend on a failed mandatory task
    fn blocked_dependents(&self, members: &[(TaskId, MemberState)]) -> Vec<TaskId> {
        let mut doomed: HashSet<TaskId> = members
            .iter()
            .filter(|(_, m)| m.is_blocking_failure())
            .map(|(id, _)| *id)
            .collect();

        // Fixed point over the dependency graph
        loop {
            let before = doomed.len();
            for (id, member) in members {
                if member.status != TaskStatus::Pending || doomed.contains(id) {
                    continue;
                }
                let blocked = self
                    .dependencies
                    .get(id)
                    .is_some_and(|deps| deps.iter().any(|d| doomed.contains(d)));
                if blocked {
                    doomed.insert(*id);
                }
            }
            if doomed.len() == before {
                break;
            }
        }

        members
            .iter()
            .filter(|(id, m)| m.status == TaskStatus::Pending && doomed.contains(id))
            .map(|(id, _)| *id)
            .collect()
    }
}
