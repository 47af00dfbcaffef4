//! Agent contract
//!
//! 오케스트레이터가 작업을 맡기는 실행 주체(에이전트)의 인터페이스입니다.
//! 에이전트는 자신이 처리할 수 있는 capability 목록을 선언하고,
//! `invoke`에서 결과 또는 (재시도 가능/불가) 오류를 돌려줍니다.

use crate::context::AgentContext;
use crate::task::{Task, TaskResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Agent identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A skill an agent declares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Self-reported proficiency in [0, 1]; used as a tie-breaker bonus
    #[serde(default)]
    pub proficiency: Option<f64>,
}

impl AgentCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            proficiency: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_proficiency(mut self, proficiency: f64) -> Self {
        self.proficiency = Some(proficiency.clamp(0.0, 1.0));
        self
    }
}

/// Failure reported by an agent
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    /// Transient; the attempt may be retried
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent; retrying will not help
    #[error("terminal: {0}")]
    Terminal(String),
}

impl AgentError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(m) | Self::Terminal(m) => m,
        }
    }
}

/// An executor of tasks
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> AgentId;

    fn capabilities(&self) -> Vec<AgentCapability>;

    /// Unreachable agents are skipped by delegation
    fn is_available(&self) -> bool {
        true
    }

    /// Perform (part of) the task. The context carries reasoning and
    /// tool-call state across retries and handoffs.
    async fn invoke(&self, task: &Task, context: &mut AgentContext)
        -> Result<TaskResult, AgentError>;
}

/// Whether `capabilities` cover every name in `required`
pub fn covers(capabilities: &[AgentCapability], required: &[String]) -> bool {
    required
        .iter()
        .all(|r| capabilities.iter().any(|c| &c.name == r))
}
