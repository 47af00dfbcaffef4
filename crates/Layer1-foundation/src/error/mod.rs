//! Tandem 공용 에러
//!
//! 계층마다 자체 에러를 두지 않고 이 타입 하나로 전파합니다.
//! CLI 종료 코드는 [`Error::exit_code`]가 결정합니다.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // ------------------------------------------------------------------
    // 스케줄링 / 위임
    // ------------------------------------------------------------------
    /// No registered agent declares every requested capability
    #[error("No eligible agent for capabilities [{}]", .0.join(", "))]
    NoEligibleAgent(Vec<String>),

    /// Capacity is exhausted (transient, retried with backoff)
    #[error("Resource exhausted: requested {requested} units, {available} of {capacity} available")]
    ResourceExhausted {
        requested: u32,
        available: u32,
        capacity: u32,
    },

    /// One or more handoff preconditions did not hold
    #[error("Handoff precondition failed: {}", .failed.join(", "))]
    PreconditionFailed { failed: Vec<String> },

    /// A state machine edge that does not exist
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    // ------------------------------------------------------------------
    // 영속화
    // ------------------------------------------------------------------
    #[error("Storage failure: {0}")]
    Storage(String),

    /// Compare-and-swap write lost the race
    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Malformed record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // ------------------------------------------------------------------
    // 입력
    // ------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Unparseable identifier or enum value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Well-formed but semantically rejected request
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::Timeout(_) | Self::Conflict { .. }
        )
    }

    /// 0 success, 1 validation, 2 not found, 3 internal
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::InvalidInput(_) | Self::Config(_) => 1,
            Self::NotFound(_) => 2,
            _ => 3,
        }
    }

    pub fn invalid_transition(
        entity: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            entity: entity.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Validation("bad".into()).exit_code(), 1);
        assert_eq!(Error::Config("unreadable".into()).exit_code(), 1);
        assert_eq!(Error::NotFound("task".into()).exit_code(), 2);
        assert_eq!(Error::Internal("boom".into()).exit_code(), 3);
        assert_eq!(Error::invalid_transition("task", "Succeeded", "Running").exit_code(), 3);
    }

    #[test]
    fn test_retryable() {
        let exhausted = Error::ResourceExhausted {
            requested: 4,
            available: 1,
            capacity: 8,
        };
        assert!(exhausted.is_retryable());
        assert!(!Error::NoEligibleAgent(vec!["python-lint".into()]).is_retryable());
    }

    #[test]
    fn test_messages_name_details() {
        let err = Error::PreconditionFailed {
            failed: vec!["context_size".into(), "no_pending_tool_calls".into()],
        };
        assert!(err.to_string().contains("context_size, no_pending_tool_calls"));

        let err = Error::NoEligibleAgent(vec!["python-lint".into()]);
        assert!(err.to_string().contains("python-lint"));
    }
}
