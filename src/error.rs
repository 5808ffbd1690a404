use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::anthropic::AnthropicError;

pub type Result<T, E = ForgeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ForgeError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        ForgeError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

// Unique/check/foreign-key failures map to ConstraintViolation.
impl From<rusqlite::Error> for ForgeError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ForgeError::ConstraintViolation(
                    msg.clone().unwrap_or_else(|| "sqlite constraint".to_string()),
                )
            }
            rusqlite::Error::FromSqlConversionFailure(_, _, cause) => {
                ForgeError::Corrupt(cause.to_string())
            }
            _ => ForgeError::Sqlite(err),
        }
    }
}

/// Closed classification of a stage or job failure.
///
/// Persisted on Job rows and consulted by the invoker (retry allow-list) and
/// the auto-repair gate (deny-list).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Explicit validation failure reported by the agent. Never retried.
    Validation,
    /// The agent run crashed or produced unusable output.
    AgentExecution,
    /// The stage exceeded its wall-clock budget.
    Timeout,
    /// Outage of something outside the job (API, network, credentials).
    ExternalInfrastructure,
}

impl FailureClass {
    pub const ALL: [FailureClass; 4] = [
        FailureClass::Validation,
        FailureClass::AgentExecution,
        FailureClass::Timeout,
        FailureClass::ExternalInfrastructure,
    ];

    /// Fixed retry allow-list.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::AgentExecution | FailureClass::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Validation => "validation",
            FailureClass::AgentExecution => "agent_execution",
            FailureClass::Timeout => "timeout",
            FailureClass::ExternalInfrastructure => "external_infrastructure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by an agent or remediation capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("agent execution failed: {0}")]
    Execution(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("external infrastructure error: {0}")]
    Infrastructure(String),
}

impl AgentError {
    pub fn class(&self) -> FailureClass {
        match self {
            AgentError::Validation(_) => FailureClass::Validation,
            AgentError::Execution(_) => FailureClass::AgentExecution,
            AgentError::Timeout(_) => FailureClass::Timeout,
            AgentError::Infrastructure(_) => FailureClass::ExternalInfrastructure,
        }
    }

    /// Rebuild an error from a class reported by the agent itself.
    pub fn from_class(class: FailureClass, message: String) -> Self {
        match class {
            FailureClass::Validation => AgentError::Validation(message),
            FailureClass::AgentExecution => AgentError::Execution(message),
            FailureClass::Timeout => AgentError::Timeout(message),
            FailureClass::ExternalInfrastructure => AgentError::Infrastructure(message),
        }
    }
}

impl From<AnthropicError> for AgentError {
    fn from(err: AnthropicError) -> Self {
        match err {
            err if err.is_timeout() => AgentError::Timeout(format!("HTTP request: {err}")),
            AnthropicError::EmptyResponse => {
                AgentError::Execution("model returned an empty response".to_string())
            }
            other => AgentError::Infrastructure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_allow_list() {
        assert!(FailureClass::AgentExecution.is_retryable());
        assert!(FailureClass::Timeout.is_retryable());
        assert!(!FailureClass::Validation.is_retryable());
        assert!(!FailureClass::ExternalInfrastructure.is_retryable());
    }

    #[test]
    fn failure_class_text_roundtrip() {
        for class in FailureClass::ALL {
            assert_eq!(FailureClass::parse(class.as_str()), Some(class));
        }
        assert_eq!(FailureClass::parse("Business"), None);
    }

    #[test]
    fn agent_error_maps_to_class() {
        assert_eq!(
            AgentError::Timeout("stage exceeded 5s".into()).class(),
            FailureClass::Timeout
        );
        assert_eq!(
            AgentError::Infrastructure("503".into()).class(),
            FailureClass::ExternalInfrastructure
        );
        assert_eq!(
            AgentError::Timeout("stage exceeded 90s".into()).to_string(),
            "timed out: stage exceeded 90s"
        );
    }

    #[test]
    fn rate_limit_is_infrastructure() {
        let err: AgentError = AnthropicError::RateLimited {
            retry_after_ms: 1000,
        }
        .into();
        assert_eq!(err.class(), FailureClass::ExternalInfrastructure);
    }

    #[test]
    fn constraint_errors_are_classified() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err: ForgeError = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, ForgeError::ConstraintViolation(_)));
    }
}
