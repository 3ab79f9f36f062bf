//! Error types for the authorization core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid message length: 0")]
    FrameEmpty,

    #[error("message too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("IPC error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("portal {op} failed: {message}")]
    Portal { op: &'static str, message: String },

    #[error("portal call timed out after {0:?}")]
    PortalTimeout(std::time::Duration),

    #[error("connection deadline exceeded")]
    DeadlineExceeded,

    #[error("portal unavailable, check stale cache: {0}")]
    StaleFallback(Box<AgentError>),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn portal(op: &'static str, message: impl Into<String>) -> Self {
        AgentError::Portal {
            op,
            message: message.into(),
        }
    }

    /// Recoverable conditions: the same request may succeed later.
    pub fn is_temporary(&self) -> bool {
        match self {
            AgentError::CircuitOpen
            | AgentError::Portal { .. }
            | AgentError::PortalTimeout(_)
            | AgentError::DeadlineExceeded
            | AgentError::Io(_) => true,
            AgentError::StaleFallback(inner) => inner.is_temporary(),
            _ => false,
        }
    }

    /// Conditions that retrying will not fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AgentError::Validation(_)
                | AgentError::Config(_)
                | AgentError::FrameEmpty
                | AgentError::FrameTooLarge { .. }
                | AgentError::Serialization(_)
        )
    }

    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::FrameEmpty | AgentError::FrameTooLarge { .. } => "framing",
            AgentError::ConnectionClosed => "closed",
            AgentError::Io(_) => "io",
            AgentError::Serialization(_) => "serialization",
            AgentError::Validation(_) => "validation",
            AgentError::CircuitOpen => "circuit_open",
            AgentError::Portal { .. } => "portal",
            AgentError::PortalTimeout(_) => "portal_timeout",
            AgentError::DeadlineExceeded => "deadline",
            AgentError::StaleFallback(_) => "stale_fallback",
            AgentError::Config(_) => "config",
            AgentError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(e.to_string())
    }
}
