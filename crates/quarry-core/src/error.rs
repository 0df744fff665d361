//! Unified error types for Quarry

use thiserror::Error;

/// Unified error type for all Quarry operations
#[derive(Error, Debug)]
pub enum QuarryError {
    // Transient infrastructure errors (retried at the tool and agent layers)
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    // Policy errors
    #[error("Domain '{host}' is not allowed for tool '{tool}'")]
    DomainNotAllowed { tool: String, host: String },

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    #[error("Tool manager is closed")]
    ToolManagerClosed,

    // Agent errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Dependency missing: {0}")]
    DependencyMissing(String),

    #[error("Agent error: {0}")]
    Agent(String),

    // Run state errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already exists: {0}")]
    RunExists(String),

    #[error("Invalid run id: {0}")]
    InvalidRunId(String),

    #[error("Job context error: {0}")]
    Context(String),

    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl QuarryError {
    /// Whether this error belongs to the transient set that retry policies act on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::ConnectionRefused(_)
        )
    }

    /// Stable tag used in `{kind, message}` error records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::ConnectionRefused(_) => "connection_refused",
            Self::DomainNotAllowed { .. } => "domain_not_allowed",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::DuplicateTool(_) => "duplicate_tool",
            Self::ToolManagerClosed => "tool_manager_closed",
            Self::Configuration(_) => "configuration_error",
            Self::DependencyMissing(_) => "dependency_missing",
            Self::Agent(_) => "agent_error",
            Self::RunNotFound(_) => "run_not_found",
            Self::RunExists(_) => "run_exists",
            Self::InvalidRunId(_) => "invalid_run_id",
            Self::Context(_) => "context_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Other(_) => "error",
        }
    }
}

impl From<reqwest::Error> for QuarryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::ConnectionRefused(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Result type alias using QuarryError
pub type Result<T> = std::result::Result<T, QuarryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(QuarryError::Network("reset".into()).is_transient());
        assert!(QuarryError::Timeout("slow".into()).is_transient());
        assert!(QuarryError::ConnectionRefused("down".into()).is_transient());

        assert!(!QuarryError::DomainNotAllowed {
            tool: "fetch".into(),
            host: "evil.com".into()
        }
        .is_transient());
        assert!(!QuarryError::Configuration("no key".into()).is_transient());
        assert!(!QuarryError::Other("boom".into()).is_transient());
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(QuarryError::Timeout("x".into()).kind(), "timeout");
        assert_eq!(
            QuarryError::DependencyMissing("sdk".into()).kind(),
            "dependency_missing"
        );
        assert_eq!(QuarryError::ToolManagerClosed.kind(), "tool_manager_closed");
    }
}
