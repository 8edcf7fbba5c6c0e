//! Error types for shell-relay.

use std::time::Duration;

use thiserror::Error;

/// Main error type for shell-relay operations.
///
/// Executor operations never return this directly to callers; it is folded
/// into an [`ExecutionResult`](crate::ExecutionResult) whose `error` field
/// carries the `Display` text.
#[derive(Error, Debug)]
pub enum ShellRelayError {
    /// Transport bring-up failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Path outside the allowed roots, path matching a blocked pattern,
    /// or command matching the dangerous list.
    #[error("Security Violation: {0}")]
    SecurityViolation(String),

    /// The requested path could not be turned into an absolute path.
    #[error("Path resolution failed: {0}")]
    PathResolution(String),

    /// Working directory is missing or not readable/writable.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Operation exceeded its time bound.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Requested file or directory is absent.
    #[error("{0}")]
    NotFound(String),

    /// Read target exceeds the size ceiling.
    #[error("File too large ({size} bytes > {limit} bytes): {path}")]
    SizeLimitExceeded { path: String, size: u64, limit: u64 },

    /// Any other transport-level failure, reported verbatim.
    #[error("{0}")]
    Transport(String),

    /// Data-plane operation attempted outside the `Connected` state.
    #[error("{0} not connected")]
    NotConnected(String),

    /// Executor lifecycle transition that the state machine forbids.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: crate::execution::ExecutorState,
        to: crate::execution::ExecutorState,
    },

    /// No executor is pooled under the requested name.
    #[error("machine '{name}' not available. Available: {available:?}")]
    MachineNotAvailable {
        name: String,
        available: Vec<String>,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

impl ShellRelayError {
    /// Build a transport error from anything displayable.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Whether this error came from the security layer.
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::SecurityViolation(_))
    }
}

/// Convenience Result type for shell-relay operations.
pub type Result<T> = std::result::Result<T, ShellRelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_violation_display() {
        let err = ShellRelayError::SecurityViolation("Dangerous command detected".into());
        assert_eq!(
            err.to_string(),
            "Security Violation: Dangerous command detected"
        );
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_timeout_display() {
        let err = ShellRelayError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Command timed out after 5s");
    }

    #[test]
    fn test_not_connected_display() {
        let err = ShellRelayError::NotConnected("SSH".into());
        assert!(err.to_string().contains("not connected"));
    }

    #[test]
    fn test_machine_not_available_lists_names() {
        let err = ShellRelayError::MachineNotAvailable {
            name: "db".into(),
            available: vec!["local".into(), "web".into()],
        };
        let text = err.to_string();
        assert!(text.contains("'db'"));
        assert!(text.contains("local"));
        assert!(text.contains("web"));
    }

    #[test]
    fn test_size_limit_display() {
        let err = ShellRelayError::SizeLimitExceeded {
            path: "/tmp/big.bin".into(),
            size: 3,
            limit: 2,
        };
        assert!(err.to_string().contains("too large"));
        assert!(err.to_string().contains("/tmp/big.bin"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ShellRelayError = io_err.into();
        assert!(matches!(err, ShellRelayError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }
}
