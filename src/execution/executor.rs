//! The executor contract shared by every transport.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::result::ExecutionResult;
use super::state::ExecutorState;
use crate::config::MachineKind;
use crate::error::ShellRelayError;
use crate::security::{dangerous_pattern, sanitize_for_display};
use crate::Result;

/// Default command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Command and file operations against one target machine.
///
/// Every data-plane operation returns an [`ExecutionResult`]; expected
/// failures (not connected, security denial, timeout, size limit, transport
/// errors) are encoded in it rather than returned as `Err`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Machine name this executor serves.
    fn name(&self) -> &str;

    /// Transport type.
    fn kind(&self) -> MachineKind;

    /// Current lifecycle state.
    fn state(&self) -> ExecutorState;

    /// Whether data-plane operations are currently allowed.
    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Path prefixes permitted for file operations.
    fn allowed_roots(&self) -> &[String];

    /// Glob patterns always denied.
    fn blocked_patterns(&self) -> &[String];

    /// Bring the transport up. Returns false on failure, logging the cause.
    async fn connect(&self) -> bool;

    /// Release the transport. Safe to call more than once.
    async fn disconnect(&self);

    /// Run one command line to completion or timeout.
    async fn execute_command(&self, command: &str, timeout: Duration) -> ExecutionResult;

    /// Read a file (at most 2 MiB), decoding invalid UTF-8 lossily.
    async fn read_file(&self, path: &str) -> ExecutionResult;

    /// Write a file, creating parent directories and overwriting.
    async fn write_file(&self, path: &str, content: &str) -> ExecutionResult;

    /// Best-effort existence check; any failure reads as false.
    async fn file_exists(&self, path: &str) -> bool;

    /// List a directory as `dir: name` / `file: name` lines.
    async fn list_directory(&self, path: &str) -> ExecutionResult;
}

/// Run `fut`, failing with [`ShellRelayError::Timeout`] after `limit`.
///
/// The future is dropped on expiry, so nothing it would have produced is
/// delivered afterwards.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ShellRelayError::Timeout(limit)),
    }
}

/// Refuse commands that match the dangerous list.
pub fn guard_command(machine: &str, command: &str) -> Result<()> {
    if let Some(pattern) = dangerous_pattern(command) {
        warn!(
            machine = %machine,
            command = %sanitize_for_display(command),
            pattern = %pattern,
            "dangerous command blocked"
        );
        return Err(ShellRelayError::SecurityViolation(
            "Dangerous command detected".to_string(),
        ));
    }
    Ok(())
}

/// Fold an internal result into the uniform outcome value.
pub fn into_result(target: &str, result: Result<ExecutionResult>) -> ExecutionResult {
    result.unwrap_or_else(|err| ExecutionResult::failure(target, &err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_value() {
        let value = with_timeout(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(ShellRelayError::Timeout(_))));
    }

    #[test]
    fn test_guard_command() {
        let err = guard_command("local", "sudo rm -rf /").unwrap_err();
        assert_eq!(err.to_string(), "Security Violation: Dangerous command detected");
        assert!(guard_command("local", "ls -la /tmp").is_ok());
    }

    #[test]
    fn test_into_result_folds_error() {
        let folded = into_result("web", Err(ShellRelayError::NotConnected("SSH".into())));
        assert!(!folded.ok);
        assert_eq!(folded.target, "web");
        assert_eq!(folded.error, "SSH not connected");

        let passed = into_result("web", Ok(ExecutionResult::success("web")));
        assert!(passed.ok);
    }
}
