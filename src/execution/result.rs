//! Execution result types.

use serde::{Deserialize, Serialize};

use super::output::truncate_chars;
use crate::error::ShellRelayError;

/// Characters kept from each of stdout and stderr.
pub const MAX_OUTPUT_CHARS: usize = 2000;

/// Largest file `read_file` will return.
pub const MAX_READ_BYTES: u64 = 2 * 1024 * 1024;

/// Outcome of any executor operation.
///
/// Either `ok` is true and `error` is empty, or `ok` is false and `error`
/// explains why. Text fields are never absent, only empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Overall success.
    pub ok: bool,
    /// Captured standard output, truncated to [`MAX_OUTPUT_CHARS`].
    pub stdout: String,
    /// Captured standard error, truncated to [`MAX_OUTPUT_CHARS`].
    pub stderr: String,
    /// File contents or directory listing.
    pub content: String,
    /// Resolved path, when the operation touched one.
    pub path: String,
    /// Failure reason; empty iff `ok`.
    pub error: String,
    /// Exit status of the command. Zero when nothing ran.
    pub returncode: i32,
    /// Machine that produced the result.
    pub target: String,
}

impl ExecutionResult {
    /// Create a successful result for `target`.
    pub fn success(target: impl Into<String>) -> Self {
        Self {
            ok: true,
            target: target.into(),
            ..Self::default()
        }
    }

    /// Create a failed result carrying the error's display text.
    pub fn failure(target: impl Into<String>, err: &ShellRelayError) -> Self {
        Self::failure_message(target, err.to_string())
    }

    /// Create a failed result from a plain message.
    pub fn failure_message(target: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = message.into();
        if error.is_empty() {
            error = "unknown error".to_string();
        }
        Self {
            ok: false,
            error,
            target: target.into(),
            ..Self::default()
        }
    }

    /// Set stdout, truncating to the output cap.
    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = truncate_chars(stdout, MAX_OUTPUT_CHARS);
        self
    }

    /// Set stderr, truncating to the output cap.
    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = truncate_chars(stderr, MAX_OUTPUT_CHARS);
        self
    }

    /// Set file contents or listing text.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Set the resolved path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the exit status.
    pub fn with_returncode(mut self, code: i32) -> Self {
        self.returncode = code;
        self
    }

    /// Check if the operation succeeded.
    ///
    /// A command that ran to completion counts as a success even with a
    /// non-zero exit status; inspect `returncode` for that.
    pub fn is_success(&self) -> bool {
        self.ok
    }

    /// Serialize for the tool-dispatch layer.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
