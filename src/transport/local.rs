//! Local subprocess and filesystem executor.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::{Config, MachineKind, LOCAL_MACHINE};
use crate::error::ShellRelayError;
use crate::execution::{
    decode_lossy, format_listing, guard_command, into_result, ExecutionResult, Executor,
    ExecutorState, ListingEntry, StateCell, MAX_READ_BYTES,
};
use crate::security::{check_workspace_permissions, sanitize_for_display, PathPolicy};
use crate::Result;

/// Executor for the host this process runs on.
///
/// Each command is its own child process, started in a fresh process group
/// on Unix so a timeout can kill everything it spawned.
pub struct LocalExecutor {
    name: String,
    workspace: PathBuf,
    policy: PathPolicy,
    state: StateCell,
}

impl LocalExecutor {
    /// Create a local executor.
    pub fn new(
        name: impl Into<String>,
        workspace: impl Into<PathBuf>,
        allowed_roots: Vec<String>,
        blocked_patterns: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            workspace: workspace.into(),
            policy: PathPolicy::new(allowed_roots, blocked_patterns),
            state: StateCell::new(),
        }
    }

    /// Create the `local` executor from the application config.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            LOCAL_MACHINE,
            config.workspace.clone(),
            config.local.allowed_roots.clone(),
            config.local.blocked_patterns.clone(),
        )
    }

    /// Working directory verified on connect.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecutionResult> {
        self.state.ensure_connected("local executor")?;
        guard_command(&self.name, command)?;

        info!(machine = %self.name, command = %sanitize_for_display(command), "executing local command");
        let start = Instant::now();

        let mut cmd = shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let code = exit_code(&output.status);
                debug!(
                    machine = %self.name,
                    exit_code = code,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "local command finished"
                );
                Ok(ExecutionResult::success(&self.name)
                    .with_stdout(&decode_lossy(&output.stdout))
                    .with_stderr(&decode_lossy(&output.stderr))
                    .with_returncode(code))
            }
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                warn!(
                    machine = %self.name,
                    command = %sanitize_for_display(command),
                    timeout_secs = timeout.as_secs_f64(),
                    "local command timed out"
                );
                Err(ShellRelayError::Timeout(timeout))
            }
        }
    }

    async fn read(&self, path: &str) -> Result<ExecutionResult> {
        self.state.ensure_connected("local executor")?;
        let safe_path = self.policy.resolve_local(path, true)?;

        let metadata = match tokio::fs::metadata(&safe_path).await {
            Ok(m) if m.is_file() => m,
            _ => return Err(ShellRelayError::NotFound(format!("File not found: {}", path))),
        };
        if metadata.len() > MAX_READ_BYTES {
            return Err(too_large(&safe_path, metadata.len()));
        }

        let bytes = tokio::fs::read(&safe_path).await?;
        // The file may have grown since the metadata call.
        if bytes.len() as u64 > MAX_READ_BYTES {
            return Err(too_large(&safe_path, bytes.len() as u64));
        }

        info!(machine = %self.name, path = %safe_path.display(), bytes = bytes.len(), "read local file");
        Ok(ExecutionResult::success(&self.name)
            .with_content(decode_lossy(&bytes))
            .with_path(safe_path.display().to_string()))
    }

    async fn write(&self, path: &str, content: &str) -> Result<ExecutionResult> {
        self.state.ensure_connected("local executor")?;
        let safe_path = self.policy.resolve_local(path, false)?;

        if let Some(parent) = safe_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&safe_path, content.as_bytes()).await?;

        info!(machine = %self.name, path = %safe_path.display(), bytes = content.len(), "wrote local file");
        Ok(ExecutionResult::success(&self.name).with_path(safe_path.display().to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.state.ensure_connected("local executor")?;
        let safe_path = self.policy.resolve_local(path, false)?;
        Ok(tokio::fs::try_exists(&safe_path).await.unwrap_or(false))
    }

    async fn list(&self, path: &str) -> Result<ExecutionResult> {
        self.state.ensure_connected("local executor")?;
        let safe_path = self.policy.resolve_local(path, true)?;

        match tokio::fs::metadata(&safe_path).await {
            Ok(m) if m.is_dir() => {}
            Ok(_) => {
                return Err(ShellRelayError::Transport(format!("Not a directory: {}", path)));
            }
            Err(_) => return Err(ShellRelayError::NotFound(format!("Path not found: {}", path))),
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&safe_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            // Follow symlinks so a link to a directory lists as `dir`.
            let is_dir = tokio::fs::metadata(entry.path())
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            entries.push(ListingEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            ));
        }

        Ok(ExecutionResult::success(&self.name)
            .with_content(format_listing(entries))
            .with_path(safe_path.display().to_string()))
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MachineKind {
        MachineKind::Local
    }

    fn state(&self) -> ExecutorState {
        self.state.get()
    }

    fn allowed_roots(&self) -> &[String] {
        self.policy.allowed_roots()
    }

    fn blocked_patterns(&self) -> &[String] {
        self.policy.blocked_patterns()
    }

    async fn connect(&self) -> bool {
        if let Some(done) = self.state.connect_shortcut(&self.name) {
            return done;
        }

        let workspace = self.workspace.clone();
        match tokio::task::spawn_blocking(move || check_workspace_permissions(&workspace)).await {
            Ok(Ok(path)) => {
                info!(machine = %self.name, workspace = %path.display(), "local executor connected");
                self.state.mark_connected()
            }
            Ok(Err(e)) => {
                error!(machine = %self.name, error = %e, "local executor connection failed");
                false
            }
            Err(e) => {
                error!(machine = %self.name, error = %e, "workspace check panicked");
                false
            }
        }
    }

    async fn disconnect(&self) {
        if self.state.close() {
            info!(machine = %self.name, "local executor disconnected");
        }
    }

    async fn execute_command(&self, command: &str, timeout: Duration) -> ExecutionResult {
        into_result(&self.name, self.run(command, timeout).await)
    }

    async fn read_file(&self, path: &str) -> ExecutionResult {
        into_result(&self.name, self.read(path).await)
    }

    async fn write_file(&self, path: &str, content: &str) -> ExecutionResult {
        into_result(&self.name, self.write(path, content).await)
    }

    async fn file_exists(&self, path: &str) -> bool {
        self.exists(path).await.unwrap_or(false)
    }

    async fn list_directory(&self, path: &str) -> ExecutionResult {
        into_result(&self.name, self.list(path).await)
    }
}

fn too_large(path: &Path, size: u64) -> ShellRelayError {
    ShellRelayError::SizeLimitExceeded {
        path: path.display().to_string(),
        size,
        limit: MAX_READ_BYTES,
    }
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(unix)]
fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    // Signal deaths report as the negated signal number.
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(1))
}

#[cfg(not(unix))]
fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: killpg only sends a signal; the child was started as the
    // leader of its own group, so pid is also the group id.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {
    // kill_on_drop already terminated the direct child.
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor(dir: &TempDir) -> LocalExecutor {
        LocalExecutor::new(
            "local",
            dir.path().join("ws"),
            vec![dir.path().to_string_lossy().into_owned()],
            vec!["*/secret/*".to_string()],
        )
    }

    #[tokio::test]
    async fn test_connect_creates_workspace() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);

        assert_eq!(exec.state(), ExecutorState::Created);
        assert!(exec.connect().await);
        assert!(exec.is_connected());
        assert!(dir.path().join("ws").is_dir());

        // Idempotent on success.
        assert!(exec.connect().await);
    }

    #[tokio::test]
    async fn test_no_reconnect_after_disconnect() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);

        assert!(exec.connect().await);
        exec.disconnect().await;
        exec.disconnect().await;
        assert!(!exec.is_connected());
        assert!(!exec.connect().await);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);

        let result = exec.execute_command("echo hi", Duration::from_secs(5)).await;
        assert!(!result.ok);
        assert!(result.error.contains("not connected"));

        let target = dir.path().join("a.txt");
        let result = exec.read_file(&target.to_string_lossy()).await;
        assert!(result.error.contains("not connected"));
        assert!(!exec.file_exists(&target.to_string_lossy()).await);
    }

    #[tokio::test]
    async fn test_blocked_path_is_security_violation() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);
        assert!(exec.connect().await);

        let target = dir.path().join("secret").join("key");
        let result = exec.write_file(&target.to_string_lossy(), "x").await;
        assert!(!result.ok);
        assert!(result.error.starts_with("Security Violation"));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_list_missing_directory() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);
        assert!(exec.connect().await);

        let missing = dir.path().join("nope");
        let result = exec.list_directory(&missing.to_string_lossy()).await;
        assert!(!result.ok);
        assert!(result.error.contains("Path not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_ok() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);
        assert!(exec.connect().await);

        let result = exec
            .execute_command("echo oops >&2; exit 3", Duration::from_secs(5))
            .await;
        assert!(result.ok);
        assert_eq!(result.returncode, 3);
        assert_eq!(result.stderr.trim(), "oops");
    }
}
