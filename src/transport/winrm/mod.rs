//! WinRM executor for Windows hosts.
//!
//! Every command runs in a fresh remote `cmd` shell that is deleted
//! afterwards. File operations are PowerShell scripts sent through
//! `-EncodedCommand`, so paths and content never touch `cmd` quoting.

pub mod soap;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::prelude::*;
use reqwest::{Client, StatusCode};
use tokio::sync::RwLock;
use tokio::time::timeout_at;
use tracing::{debug, error, info, warn};

use self::soap::{encode_powershell, ps_quote, Envelopes};
use crate::config::{MachineKind, WinRmConfig};
use crate::error::ShellRelayError;
use crate::execution::{
    decode_lossy, format_listing, guard_command, into_result, ExecutionResult, Executor,
    ExecutorState, ListingEntry, StateCell, MAX_READ_BYTES,
};
use crate::security::{sanitize_for_display, PathPolicy, PathStyle};
use crate::Result;

/// Bound on a single PowerShell file operation.
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on any single HTTP exchange. A Receive may legitimately wait the
/// full server-side operation timeout before answering.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(soap::OPERATION_TIMEOUT_SECS + 10);

/// Bound on the terminate signal and shell delete sent after a command.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Base64 characters per write round trip. A multiple of 4 that keeps the
/// encoded command line under the 8191 character `cmd` limit.
const WRITE_CHUNK_CHARS: usize = 2000;

const PROBE_COMMAND: &str = "echo shell-relay connection test";

const UTF8_PREAMBLE: &str = "[Console]::OutputEncoding = [System.Text.Encoding]::UTF8\n";

/// Raw output of one remote command.
struct RawOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    code: i32,
}

/// Executor for a Windows host reachable over WinRM.
pub struct WinRmExecutor {
    name: String,
    config: WinRmConfig,
    envelopes: Envelopes,
    policy: PathPolicy,
    state: StateCell,
    client: RwLock<Option<Client>>,
}

impl WinRmExecutor {
    /// Create a WinRM executor. Nothing is contacted until [`Executor::connect`].
    pub fn new(name: impl Into<String>, config: WinRmConfig) -> Self {
        let policy = PathPolicy::new(config.allowed_roots.clone(), config.blocked_patterns.clone());
        Self {
            name: name.into(),
            envelopes: Envelopes::new(config.endpoint()),
            config,
            policy,
            state: StateCell::new(),
            client: RwLock::new(None),
        }
    }

    fn build_client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(self.config.connect_timeout())
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!self.config.cert_validation)
            .build()
            .map_err(|e| ShellRelayError::Connection(format!("failed to create HTTP client: {}", e)))
    }

    async fn client(&self) -> Result<Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| ShellRelayError::NotConnected("WinRM".into()))
    }

    async fn post_raw(&self, client: &Client, envelope: String) -> Result<(StatusCode, String)> {
        let response = client
            .post(self.config.endpoint())
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
            .map_err(|e| ShellRelayError::Transport(format!("WinRM request failed: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ShellRelayError::Transport(format!("WinRM response unreadable: {}", e)))?;
        Ok((status, body))
    }

    async fn post(&self, client: &Client, envelope: String) -> Result<String> {
        let (status, body) = self.post_raw(client, envelope).await?;
        if status.is_success() {
            return Ok(body);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ShellRelayError::Transport(
                "WinRM authentication failed (HTTP 401)".into(),
            ));
        }
        let reason = soap::fault_reason(&body).unwrap_or_else(|| "no fault detail".into());
        Err(ShellRelayError::Transport(format!(
            "WinRM request failed: HTTP {}: {}",
            status, reason
        )))
    }

    /// Create a shell, run `command` in it and collect output until done.
    ///
    /// On expiry of `timeout` the command is signalled to terminate. The
    /// shell is deleted in every case.
    async fn exec_raw(&self, client: &Client, command: &str, timeout: Duration) -> Result<RawOutput> {
        let deadline = tokio::time::Instant::now() + timeout;

        let created = timeout_at(deadline, self.post(client, self.envelopes.create_shell()))
            .await
            .map_err(|_| ShellRelayError::Timeout(timeout))??;
        let shell_id = soap::extract_shell_id(&created)
            .ok_or_else(|| ShellRelayError::Transport("WinRM response carried no shell id".into()))?;
        debug!(machine = %self.name, shell_id = %shell_id, "created WinRM shell");

        let outcome = self
            .run_in_shell(client, &shell_id, command, deadline, timeout)
            .await;

        self.cleanup(client, self.envelopes.delete_shell(&shell_id), "shell delete")
            .await;
        outcome
    }

    /// Send a cleanup request, giving up after [`CLEANUP_TIMEOUT`].
    async fn cleanup(&self, client: &Client, envelope: String, what: &str) {
        match tokio::time::timeout(CLEANUP_TIMEOUT, self.post(client, envelope)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(machine = %self.name, error = %e, "WinRM {} failed", what),
            Err(_) => warn!(machine = %self.name, "WinRM {} got no answer", what),
        }
    }

    async fn run_in_shell(
        &self,
        client: &Client,
        shell_id: &str,
        command: &str,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<RawOutput> {
        let started = timeout_at(deadline, self.post(client, self.envelopes.command(shell_id, command)))
            .await
            .map_err(|_| ShellRelayError::Timeout(timeout))??;
        let command_id = soap::extract_command_id(&started)
            .ok_or_else(|| ShellRelayError::Transport("WinRM response carried no command id".into()))?;

        match timeout_at(deadline, self.receive_all(client, shell_id, &command_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(machine = %self.name, command_id = %command_id, "WinRM command timed out, terminating");
                self.cleanup(client, self.envelopes.terminate(shell_id, &command_id), "terminate signal")
                    .await;
                Err(ShellRelayError::Timeout(timeout))
            }
        }
    }

    async fn receive_all(&self, client: &Client, shell_id: &str, command_id: &str) -> Result<RawOutput> {
        let mut output = RawOutput {
            stdout: Vec::new(),
            stderr: Vec::new(),
            code: 0,
        };
        let mut code = None;

        loop {
            let (status, body) = self
                .post_raw(client, self.envelopes.receive(shell_id, command_id))
                .await?;
            if !status.is_success() {
                if soap::is_operation_timeout(&body) {
                    continue;
                }
                let reason = soap::fault_reason(&body).unwrap_or_else(|| "no fault detail".into());
                return Err(ShellRelayError::Transport(format!(
                    "WinRM receive failed: HTTP {}: {}",
                    status, reason
                )));
            }

            let chunk = soap::parse_receive(&body);
            output.stdout.extend_from_slice(&chunk.stdout);
            output.stderr.extend_from_slice(&chunk.stderr);
            if chunk.exit_code.is_some() {
                code = chunk.exit_code;
            }
            if chunk.done {
                break;
            }
        }

        output.code = code.unwrap_or(0);
        Ok(output)
    }

    /// Run a PowerShell script, failing unless it exits with status 0.
    ///
    /// The dangerous-command check runs on the generated script text, so a
    /// payload can be refused by a coincidental match.
    async fn powershell(&self, script: &str) -> Result<String> {
        guard_command(&self.name, script)?;
        let client = self.client().await?;
        let script = format!("{}{}", UTF8_PREAMBLE, script);
        let output = self
            .exec_raw(&client, &encode_powershell(&script), FILE_OP_TIMEOUT)
            .await?;

        if output.code != 0 {
            let stderr = decode_lossy(&output.stderr);
            let detail = stderr.trim();
            return Err(ShellRelayError::Transport(if detail.is_empty() {
                format!("PowerShell exited with status {}", output.code)
            } else {
                detail.to_string()
            }));
        }
        Ok(decode_lossy(&output.stdout))
    }

    /// Confine a requested path and switch it to backslash separators.
    fn remote_path(&self, path: &str) -> Result<String> {
        let confined = self.policy.confine_remote(path, PathStyle::Windows)?;
        Ok(confined.replace('/', "\\"))
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecutionResult> {
        self.state.ensure_connected("WinRM")?;
        guard_command(&self.name, command)?;
        let client = self.client().await?;

        info!(machine = %self.name, command = %sanitize_for_display(command), "executing WinRM command");
        let start = Instant::now();
        let output = self.exec_raw(&client, command, timeout).await?;

        debug!(
            machine = %self.name,
            exit_code = output.code,
            duration_ms = start.elapsed().as_millis() as u64,
            "WinRM command finished"
        );
        Ok(ExecutionResult::success(&self.name)
            .with_stdout(&decode_lossy(&output.stdout))
            .with_stderr(&decode_lossy(&output.stderr))
            .with_returncode(output.code))
    }

    async fn read(&self, path: &str) -> Result<ExecutionResult> {
        self.state.ensure_connected("WinRM")?;
        let remote = self.remote_path(path)?;

        let script = format!(
            "$p = {}\n\
             if (-not (Test-Path -LiteralPath $p -PathType Leaf)) {{ Write-Output 'MISSING'; exit 0 }}\n\
             $len = (Get-Item -LiteralPath $p -Force).Length\n\
             if ($len -gt {}) {{ Write-Output \"TOOBIG $len\"; exit 0 }}\n\
             Write-Output ('DATA ' + [System.Convert]::ToBase64String([System.IO.File]::ReadAllBytes($p)))",
            ps_quote(&remote),
            MAX_READ_BYTES
        );
        let stdout = self.powershell(&script).await?;
        let reply = stdout.trim();

        let bytes = if reply == "MISSING" {
            return Err(ShellRelayError::NotFound(format!("File not found: {}", path)));
        } else if let Some(size) = reply.strip_prefix("TOOBIG ") {
            return Err(ShellRelayError::SizeLimitExceeded {
                path: remote,
                size: size.trim().parse().unwrap_or(MAX_READ_BYTES + 1),
                limit: MAX_READ_BYTES,
            });
        } else if let Some(data) = reply.strip_prefix("DATA") {
            BASE64_STANDARD
                .decode(data.trim())
                .map_err(|e| ShellRelayError::Transport(format!("failed to decode file content: {}", e)))?
        } else {
            return Err(ShellRelayError::Transport(format!(
                "unexpected read reply: {}",
                sanitize_for_display(reply)
            )));
        };

        info!(machine = %self.name, path = %remote, bytes = bytes.len(), "read remote file");
        Ok(ExecutionResult::success(&self.name)
            .with_content(decode_lossy(&bytes))
            .with_path(remote))
    }

    async fn write(&self, path: &str, content: &str) -> Result<ExecutionResult> {
        self.state.ensure_connected("WinRM")?;
        let remote = self.remote_path(path)?;
        let quoted = ps_quote(&remote);

        let mkdir = format!(
            "$dir = [System.IO.Path]::GetDirectoryName({})\n\
             if ($dir -and -not (Test-Path -LiteralPath $dir)) {{ New-Item -ItemType Directory -Force -Path $dir | Out-Null }}",
            quoted
        );
        self.powershell(&mkdir).await?;

        let encoded = BASE64_STANDARD.encode(content.as_bytes());
        for (index, chunk) in write_chunks(&encoded).into_iter().enumerate() {
            let script = if index == 0 {
                format!(
                    "[System.IO.File]::WriteAllBytes({}, [System.Convert]::FromBase64String('{}'))",
                    quoted, chunk
                )
            } else {
                format!(
                    "$b = [System.Convert]::FromBase64String('{}')\n\
                     $s = [System.IO.File]::Open({}, [System.IO.FileMode]::Append)\n\
                     try {{ $s.Write($b, 0, $b.Length) }} finally {{ $s.Close() }}",
                    chunk, quoted
                )
            };
            self.powershell(&script).await?;
        }

        info!(machine = %self.name, path = %remote, bytes = content.len(), "wrote remote file");
        Ok(ExecutionResult::success(&self.name).with_path(remote))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.state.ensure_connected("WinRM")?;
        let remote = self.remote_path(path)?;
        let script = format!(
            "if (Test-Path -LiteralPath {}) {{ 'True' }} else {{ 'False' }}",
            ps_quote(&remote)
        );
        Ok(self.powershell(&script).await?.trim() == "True")
    }

    async fn list(&self, path: &str) -> Result<ExecutionResult> {
        self.state.ensure_connected("WinRM")?;
        let remote = self.remote_path(path)?;
        let script = format!(
            "$p = {}\n\
             if (-not (Test-Path -LiteralPath $p -PathType Container)) {{ Write-Output 'MISSING'; exit 0 }}\n\
             Get-ChildItem -LiteralPath $p -Force | ForEach-Object {{ if ($_.PSIsContainer) {{ 'dir: ' + $_.Name }} else {{ 'file: ' + $_.Name }} }}",
            ps_quote(&remote)
        );
        let stdout = self.powershell(&script).await?;
        if stdout.trim() == "MISSING" {
            return Err(ShellRelayError::NotFound(format!("Path not found: {}", path)));
        }

        Ok(ExecutionResult::success(&self.name)
            .with_content(format_listing(parse_listing(&stdout)))
            .with_path(remote))
    }
}

#[async_trait]
impl Executor for WinRmExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MachineKind {
        MachineKind::Winrm
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

        let mut slot = self.client.write().await;
        if slot.is_some() {
            return self.state.get().is_connected();
        }

        let client = match self.build_client() {
            Ok(client) => client,
            Err(e) => {
                error!(machine = %self.name, error = %e, "WinRM connection failed");
                return false;
            }
        };

        match self
            .exec_raw(&client, PROBE_COMMAND, self.config.connect_timeout())
            .await
        {
            Ok(output) if output.code == 0 => {
                *slot = Some(client);
                info!(machine = %self.name, endpoint = %self.config.endpoint(), "WinRM executor connected");
                self.state.mark_connected()
            }
            Ok(output) => {
                error!(machine = %self.name, exit_code = output.code, "WinRM connection test failed");
                false
            }
            Err(e) => {
                error!(machine = %self.name, endpoint = %self.config.endpoint(), error = %e, "WinRM connection failed");
                false
            }
        }
    }

    async fn disconnect(&self) {
        self.state.close();
        if self.client.write().await.take().is_some() {
            info!(machine = %self.name, "WinRM executor disconnected");
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

/// Split base64 text into write-sized pieces. Empty content is one empty piece.
fn write_chunks(encoded: &str) -> Vec<&str> {
    if encoded.is_empty() {
        return vec![""];
    }
    (0..encoded.len())
        .step_by(WRITE_CHUNK_CHARS)
        .map(|start| &encoded[start..(start + WRITE_CHUNK_CHARS).min(encoded.len())])
        .collect()
}

fn parse_listing(stdout: &str) -> Vec<ListingEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            if let Some(name) = line.strip_prefix("dir: ") {
                Some(ListingEntry::new(name, true))
            } else {
                line.strip_prefix("file: ")
                    .map(|name| ListingEntry::new(name, false))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> WinRmExecutor {
        WinRmExecutor::new("win", WinRmConfig::new("127.0.0.1", "admin", "secret"))
    }

    #[test]
    fn test_write_chunks() {
        assert_eq!(write_chunks(""), vec![""]);
        assert_eq!(write_chunks("QUJD"), vec!["QUJD"]);

        let long = "A".repeat(WRITE_CHUNK_CHARS * 2 + 8);
        let chunks = write_chunks(&long);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), WRITE_CHUNK_CHARS);
        assert_eq!(chunks[2].len(), 8);
        assert!(chunks.iter().all(|c| c.len() % 4 == 0));
    }

    #[test]
    fn test_remote_path_uses_backslashes() {
        let exec = executor();
        assert_eq!(exec.remote_path("C:/temp/a.txt").unwrap(), "C:\\temp\\a.txt");
        assert!(exec.remote_path("C:/Windows/System32/drivers/etc/hosts").is_err());
        assert!(exec.remote_path("temp/a.txt").is_err());
    }

    #[test]
    fn test_parse_listing() {
        let entries = parse_listing("file: b.txt\r\ndir: a\r\n\r\nnoise\r\n");
        assert_eq!(
            entries,
            vec![ListingEntry::new("b.txt", false), ListingEntry::new("a", true)]
        );
        assert_eq!(format_listing(entries), "dir: a\nfile: b.txt");
    }

    #[test]
    fn test_policy_from_config() {
        let exec = executor();
        assert_eq!(exec.kind(), MachineKind::Winrm);
        assert!(exec.allowed_roots().iter().any(|r| r == "C:/"));
        assert!(exec
            .blocked_patterns()
            .iter()
            .any(|p| p == "*/Windows/System32/*"));
    }

    #[tokio::test]
    async fn test_operations_before_connect() {
        let exec = executor();
        let result = exec.execute_command("dir", Duration::from_secs(1)).await;
        assert!(!result.ok);
        assert_eq!(result.error, "WinRM not connected");

        assert!(!exec.read_file("C:/temp/a.txt").await.ok);
        assert!(!exec.write_file("C:/temp/a.txt", "x").await.ok);
        assert!(!exec.list_directory("C:/temp").await.ok);
        assert!(!exec.file_exists("C:/temp/a.txt").await);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_false() {
        let mut config = WinRmConfig::new("127.0.0.1", "admin", "secret");
        config.port = 1;
        config.ssl = false;
        config.connect_timeout_secs = 2;
        let exec = WinRmExecutor::new("win", config);

        assert!(!exec.connect().await);
        assert_eq!(exec.state(), ExecutorState::Created);

        exec.disconnect().await;
        assert_eq!(exec.state(), ExecutorState::Disconnected);
    }
}
