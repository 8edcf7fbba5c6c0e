//! SSH executor: one exec channel per command, one SFTP channel for files.
//!
//! The session and SFTP handle sit behind a single async mutex, so
//! operations on one machine run one at a time.
//!
//! Timeouts are best-effort: on expiry the channel is dropped and a timeout
//! result returned, but an SSH exec channel cannot be reliably cancelled, so
//! the remote process may keep running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client::{self, AuthResult};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{expand_home, MachineKind, SshConfig};
use crate::error::ShellRelayError;
use crate::execution::{
    decode_lossy, format_listing, guard_command, into_result, with_timeout, ExecutionResult,
    Executor, ExecutorState, ListingEntry, StateCell, MAX_READ_BYTES,
};
use crate::security::{sanitize_for_display, PathPolicy, PathStyle};
use crate::Result;

/// Bound on a single SFTP file operation.
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepts every host key, like `StrictHostKeyChecking=no`.
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

struct SshTransport {
    handle: client::Handle<ClientHandler>,
    sftp: SftpSession,
}

/// Executor for a remote host reachable over SSH.
pub struct SshExecutor {
    name: String,
    config: SshConfig,
    policy: PathPolicy,
    state: StateCell,
    transport: Mutex<Option<SshTransport>>,
}

impl SshExecutor {
    /// Create an SSH executor. Nothing is opened until [`Executor::connect`].
    pub fn new(name: impl Into<String>, config: SshConfig) -> Self {
        let policy = PathPolicy::new(config.allowed_roots.clone(), config.blocked_patterns.clone());
        Self {
            name: name.into(),
            config,
            policy,
            state: StateCell::new(),
            transport: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<SshTransport> {
        let client_config = Arc::new(client::Config::default());
        let mut handle = client::connect(
            client_config,
            (self.config.host.as_str(), self.config.port),
            ClientHandler,
        )
        .await
        .map_err(|e| ShellRelayError::Connection(format!("SSH connect failed: {}", e)))?;

        self.authenticate(&mut handle).await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ShellRelayError::Connection(format!("SFTP channel failed: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ShellRelayError::Connection(format!("SFTP subsystem failed: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ShellRelayError::Connection(format!("SFTP session failed: {}", e)))?;

        Ok(SshTransport { handle, sftp })
    }

    /// Key first when the file exists, then password.
    async fn authenticate(&self, handle: &mut client::Handle<ClientHandler>) -> Result<()> {
        let username = self.config.username.clone();

        if let Some(key_path) = self.config.private_key_path.as_deref().filter(|p| !p.is_empty()) {
            let path = expand_home(key_path);
            if path.exists() {
                let key = russh::keys::load_secret_key(&path, None).map_err(|e| {
                    ShellRelayError::Connection(format!(
                        "failed to load key {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(ShellRelayError::transport)?
                    .flatten();
                let result = handle
                    .authenticate_publickey(
                        username.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
                    .map_err(ShellRelayError::transport)?;
                if matches!(result, AuthResult::Success) {
                    debug!(machine = %self.name, "authenticated with public key");
                    return Ok(());
                }
                warn!(machine = %self.name, "public key rejected, trying password");
            } else {
                warn!(machine = %self.name, key = %key_path, "SSH key not found, falling back to password");
            }
        }

        match self.config.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => {
                let result = handle
                    .authenticate_password(username, password)
                    .await
                    .map_err(ShellRelayError::transport)?;
                if matches!(result, AuthResult::Success) {
                    debug!(machine = %self.name, "authenticated with password");
                    Ok(())
                } else {
                    Err(ShellRelayError::Connection("SSH authentication failed".into()))
                }
            }
            None => Err(ShellRelayError::Connection(
                "SSH authentication failed: no usable key or password".into(),
            )),
        }
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecutionResult> {
        self.state.ensure_connected("SSH")?;
        guard_command(&self.name, command)?;

        info!(machine = %self.name, command = %sanitize_for_display(command), "executing SSH command");
        let start = Instant::now();

        let (stdout, stderr, code) = with_timeout(timeout, async {
            let guard = self.transport.lock().await;
            let transport = guard
                .as_ref()
                .ok_or_else(|| ShellRelayError::NotConnected("SSH".into()))?;
            exec_capture(&transport.handle, command).await
        })
        .await
        .inspect_err(|e| {
            if matches!(e, ShellRelayError::Timeout(_)) {
                warn!(machine = %self.name, "SSH command timed out; remote process may still be running");
            }
        })?;

        debug!(
            machine = %self.name,
            exit_code = code,
            duration_ms = start.elapsed().as_millis() as u64,
            "SSH command finished"
        );
        Ok(ExecutionResult::success(&self.name)
            .with_stdout(&decode_lossy(&stdout))
            .with_stderr(&decode_lossy(&stderr))
            .with_returncode(code))
    }

    async fn read(&self, path: &str) -> Result<ExecutionResult> {
        self.state.ensure_connected("SSH")?;
        let remote = self.policy.confine_remote(path, PathStyle::Posix)?;

        let bytes = with_timeout(FILE_OP_TIMEOUT, async {
            let guard = self.transport.lock().await;
            let transport = guard
                .as_ref()
                .ok_or_else(|| ShellRelayError::NotConnected("SSH".into()))?;

            let file = transport
                .sftp
                .open(&remote)
                .await
                .map_err(|e| sftp_error(e, format!("File not found: {}", path)))?;
            let mut bytes = Vec::new();
            file.take(MAX_READ_BYTES + 1)
                .read_to_end(&mut bytes)
                .await?;

            if bytes.len() as u64 > MAX_READ_BYTES {
                let size = transport
                    .sftp
                    .metadata(&remote)
                    .await
                    .ok()
                    .and_then(|m| m.size)
                    .unwrap_or(bytes.len() as u64);
                return Err(ShellRelayError::SizeLimitExceeded {
                    path: remote.clone(),
                    size,
                    limit: MAX_READ_BYTES,
                });
            }
            Ok::<_, ShellRelayError>(bytes)
        })
        .await?;

        info!(machine = %self.name, path = %remote, bytes = bytes.len(), "read remote file");
        Ok(ExecutionResult::success(&self.name)
            .with_content(decode_lossy(&bytes))
            .with_path(remote))
    }

    async fn write(&self, path: &str, content: &str) -> Result<ExecutionResult> {
        self.state.ensure_connected("SSH")?;
        let remote = self.policy.confine_remote(path, PathStyle::Posix)?;

        with_timeout(FILE_OP_TIMEOUT, async {
            let guard = self.transport.lock().await;
            let transport = guard
                .as_ref()
                .ok_or_else(|| ShellRelayError::NotConnected("SSH".into()))?;

            for dir in parent_dirs(&remote) {
                let exists = transport
                    .sftp
                    .try_exists(&dir)
                    .await
                    .map_err(ShellRelayError::transport)?;
                if !exists {
                    debug!(machine = %self.name, dir = %dir, "creating remote directory");
                    transport
                        .sftp
                        .create_dir(&dir)
                        .await
                        .map_err(ShellRelayError::transport)?;
                }
            }

            let flags = OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE;
            let mut file = transport
                .sftp
                .open_with_flags(&remote, flags)
                .await
                .map_err(ShellRelayError::transport)?;
            file.write_all(content.as_bytes()).await?;
            file.shutdown().await?;
            Ok::<_, ShellRelayError>(())
        })
        .await?;

        info!(machine = %self.name, path = %remote, bytes = content.len(), "wrote remote file");
        Ok(ExecutionResult::success(&self.name).with_path(remote))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.state.ensure_connected("SSH")?;
        let remote = self.policy.confine_remote(path, PathStyle::Posix)?;

        with_timeout(FILE_OP_TIMEOUT, async {
            let guard = self.transport.lock().await;
            let transport = guard
                .as_ref()
                .ok_or_else(|| ShellRelayError::NotConnected("SSH".into()))?;
            transport
                .sftp
                .try_exists(&remote)
                .await
                .map_err(ShellRelayError::transport)
        })
        .await
    }

    async fn list(&self, path: &str) -> Result<ExecutionResult> {
        self.state.ensure_connected("SSH")?;
        let remote = self.policy.confine_remote(path, PathStyle::Posix)?;

        let entries = with_timeout(FILE_OP_TIMEOUT, async {
            let guard = self.transport.lock().await;
            let transport = guard
                .as_ref()
                .ok_or_else(|| ShellRelayError::NotConnected("SSH".into()))?;

            let listing = transport
                .sftp
                .read_dir(&remote)
                .await
                .map_err(|e| sftp_error(e, format!("Path not found: {}", path)))?;

            let entries: Vec<ListingEntry> = listing
                .filter(|entry| entry.file_name() != "." && entry.file_name() != "..")
                .map(|entry| ListingEntry::new(entry.file_name(), entry.metadata().is_dir()))
                .collect();
            Ok::<_, ShellRelayError>(entries)
        })
        .await?;

        Ok(ExecutionResult::success(&self.name)
            .with_content(format_listing(entries))
            .with_path(remote))
    }
}

#[async_trait]
impl Executor for SshExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MachineKind {
        MachineKind::Ssh
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

        let mut slot = self.transport.lock().await;
        if slot.is_some() {
            return self.state.get().is_connected();
        }

        let timeout = self.config.connect_timeout();
        match with_timeout(timeout, self.open()).await {
            Ok(transport) => {
                *slot = Some(transport);
                info!(
                    machine = %self.name,
                    host = %self.config.host,
                    port = self.config.port,
                    "SSH executor connected"
                );
                self.state.mark_connected()
            }
            Err(e) => {
                error!(machine = %self.name, host = %self.config.host, error = %e, "SSH connection failed");
                false
            }
        }
    }

    async fn disconnect(&self) {
        self.state.close();

        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            if let Err(e) = transport.sftp.close().await {
                debug!(machine = %self.name, error = %e, "SFTP close failed");
            }
            if let Err(e) = transport
                .handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                debug!(machine = %self.name, error = %e, "SSH disconnect failed");
            }
            info!(machine = %self.name, "SSH executor disconnected");
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

/// Run one command on a fresh exec channel and collect its output.
async fn exec_capture(
    handle: &client::Handle<ClientHandler>,
    command: &str,
) -> Result<(Vec<u8>, Vec<u8>, i32)> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(ShellRelayError::transport)?;
    channel
        .exec(true, command)
        .await
        .map_err(ShellRelayError::transport)?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut code = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => code = Some(exit_status as i32),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    let code = code.ok_or_else(|| {
        ShellRelayError::Transport("SSH channel closed without an exit status".into())
    })?;
    Ok((stdout, stderr, code))
}

/// Map "no such file" to `NotFound(message)`, anything else verbatim.
fn sftp_error(err: SftpError, not_found: String) -> ShellRelayError {
    match err {
        SftpError::Status(ref status) if status.status_code == StatusCode::NoSuchFile => {
            ShellRelayError::NotFound(not_found)
        }
        other => ShellRelayError::transport(other),
    }
}

/// Every ancestor directory of an absolute POSIX path, shallowest first.
fn parent_dirs(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut dirs = Vec::new();
    let mut current = String::new();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(segment);
        dirs.push(current.clone());
    }
    dirs
}
