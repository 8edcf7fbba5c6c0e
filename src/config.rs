//! Configuration management for shell-relay.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values
//!
//! Remote machines can come from the file's `machines` list or from the
//! `SSH_SERVER_*` / `WINRM_SERVER_*` environment variables. The local machine
//! is implicit and always present under the name `local`.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cli::Args;
use crate::security::{default_blocked_patterns, DEFAULT_LOCAL_ROOT};

/// Name of the implicit local machine.
pub const LOCAL_MACHINE: &str = "local";

/// Transport type of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    /// Local subprocesses and filesystem.
    Local,
    /// SSH exec channel plus SFTP.
    Ssh,
    /// WinRM remote shell.
    Winrm,
}

impl MachineKind {
    /// Lowercase type name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
            Self::Winrm => "winrm",
        }
    }
}

impl fmt::Display for MachineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local working directory, created on start-up.
    pub workspace: PathBuf,
    /// Default command timeout in seconds.
    pub shell_timeout_secs: u64,
    /// Path policy of the local machine.
    pub local: LocalSection,
    /// Additional machines.
    pub machines: Vec<MachineConfig>,
    /// Logging configuration.
    pub logging: LoggingSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(DEFAULT_LOCAL_ROOT),
            shell_timeout_secs: 60,
            local: LocalSection::default(),
            machines: Vec::new(),
            logging: LoggingSection::default(),
        }
    }
}

/// Local machine section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    /// Path prefixes permitted for file operations.
    pub allowed_roots: Vec<String>,
    /// Glob patterns always denied.
    pub blocked_patterns: Vec<String>,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            allowed_roots: vec![DEFAULT_LOCAL_ROOT.to_string()],
            blocked_patterns: default_blocked_patterns(),
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or a full filter directive.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One configured target machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Unique machine name.
    pub name: String,
    /// Transport type and its parameters.
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Use this machine when a caller names none.
    #[serde(default)]
    pub is_default: bool,
}

impl MachineConfig {
    /// Transport type.
    pub fn kind(&self) -> MachineKind {
        match self.transport {
            TransportConfig::Local => MachineKind::Local,
            TransportConfig::Ssh { .. } => MachineKind::Ssh,
            TransportConfig::Winrm { .. } => MachineKind::Winrm,
        }
    }
}

/// Per-type connection parameters, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// The local host.
    Local,
    /// A Linux/Unix host over SSH.
    Ssh {
        /// SSH parameters.
        ssh: SshConfig,
    },
    /// A Windows host over WinRM.
    Winrm {
        /// WinRM parameters.
        winrm: WinRmConfig,
    },
}

/// SSH connection parameters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Private key file; preferred over the password when it exists.
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ssh_roots")]
    pub allowed_roots: Vec<String>,
    #[serde(default = "default_ssh_blocked")]
    pub blocked_patterns: Vec<String>,
}

impl SshConfig {
    /// Create a config with default port, timeout and path policy.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            password: None,
            private_key_path: None,
            connect_timeout_secs: default_connect_timeout(),
            allowed_roots: default_ssh_roots(),
            blocked_patterns: default_ssh_blocked(),
        }
    }

    /// Connection bring-up bound.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("allowed_roots", &self.allowed_roots)
            .field("blocked_patterns", &self.blocked_patterns)
            .finish()
    }
}

/// WinRM connection parameters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinRmConfig {
    pub host: String,
    #[serde(default = "default_winrm_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Use HTTPS.
    #[serde(default = "default_true")]
    pub ssl: bool,
    /// Verify the server certificate. Off by default for self-signed lab hosts.
    #[serde(default)]
    pub cert_validation: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_winrm_roots")]
    pub allowed_roots: Vec<String>,
    #[serde(default = "default_winrm_blocked")]
    pub blocked_patterns: Vec<String>,
}

impl WinRmConfig {
    /// Create a config with default port, TLS settings and path policy.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_winrm_port(),
            username: username.into(),
            password: password.into(),
            ssl: true,
            cert_validation: false,
            connect_timeout_secs: default_connect_timeout(),
            allowed_roots: default_winrm_roots(),
            blocked_patterns: default_winrm_blocked(),
        }
    }

    /// WS-Management endpoint URL.
    pub fn endpoint(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}/wsman", scheme, self.host, self.port)
    }

    /// Connection bring-up bound.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl fmt::Debug for WinRmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinRmConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .field("cert_validation", &self.cert_validation)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("allowed_roots", &self.allowed_roots)
            .field("blocked_patterns", &self.blocked_patterns)
            .finish()
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_winrm_port() -> u16 {
    5986
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_ssh_roots() -> Vec<String> {
    strings(&["/home", "/tmp"])
}

fn default_ssh_blocked() -> Vec<String> {
    strings(&["*/proc/*", "*/sys/*", "*/dev/*"])
}

fn default_winrm_roots() -> Vec<String> {
    strings(&["C:/", "D:/", "E:/"])
}

fn default_winrm_blocked() -> Vec<String> {
    strings(&["*/Windows/System32/*", "*/Program Files/*"])
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source (for testing).
    pub fn apply_env_from<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workspace) = get("SHELL_RELAY_WORKSPACE") {
            if !workspace.is_empty() {
                self.workspace = PathBuf::from(workspace);
            }
        }

        if let Some(timeout) = get("SHELL_RELAY_TIMEOUT") {
            match timeout.parse() {
                Ok(secs) => self.shell_timeout_secs = secs,
                Err(_) => warn!(value = %timeout, "ignoring invalid SHELL_RELAY_TIMEOUT"),
            }
        }

        if let Some(level) = get("SHELL_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = get("RUST_LOG") {
            self.logging.level = level;
        }

        for machine in machines_from_env(&get) {
            self.upsert_machine(machine);
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(secs) = args.timeout_secs {
            self.shell_timeout_secs = secs;
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain, then validate it.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Config::default();

        // Load from config file if specified
        if let Some(ref path) = args.config {
            config = Config::from_file(path)?;
        }

        config.apply_env();
        config.apply_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Check cross-machine constraints.
    ///
    /// Missing SSH credentials only warn; the connection attempt will fail
    /// and be logged at start-up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "shell_timeout_secs must be greater than zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for machine in &self.machines {
            if machine.name.trim().is_empty() {
                return Err(ConfigError::Invalid("machine name must not be empty".into()));
            }
            if !seen.insert(machine.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate machine name: {}",
                    machine.name
                )));
            }
            if machine.name == LOCAL_MACHINE && machine.kind() != MachineKind::Local {
                return Err(ConfigError::Invalid(format!(
                    "machine name '{}' is reserved for the local machine",
                    LOCAL_MACHINE
                )));
            }

            match &machine.transport {
                TransportConfig::Local => {
                    if machine.name != LOCAL_MACHINE {
                        return Err(ConfigError::Invalid(format!(
                            "local machine entry '{}' must be named '{}'",
                            machine.name, LOCAL_MACHINE
                        )));
                    }
                }
                TransportConfig::Ssh { ssh } => {
                    let has_password = ssh.password.as_deref().is_some_and(|p| !p.is_empty());
                    let has_key = ssh.private_key_path.as_deref().is_some_and(|p| !p.is_empty());
                    if !has_password && !has_key {
                        warn!(machine = %machine.name, "SSH config has neither password nor private key");
                    }
                    if let Some(key) = ssh.private_key_path.as_deref().filter(|p| !p.is_empty()) {
                        if !expand_home(key).exists() {
                            warn!(machine = %machine.name, key = %key, "SSH key path does not exist");
                        }
                    }
                }
                TransportConfig::Winrm { winrm } => {
                    if winrm.password.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "WinRM password is required for machine '{}'",
                            machine.name
                        )));
                    }
                }
            }
        }

        let defaults = self.machines.iter().filter(|m| m.is_default).count();
        if defaults > 1 {
            return Err(ConfigError::Invalid(format!(
                "{} machines are marked is_default; at most one is allowed",
                defaults
            )));
        }

        Ok(())
    }

    /// Look up a machine by name.
    pub fn machine(&self, name: &str) -> Option<&MachineConfig> {
        self.machines.iter().find(|m| m.name == name)
    }

    /// Name of the default machine, `local` when none is marked.
    pub fn default_machine_name(&self) -> &str {
        self.machines
            .iter()
            .find(|m| m.is_default)
            .map(|m| m.name.as_str())
            .unwrap_or(LOCAL_MACHINE)
    }

    /// All machine names, starting with `local`.
    pub fn machine_names(&self) -> Vec<String> {
        let mut names = vec![LOCAL_MACHINE.to_string()];
        names.extend(
            self.machines
                .iter()
                .filter(|m| m.name != LOCAL_MACHINE)
                .map(|m| m.name.clone()),
        );
        names
    }

    /// Default command timeout.
    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }

    fn upsert_machine(&mut self, machine: MachineConfig) {
        match self.machines.iter_mut().find(|m| m.name == machine.name) {
            Some(existing) => *existing = machine,
            None => self.machines.push(machine),
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

fn machines_from_env<F>(get: &F) -> Vec<MachineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut machines = Vec::new();

    if let Some(host) = get("SSH_SERVER_HOST").filter(|h| !h.is_empty()) {
        let mut ssh = SshConfig::new(host, get("SSH_SERVER_USER").unwrap_or_else(|| "root".into()));
        ssh.port = env_port(get, "SSH_SERVER_PORT", ssh.port);
        ssh.password = get("SSH_SERVER_PASSWORD").filter(|p| !p.is_empty());
        ssh.private_key_path = get("SSH_SERVER_KEY_PATH").filter(|p| !p.is_empty());
        if let Some(roots) = get("SSH_ALLOWED_ROOTS") {
            ssh.allowed_roots = split_list(&roots);
        }
        if let Some(patterns) = get("SSH_BLOCKED_PATTERNS") {
            ssh.blocked_patterns = split_list(&patterns);
        }

        machines.push(MachineConfig {
            name: get("SSH_SERVER_NAME").unwrap_or_else(|| "server-01".into()),
            transport: TransportConfig::Ssh { ssh },
            is_default: env_flag(get, "SSH_IS_DEFAULT", false),
        });
    }

    if let Some(host) = get("WINRM_SERVER_HOST").filter(|h| !h.is_empty()) {
        let mut winrm = WinRmConfig::new(
            host,
            get("WINRM_SERVER_USER").unwrap_or_else(|| "Administrator".into()),
            get("WINRM_SERVER_PASSWORD").unwrap_or_default(),
        );
        winrm.port = env_port(get, "WINRM_SERVER_PORT", winrm.port);
        winrm.ssl = env_flag(get, "WINRM_SSL", true);
        winrm.cert_validation = env_flag(get, "WINRM_CERT_VALIDATION", false);
        if let Some(roots) = get("WINRM_ALLOWED_ROOTS") {
            winrm.allowed_roots = split_list(&roots);
        }
        if let Some(patterns) = get("WINRM_BLOCKED_PATTERNS") {
            winrm.blocked_patterns = split_list(&patterns);
        }

        machines.push(MachineConfig {
            name: get("WINRM_SERVER_NAME").unwrap_or_else(|| "win-server-01".into()),
            transport: TransportConfig::Winrm { winrm },
            is_default: env_flag(get, "WINRM_IS_DEFAULT", false),
        });
    }

    machines
}

fn env_port<F>(get: &F, key: &str, fallback: u16) -> u16
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(key = %key, value = %value, "ignoring invalid port");
            fallback
        }),
        None => fallback,
    }
}

fn env_flag<F>(get: &F, key: &str, fallback: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(fallback)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Semantically invalid configuration.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::error::ShellRelayError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
