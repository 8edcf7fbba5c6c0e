//! Connection manager integration tests.
//!
//! Remote machines are replaced by in-memory executors through a custom
//! `ExecutorFactory`, so no network access is needed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_test::assert_ok;

use shell_relay::config::{MachineConfig, SshConfig, TransportConfig, WinRmConfig};
use shell_relay::execution::{ExecutorState, StateCell};
use shell_relay::{
    Config, ConnectionManager, ExecutionResult, Executor, ExecutorFactory, MachineKind,
    ShellRelayError,
};

// ============================================================================
// Test Doubles
// ============================================================================

struct FakeExecutor {
    name: String,
    kind: MachineKind,
    reachable: bool,
    probe_ok: bool,
    roots: Vec<String>,
    state: StateCell,
    disconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MachineKind {
        self.kind
    }

    fn state(&self) -> ExecutorState {
        self.state.get()
    }

    fn allowed_roots(&self) -> &[String] {
        &self.roots
    }

    fn blocked_patterns(&self) -> &[String] {
        &[]
    }

    async fn connect(&self) -> bool {
        self.reachable && self.state.mark_connected()
    }

    async fn disconnect(&self) {
        self.state.close();
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn execute_command(&self, command: &str, _timeout: Duration) -> ExecutionResult {
        if self.probe_ok {
            ExecutionResult::success(&self.name).with_stdout(command.trim_start_matches("echo "))
        } else {
            ExecutionResult::failure_message(&self.name, "connection reset")
        }
    }

    async fn read_file(&self, _path: &str) -> ExecutionResult {
        ExecutionResult::failure_message(&self.name, "unsupported")
    }

    async fn write_file(&self, _path: &str, _content: &str) -> ExecutionResult {
        ExecutionResult::failure_message(&self.name, "unsupported")
    }

    async fn file_exists(&self, _path: &str) -> bool {
        false
    }

    async fn list_directory(&self, _path: &str) -> ExecutionResult {
        ExecutionResult::failure_message(&self.name, "unsupported")
    }
}

#[derive(Default)]
struct FakeFactory {
    unreachable: HashSet<String>,
    failing_probe: HashSet<String>,
    built: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
}

impl FakeFactory {
    fn unreachable(mut self, name: &str) -> Self {
        self.unreachable.insert(name.to_string());
        self
    }

    fn failing_probe(mut self, name: &str) -> Self {
        self.failing_probe.insert(name.to_string());
        self
    }

    fn build(&self, name: &str, kind: MachineKind) -> Arc<dyn Executor> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Arc::new(FakeExecutor {
            name: name.to_string(),
            kind,
            reachable: !self.unreachable.contains(name),
            probe_ok: !self.failing_probe.contains(name),
            roots: vec![format!("/srv/{}", name)],
            state: StateCell::new(),
            disconnects: Arc::clone(&self.disconnects),
        })
    }
}

impl ExecutorFactory for FakeFactory {
    fn local(&self, _config: &Config) -> Arc<dyn Executor> {
        self.build("local", MachineKind::Local)
    }

    fn remote(&self, machine: &MachineConfig) -> Option<Arc<dyn Executor>> {
        match machine.kind() {
            MachineKind::Local => None,
            kind => Some(self.build(&machine.name, kind)),
        }
    }
}

fn ssh(name: &str, is_default: bool) -> MachineConfig {
    MachineConfig {
        name: name.to_string(),
        transport: TransportConfig::Ssh {
            ssh: SshConfig::new(format!("{}.internal", name), "ops"),
        },
        is_default,
    }
}

fn winrm(name: &str, is_default: bool) -> MachineConfig {
    MachineConfig {
        name: name.to_string(),
        transport: TransportConfig::Winrm {
            winrm: WinRmConfig::new(format!("{}.internal", name), "Administrator", "pw"),
        },
        is_default,
    }
}

fn local_entry(name: &str, is_default: bool) -> MachineConfig {
    MachineConfig {
        name: name.to_string(),
        transport: TransportConfig::Local,
        is_default,
    }
}

fn config(machines: Vec<MachineConfig>) -> Config {
    Config {
        machines,
        ..Config::default()
    }
}

async fn manager(machines: Vec<MachineConfig>, factory: FakeFactory) -> (ConnectionManager, Arc<FakeFactory>) {
    let factory = Arc::new(factory);
    let manager = ConnectionManager::with_factory(config(machines), factory.clone());
    manager.initialize().await;
    (manager, factory)
}

// ============================================================================
// Default Machine Tests
// ============================================================================

#[tokio::test]
async fn test_explicit_default_machine() {
    let (manager, _) = manager(
        vec![local_entry("local", false), ssh("db", true)],
        FakeFactory::default(),
    )
    .await;

    assert_eq!(manager.default_machine(), "db");
    assert_eq!(manager.get_executor(None).unwrap().name(), "db");
}

#[tokio::test]
async fn test_default_falls_back_to_local() {
    let (manager, _) = manager(vec![ssh("db", false)], FakeFactory::default()).await;

    assert_eq!(manager.default_machine(), "local");
    assert_eq!(manager.get_executor(None).unwrap().name(), "local");
}

#[tokio::test]
async fn test_unreachable_default_is_not_recorded() {
    let (manager, _) = manager(
        vec![ssh("db", true)],
        FakeFactory::default().unreachable("db"),
    )
    .await;

    assert_eq!(manager.default_machine(), "local");
}

#[tokio::test]
async fn test_local_entry_marks_default() {
    let (manager, _) = manager(
        vec![local_entry("local", true), ssh("db", false)],
        FakeFactory::default(),
    )
    .await;

    assert_eq!(manager.default_machine(), "local");
    assert_eq!(manager.len(), 2);
}

#[tokio::test]
async fn test_misnamed_local_entry_keeps_local_default() {
    let (manager, _) = manager(
        vec![local_entry("workstation", true), ssh("db", false)],
        FakeFactory::default(),
    )
    .await;

    assert_eq!(manager.default_machine(), "local");
    assert_eq!(manager.get_executor(None).unwrap().name(), "local");
    assert_eq!(manager.list_machines(), vec!["db", "local"]);
}

// ============================================================================
// Bring-up Tests
// ============================================================================

#[tokio::test]
async fn test_partial_bring_up() {
    let (manager, _) = manager(
        vec![ssh("db", false), ssh("down", false), winrm("win", false)],
        FakeFactory::default().unreachable("down"),
    )
    .await;

    assert!(manager.is_initialized());
    assert_eq!(manager.list_machines(), vec!["db", "local", "win"]);

    let err = manager.get_executor(Some("down")).err().unwrap();
    match err {
        ShellRelayError::MachineNotAvailable { name, available } => {
            assert_eq!(name, "down");
            assert_eq!(available, vec!["db", "local", "win"]);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_local_failure_does_not_abort_remotes() {
    let (manager, _) = manager(
        vec![ssh("db", false)],
        FakeFactory::default().unreachable("local"),
    )
    .await;

    assert!(manager.is_initialized());
    assert_eq!(manager.list_machines(), vec!["db"]);
    assert!(matches!(
        manager.get_executor(None),
        Err(ShellRelayError::MachineNotAvailable { .. })
    ));
}

#[tokio::test]
async fn test_initialize_twice_is_noop() {
    let (manager, factory) = manager(vec![ssh("db", false)], FakeFactory::default()).await;
    assert_eq!(factory.built.load(Ordering::SeqCst), 2);

    manager.initialize().await;
    assert_eq!(factory.built.load(Ordering::SeqCst), 2);
    assert_eq!(manager.len(), 2);
}

#[tokio::test]
async fn test_not_initialized_before_initialize() {
    let manager = ConnectionManager::with_factory(config(vec![]), Arc::new(FakeFactory::default()));

    assert!(!manager.is_initialized());
    assert!(manager.is_empty());
    assert!(matches!(
        manager.get_executor(None),
        Err(ShellRelayError::MachineNotAvailable { .. })
    ));
}

// ============================================================================
// Health and Stats Tests
// ============================================================================

#[tokio::test]
async fn test_probe_failure_is_reported_not_evicted() {
    let (manager, _) = manager(
        vec![ssh("db", false), winrm("win", false)],
        FakeFactory::default().failing_probe("win"),
    )
    .await;

    let results = manager.test_all_connections().await;
    assert_eq!(results.get("local"), Some(&true));
    assert_eq!(results.get("db"), Some(&true));
    assert_eq!(results.get("win"), Some(&false));

    assert_eq!(manager.len(), 3);
    assert_ok!(manager.get_executor(Some("win")));
}

#[tokio::test]
async fn test_executor_stats() {
    let (manager, _) = manager(vec![winrm("win", false)], FakeFactory::default()).await;

    let stats = manager.executor_stats();
    let win = stats.get("win").unwrap();
    assert_eq!(win.kind, MachineKind::Winrm);
    assert!(win.connected);
    assert_eq!(win.allowed_roots, vec!["/srv/win"]);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["local"]["type"], "local");
    assert_eq!(json["win"]["connected"], true);
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_then_reinitialize() {
    let (manager, factory) = manager(
        vec![ssh("db", true), winrm("win", false)],
        FakeFactory::default(),
    )
    .await;
    let held = assert_ok!(manager.get_executor(Some("db")));

    manager.shutdown().await;
    assert!(!manager.is_initialized());
    assert!(manager.is_empty());
    assert_eq!(factory.disconnects.load(Ordering::SeqCst), 3);
    assert_eq!(held.state(), ExecutorState::Disconnected);

    manager.initialize().await;
    assert!(manager.is_initialized());
    assert_eq!(manager.len(), 3);
    assert_eq!(manager.default_machine(), "db");
    assert!(manager.get_executor(Some("db")).unwrap().is_connected());
}

// ============================================================================
// Real Local Backend
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_default_factory_local_bring_up() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().join("workspace");
    let mut config = Config::default();
    config.workspace = workspace.clone();
    config.local.allowed_roots = vec![workspace.to_string_lossy().into_owned()];

    let manager = ConnectionManager::new(config);
    manager.initialize().await;

    assert_eq!(manager.list_machines(), vec!["local"]);
    assert!(workspace.is_dir());

    let results = manager.test_all_connections().await;
    assert_eq!(results.get("local"), Some(&true));

    let local = manager.get_executor(None).unwrap();
    let target = workspace.join("hello.txt");
    let written = local.write_file(&target.to_string_lossy(), "hi").await;
    assert!(written.ok, "{}", written.error);

    manager.shutdown().await;
    assert!(!local.is_connected());
}
