//! Named pool of connected executors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::factory::{DefaultExecutorFactory, ExecutorFactory};
use crate::config::{Config, MachineKind, LOCAL_MACHINE};
use crate::error::ShellRelayError;
use crate::execution::Executor;
use crate::Result;

/// Command used by [`ConnectionManager::test_all_connections`].
pub const PROBE_COMMAND: &str = "echo test";

/// Status of one pooled executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineStatus {
    /// Transport type.
    #[serde(rename = "type")]
    pub kind: MachineKind,
    /// Whether the executor is in the `Connected` state.
    pub connected: bool,
    /// Path prefixes permitted for file operations.
    pub allowed_roots: Vec<String>,
}

/// Owns one executor per reachable machine.
///
/// The pool is filled by [`initialize`](Self::initialize) and emptied by
/// [`shutdown`](Self::shutdown); lookups in between never mutate it.
pub struct ConnectionManager {
    config: Config,
    factory: Arc<dyn ExecutorFactory>,
    executors: RwLock<BTreeMap<String, Arc<dyn Executor>>>,
    default_machine: RwLock<String>,
    initialized: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager that builds the real transport backends.
    pub fn new(config: Config) -> Self {
        Self::with_factory(config, Arc::new(DefaultExecutorFactory))
    }

    /// Create a manager with a custom executor factory.
    pub fn with_factory(config: Config, factory: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            config,
            factory,
            executors: RwLock::new(BTreeMap::new()),
            default_machine: RwLock::new(LOCAL_MACHINE.to_string()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Configuration the pool is built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect the local executor, then every configured remote machine.
    ///
    /// Machines that fail to connect are logged and left out of the pool.
    /// Calling this on an initialized manager does nothing.
    pub async fn initialize(&self) {
        if self.is_initialized() {
            debug!("connection pool already initialized");
            return;
        }
        info!(machines = self.config.machines.len(), "initializing connection pool");

        let mut pool = BTreeMap::new();
        let mut default_machine = LOCAL_MACHINE.to_string();

        let local = self.factory.local(&self.config);
        if local.connect().await {
            info!(machine = %local.name(), "local executor connected");
            pool.insert(local.name().to_string(), local);
        } else {
            error!("failed to connect local executor");
        }

        for machine in &self.config.machines {
            // The local executor is always pooled as `local`, which is already the fallback default.
            if machine.kind() == MachineKind::Local {
                continue;
            }

            let Some(executor) = self.factory.remote(machine) else {
                warn!(machine = %machine.name, "no executor available for machine");
                continue;
            };

            if executor.connect().await {
                info!(machine = %machine.name, kind = %machine.kind(), "executor connected");
                if machine.is_default {
                    default_machine = machine.name.clone();
                }
                pool.insert(machine.name.clone(), executor);
            } else {
                warn!(machine = %machine.name, kind = %machine.kind(), "failed to connect, skipping");
            }
        }

        let count = pool.len();
        match self.executors.write() {
            Ok(mut executors) => *executors = pool,
            Err(_) => {
                error!("executor pool lock poisoned");
                return;
            }
        }
        if let Ok(mut default) = self.default_machine.write() {
            *default = default_machine;
        }
        self.initialized.store(true, Ordering::SeqCst);

        info!(executors = count, default = %self.default_machine(), "connection pool initialized");
    }

    /// Executor for `name`, or for the default machine when `None`.
    pub fn get_executor(&self, name: Option<&str>) -> Result<Arc<dyn Executor>> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.default_machine(),
        };

        let executors = self
            .executors
            .read()
            .map_err(|_| ShellRelayError::LockPoisoned)?;
        executors
            .get(&name)
            .cloned()
            .ok_or_else(|| ShellRelayError::MachineNotAvailable {
                name,
                available: executors.keys().cloned().collect(),
            })
    }

    /// Names of every pooled machine, sorted.
    pub fn list_machines(&self) -> Vec<String> {
        self.executors
            .read()
            .map(|executors| executors.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Name used when a caller names no machine.
    pub fn default_machine(&self) -> String {
        self.default_machine
            .read()
            .map(|name| name.clone())
            .unwrap_or_else(|_| LOCAL_MACHINE.to_string())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Type, connection state and allowed roots per pooled machine.
    pub fn executor_stats(&self) -> BTreeMap<String, MachineStatus> {
        self.snapshot()
            .into_iter()
            .map(|(name, executor)| {
                let status = MachineStatus {
                    kind: executor.kind(),
                    connected: executor.is_connected(),
                    allowed_roots: executor.allowed_roots().to_vec(),
                };
                (name, status)
            })
            .collect()
    }

    /// Run a harmless probe on every pooled executor.
    ///
    /// Failures are reported, never evicted.
    pub async fn test_all_connections(&self) -> BTreeMap<String, bool> {
        let timeout = self.config.shell_timeout();
        let probes = self.snapshot().into_iter().map(|(name, executor)| async move {
            let result = executor.execute_command(PROBE_COMMAND, timeout).await;
            if !result.ok {
                warn!(machine = %name, error = %result.error, "connection test failed");
            }
            (name, result.ok)
        });

        join_all(probes).await.into_iter().collect()
    }

    /// Disconnect every executor, empty the pool and allow re-initialization.
    pub async fn shutdown(&self) {
        info!("shutting down connection pool");

        let drained: Vec<(String, Arc<dyn Executor>)> = match self.executors.write() {
            Ok(mut executors) => std::mem::take(&mut *executors).into_iter().collect(),
            Err(_) => {
                error!("executor pool lock poisoned");
                Vec::new()
            }
        };

        for (name, executor) in drained {
            executor.disconnect().await;
            info!(machine = %name, "disconnected");
        }

        if let Ok(mut default) = self.default_machine.write() {
            *default = LOCAL_MACHINE.to_string();
        }
        self.initialized.store(false, Ordering::SeqCst);
        info!("connection pool shutdown complete");
    }

    /// Number of pooled executors.
    pub fn len(&self) -> usize {
        self.executors.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Executor>)> {
        self.executors
            .read()
            .map(|executors| {
                executors
                    .iter()
                    .map(|(name, executor)| (name.clone(), Arc::clone(executor)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("executors", &self.list_machines())
            .field("default_machine", &self.default_machine())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
