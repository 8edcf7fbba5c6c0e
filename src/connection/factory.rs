//! Construction of executors from configuration.

use std::sync::Arc;

use crate::config::{Config, MachineConfig, TransportConfig};
use crate::execution::Executor;
use crate::transport::{LocalExecutor, SshExecutor, WinRmExecutor};

/// Builds executors for the connection manager.
///
/// The manager only calls `connect()` on what the factory returns, so tests
/// can substitute executors that never touch the network.
pub trait ExecutorFactory: Send + Sync {
    /// The always-present local executor.
    fn local(&self, config: &Config) -> Arc<dyn Executor>;

    /// Executor for a configured remote machine, `None` for local-type entries.
    fn remote(&self, machine: &MachineConfig) -> Option<Arc<dyn Executor>>;
}

/// Factory producing the real transport backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExecutorFactory;

impl ExecutorFactory for DefaultExecutorFactory {
    fn local(&self, config: &Config) -> Arc<dyn Executor> {
        Arc::new(LocalExecutor::from_config(config))
    }

    fn remote(&self, machine: &MachineConfig) -> Option<Arc<dyn Executor>> {
        match &machine.transport {
            TransportConfig::Local => None,
            TransportConfig::Ssh { ssh } => {
                Some(Arc::new(SshExecutor::new(&machine.name, ssh.clone())))
            }
            TransportConfig::Winrm { winrm } => {
                Some(Arc::new(WinRmExecutor::new(&machine.name, winrm.clone())))
            }
        }
    }
}
