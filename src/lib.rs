//! # shell-relay
//!
//! Sandboxed command and file execution on local, SSH and WinRM machines.
//!
//! Callers ask a [`ConnectionManager`] for the [`Executor`] bound to a
//! machine name and invoke operations on it. Every operation returns an
//! [`ExecutionResult`]; expected failures (security denials, timeouts,
//! transport errors) are carried in it instead of being returned as errors.
//!
//! ## Features
//!
//! - **Three transports**: local subprocesses, SSH exec + SFTP, WinRM shells
//! - **Path confinement**: allowed roots per machine, blocked patterns win
//! - **Command filtering**: destructive commands are refused before dispatch
//! - **Bounded waits**: every command and file operation has a timeout
//!
//! ## Quick Start
//!
//! ```no_run
//! use shell_relay::{Config, ConnectionManager};
//!
//! #[tokio::main]
//! async fn main() -> shell_relay::Result<()> {
//!     shell_relay::logging::try_init().ok();
//!
//!     let manager = ConnectionManager::new(Config::default());
//!     manager.initialize().await;
//!
//!     let local = manager.get_executor(Some("local"))?;
//!     let written = local.write_file("./workspace/notes.txt", "hello").await;
//!     assert!(written.ok, "{}", written.error);
//!
//!     let listing = local.list_directory("./workspace").await;
//!     println!("{}", listing.content);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod execution;
pub mod logging;
pub mod security;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, MachineConfig, MachineKind, SshConfig, TransportConfig, WinRmConfig};
pub use connection::{ConnectionManager, DefaultExecutorFactory, ExecutorFactory, MachineStatus};
pub use error::{Result, ShellRelayError};
pub use execution::{ExecutionResult, Executor, ExecutorState};
pub use security::{PathPolicy, PathStyle};
pub use transport::{LocalExecutor, SshExecutor, WinRmExecutor};
