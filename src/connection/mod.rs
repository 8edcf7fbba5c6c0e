//! Connection lifecycle: one executor per named machine.
//!
//! # Example
//!
//! ```no_run
//! use shell_relay::{Config, ConnectionManager};
//!
//! # async fn run() -> shell_relay::Result<()> {
//! let manager = ConnectionManager::new(Config::default());
//! manager.initialize().await;
//!
//! let executor = manager.get_executor(None)?;
//! let result = executor
//!     .execute_command("echo hello", manager.config().shell_timeout())
//!     .await;
//! println!("{}", result.stdout);
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod factory;
mod manager;

pub use factory::{DefaultExecutorFactory, ExecutorFactory};
pub use manager::{ConnectionManager, MachineStatus, PROBE_COMMAND};
