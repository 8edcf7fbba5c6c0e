//! Executor backends.
//!
//! - [`LocalExecutor`]: subprocesses and the local filesystem
//! - [`SshExecutor`]: exec channels and SFTP over one SSH session
//! - [`WinRmExecutor`]: WS-Management remote shells and PowerShell

mod local;
mod ssh;
pub mod winrm;

pub use local::LocalExecutor;
pub use ssh::SshExecutor;
pub use winrm::WinRmExecutor;
