//! Executor contract and its result type.
//!
//! This module provides what every transport shares:
//! - The [`Executor`] trait
//! - [`ExecutionResult`], the uniform outcome value
//! - Lifecycle state, timeout wrapping and output truncation
//!
//! # Example
//!
//! ```no_run
//! use shell_relay::execution::{Executor, DEFAULT_TIMEOUT};
//!
//! async fn uptime(executor: &dyn Executor) -> String {
//!     let result = executor.execute_command("uptime", DEFAULT_TIMEOUT).await;
//!     if result.is_success() {
//!         result.stdout
//!     } else {
//!         result.error
//!     }
//! }
//! ```

mod executor;
mod output;
mod result;
mod state;

pub use executor::{guard_command, into_result, with_timeout, Executor, DEFAULT_TIMEOUT};
pub use output::{decode_lossy, format_listing, truncate_chars, ListingEntry};
pub use result::{ExecutionResult, MAX_OUTPUT_CHARS, MAX_READ_BYTES};
pub use state::{ExecutorState, StateCell};
