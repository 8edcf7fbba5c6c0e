//! Security policy gating every path and command.
//!
//! ## Features
//!
//! - **Path confinement**: allow-list roots plus a blacklist that always wins
//! - **Command filtering**: case-insensitive deny list of destructive commands
//! - **Workspace check**: the local working directory must exist and be
//!   readable and writable before local traffic is accepted
//!
//! ## Example
//!
//! ```rust
//! use shell_relay::security::{is_dangerous_command, PathPolicy, PathStyle};
//!
//! assert!(is_dangerous_command("sudo rm -rf /"));
//! assert!(!is_dangerous_command("ls -la /tmp"));
//!
//! let policy = PathPolicy::new(vec!["/home".into()], vec!["*/.ssh/*".into()]);
//! assert!(policy.confine_remote("/home/dev/notes.txt", PathStyle::Posix).is_ok());
//! assert!(policy.confine_remote("/homework/notes.txt", PathStyle::Posix).is_err());
//! assert!(policy.confine_remote("/home/dev/.ssh/id_rsa", PathStyle::Posix).is_err());
//! ```

pub mod commands;
pub mod paths;

// Re-export commonly used items
pub use commands::{dangerous_pattern, is_dangerous_command, sanitize_for_display, DANGEROUS_COMMANDS};
pub use paths::{
    check_workspace_permissions, confine_remote_path, default_blocked_patterns, is_under_root,
    matches_blocked, resolve_safe_path, to_slash_string, PathPolicy, PathStyle,
    DEFAULT_LOCAL_ROOT,
};
