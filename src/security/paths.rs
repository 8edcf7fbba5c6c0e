//! Path confinement.
//!
//! Every file operation passes through [`resolve_safe_path`] (local
//! filesystem) or [`confine_remote_path`] (SSH/WinRM targets) before any
//! transport is touched. The blacklist is checked first and always wins over
//! the allow-list.

use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::{debug, info, warn};

use crate::error::ShellRelayError;
use crate::Result;

/// Root used for local file operations when nothing else is configured.
pub const DEFAULT_LOCAL_ROOT: &str = "./workspace";

const MAX_LINK_HOPS: usize = 40;

/// Blocked patterns applied to the local machine by default.
pub fn default_blocked_patterns() -> Vec<String> {
    [
        "*/Windows/*",
        "*/System32/*",
        "*/etc/*",
        "*/bin/*",
        "*/proc/*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Separator and case rules of the machine a path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    /// `/`-rooted, case-sensitive.
    Posix,
    /// Drive-letter or UNC rooted, case-insensitive, `\` accepted as separator.
    Windows,
}

impl PathStyle {
    /// Style of the host this process runs on.
    pub fn native() -> Self {
        if cfg!(windows) {
            PathStyle::Windows
        } else {
            PathStyle::Posix
        }
    }

    fn case_sensitive(self) -> bool {
        matches!(self, PathStyle::Posix)
    }
}

/// Allowed roots and blocked patterns of one machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathPolicy {
    allowed_roots: Vec<String>,
    blocked_patterns: Vec<String>,
}

impl PathPolicy {
    /// Create a policy from root prefixes and blocked glob patterns.
    pub fn new(allowed_roots: Vec<String>, blocked_patterns: Vec<String>) -> Self {
        Self {
            allowed_roots,
            blocked_patterns,
        }
    }

    /// Path prefixes permitted for file operations.
    pub fn allowed_roots(&self) -> &[String] {
        &self.allowed_roots
    }

    /// Glob patterns that are always denied.
    pub fn blocked_patterns(&self) -> &[String] {
        &self.blocked_patterns
    }

    /// Confine a path on the local filesystem.
    pub fn resolve_local(&self, requested: &str, must_exist: bool) -> Result<PathBuf> {
        resolve_safe_path(
            requested,
            must_exist,
            &self.allowed_roots,
            &self.blocked_patterns,
        )
    }

    /// Confine a path that lives on a remote machine.
    pub fn confine_remote(&self, requested: &str, style: PathStyle) -> Result<String> {
        confine_remote_path(
            requested,
            style,
            &self.allowed_roots,
            &self.blocked_patterns,
        )
    }
}

/// Resolve a requested local path into a confined, absolute path.
///
/// With `must_exist` and an existing target the full path is canonicalized
/// (symlinks followed). Otherwise only the parent is canonicalized and the
/// leaf name re-appended, so a file that does not exist yet still gets an
/// absolute target. A symlink leaf is always resolved to its destination,
/// even when the destination does not exist yet.
pub fn resolve_safe_path(
    requested: &str,
    must_exist: bool,
    allowed_roots: &[String],
    blocked_patterns: &[String],
) -> Result<PathBuf> {
    if requested.contains('\0') {
        return Err(ShellRelayError::PathResolution(
            "path contains a NUL byte".to_string(),
        ));
    }

    let target = resolve_target(Path::new(requested), must_exist)
        .map_err(|e| ShellRelayError::PathResolution(format!("'{}': {}", requested, e)))?;
    let target_str = to_slash_string(&target);
    let style = PathStyle::native();

    if let Some(pattern) = matches_blocked(&target_str, blocked_patterns, style) {
        warn!(path = %target_str, pattern = %pattern, "security block: blocked pattern");
        return Err(ShellRelayError::SecurityViolation(format!(
            "Access Denied: Path '{}' is in a blocked system directory.",
            target_str
        )));
    }

    let roots: Vec<String> = allowed_roots
        .iter()
        .filter_map(|root| match resolve_lenient(Path::new(root)) {
            Ok(resolved) => Some(to_slash_string(&resolved)),
            Err(e) => {
                debug!(root = %root, error = %e, "skipping unresolvable root");
                None
            }
        })
        .collect();

    if !roots.iter().any(|root| is_under_root(&target_str, root, style)) {
        warn!(path = %target_str, "security block: outside allowed roots");
        return Err(outside_roots(&target_str, &roots));
    }

    Ok(target)
}

/// Confine a path on a remote machine.
///
/// The remote filesystem cannot be inspected from here, so the path is
/// normalized lexically (`.` and `..` folded) and must be absolute in the
/// remote's own style. Returns the normalized path with `/` separators.
pub fn confine_remote_path(
    requested: &str,
    style: PathStyle,
    allowed_roots: &[String],
    blocked_patterns: &[String],
) -> Result<String> {
    if requested.contains('\0') {
        return Err(ShellRelayError::PathResolution(
            "path contains a NUL byte".to_string(),
        ));
    }

    let target = normalize_remote(requested, style).ok_or_else(|| {
        ShellRelayError::PathResolution(format!("remote path must be absolute: '{}'", requested))
    })?;

    if let Some(pattern) = matches_blocked(&target, blocked_patterns, style) {
        warn!(path = %target, pattern = %pattern, "security block: blocked pattern");
        return Err(ShellRelayError::SecurityViolation(format!(
            "Access Denied: Path '{}' is in a blocked system directory.",
            target
        )));
    }

    let roots: Vec<String> = allowed_roots
        .iter()
        .filter_map(|root| normalize_remote(root, style))
        .collect();

    if !roots.iter().any(|root| is_under_root(&target, root, style)) {
        warn!(path = %target, "security block: outside allowed roots");
        return Err(outside_roots(&target, &roots));
    }

    Ok(target)
}

/// Ensure the working directory exists and is readable and writable.
///
/// Creates the directory when missing. Returns its canonical path.
pub fn check_workspace_permissions(workspace: impl AsRef<Path>) -> Result<PathBuf> {
    let workspace = workspace.as_ref();

    if !workspace.exists() {
        std::fs::create_dir_all(workspace).map_err(|e| {
            ShellRelayError::Permission(format!(
                "Cannot create workspace '{}': {}",
                workspace.display(),
                e
            ))
        })?;
        info!(workspace = %workspace.display(), "created workspace");
    }

    if !workspace.is_dir() {
        return Err(ShellRelayError::Permission(format!(
            "Workspace '{}' is not a directory.",
            workspace.display()
        )));
    }

    if !is_readable_writable(workspace) {
        return Err(ShellRelayError::Permission(format!(
            "Workspace '{}' is not readable/writable.",
            workspace.display()
        )));
    }

    let canonical = workspace.canonicalize()?;
    info!(workspace = %canonical.display(), "workspace permissions verified");
    Ok(canonical)
}

/// Return the first blocked pattern matching `path`, if any.
///
/// Patterns are wrapped in `*...*` so they match anywhere in the path.
pub fn matches_blocked(path: &str, blocked_patterns: &[String], style: PathStyle) -> Option<String> {
    let options = MatchOptions {
        case_sensitive: style.case_sensitive(),
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };

    blocked_patterns
        .iter()
        .find(|pattern| {
            let wrapped = collapse_stars(&format!("*{}*", pattern.replace('\\', "/")));
            match Pattern::new(&wrapped) {
                Ok(glob) => glob.matches_with(path, options),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "invalid blocked pattern, matching literally");
                    let literal = pattern.trim_matches('*').replace('\\', "/");
                    if options.case_sensitive {
                        path.contains(&literal)
                    } else {
                        path.to_lowercase().contains(&literal.to_lowercase())
                    }
                }
            }
        })
        .cloned()
}

/// Prefix match on a separator boundary: `/home` covers `/home/x` but not
/// `/homework`.
pub fn is_under_root(path: &str, root: &str, style: PathStyle) -> bool {
    let root = root.trim_end_matches('/');
    let (path, root) = if style.case_sensitive() {
        (path.to_string(), root.to_string())
    } else {
        (path.to_lowercase(), root.to_lowercase())
    };

    if !path.starts_with(&root) {
        return false;
    }

    path.len() == root.len() || path.as_bytes()[root.len()] == b'/'
}

/// Render a path with `/` separators, dropping the Windows verbatim prefix.
pub fn to_slash_string(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let trimmed = raw.strip_prefix(r"\\?\").unwrap_or(&raw);
    trimmed.replace('\\', "/")
}

fn outside_roots(target: &str, roots: &[String]) -> ShellRelayError {
    ShellRelayError::SecurityViolation(format!(
        "Access Denied: Path '{}' is outside allowed roots. Allowed roots: [{}]",
        target,
        roots.join(", ")
    ))
}

fn resolve_target(requested: &Path, must_exist: bool) -> io::Result<PathBuf> {
    match std::fs::symlink_metadata(requested) {
        // Writes follow a symlink leaf, so confinement is decided on its target.
        Ok(meta) if meta.file_type().is_symlink() => return resolve_link(requested),
        Ok(_) if must_exist => return requested.canonicalize(),
        _ => {}
    }

    match (requested.parent(), requested.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            Ok(resolve_lenient(parent)?.join(name))
        }
        _ => resolve_lenient(requested),
    }
}

/// Follow a symlink chain, including dangling links, to the path it lands on.
fn resolve_link(link: &Path) -> io::Result<PathBuf> {
    let mut current = link.to_path_buf();
    for _ in 0..MAX_LINK_HOPS {
        match current.canonicalize() {
            Ok(resolved) => return Ok(resolved),
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            Err(_) => {}
        }
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let dest = std::fs::read_link(&current)?;
                current = match current.parent() {
                    Some(parent) => parent.join(dest),
                    None => dest,
                };
            }
            _ => return resolve_lenient(&current),
        }
    }
    Err(io::Error::other("too many levels of symbolic links"))
}

/// Canonicalize the longest existing prefix and append the rest lexically.
fn resolve_lenient(path: &Path) -> io::Result<PathBuf> {
    let mut current = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut tail: Vec<OsString> = Vec::new();

    loop {
        match current.canonicalize() {
            Ok(mut resolved) => {
                for name in tail.iter().rev() {
                    resolved.push(name);
                }
                return Ok(resolved);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match (current.parent(), current.file_name()) {
                    (Some(parent), Some(name)) => {
                        tail.push(name.to_os_string());
                        current = parent.to_path_buf();
                    }
                    _ => {
                        let folded = normalize_lexically(&current);
                        if folded == current {
                            return Err(e);
                        }
                        current = folded;
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn normalize_remote(path: &str, style: PathStyle) -> Option<String> {
    let slashed = match style {
        PathStyle::Posix => path.to_string(),
        PathStyle::Windows => path.replace('\\', "/"),
    };

    let (prefix, rest) = match style {
        PathStyle::Posix => (String::new(), slashed.strip_prefix('/')?.to_string()),
        PathStyle::Windows => {
            let bytes = slashed.as_bytes();
            if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
                let rest = &slashed[2..];
                if !(rest.is_empty() || rest.starts_with('/')) {
                    // Drive-relative ("C:foo") has no fixed anchor.
                    return None;
                }
                (slashed[..2].to_string(), rest.to_string())
            } else if let Some(unc) = slashed.strip_prefix("//") {
                ("/".to_string(), unc.to_string())
            } else {
                return None;
            }
        }
    };

    let mut parts: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }

    Some(format!("{}/{}", prefix, parts.join("/")))
}

fn collapse_stars(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c == '*' && out.ends_with('*') {
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(unix)]
fn is_readable_writable(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

#[cfg(not(unix))]
fn is_readable_writable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}
