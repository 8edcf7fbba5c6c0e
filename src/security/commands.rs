//! Dangerous command detection.
//!
//! Matching is a case-insensitive substring search over the whole command
//! line. A pattern anywhere in the text blocks the command, so some harmless
//! commands are rejected too (`echo "mkfs"`), never the reverse.

/// Command fragments that are always refused.
pub const DANGEROUS_COMMANDS: &[&str] = &[
    // Filesystem wipes
    "rm -rf /",
    "rm -rf /*",
    "format c:",
    "del /s /q c:\\",
    // Fork bomb
    ":(){ :|:& };:",
    // Disk formatting / raw overwrite
    "mkfs",
    "dd if=/dev/zero",
    // Recursive permission and ownership resets on root
    "chmod -R 777 /",
    "chown -R root:root /",
    // Shutdown / halt
    "shutdown -h now",
    "init 0",
    "shutdown /s 0",
];

/// Maximum characters kept by [`sanitize_for_display`].
const DISPLAY_LIMIT: usize = 100;

/// Return the first deny-list entry found in `command`, if any.
pub fn dangerous_pattern(command: &str) -> Option<&'static str> {
    let lower = command.to_lowercase();

    DANGEROUS_COMMANDS
        .iter()
        .copied()
        .find(|pattern| lower.contains(&pattern.to_lowercase()))
}

/// Check whether a command matches the dangerous command list.
pub fn is_dangerous_command(command: &str) -> bool {
    dangerous_pattern(command).is_some()
}

/// Prepare a command string for log output.
///
/// Control characters are dropped and the text is cut to a short preview.
pub fn sanitize_for_display(command: &str) -> String {
    command
        .chars()
        .filter(|c| !c.is_control() || *c == '\t')
        .take(DISPLAY_LIMIT)
        .collect()
}
