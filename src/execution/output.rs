//! Output helpers shared by every transport.

use std::fmt;

/// Keep at most `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Decode bytes as UTF-8, replacing invalid sequences.
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListingEntry {
    /// Entry name without its parent path.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

impl ListingEntry {
    /// Create a listing entry.
    pub fn new(name: impl Into<String>, is_dir: bool) -> Self {
        Self {
            name: name.into(),
            is_dir,
        }
    }
}

impl fmt::Display for ListingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_dir { "dir" } else { "file" };
        write!(f, "{}: {}", kind, self.name)
    }
}

/// Render entries as `dir: name` / `file: name` lines, sorted by name.
pub fn format_listing(mut entries: Vec<ListingEntry>) -> String {
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
