//! Helpers for sanitizing data before it enters span attributes, log lines,
//! or the job store's `error_message` column.

use std::path::Path;

/// Returns only the filename component of a path (no directory).
///
/// Safe for span fields: reveals the file name without exposing the layout
/// of the worker's disk.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Truncates `message` to at most `max_chars` characters, marking the cut.
///
/// Counts characters, not bytes, so multi-byte text is never split.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}... (truncated)", &message[..cut]),
        None => message.to_string(),
    }
}

/// Drops the query string of a signed URL so the token never reaches logs.
///
/// - `https://x.supabase.co/storage/v1/object/sign/b/k.png?token=abc` →
///   `https://x.supabase.co/storage/v1/object/sign/b/k.png?<redacted>`
pub fn redact_signed_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{}?<redacted>", base),
        None => url.to_string(),
    }
}
