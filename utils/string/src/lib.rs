//! UTF-8 safe truncation helpers for text handed to subprocesses.
//!
//! Diagnostic output and agent summaries can be arbitrarily large. These
//! helpers shrink them to a byte or line budget without splitting a
//! multi-byte character.

use std::borrow::Cow;

/// Marker appended by [`truncate_with_marker`] when text was cut.
pub const TRUNCATION_MARKER: &str = "…";

/// Longest prefix of `s` that fits in `max_bytes` and ends on a char boundary.
///
/// ```
/// use warden_utils_string::prefix_at_char_boundary;
///
/// assert_eq!(prefix_at_char_boundary("gateway", 4), "gate");
/// // "é" is two bytes and is never split.
/// assert_eq!(prefix_at_char_boundary("né", 2), "n");
/// ```
pub fn prefix_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate `s` to `max_bytes`, appending [`TRUNCATION_MARKER`] when cut.
///
/// The marker is counted against the budget, so the result never exceeds
/// `max_bytes` unless the budget is smaller than the marker itself.
pub fn truncate_with_marker(s: &str, max_bytes: usize) -> Cow<'_, str> {
    if s.len() <= max_bytes {
        return Cow::Borrowed(s);
    }
    let budget = max_bytes.saturating_sub(TRUNCATION_MARKER.len());
    let mut out = prefix_at_char_boundary(s, budget).to_string();
    out.push_str(TRUNCATION_MARKER);
    Cow::Owned(out)
}

/// Keep the first and last lines of `text` so that at most `max_lines`
/// original lines survive.
///
/// The head gets the larger half when `max_lines` is odd. The dropped middle
/// is replaced by a single `... [N lines omitted] ...` line, so the window
/// still tells the reader how much was removed.
pub fn head_tail_lines(text: &str, max_lines: usize) -> Cow<'_, str> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return Cow::Borrowed(text);
    }

    let head = max_lines.div_ceil(2);
    let tail = max_lines - head;
    let omitted = lines.len() - head - tail;

    let mut out = Vec::with_capacity(max_lines + 1);
    out.extend_from_slice(&lines[..head]);
    let marker = format!("... [{omitted} lines omitted] ...");
    out.push(marker.as_str());
    out.extend_from_slice(&lines[lines.len() - tail..]);
    Cow::Owned(out.join("\n"))
}
