/// Safely truncate a string at character boundaries, not byte boundaries
///
/// Multi-byte UTF-8 characters are never split. Returns the string with "..."
/// appended if truncation occurred.
pub fn safe_truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

/// Keep the head and tail of `s`, replacing the middle with an ellipsis so the
/// result is at most `max_chars` characters.
pub fn truncate_middle(s: &str, max_chars: usize) -> String {
    const MARKER: &str = " … ";
    let len = s.chars().count();
    if len <= max_chars {
        return s.to_string();
    }
    let marker_len = MARKER.chars().count();
    if max_chars <= marker_len {
        return s.chars().take(max_chars).collect();
    }

    let keep = max_chars - marker_len;
    let head = keep.div_ceil(2);
    let tail = keep - head;
    let start: String = s.chars().take(head).collect();
    let end: String = s.chars().skip(len - tail).collect();
    format!("{}{}{}", start, MARKER, end)
}
