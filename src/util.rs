//! Small string helpers shared by the broker and the orchestrator.

/// First `limit` characters of `text`, never splitting a code point.
pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// Abbreviated credential for log lines.
pub(crate) fn short_key(key: &str) -> String {
    const VISIBLE: usize = 20;
    if key.chars().count() > VISIBLE {
        format!("{}...", truncate_chars(key, VISIBLE))
    } else {
        key.to_string()
    }
}
