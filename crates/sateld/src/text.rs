const LOG_MAX_CHARS: usize = 4000;

/// Longest prefix of `text` that is at most `max_len` bytes and ends on a char boundary.
pub(crate) fn utf8_safe_prefix(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    if max_len == 0 {
        return "";
    }
    let mut cut = 0usize;
    for (idx, ch) in text.char_indices() {
        let next = idx + ch.len_utf8();
        if next > max_len {
            break;
        }
        cut = next;
    }
    &text[..cut]
}

/// First `max_chars` characters of `text`.
pub(crate) fn char_prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub(crate) fn truncate_with_suffix(text: &str, max_chars: usize, suffix: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out = char_prefix(text, max_chars).to_string();
    out.push_str(suffix);
    out
}

pub(crate) fn truncate_for_log(text: &str) -> String {
    truncate_with_suffix(text, LOG_MAX_CHARS, "...(truncated)")
}
