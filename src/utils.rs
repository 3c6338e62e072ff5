/// Collapse every run of whitespace into a single space and trim both ends.
///
/// Used before hashing so that re-flowed script text maps to the same clip.
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Short, char-boundary-safe preview of `s` for log lines and events.
pub fn preview(s: &str, max_chars: usize) -> String {
    let mut chars = s.char_indices();
    match chars.nth(max_chars) {
        None => s.to_string(),
        Some((end, _)) => format!("{}...", &s[..end]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_runs() {
        assert_eq!(normalize_text("  Hallo \n\t Welt.  "), "Hallo Welt.");
    }

    #[test]
    fn normalize_empty() {
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn preview_within_limit() {
        assert_eq!(preview("hello", 10), "hello");
        assert_eq!(preview("hello", 5), "hello");
    }

    #[test]
    fn preview_truncates() {
        assert_eq!(preview("hello world", 5), "hello...");
    }

    #[test]
    fn preview_multibyte_no_split() {
        assert_eq!(preview("あいう", 2), "あい...");
    }

    #[test]
    fn preview_zero() {
        assert_eq!(preview("hello", 0), "...");
    }
}
