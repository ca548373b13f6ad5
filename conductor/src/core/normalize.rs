//! Failure-message normalization for the error window.
//!
//! Two failures are "the same" when their normalized forms are equal, so
//! normalization strips the noise that varies between otherwise identical
//! runs: ANSI escapes and whitespace layout. Long outputs keep their tail,
//! where build tools put the actual error summary.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum characters kept in a normalized message.
pub const MAX_MESSAGE_CHARS: usize = 240;

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi regex should be valid"));

/// Normalize a raw failure output into a stable, bounded message.
pub fn normalize_error(raw: &str) -> String {
    let stripped = ANSI_RE.replace_all(raw, "");
    let collapsed: String = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    tail_chars(&collapsed, MAX_MESSAGE_CHARS)
}

fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(
            normalize_error("error:   test\n\n  failed\t badly"),
            "error: test failed badly"
        );
    }

    #[test]
    fn strips_ansi_escapes() {
        assert_eq!(
            normalize_error("\x1b[31merror\x1b[0m: red"),
            "error: red"
        );
    }

    #[test]
    fn identical_failures_normalize_identically() {
        let a = normalize_error("error: assertion failed\n  left: 1\n");
        let b = normalize_error("error: assertion  failed left: 1");
        assert_eq!(a, b);
    }

    #[test]
    fn long_output_keeps_the_tail() {
        let raw = format!("{} final error line", "noise ".repeat(100));
        let normalized = normalize_error(&raw);
        assert!(normalized.chars().count() <= MAX_MESSAGE_CHARS);
        assert!(normalized.ends_with("final error line"));
    }
}
