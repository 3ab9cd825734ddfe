//! Shared utility functions for the testloom crate.

/// Extract the first balanced JSON value (`{...}` or `[...]`) from text
/// that may contain other content.
///
/// Bracket counting is string-aware: brackets inside quoted strings are
/// skipped, and escape sequences inside strings are respected, so
/// `{"a": "}"}` extracts correctly. Returns `None` when no opener exists
/// or the structure never closes (truncated output).
pub fn extract_first_json(text: &str) -> Option<&str> {
    let (start, opener) = text
        .char_indices()
        .find(|(_, ch)| *ch == '{' || *ch == '[')?;
    let closer = if opener == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_str = false;
    let mut escape = false;

    for (i, ch) in text[start..].char_indices() {
        if in_str {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }

        if ch == '"' {
            in_str = true;
        } else if ch == opener {
            depth += 1;
        } else if ch == closer {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..start + i + ch.len_utf8()]);
            }
        }
    }

    None
}

/// Truncate a string to at most `max_chars` characters, appending `...`
/// when anything was cut. Never splits a UTF-8 character.
pub fn clip_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3).max(1);
    let mut out: String = s.chars().take(keep).collect();
    out.truncate(out.trim_end().len());
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_simple_object() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(extract_first_json(text), Some(r#"{"key": "value"}"#));
    }

    #[test]
    fn test_extract_with_prefix_and_suffix() {
        let text = r#"Sure! Here you go: {"phases": []} hope that helps"#;
        assert_eq!(extract_first_json(text), Some(r#"{"phases": []}"#));
    }

    #[test]
    fn test_extract_array() {
        let text = "noise [1, 2, [3]] noise";
        assert_eq!(extract_first_json(text), Some("[1, 2, [3]]"));
    }

    #[test]
    fn test_extract_nested() {
        let text = r#"{"outer": {"inner": [1, 2]}}"#;
        assert_eq!(extract_first_json(text), Some(text));
    }

    #[test]
    fn test_extract_skips_brackets_inside_strings() {
        let text = r#"x {"a": "}{", "b": "]["} y"#;
        assert_eq!(extract_first_json(text), Some(r#"{"a": "}{", "b": "]["}"#));
    }

    #[test]
    fn test_extract_respects_escaped_quotes() {
        let text = r#"{"a": "she said \"}\" loudly"}"#;
        assert_eq!(extract_first_json(text), Some(text));
    }

    #[test]
    fn test_extract_no_json() {
        assert_eq!(extract_first_json("no json here"), None);
    }

    #[test]
    fn test_extract_truncated_returns_none() {
        assert_eq!(extract_first_json(r#"{"unclosed": "object""#), None);
    }

    #[test]
    fn test_clip_short_string_untouched() {
        assert_eq!(clip_chars("hello", 10), "hello");
    }

    #[test]
    fn test_clip_appends_ellipsis() {
        let clipped = clip_chars("abcdefghij", 8);
        assert_eq!(clipped, "abcde...");
        assert!(clipped.chars().count() <= 8);
    }

    #[test]
    fn test_clip_multibyte_safe() {
        let s = "héllo wörld élan über";
        let clipped = clip_chars(s, 10);
        assert!(clipped.ends_with("..."));
        // must be a valid prefix of the original plus the marker
        assert!(s.starts_with(clipped.trim_end_matches("...")));
    }
}
