//! Text helpers for generated code and display strings.

/// Strips a surrounding markdown code fence from generated code.
///
/// Handles ```` ```python ```` and bare ```` ``` ```` openers; text without a
/// fence is returned trimmed.
pub fn clean_code_block(code: &str) -> String {
    let mut code = code.trim();
    if let Some(rest) = code.strip_prefix("```python") {
        code = rest;
    } else if let Some(rest) = code.strip_prefix("```py") {
        code = rest;
    } else if let Some(rest) = code.strip_prefix("```") {
        code = rest;
    }
    if let Some(rest) = code.strip_suffix("```") {
        code = rest;
    }
    code.trim().to_string()
}

/// Truncates to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_code_block() {
        assert_eq!(clean_code_block("```python\nprint(1)\n```"), "print(1)");
        assert_eq!(clean_code_block("```\nx = 2\n```\n"), "x = 2");
        assert_eq!(clean_code_block("  y = 3  "), "y = 3");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 5), "ab");
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}
