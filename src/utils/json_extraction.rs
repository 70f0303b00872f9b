//! JSON extraction for LLM responses and sandbox output.
//!
//! LLM responses may wrap JSON in markdown code fences or surround it with
//! prose; generated scripts print diagnostics before their final JSON line.
//! The extraction functions try, in order:
//! 1. JSON in a ```` ```json ```` fenced block
//! 2. JSON in any fenced block
//! 3. The whole trimmed content
//! 4. The last balanced `{...}` object that parses
//!
//! # Example
//!
//! ```
//! use ml_forge::utils::json_extraction::extract_json_object;
//!
//! let response = "Here you go:\n```json\n{\"overall_assessment\": \"finalize\"}\n```";
//! let value = extract_json_object(response).unwrap();
//! assert_eq!(value["overall_assessment"], "finalize");
//! ```

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn json_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").expect("valid regex"))
}

fn any_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").expect("valid regex"))
}

/// Extracts the JSON object an LLM returned, if any.
pub fn extract_json_object(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    for re in [json_fence(), any_fence()] {
        if let Some(block) = re.captures(trimmed).and_then(|c| c.get(1)) {
            if let Some(value) = parse_object(block.as_str().trim()) {
                return Some(value);
            }
        }
    }

    if let Some(value) = parse_object(trimmed) {
        return Some(value);
    }

    extract_last_valid_json_object(trimmed)
}

/// Parses the last line of `stdout` that holds a JSON object.
///
/// Generated scripts print their structured result as the final line;
/// anything printed before it is diagnostic.
pub fn parse_last_json_line(stdout: &str) -> Option<Value> {
    stdout
        .trim()
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<Value>(line).ok().filter(Value::is_object))
}

fn parse_object(candidate: &str) -> Option<Value> {
    if !candidate.starts_with('{') {
        return None;
    }
    let end = find_matching_brace(candidate)?;
    serde_json::from_str::<Value>(&candidate[..=end])
        .ok()
        .filter(Value::is_object)
}

/// Finds the last `{` whose balanced object parses as JSON.
pub fn extract_last_valid_json_object(content: &str) -> Option<Value> {
    let positions: Vec<usize> = content
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .map(|(i, _)| i)
        .collect();

    positions
        .iter()
        .rev()
        .find_map(|&start| parse_object(&content[start..]))
}

/// Returns the index of the `}` matching the `{` at the start of `s`.
///
/// Braces inside string literals and escaped quotes are ignored.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}
