//! JSON extraction from chat-model output.
//!
//! Models asked for a JSON object frequently wrap it in markdown fences or
//! lead-in prose. Extraction tries, in order:
//!
//! 1. a ```json fenced block
//! 2. any fenced block
//! 3. content that already starts with `{`
//! 4. the first brace-balanced object anywhere in the content
//!
//! Every candidate is validated with a real JSON parse before it is
//! returned.

use regex::Regex;

/// Extracts a JSON object from model output, or `None` when no parseable
/// object is present.
pub fn extract_json_object(content: &str) -> Option<String> {
    let trimmed = content.trim();

    if let Some(json) = extract_from_code_block(trimmed, true) {
        if serde_json::from_str::<serde_json::Value>(&json).is_ok() {
            return Some(json);
        }
    }

    if let Some(json) = extract_from_code_block(trimmed, false) {
        if serde_json::from_str::<serde_json::Value>(&json).is_ok() {
            return Some(json);
        }
    }

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            let candidate = &trimmed[..=end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Some(candidate.to_string());
            }
        }
    }

    if let Some(start) = trimmed.find('{') {
        if let Some(end) = find_matching_brace(&trimmed[start..]) {
            let candidate = &trimmed[start..=start + end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Some(candidate.to_string());
            }
        }
    }

    None
}

/// Pulls the body out of a fenced code block; `json_only` restricts the
/// match to ```json fences.
fn extract_from_code_block(content: &str, json_only: bool) -> Option<String> {
    let pattern = if json_only {
        r"```json\s*\n?([\s\S]*?)\n?```"
    } else {
        r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```"
    };
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(content)?;
    let body = caps.get(1)?.as_str().trim();

    if let Some(start) = body.find('{') {
        if let Some(end) = find_matching_brace(&body[start..]) {
            return Some(body[start..=start + end].to_string());
        }
    }
    None
}

/// Finds the index of the brace closing the object that opens the string.
///
/// Handles nested braces, string literals and escape sequences inside
/// strings.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                depth += 1;
            }
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
