//! Role behaviors the scheduler drives: planner, executor, reviewer.
//!
//! Shared here: tolerant extraction of JSON from LLM output. Models are
//! instructed to emit only JSON, but in practice wrap it in prose or
//! fences, so extraction scans for a fenced code block first, then for a
//! bracketed payload, then falls back to the trimmed text.

pub mod executor;
pub mod planner;
pub mod reviewer;

pub use executor::{Executor, ExecutorOutcome};
pub use planner::{run_planner, PlannerError};
pub use reviewer::{ReviewOutcome, Reviewer};

/// Extract a JSON **array** from model output.
pub(crate) fn extract_json_array(text: &str) -> Option<serde_json::Value> {
    if let Some(block) = fenced_block(text) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(block.trim()) {
            if value.is_array() {
                return Some(value);
            }
        }
    }
    if let Some(slice) = bracketed(text, '[', ']') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(slice) {
            return Some(value);
        }
    }
    serde_json::from_str(text.trim()).ok().filter(|v: &serde_json::Value| v.is_array())
}

/// Extract a JSON **object** from model output.
pub(crate) fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    if let Some(block) = fenced_block(text) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(block.trim()) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    if let Some(slice) = bracketed(text, '{', '}') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(slice) {
            return Some(value);
        }
    }
    serde_json::from_str(text.trim()).ok().filter(|v: &serde_json::Value| v.is_object())
}

/// The contents of the first fenced code block, if any.
///
/// An info string on the opening fence (e.g. ```` ```json ````) is skipped.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// The slice from the first `open` to the last `close`, inclusive.
fn bracketed(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

/// Truncate to at most `cap` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, cap: usize) -> &str {
    match text.char_indices().nth(cap) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Scan for "exit code N" / "exited with code N" markers with N != 0.
pub(crate) fn has_nonzero_exit(lower: &str) -> bool {
    for marker in ["exited with code ", "exit code ", "exit status "] {
        let mut rest = lower;
        while let Some(pos) = rest.find(marker) {
            let tail = &rest[pos + marker.len()..];
            let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
            if digits.parse::<i64>().map(|code| code != 0).unwrap_or(false) {
                return true;
            }
            rest = &rest[pos + marker.len()..];
        }
    }
    false
}

/// The last `cap` characters of a transcript.
pub(crate) fn tail_chars(text: &str, cap: usize) -> &str {
    let count = text.chars().count();
    if count <= cap {
        return text;
    }
    let skip = count - cap;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
