//! Structured-record extraction from free-form agent output.
//!
//! Agents wrap records in prose, code fences, or slightly broken JSON. The
//! extractor tries progressively more invasive strategies and returns the first
//! (or longest) JSON object/array it can recover:
//!
//! 1. the whole trimmed text;
//! 2. labelled fenced code blocks;
//! 3. balanced `{}`/`[]` regions found by a string-aware scan, each retried
//!    through the targeted repair rules, longest parse wins;
//! 4. aggressive repair over the first-opener..last-closer span.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::repair::{repair_aggressive, repair_targeted};

/// Recover a JSON object or array from `raw`, or `None` if every strategy fails.
pub fn extract_structured(raw: &str) -> Option<Value> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(value) = parse_record(text) {
        return Some(value);
    }

    if let Some(value) = longest(fenced_blocks(text).into_iter().filter_map(|body| {
        parse_record(body).map(|value| (body.len(), value))
    })) {
        return Some(value);
    }

    let candidates = candidate_regions(text);
    if let Some(value) = longest(candidates.iter().filter_map(|region| {
        parse_record(region)
            .or_else(|| parse_record(&repair_targeted(region)))
            .map(|value| (region.len(), value))
    })) {
        return Some(value);
    }

    let span = outer_span(text)?;
    parse_record(&repair_aggressive(span))
}

/// True when the output opens a bracket it never closes, i.e. the agent was cut off.
pub fn looks_truncated(raw: &str) -> bool {
    let text = raw.trim();
    let mut idx = 0;
    while idx < text.len() {
        let Some(ch) = text[idx..].chars().next() else {
            break;
        };
        if is_opener(ch) {
            match scan_region(text, idx) {
                Scan::Closed(end) => {
                    idx = end + 1;
                    continue;
                }
                Scan::Unterminated => return true,
                Scan::Mismatched => {}
            }
        }
        idx += ch.len_utf8();
    }
    false
}

fn parse_record(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

fn longest(parsed: impl Iterator<Item = (usize, Value)>) -> Option<Value> {
    let mut best: Option<(usize, Value)> = None;
    for (len, value) in parsed {
        if best.as_ref().is_none_or(|(best_len, _)| len > *best_len) {
            best = Some((len, value));
        }
    }
    best.map(|(_, value)| value)
}

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[ \t]*\r?\n(.*?)```").expect("fence regex")
});

/// Bodies of fenced code blocks, in order.
fn fenced_blocks(text: &str) -> Vec<&str> {
    FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(2).map(|body| body.as_str().trim()))
        .collect()
}

fn is_opener(ch: char) -> bool {
    ch == '{' || ch == '['
}

enum Scan {
    Closed(usize),
    Mismatched,
    Unterminated,
}

/// Find the byte index of the bracket closing the opener at `start`.
fn scan_region(text: &str, start: usize) -> Scan {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return Scan::Mismatched;
                }
                if stack.is_empty() {
                    return Scan::Closed(start + offset);
                }
            }
            _ => {}
        }
    }
    Scan::Unterminated
}

/// Every balanced region that does not sit inside an earlier balanced region.
///
/// When an opener never closes, scanning resumes just after it so nested
/// complete regions are still found.
fn candidate_regions(text: &str) -> Vec<&str> {
    let mut regions = Vec::new();
    let mut idx = 0;
    while idx < text.len() {
        let Some(ch) = text[idx..].chars().next() else {
            break;
        };
        if is_opener(ch)
            && let Scan::Closed(end) = scan_region(text, idx)
        {
            regions.push(&text[idx..=end]);
            idx = end + 1;
            continue;
        }
        idx += ch.len_utf8();
    }
    regions
}

/// From the first opener to the last closer, or to the end when nothing closes after it.
fn outer_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let end = text
        .rfind(['}', ']'])
        .filter(|end| *end > start)
        .map_or(text.len(), |end| end + 1);
    Some(&text[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prose_wrapped_record_with_unquoted_key_is_recovered() {
        let raw = "Sure! Here is the plan:\n{\"story_id\":\"S-1\",\"tasks\":[{\"id\":\"T-1\",\"title\":\"add file\",files_to_create:[\"a.txt\"]}]}\nLet me know!";
        let value = extract_structured(raw).expect("record");
        assert_eq!(value["story_id"], "S-1");
        assert_eq!(value["tasks"][0]["files_to_create"], json!(["a.txt"]));
    }

    #[test]
    fn plain_json_is_returned_as_is() {
        let value = extract_structured("  {\"a\": [1, 2]}\n").expect("record");
        assert_eq!(value, json!({"a": [1, 2]}));
    }

    #[test]
    fn fenced_block_is_preferred_over_prose() {
        let raw = "Notes {not json}\n```json\n{\"files\": []}\n```\nDone.";
        assert_eq!(extract_structured(raw), Some(json!({"files": []})));
    }

    #[test]
    fn longest_candidate_wins() {
        let raw = "first [1] then {\"tasks\": [{\"id\": \"x\"}], \"story_id\": \"S\"} end";
        let value = extract_structured(raw).expect("record");
        assert_eq!(value["story_id"], "S");
    }

    #[test]
    fn brackets_inside_strings_do_not_split_regions() {
        let raw = "result: {\"content\": \"fn main() { let v = [1, 2; }\"} ok";
        let value = extract_structured(raw).expect("record");
        assert_eq!(value["content"], "fn main() { let v = [1, 2; }");
    }

    #[test]
    fn truncated_output_is_closed_by_aggressive_pass() {
        let raw = "Here you go: {\"tasks\": [{\"id\": \"S-1-T01\", \"description\": \"write the ind";
        assert!(looks_truncated(raw));
        let value = extract_structured(raw).expect("record");
        assert_eq!(value["tasks"][0]["id"], "S-1-T01");
    }

    #[test]
    fn single_quoted_record_is_recovered_aggressively() {
        let raw = "{'story_id': 'S-2', 'tasks': []}";
        let value = extract_structured(raw).expect("record");
        assert_eq!(value, json!({"story_id": "S-2", "tasks": []}));
    }

    #[test]
    fn text_without_structure_yields_none() {
        assert_eq!(extract_structured(""), None);
        assert_eq!(extract_structured("I could not do that."), None);
        assert_eq!(extract_structured("\"just a string\""), None);
        assert!(!looks_truncated("no brackets at all"));
    }

    #[test]
    fn extracting_serialized_output_is_stable() {
        let raw = "preamble {\"a\": 1, b: [true,],} trailer";
        let first = extract_structured(raw).expect("record");
        let again = extract_structured(&first.to_string()).expect("record");
        assert_eq!(first, again);
    }
}
