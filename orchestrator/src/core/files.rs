//! Developer/verifier output normalization into [`FileSpec`]s, plus path safety.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::core::types::FileSpec;

const PATH_KEYS: &[&str] = &["path", "file_path", "filepath", "filename", "file", "name"];
const CONTENT_KEYS: &[&str] = &["content", "contents", "code", "body", "source", "text"];
const LIST_KEYS: &[&str] = &["files", "tests", "test_files", "outputs"];

/// Normalized files plus the problems found while normalizing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedFiles {
    pub files: Vec<FileSpec>,
    pub issues: Vec<String>,
}

/// Canonical form of a relative path: forward slashes, no `./`, no doubled separators.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        parts.push(part);
    }
    let mut out = parts.join("/");
    if unified.starts_with('/') {
        out.insert(0, '/');
    }
    out
}

/// Reject empty, absolute, drive-prefixed and parent-escaping paths.
pub fn check_relative_path(path: &str) -> Result<String, String> {
    let normalized = normalize_path(path);
    if normalized.is_empty() {
        return Err("path is empty".to_string());
    }
    if normalized.starts_with('/') {
        return Err(format!("path `{path}` must be relative"));
    }
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(format!("path `{path}` has a drive prefix"));
    }
    if normalized.split('/').any(|part| part == "..") {
        return Err(format!("path `{path}` escapes the workspace"));
    }
    Ok(normalized)
}

/// Accept the shapes agents actually produce:
/// `{ "files": [...] }`, `{ "files": { path: content } }`, a bare array of
/// entries, a single `{ path, content }` entry, or a bare `{ path: content }` map.
pub fn normalize_file_specs(record: &Value) -> NormalizedFiles {
    let mut collected: BTreeMap<String, String> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut issues = Vec::new();

    let mut push = |path: String, content: String, issues: &mut Vec<String>| {
        let path = normalize_path(&path);
        if collected.insert(path.clone(), content).is_some() {
            issues.push(format!("{path}: listed more than once; last entry kept"));
        } else {
            order.push(path);
        }
    };

    match record {
        Value::Array(items) => collect_entries(items, &mut push, &mut issues),
        Value::Object(map) => {
            if let Some(list) = LIST_KEYS.iter().find_map(|key| map.get(*key)) {
                match list {
                    Value::Array(items) => collect_entries(items, &mut push, &mut issues),
                    Value::Object(entries) => collect_map(entries, &mut push, &mut issues),
                    _ => issues.push("files must be an array or an object".to_string()),
                }
            } else if field(map, PATH_KEYS).is_some() {
                collect_entries(std::slice::from_ref(record), &mut push, &mut issues);
            } else if map.keys().all(|key| looks_like_path(key)) && !map.is_empty() {
                collect_map(map, &mut push, &mut issues);
            } else {
                issues.push("no files found in output".to_string());
            }
        }
        _ => issues.push("output must be a JSON object or array".to_string()),
    }

    let files = order
        .into_iter()
        .filter_map(|path| {
            collected
                .remove(&path)
                .map(|content| FileSpec { path, content })
        })
        .collect();
    NormalizedFiles { files, issues }
}

fn field<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| map.get(*key))
}

fn looks_like_path(key: &str) -> bool {
    key.contains('/') || key.contains('.')
}

fn content_text(path: &str, value: &Value) -> Result<String, String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Array(lines) if lines.iter().all(Value::is_string) => Ok(lines
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n")),
        Value::Object(_) | Value::Array(_) if path.ends_with(".json") => {
            serde_json::to_string_pretty(value)
                .map(|mut text| {
                    text.push('\n');
                    text
                })
                .map_err(|err| format!("{path}: {err}"))
        }
        _ => Err(format!("{path}: content must be text")),
    }
}

fn collect_entries(
    items: &[Value],
    push: &mut impl FnMut(String, String, &mut Vec<String>),
    issues: &mut Vec<String>,
) {
    for (idx, item) in items.iter().enumerate() {
        let Some(entry) = item.as_object() else {
            issues.push(format!("files[{idx}]: entry must be an object"));
            continue;
        };
        let Some(path) = field(entry, PATH_KEYS).and_then(Value::as_str) else {
            issues.push(format!("files[{idx}]: missing path"));
            continue;
        };
        let Some(content) = field(entry, CONTENT_KEYS) else {
            issues.push(format!("{path}: missing content"));
            continue;
        };
        match content_text(path, content) {
            Ok(text) => push(path.to_string(), text, issues),
            Err(issue) => issues.push(issue),
        }
    }
}

fn collect_map(
    entries: &Map<String, Value>,
    push: &mut impl FnMut(String, String, &mut Vec<String>),
    issues: &mut Vec<String>,
) {
    for (path, content) in entries {
        match content_text(path, content) {
            Ok(text) => push(path.clone(), text, issues),
            Err(issue) => issues.push(issue),
        }
    }
}
