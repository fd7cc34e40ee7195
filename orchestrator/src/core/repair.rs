//! Ordered text repairs for almost-JSON agent output.
//!
//! Each [`RepairRule`] is a named, independently testable rewrite. The targeted
//! rules run on every candidate region; the aggressive rules only run in the
//! last-resort pass over the outermost bracket span.

use std::sync::LazyLock;

use regex::Regex;

/// A single named rewrite.
pub struct RepairRule {
    pub name: &'static str,
    pub applies: fn(&str) -> bool,
    pub rewrite: fn(&str) -> String,
}

/// Repairs that are safe to try on any candidate.
pub const TARGETED_RULES: &[RepairRule] = &[
    RepairRule {
        name: "invalid_escapes",
        applies: has_invalid_escapes,
        rewrite: fix_invalid_escapes,
    },
    RepairRule {
        name: "template_interpolation",
        applies: has_template_interpolation,
        rewrite: neutralize_template_interpolation,
    },
    RepairRule {
        name: "markup_artifacts",
        applies: has_markup_artifacts,
        rewrite: strip_markup_artifacts,
    },
    RepairRule {
        name: "unquoted_keys",
        applies: has_unquoted_keys,
        rewrite: quote_unquoted_keys,
    },
    RepairRule {
        name: "trailing_commas",
        applies: has_trailing_commas,
        rewrite: strip_trailing_commas,
    },
];

/// Last-resort repairs; these may change meaning and only run when nothing else parsed.
pub const AGGRESSIVE_RULES: &[RepairRule] = &[
    RepairRule {
        name: "smart_quotes",
        applies: has_smart_quotes,
        rewrite: normalize_smart_quotes,
    },
    RepairRule {
        name: "line_comments",
        applies: has_comments,
        rewrite: strip_comments,
    },
    RepairRule {
        name: "single_quoted_strings",
        applies: has_single_quoted_strings,
        rewrite: convert_single_quoted_strings,
    },
    RepairRule {
        name: "python_literals",
        applies: has_python_literals,
        rewrite: convert_python_literals,
    },
    RepairRule {
        name: "close_truncated",
        applies: is_unclosed,
        rewrite: close_truncated,
    },
];

/// Apply `rules` in order, returning the rewritten text and the names that fired.
pub fn apply_rules(input: &str, rules: &[RepairRule]) -> (String, Vec<&'static str>) {
    let mut text = input.to_string();
    let mut fired = Vec::new();
    for rule in rules {
        if (rule.applies)(&text) {
            text = (rule.rewrite)(&text);
            fired.push(rule.name);
        }
    }
    (text, fired)
}

pub fn repair_targeted(input: &str) -> String {
    apply_rules(input, TARGETED_RULES).0
}

/// Aggressive rules first, so the targeted rules see normalized quotes and closers.
pub fn repair_aggressive(input: &str) -> String {
    let (text, _) = apply_rules(input, AGGRESSIVE_RULES);
    repair_targeted(&text)
}

/// Split `input` into alternating code and double-quoted string segments.
///
/// String segments keep their quotes. An unterminated string runs to the end.
fn segments(input: &str) -> Vec<(bool, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in input.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                out.push((true, &input[start..=idx]));
                start = idx + 1;
                in_string = false;
            }
        } else if ch == '"' {
            if start < idx {
                out.push((false, &input[start..idx]));
            }
            start = idx;
            in_string = true;
        }
    }
    if start < input.len() {
        out.push((in_string, &input[start..]));
    }
    out
}

/// Rewrite only the parts of `input` outside double-quoted strings.
fn map_outside_strings(input: &str, f: impl Fn(&str) -> String) -> String {
    segments(input)
        .into_iter()
        .map(|(is_string, text)| {
            if is_string {
                text.to_string()
            } else {
                f(text)
            }
        })
        .collect()
}

fn any_outside_strings(input: &str, f: impl Fn(&str) -> bool) -> bool {
    segments(input)
        .into_iter()
        .any(|(is_string, text)| !is_string && f(text))
}

const VALID_ESCAPES: &[char] = &['"', '\\', '/', 'b', 'f', 'n', 'r', 't'];

fn is_valid_escape(rest: &str) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        Some(ch) if VALID_ESCAPES.contains(&ch) => true,
        Some('u') => {
            let hex: String = chars.take(4).collect();
            hex.len() == 4 && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        _ => false,
    }
}

fn has_invalid_escapes(input: &str) -> bool {
    segments(input).into_iter().any(|(is_string, text)| {
        is_string
            && text
                .match_indices('\\')
                .any(|(idx, _)| !is_valid_escape(&text[idx + 1..]))
    })
}

fn fix_invalid_escapes(input: &str) -> String {
    segments(input)
        .into_iter()
        .map(|(is_string, text)| {
            if !is_string {
                return text.to_string();
            }
            let mut out = String::with_capacity(text.len());
            let mut chars = text.char_indices();
            while let Some((idx, ch)) = chars.next() {
                if ch != '\\' {
                    out.push(ch);
                    continue;
                }
                if is_valid_escape(&text[idx + 1..]) {
                    out.push('\\');
                    if let Some((_, next)) = chars.next() {
                        out.push(next);
                    }
                } else if text[idx + 1..].starts_with('u') {
                    // `\u` without four hex digits: keep the text literally.
                    out.push_str("\\\\");
                }
                // Any other illegal escape drops the backslash.
            }
            out
        })
        .collect()
}

fn has_template_interpolation(input: &str) -> bool {
    input.contains("${")
}

/// Escape bare double quotes inside `${...}` so they stop terminating the host string.
fn neutralize_template_interpolation(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find("${") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let mut depth = 0usize;
        let mut end = tail.len();
        for (idx, ch) in tail.char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        end = idx + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        let span = &tail[..end];
        let mut prev = '\0';
        for ch in span.chars() {
            if ch == '"' && prev != '\\' {
                out.push_str("\\\"");
            } else {
                out.push(ch);
            }
            prev = ch;
        }
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

static MARKUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)```[a-z0-9_-]*|<br\s*/?>|<!--.*?-->|\*\*").expect("markup regex")
});

fn has_markup_artifacts(input: &str) -> bool {
    any_outside_strings(input, |text| MARKUP_RE.is_match(text))
}

fn strip_markup_artifacts(input: &str) -> String {
    map_outside_strings(input, |text| MARKUP_RE.replace_all(text, "").into_owned())
}

static UNQUOTED_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([{,]\s*)([A-Za-z_$][A-Za-z0-9_$-]*)(\s*:)").expect("unquoted key regex")
});

fn has_unquoted_keys(input: &str) -> bool {
    any_outside_strings(input, |text| UNQUOTED_KEY_RE.is_match(text))
}

fn quote_unquoted_keys(input: &str) -> String {
    map_outside_strings(input, |text| {
        UNQUOTED_KEY_RE
            .replace_all(text, |caps: &regex::Captures<'_>| {
                format!("{}\"{}\"{}", &caps[1], &caps[2], &caps[3])
            })
            .into_owned()
    })
}

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("trailing comma regex"));

fn has_trailing_commas(input: &str) -> bool {
    any_outside_strings(input, |text| TRAILING_COMMA_RE.is_match(text))
}

fn strip_trailing_commas(input: &str) -> String {
    map_outside_strings(input, |text| {
        TRAILING_COMMA_RE.replace_all(text, "$1").into_owned()
    })
}

const SMART_QUOTES: &[(char, char)] = &[
    ('\u{201C}', '"'),
    ('\u{201D}', '"'),
    ('\u{201E}', '"'),
    ('\u{2018}', '\''),
    ('\u{2019}', '\''),
];

fn has_smart_quotes(input: &str) -> bool {
    input.chars().any(|c| SMART_QUOTES.iter().any(|(q, _)| *q == c))
}

fn normalize_smart_quotes(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            SMART_QUOTES
                .iter()
                .find(|(q, _)| *q == c)
                .map_or(c, |(_, plain)| *plain)
        })
        .collect()
}

static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)//[^\n]*|/\*.*?\*/").expect("comment regex"));

fn has_comments(input: &str) -> bool {
    any_outside_strings(input, |text| COMMENT_RE.is_match(text))
}

fn strip_comments(input: &str) -> String {
    map_outside_strings(input, |text| COMMENT_RE.replace_all(text, "").into_owned())
}

fn has_single_quoted_strings(input: &str) -> bool {
    any_outside_strings(input, |text| text.contains('\''))
}

/// Convert `'text'` literals outside double-quoted strings into JSON strings.
fn convert_single_quoted_strings(input: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        Double,
        Single,
    }
    let mut out = String::with_capacity(input.len());
    let mut state = State::Code;
    let mut escaped = false;
    for ch in input.chars() {
        match state {
            State::Code => match ch {
                '"' => {
                    state = State::Double;
                    out.push(ch);
                }
                '\'' => {
                    state = State::Single;
                    out.push('"');
                }
                _ => out.push(ch),
            },
            State::Double => {
                out.push(ch);
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    state = State::Code;
                }
            }
            State::Single => {
                if escaped {
                    if ch != '\'' {
                        out.push('\\');
                    }
                    out.push(ch);
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '\'' {
                    out.push('"');
                    state = State::Code;
                } else if ch == '"' {
                    out.push_str("\\\"");
                } else {
                    out.push(ch);
                }
            }
        }
    }
    if state == State::Single {
        out.push('"');
    }
    out
}

static PYTHON_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(True|False|None)\b").expect("python literal regex"));

fn has_python_literals(input: &str) -> bool {
    any_outside_strings(input, |text| PYTHON_LITERAL_RE.is_match(text))
}

fn convert_python_literals(input: &str) -> String {
    map_outside_strings(input, |text| {
        PYTHON_LITERAL_RE
            .replace_all(text, |caps: &regex::Captures<'_>| {
                match &caps[1] {
                    "True" => "true",
                    "False" => "false",
                    _ => "null",
                }
                .to_string()
            })
            .into_owned()
    })
}

/// Unclosed bracket stack and whether the text ends inside a string.
fn open_state(input: &str) -> (Vec<char>, bool) {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in input.chars() {
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
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    (stack, in_string)
}

fn is_unclosed(input: &str) -> bool {
    let (stack, in_string) = open_state(input);
    in_string || !stack.is_empty()
}

/// Close an open string, drop a dangling separator, then append the missing closers.
fn close_truncated(input: &str) -> String {
    let (stack, in_string) = open_state(input);
    let mut out = input.to_string();
    if in_string {
        if out.ends_with('\\') {
            out.pop();
        }
        out.push('"');
    }
    loop {
        let trimmed = out.trim_end();
        if trimmed.ends_with(',') || trimmed.ends_with(':') {
            let cut = trimmed.len() - 1;
            out.truncate(cut);
        } else {
            let len = trimmed.len();
            out.truncate(len);
            break;
        }
    }
    // A key with no value left after the cut: `{"a": 1, "b"` -> drop `"b"`.
    if let Some(stripped) = strip_dangling_key(&out, stack.last().copied()) {
        out = stripped;
    }
    out.extend(stack.iter().rev());
    out
}

fn strip_dangling_key(text: &str, innermost: Option<char>) -> Option<String> {
    if innermost != Some('}') || !text.ends_with('"') {
        return None;
    }
    let body = &text[..text.len() - 1];
    let open = body.rfind('"')?;
    let before = body[..open].trim_end();
    if before.ends_with(',') {
        Some(before[..before.len() - 1].to_string())
    } else if before.ends_with('{') {
        Some(before.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parses(text: &str) -> bool {
        serde_json::from_str::<serde_json::Value>(text).is_ok()
    }

    #[test]
    fn invalid_escapes_are_dropped_inside_strings() {
        let input = r#"{"msg": "it\'s \$5", "ok": "a\nb"}"#;
        assert!(has_invalid_escapes(input));
        let fixed = fix_invalid_escapes(input);
        assert_eq!(fixed, r#"{"msg": "it's $5", "ok": "a\nb"}"#);
        assert!(parses(&fixed));
    }

    #[test]
    fn template_interpolation_quotes_are_escaped() {
        let input = r#"{"code": "const s = `${user["name"]}`;"}"#;
        assert!(!parses(input));
        let fixed = neutralize_template_interpolation(input);
        assert!(parses(&fixed), "{fixed}");
    }

    #[test]
    fn markup_outside_strings_is_removed() {
        let input = "{\"a\": 1,<br> **\"b\": \"<br> kept\"}";
        let fixed = strip_markup_artifacts(input);
        assert_eq!(fixed, "{\"a\": 1, \"b\": \"<br> kept\"}");
    }

    #[test]
    fn unquoted_keys_are_quoted_but_string_content_is_not() {
        let input = r#"{id: "T-1", files_to_create: ["a.txt"], "note": "x, y: z"}"#;
        let fixed = quote_unquoted_keys(input);
        assert_eq!(
            fixed,
            r#"{"id": "T-1", "files_to_create": ["a.txt"], "note": "x, y: z"}"#
        );
    }

    #[test]
    fn trailing_commas_are_removed() {
        let fixed = strip_trailing_commas("{\"a\": [1, 2,], \"b\": \",]\",}");
        assert_eq!(fixed, "{\"a\": [1, 2], \"b\": \",]\"}");
    }

    #[test]
    fn single_quotes_and_python_literals_convert() {
        let (fixed, fired) = apply_rules("{'a': 'say \"hi\"', 'b': True}", AGGRESSIVE_RULES);
        assert!(fired.contains(&"single_quoted_strings"));
        assert!(fired.contains(&"python_literals"));
        let value: serde_json::Value = serde_json::from_str(&fixed).expect("parse");
        assert_eq!(value["a"], "say \"hi\"");
        assert_eq!(value["b"], true);
    }

    #[test]
    fn comments_outside_strings_are_stripped() {
        let fixed = strip_comments("{\"url\": \"http://x\", // note\n \"b\": 2 /* c */}");
        assert!(parses(&fixed), "{fixed}");
        assert!(fixed.contains("http://x"));
    }

    #[test]
    fn truncated_tail_is_closed() {
        let fixed = close_truncated(r#"{"tasks": [{"id": "T-1", "desc": "add fi"#);
        assert!(parses(&fixed), "{fixed}");
        let fixed = close_truncated(r#"{"tasks": [1, 2,"#);
        assert!(parses(&fixed), "{fixed}");
        let fixed = close_truncated(r#"{"a": 1, "b""#);
        assert!(parses(&fixed), "{fixed}");
    }

    #[test]
    fn rules_only_fire_when_applicable() {
        let (text, fired) = apply_rules(r#"{"a": 1}"#, TARGETED_RULES);
        assert_eq!(text, r#"{"a": 1}"#);
        assert!(fired.is_empty());
    }
}
