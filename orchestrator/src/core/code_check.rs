//! Content validation for generated files.
//!
//! Errors make a file unusable (unsafe path, binary content, syntax). Warnings
//! flag likely mistakes the agent should fix but that do not block the write:
//! schema-definition slips and test-file resource anti-patterns.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::core::files::check_relative_path;
use crate::core::types::FileSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub path: String,
    pub level: FindingLevel,
    pub rule: &'static str,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeReport {
    pub findings: Vec<Finding>,
}

impl CodeReport {
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.level == FindingLevel::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.level == FindingLevel::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.findings.iter().map(ToString::to_string).collect()
    }
}

pub fn validate_files(files: &[FileSpec]) -> CodeReport {
    CodeReport {
        findings: files.iter().flat_map(validate_file).collect(),
    }
}

fn finding(path: &str, level: FindingLevel, rule: &'static str, message: String) -> Finding {
    Finding {
        path: path.to_string(),
        level,
        rule,
        message,
    }
}

pub fn validate_file(file: &FileSpec) -> Vec<Finding> {
    let path = file.path.as_str();
    let mut findings = Vec::new();

    if let Err(reason) = check_relative_path(path) {
        findings.push(finding(path, FindingLevel::Error, "path", reason));
        return findings;
    }
    if let Some(reason) = binary_content(&file.content) {
        findings.push(finding(path, FindingLevel::Error, "text", reason));
        return findings;
    }

    if let Some(detail) = syntax_error(path, &file.content) {
        findings.push(finding(path, FindingLevel::Error, "syntax", detail));
    }
    if is_schema_file(path) {
        findings.extend(
            schema_warnings(&file.content)
                .into_iter()
                .map(|msg| finding(path, FindingLevel::Warning, "schema", msg)),
        );
    }
    if is_test_file(path) {
        findings.extend(
            test_pattern_warnings(path, &file.content)
                .into_iter()
                .map(|msg| finding(path, FindingLevel::Warning, "test_pattern", msg)),
        );
    }
    findings
}

fn binary_content(content: &str) -> Option<String> {
    let suspicious = content
        .chars()
        .filter(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\u{0c}'))
        .count();
    if content.contains('\0') {
        Some("content contains NUL bytes".to_string())
    } else if suspicious > 0 {
        Some(format!("content contains {suspicious} control characters"))
    } else {
        None
    }
}

fn extension(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    CLike,
    Js,
    Rust,
    Python,
    Css,
}

fn syntax_error(path: &str, content: &str) -> Option<String> {
    match extension(path).as_str() {
        "json" => serde_json::from_str::<serde_json::Value>(content)
            .err()
            .map(|err| format!("invalid JSON: {err}")),
        "toml" => toml::from_str::<toml::Table>(content)
            .err()
            .map(|err| format!("invalid TOML: {}", err.to_string().trim())),
        "yaml" | "yml" => yaml_error(content),
        // JSX text nodes carry bare apostrophes, so .jsx/.tsx are not balance-checked.
        "js" | "ts" | "mjs" | "cjs" => delimiter_error(content, Lang::Js),
        "java" | "c" | "h" | "cpp" | "hpp" | "cs" | "go" | "kt" | "swift" | "scss" => {
            delimiter_error(content, Lang::CLike)
        }
        "rs" => delimiter_error(content, Lang::Rust),
        "py" => delimiter_error(content, Lang::Python),
        "css" => delimiter_error(content, Lang::Css),
        _ => None,
    }
}

fn yaml_error(content: &str) -> Option<String> {
    for document in serde_yaml::Deserializer::from_str(content) {
        if let Err(err) = serde_yaml::Value::deserialize(document) {
            return Some(format!("invalid YAML: {err}"));
        }
    }
    None
}

/// String- and comment-aware bracket balance check.
fn delimiter_error(content: &str, lang: Lang) -> Option<String> {
    let chars: Vec<char> = content.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut idx = 0usize;

    let line_comment = |i: usize| -> bool {
        match lang {
            Lang::Python => chars[i] == '#',
            Lang::CLike | Lang::Js | Lang::Rust => {
                chars[i] == '/' && chars.get(i + 1) == Some(&'/')
            }
            Lang::Css => false,
        }
    };

    while idx < chars.len() {
        let ch = chars[idx];
        if ch == '\n' {
            line += 1;
            idx += 1;
            continue;
        }
        if line_comment(idx) {
            while idx < chars.len() && chars[idx] != '\n' {
                idx += 1;
            }
            continue;
        }
        if lang != Lang::Python && ch == '/' && chars.get(idx + 1) == Some(&'*') {
            let start_line = line;
            idx += 2;
            loop {
                if idx + 1 >= chars.len() {
                    return Some(format!("unterminated block comment starting at line {start_line}"));
                }
                if chars[idx] == '\n' {
                    line += 1;
                }
                if chars[idx] == '*' && chars[idx + 1] == '/' {
                    idx += 2;
                    break;
                }
                idx += 1;
            }
            continue;
        }
        if lang == Lang::Js && ch == '/' && regex_allowed(&chars, idx) {
            if let Some(next) = skip_regex(&chars, idx) {
                idx = next;
                continue;
            }
        }
        if let Some(quote) = string_start(&chars, idx, lang) {
            let start_line = line;
            match skip_string(&chars, idx, quote, &mut line) {
                Some(next) => {
                    idx = next;
                    continue;
                }
                None => {
                    return Some(format!("unterminated string starting at line {start_line}"));
                }
            }
        }
        match ch {
            '(' | '[' | '{' => stack.push((ch, line)),
            ')' | ']' | '}' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Some(format!(
                            "`{ch}` at line {line} does not match `{open}` opened at line {open_line}"
                        ));
                    }
                    None => return Some(format!("unbalanced `{ch}` at line {line}")),
                }
            }
            _ => {}
        }
        idx += 1;
    }

    stack
        .last()
        .map(|(open, open_line)| format!("unclosed `{open}` opened at line {open_line}"))
}

/// Quote sequence opening a string literal at `idx`, if any.
fn string_start(chars: &[char], idx: usize, lang: Lang) -> Option<&'static str> {
    let ch = chars[idx];
    let triple = |q: char| chars.get(idx + 1) == Some(&q) && chars.get(idx + 2) == Some(&q);
    match (lang, ch) {
        (Lang::Python, '"') if triple('"') => Some("\"\"\""),
        (Lang::Python, '\'') if triple('\'') => Some("'''"),
        (_, '"') => Some("\""),
        (Lang::CLike | Lang::Js, '`') => Some("`"),
        (Lang::Rust, '\'') => {
            // Char literals only; lifetimes and labels have no closing quote nearby.
            let is_char = match chars.get(idx + 1) {
                Some('\\') => true,
                Some(_) => chars.get(idx + 2) == Some(&'\''),
                None => false,
            };
            is_char.then_some("'")
        }
        (Lang::CLike | Lang::Js | Lang::Python | Lang::Css, '\'') => Some("'"),
        _ => None,
    }
}

const REGEX_KEYWORDS: &[&str] = &[
    "return", "typeof", "case", "in", "of", "delete", "void", "throw", "new", "yield", "await",
];

/// Whether a `/` at `idx` opens a regex literal rather than dividing.
fn regex_allowed(chars: &[char], idx: usize) -> bool {
    let mut end = idx;
    while end > 0 && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    let Some(&prev) = end.checked_sub(1).and_then(|i| chars.get(i)) else {
        return true;
    };
    if "(,=:[!&|?{};+-*%<>~^".contains(prev) {
        return true;
    }
    let mut start = end;
    while start > 0 && (chars[start - 1].is_alphanumeric() || chars[start - 1] == '_') {
        start -= 1;
    }
    let word: String = chars[start..end].iter().collect();
    REGEX_KEYWORDS.contains(&word.as_str())
}

/// Index just past a regex literal's closing `/`, or `None` when the line ends first.
fn skip_regex(chars: &[char], start: usize) -> Option<usize> {
    let mut idx = start + 1;
    let mut in_class = false;
    while idx < chars.len() {
        match chars[idx] {
            '\\' => idx += 1,
            '\n' => return None,
            '[' => in_class = true,
            ']' => in_class = false,
            '/' if !in_class => return Some(idx + 1),
            _ => {}
        }
        idx += 1;
    }
    None
}

/// Index just past the closing quote, or `None` when the string never closes.
fn skip_string(chars: &[char], start: usize, quote: &str, line: &mut usize) -> Option<usize> {
    let quote: Vec<char> = quote.chars().collect();
    let multiline = quote.len() == 3 || quote[0] == '`';
    let mut idx = start + quote.len();
    while idx < chars.len() {
        let ch = chars[idx];
        if ch == '\\' {
            if chars.get(idx + 1) == Some(&'\n') {
                *line += 1;
            }
            idx += 2;
            continue;
        }
        if ch == '\n' {
            if !multiline {
                return None;
            }
            *line += 1;
        }
        if chars[idx..].starts_with(&quote) {
            return Some(idx + quote.len());
        }
        idx += 1;
    }
    None
}

static SCHEMA_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^|/)(schema|models?|migrations?|database|db|init)[^/]*\.(sql|js|ts|py)$|(^|/)migrations/|\.sql$")
        .expect("schema name regex")
});

pub fn is_schema_file(path: &str) -> bool {
    SCHEMA_NAME_RE.is_match(path)
}

static CREATE_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)create\s+table\s+(?:if\s+not\s+exists\s+)?[`"\[]?(\w+)[`"\]]?\s*\("#)
        .expect("create table regex")
});
static COLUMN_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*[`\x22]?(\w+)[`\x22]?\s+(integer|int|bigint|smallint|serial|bigserial|text|varchar|char|real|float|double|numeric|decimal|boolean|bool|date|datetime|timestamp|timestamptz|blob|uuid|json|jsonb)\b")
        .expect("column start regex")
});
static FOREIGN_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bforeign\s+key\s*([^\s(])").expect("foreign key regex"));
static REFERENCES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\breferences\b\s*(?:[(,)]|$)").expect("references regex"));
static CHECK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcheck\b\s*([^\s(])").expect("check regex"));

const RESERVED_COLUMNS: &[&str] = &[
    "user", "order", "group", "select", "table", "from", "where", "limit", "offset", "desc",
    "asc", "column", "values", "default", "references", "transaction", "end", "to", "case",
    "when",
];
const CONSTRAINT_WORDS: &[&str] = &[
    "primary", "foreign", "unique", "constraint", "check", "key", "index",
];

fn schema_warnings(content: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    for caps in CREATE_TABLE_RE.captures_iter(content) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let table = name.as_str();
        let body_start = whole.end();
        let Some(body) = paren_body(&content[body_start..]) else {
            warnings.push(format!("table `{table}`: definition is never closed"));
            continue;
        };
        for definition in split_top_level(body) {
            let trimmed = definition.trim();
            let first = trimmed
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase();
            let quoted = trimmed.starts_with(['`', '"', '[']);
            let is_constraint = CONSTRAINT_WORDS.contains(&first.as_str());
            if !quoted && !is_constraint && RESERVED_COLUMNS.contains(&first.as_str()) {
                warnings.push(format!(
                    "table `{table}`: column `{first}` is a reserved word; quote or rename it"
                ));
            }
            for extra in trimmed.lines().skip(1) {
                if let Some(column) = COLUMN_START_RE.captures(extra).and_then(|c| c.get(1)) {
                    warnings.push(format!(
                        "table `{table}`: missing comma before column `{}`",
                        column.as_str()
                    ));
                }
            }
            if FOREIGN_KEY_RE.is_match(trimmed) {
                warnings.push(format!(
                    "table `{table}`: FOREIGN KEY must be followed by a column list"
                ));
            }
            if REFERENCES_RE.is_match(trimmed) {
                warnings.push(format!("table `{table}`: REFERENCES is missing a target table"));
            }
            if CHECK_RE.is_match(trimmed) {
                warnings.push(format!(
                    "table `{table}`: CHECK must be followed by a parenthesized expression"
                ));
            }
        }
    }
    warnings
}

/// Text up to the `)` that closes an already-consumed `(`.
fn paren_body(text: &str) -> Option<&str> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    for (idx, ch) in text.char_indices() {
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => quote = Some(ch),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..idx]);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut quote: Option<char> = None;
    for (idx, ch) in body.char_indices() {
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => quote = Some(ch),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&body[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

static TEST_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|/)(test_[^/]+\.py|[^/]+_test\.(py|go)|[^/]+\.(test|spec)\.(js|jsx|ts|tsx|mjs|cjs))$|(^|/)(tests?|__tests__)/[^/]+\.(js|jsx|ts|tsx|mjs|cjs|py|rs|go)$")
        .expect("test name regex")
});

/// Recognized test file naming conventions.
pub fn is_test_file(path: &str) -> bool {
    TEST_NAME_RE.is_match(path)
}

static FIRST_TEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:(?:test|it|describe)(?:\.\w+)?\s*\(|def\s+test_|async\s+def\s+test_|func\s+Test\w*\(|class\s+Test\w*|#\[test\])")
        .expect("first test regex")
});
static ACQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"new\s+(?:sqlite3\.)?Database\s*\(|\bDatabase\s*\(|sqlite3\.connect\s*\(|createConnection\s*\(|createPool\s*\(|new\s+(?:Pool|Client|MongoClient|Sequelize|PrismaClient)\s*\(|mongoose\.connect\s*\(|psycopg2?\.connect\s*\(|create_engine\s*\(|sql\.Open\s*\(")
        .expect("acquire regex")
});
static RELEASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(close|end|destroy|disconnect|\$disconnect|quit|release|dispose)\s*\(")
        .expect("release regex")
});

fn test_pattern_warnings(path: &str, content: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    let acquisitions: Vec<usize> = ACQUIRE_RE.find_iter(content).map(|m| m.start()).collect();
    if acquisitions.is_empty() {
        return warnings;
    }
    let first_test = FIRST_TEST_RE
        .find(content)
        .map_or(content.len(), |m| m.start());
    let python = extension(path) == "py";
    let file_scope = acquisitions.iter().any(|&pos| {
        pos < first_test
            && if python {
                at_line_start(content, pos)
            } else {
                brace_depth(&content[..pos]) == 0
            }
    });
    if file_scope {
        warnings.push(
            "persistence handle is opened at file scope before the first test; open it in a setup hook"
                .to_string(),
        );
    }
    if !RELEASE_RE.is_match(content) {
        warnings.push(
            "persistence handle is never released; close it in a teardown hook".to_string(),
        );
    }
    warnings
}

fn at_line_start(content: &str, pos: usize) -> bool {
    let line_start = content[..pos].rfind('\n').map_or(0, |idx| idx + 1);
    let prefix = &content[line_start..pos];
    !prefix.starts_with([' ', '\t'])
}

fn brace_depth(prefix: &str) -> i64 {
    let mut depth = 0i64;
    for ch in prefix.chars() {
        match ch {
            '{' | '(' => depth += 1,
            '}' | ')' => depth -= 1,
            _ => {}
        }
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors(path: &str, content: &str) -> Vec<String> {
        validate_file(&FileSpec::new(path, content))
            .into_iter()
            .filter(|f| f.level == FindingLevel::Error)
            .map(|f| f.message)
            .collect()
    }

    fn warnings(path: &str, content: &str) -> Vec<String> {
        validate_file(&FileSpec::new(path, content))
            .into_iter()
            .filter(|f| f.level == FindingLevel::Warning)
            .map(|f| f.message)
            .collect()
    }

    #[test]
    fn structured_formats_are_parsed() {
        assert!(errors("package.json", "{\"name\": }")[0].starts_with("invalid JSON"));
        assert!(errors("Cargo.toml", "[package\nname = 1")[0].starts_with("invalid TOML"));
        assert!(errors("ci.yml", "a: [1, 2")[0].starts_with("invalid YAML"));
        assert!(errors("ci.yml", "a: 1\n---\nb: 2\n").is_empty());
        assert!(errors("package.json", "{\"name\": \"x\"}").is_empty());
    }

    #[test]
    fn delimiter_balance_ignores_strings_and_comments() {
        let ok = "function f() {\n  const s = \"}\"; // }\n  /* { */ return `${s}`;\n}\n";
        assert!(errors("src/a.js", ok).is_empty());
        let broken = "function f() {\n  return [1, 2;\n}\n";
        let errs = errors("src/a.js", broken);
        assert_eq!(errs, vec!["`}` at line 3 does not match `[` opened at line 2"]);
        assert_eq!(errors("a.py", "def f(:\n    pass\n"), vec!["unclosed `(` opened at line 1"]);
        assert!(errors("a.py", "s = '''multi\n(line'''\n").is_empty());
        assert!(errors("lib.rs", "fn f<'a>(x: &'a str) -> char { '{' }\n").is_empty());
    }

    #[test]
    fn js_regex_literals_are_not_strings() {
        let quotes = "const s = x;\nconst t = s.replace(/'/g, \"\");\n";
        assert!(errors("src/a.js", quotes).is_empty());
        let classes = "function f(s) {\n  return /[/\"(]+/.test(s) && s.split(/\\//);\n}\n";
        assert!(errors("src/util.ts", classes).is_empty());
        let division = "const half = (a + b) / 2;\nconst q = total / count / 'x'.length;\n";
        assert!(errors("src/a.js", division).is_empty());
        let unclosed = "const s = x.replace(/a/g, 'b);\n";
        assert_eq!(errors("src/a.js", unclosed), vec!["unterminated string starting at line 1"]);
    }

    #[test]
    fn unsafe_paths_and_binary_content_are_errors() {
        assert_eq!(errors("../x.js", "")[0], "path `../x.js` escapes the workspace");
        assert_eq!(errors("a.txt", "a\0b"), vec!["content contains NUL bytes"]);
    }

    #[test]
    fn schema_heuristics_warn() {
        let sql = "CREATE TABLE orders (\n  id INTEGER PRIMARY KEY,\n  user TEXT NOT NULL\n  total REAL,\n  FOREIGN KEY user REFERENCES users(id),\n  CHECK total > 0\n);\n";
        let warns = warnings("db/schema.sql", sql);
        assert!(warns.iter().any(|w| w.contains("column `user` is a reserved word")), "{warns:?}");
        assert!(warns.iter().any(|w| w.contains("missing comma before column `total`")), "{warns:?}");
        assert!(warns.iter().any(|w| w.contains("FOREIGN KEY")), "{warns:?}");
        assert!(warns.iter().any(|w| w.contains("CHECK")), "{warns:?}");

        let clean = "CREATE TABLE users (\n  id INTEGER PRIMARY KEY,\n  \"user\" TEXT,\n  team_id INTEGER REFERENCES teams(id)\n);\n";
        assert!(warnings("schema.sql", clean).is_empty());
    }

    #[test]
    fn test_files_flag_file_scope_handles() {
        let bad = "const Database = require('better-sqlite3');\nconst db = new Database(':memory:');\n\ntest('works', () => {\n  expect(db).toBeTruthy();\n});\n";
        let warns = warnings("tests/db.test.js", bad);
        assert_eq!(warns.len(), 2, "{warns:?}");

        let good = "let db;\nbeforeEach(() => { db = new Database(':memory:'); });\nafterEach(() => db.close());\ntest('works', () => {});\n";
        assert!(warnings("tests/db.test.js", good).is_empty());

        let py = "import sqlite3\nconn = sqlite3.connect(':memory:')\n\ndef test_x():\n    assert conn\n";
        assert_eq!(warnings("tests/test_db.py", py).len(), 2);
    }

    #[test]
    fn test_file_names() {
        assert!(is_test_file("tests/test_api.py"));
        assert!(is_test_file("src/app.test.ts"));
        assert!(is_test_file("__tests__/app.js"));
        assert!(is_test_file("pkg/handler_test.go"));
        assert!(!is_test_file("src/app.js"));
        assert!(!is_test_file("tests/fixtures.json"));
    }
}
