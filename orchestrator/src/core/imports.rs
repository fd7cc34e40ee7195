//! Third-party dependency discovery from source imports and package manifests.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Fold a package reference onto a comparable name.
///
/// npm scopes are kept (`@scope/pkg`), sub-paths and version specifiers are
/// dropped, case and `-`/`_` are folded.
pub fn normalize_dependency(name: &str) -> String {
    let trimmed = name.trim().trim_matches(|c| c == '"' || c == '\'');
    let base = if let Some(scoped) = trimmed.strip_prefix('@') {
        let mut parts = scoped.splitn(3, '/');
        match (parts.next(), parts.next()) {
            (Some(scope), Some(pkg)) => format!("@{scope}/{pkg}"),
            _ => trimmed.to_string(),
        }
    } else {
        trimmed
            .split(['/', '[', '=', '<', '>', '~', '!', ';', ' ', '^'])
            .next()
            .unwrap_or_default()
            .to_string()
    };
    base.to_lowercase().replace('_', "-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    JavaScript,
    Python,
}

fn source_kind(path: &str) -> Option<SourceKind> {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
    match ext.as_str() {
        "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" | "mts" | "cts" => Some(SourceKind::JavaScript),
        "py" => Some(SourceKind::Python),
        _ => None,
    }
}

static JS_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)(?:^|[^.\w])(?:import|export)\s+(?:type\s+)?(?:[\w*${}\s,]+?\s+from\s+)?['"]([^'"]+)['"]"#,
    )
    .expect("js import regex")
});
static JS_REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:require|import)\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("js require regex")
});
static PY_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*import\s+([\w.]+(?:\s+as\s+\w+)?(?:\s*,\s*[\w.]+(?:\s+as\s+\w+)?)*)")
        .expect("py import regex")
});
static PY_FROM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*from\s+([\w.]+)\s+import\s").expect("py from regex"));

const NODE_BUILTINS: &[&str] = &[
    "assert", "async_hooks", "buffer", "child_process", "cluster", "console", "constants",
    "crypto", "dgram", "diagnostics_channel", "dns", "domain", "events", "fs", "http", "http2",
    "https", "inspector", "module", "net", "os", "path", "perf_hooks", "process", "punycode",
    "querystring", "readline", "repl", "stream", "string_decoder", "sys", "test", "timers",
    "tls", "trace_events", "tty", "url", "util", "v8", "vm", "wasi", "worker_threads", "zlib",
];

const PYTHON_STDLIB: &[&str] = &[
    "__future__", "abc", "argparse", "array", "ast", "asyncio", "base64", "binascii", "bisect",
    "builtins", "calendar", "collections", "concurrent", "contextlib", "copy", "csv", "ctypes",
    "dataclasses", "datetime", "decimal", "difflib", "email", "enum", "errno", "fnmatch",
    "fractions", "functools", "gc", "getpass", "glob", "gzip", "hashlib", "heapq", "hmac",
    "html", "http", "importlib", "inspect", "io", "ipaddress", "itertools", "json", "logging",
    "math", "mimetypes", "multiprocessing", "numbers", "operator", "os", "pathlib", "pickle",
    "platform", "pprint", "queue", "random", "re", "secrets", "select", "shlex", "shutil",
    "signal", "socket", "sqlite3", "ssl", "stat", "statistics", "string", "struct",
    "subprocess", "sys", "tempfile", "textwrap", "threading", "time", "timeit", "traceback",
    "types", "typing", "unittest", "urllib", "uuid", "warnings", "weakref", "xml", "zipfile",
    "zoneinfo",
];

/// Third-party packages a source file imports, after dropping relative imports,
/// built-ins, and modules that resolve to `local_paths`.
pub fn scan_imports(path: &str, content: &str, local_paths: &BTreeSet<String>) -> Vec<String> {
    let Some(kind) = source_kind(path) else {
        return Vec::new();
    };
    let mut found = BTreeSet::new();
    match kind {
        SourceKind::JavaScript => {
            let specifiers = JS_IMPORT_RE
                .captures_iter(content)
                .chain(JS_REQUIRE_RE.captures_iter(content))
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()));
            for spec in specifiers {
                if let Some(name) = js_package(&spec, local_paths) {
                    found.insert(name);
                }
            }
        }
        SourceKind::Python => {
            let local_modules = python_local_modules(local_paths);
            let mut modules: Vec<String> = PY_FROM_RE
                .captures_iter(content)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .collect();
            for caps in PY_IMPORT_RE.captures_iter(content) {
                if let Some(list) = caps.get(1) {
                    modules.extend(
                        list.as_str()
                            .split(',')
                            .filter_map(|item| item.split_whitespace().next())
                            .map(str::to_string),
                    );
                }
            }
            for module in modules {
                if module.starts_with('.') {
                    continue;
                }
                let top = module.split('.').next().unwrap_or_default();
                if top.is_empty()
                    || PYTHON_STDLIB.contains(&top)
                    || local_modules.contains(top)
                {
                    continue;
                }
                found.insert(normalize_dependency(top));
            }
        }
    }
    found.into_iter().collect()
}

fn js_package(spec: &str, local_paths: &BTreeSet<String>) -> Option<String> {
    if spec.starts_with('.') || spec.starts_with('/') || spec.starts_with("node:") {
        return None;
    }
    if spec.starts_with("~/") || spec.starts_with("@/") {
        return None;
    }
    let name = normalize_dependency(spec);
    let root = name.split('/').next().unwrap_or_default();
    if NODE_BUILTINS.contains(&root) {
        return None;
    }
    // Bare specifiers that resolve to project files (baseUrl-style imports).
    let first_segment = spec.split('/').next().unwrap_or_default();
    let local_prefix = format!("{first_segment}/");
    if local_paths.iter().any(|path| {
        path == spec || (!first_segment.starts_with('@') && path.starts_with(&local_prefix))
    }) {
        return None;
    }
    Some(name)
}

/// Top-level module names provided by project files: `pkg/mod.py` gives `pkg`, `util.py` gives `util`.
fn python_local_modules(local_paths: &BTreeSet<String>) -> BTreeSet<String> {
    local_paths
        .iter()
        .filter(|path| path.ends_with(".py"))
        .flat_map(|path| {
            let mut names = Vec::new();
            let parts: Vec<&str> = path.split('/').collect();
            for (idx, part) in parts.iter().enumerate() {
                let name = if idx + 1 == parts.len() {
                    part.trim_end_matches(".py")
                } else {
                    part
                };
                names.push(name.to_string());
            }
            names
        })
        .collect()
}

/// Manifest file names this module understands.
pub fn is_manifest(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name == "package.json"
        || name == "Cargo.toml"
        || name == "pyproject.toml"
        || (name.starts_with("requirements") && name.ends_with(".txt"))
}

/// Normalized dependency names declared by a manifest, or `None` for non-manifests.
///
/// Unparseable manifests yield an empty set; the code validator reports the syntax error.
pub fn manifest_dependencies(path: &str, content: &str) -> Option<BTreeSet<String>> {
    if !is_manifest(path) {
        return None;
    }
    let name = path.rsplit('/').next().unwrap_or(path);
    let names: Vec<String> = match name {
        "package.json" => package_json_dependencies(content),
        "Cargo.toml" => cargo_dependencies(content),
        "pyproject.toml" => pyproject_dependencies(content),
        _ => requirements_dependencies(content),
    };
    Some(names.iter().map(|dep| normalize_dependency(dep)).collect())
}

fn package_json_dependencies(content: &str) -> Vec<String> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(content) else {
        return Vec::new();
    };
    [
        "dependencies",
        "devDependencies",
        "peerDependencies",
        "optionalDependencies",
    ]
    .iter()
    .filter_map(|key| map.get(*key).and_then(Value::as_object))
    .flat_map(|deps| deps.keys().cloned())
    .collect()
}

fn cargo_dependencies(content: &str) -> Vec<String> {
    let Ok(table) = toml::from_str::<toml::Table>(content) else {
        return Vec::new();
    };
    ["dependencies", "dev-dependencies", "build-dependencies"]
        .iter()
        .filter_map(|key| table.get(*key).and_then(toml::Value::as_table))
        .flat_map(|deps| deps.keys().cloned())
        .collect()
}

fn pyproject_dependencies(content: &str) -> Vec<String> {
    let Ok(table) = toml::from_str::<toml::Table>(content) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    if let Some(project) = table.get("project").and_then(toml::Value::as_table) {
        if let Some(deps) = project.get("dependencies").and_then(toml::Value::as_array) {
            names.extend(deps.iter().filter_map(toml::Value::as_str).map(str::to_string));
        }
        if let Some(optional) = project
            .get("optional-dependencies")
            .and_then(toml::Value::as_table)
        {
            for group in optional.values().filter_map(toml::Value::as_array) {
                names.extend(group.iter().filter_map(toml::Value::as_str).map(str::to_string));
            }
        }
    }
    let poetry = table
        .get("tool")
        .and_then(|tool| tool.get("poetry"))
        .and_then(toml::Value::as_table);
    if let Some(poetry) = poetry {
        for key in ["dependencies", "dev-dependencies"] {
            if let Some(deps) = poetry.get(key).and_then(toml::Value::as_table) {
                names.extend(deps.keys().filter(|name| *name != "python").cloned());
            }
        }
    }
    names
}

fn requirements_dependencies(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty() && !line.starts_with('-'))
        .map(str::to_string)
        .collect()
}
