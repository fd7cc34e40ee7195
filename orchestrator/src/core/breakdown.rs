//! Breakdown validation: alias normalization plus one declared task schema.
//!
//! Agents use many spellings for the same field. Every spelling is folded onto
//! the canonical name first, then [`TASK_RULES`] is checked in a single pass.
//! `Hard` violations reject the breakdown; `Soft` ones trigger one re-prompt
//! and otherwise ride along as warnings.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::types::{
    ConflictFlag, DependencyDeclaration, StackMetadata, Task, TaskBreakdown,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Hard,
    Soft,
}

/// One schema violation, located by a JSON-pointer-like path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub severity: Severity,
    pub location: String,
    pub message: String,
}

impl Violation {
    fn hard(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Hard,
            location: location.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// A task-level rule. `check` returns a message when the task violates it.
pub struct TaskRule {
    pub name: &'static str,
    pub severity: Severity,
    pub check: fn(&Task, &str) -> Option<String>,
}

/// The declared task schema, checked once per task.
pub const TASK_RULES: &[TaskRule] = &[
    TaskRule {
        name: "task_id_present",
        severity: Severity::Hard,
        check: check_task_id_present,
    },
    TaskRule {
        name: "description_present",
        severity: Severity::Hard,
        check: check_description_present,
    },
    TaskRule {
        name: "task_id_format",
        severity: Severity::Soft,
        check: check_task_id_format,
    },
    TaskRule {
        name: "files_or_command",
        severity: Severity::Soft,
        check: check_files_or_command,
    },
];

fn check_task_id_present(task: &Task, _story_id: &str) -> Option<String> {
    task.task_id
        .trim()
        .is_empty()
        .then(|| "missing task_id".to_string())
}

fn check_description_present(task: &Task, _story_id: &str) -> Option<String> {
    task.description
        .trim()
        .is_empty()
        .then(|| "missing description".to_string())
}

fn check_task_id_format(task: &Task, story_id: &str) -> Option<String> {
    if task.task_id.trim().is_empty() || task_id_matches(&task.task_id, story_id) {
        return None;
    }
    Some(format!(
        "task_id `{}` must look like `{}`",
        task.task_id,
        expected_task_id(story_id, 1)
    ))
}

fn check_files_or_command(task: &Task, _story_id: &str) -> Option<String> {
    if task.files().next().is_some() || task.has_command() {
        None
    } else {
        Some("task must list files_to_create, files_to_modify, or a command".to_string())
    }
}

/// `<story_id>-T<NN>` with at least two digits.
pub fn task_id_matches(task_id: &str, story_id: &str) -> bool {
    let pattern = format!(r"^{}-T\d{{2,}}$", regex::escape(story_id));
    Regex::new(&pattern).is_ok_and(|re| re.is_match(task_id.trim()))
}

pub fn expected_task_id(story_id: &str, seq: usize) -> String {
    format!("{story_id}-T{seq:02}")
}

/// Outcome of validating one architect record.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakdownCheck {
    /// `None` only when the record was not even an object with a task list.
    pub breakdown: Option<TaskBreakdown>,
    pub violations: Vec<Violation>,
    /// Silent fixes applied during normalization (story id overwrite).
    pub corrections: Vec<String>,
}

impl BreakdownCheck {
    pub fn hard_violations(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| v.severity == Severity::Hard)
    }

    pub fn soft_violations(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| v.severity == Severity::Soft)
    }

    /// Usable: a breakdown exists and nothing hard is wrong with it.
    pub fn is_accepted(&self) -> bool {
        self.breakdown.is_some() && self.hard_violations().next().is_none()
    }

    pub fn is_clean(&self) -> bool {
        self.is_accepted() && self.violations.is_empty()
    }

    /// Tasks the architect promised but did not deliver.
    pub fn missing_task_count(&self) -> Option<usize> {
        let breakdown = self.breakdown.as_ref()?;
        let expected = breakdown.expected_task_count?;
        (expected > breakdown.tasks.len()).then(|| expected - breakdown.tasks.len())
    }
}

/// Normalize and validate an architect record for `expected_story_id`.
pub fn validate_breakdown(record: &Value, expected_story_id: &str) -> BreakdownCheck {
    let mut violations = Vec::new();
    let mut corrections = Vec::new();

    let Some(map) = record.as_object() else {
        violations.push(Violation::hard("$", "breakdown must be a JSON object"));
        return BreakdownCheck {
            breakdown: None,
            violations,
            corrections,
        };
    };

    let raw_tasks = match first_field(map, TASKS_ALIASES) {
        Some(Value::Array(items)) => items,
        Some(_) => {
            violations.push(Violation::hard("$.tasks", "tasks must be an array"));
            return BreakdownCheck {
                breakdown: None,
                violations,
                corrections,
            };
        }
        None => {
            violations.push(Violation::hard("$.tasks", "missing tasks array"));
            return BreakdownCheck {
                breakdown: None,
                violations,
                corrections,
            };
        }
    };
    if raw_tasks.is_empty() {
        violations.push(Violation::hard("$.tasks", "tasks must not be empty"));
    }

    let mut tasks = Vec::with_capacity(raw_tasks.len());
    for (idx, raw) in raw_tasks.iter().enumerate() {
        let location = format!("$.tasks[{idx}]");
        let Some(task_map) = raw.as_object() else {
            violations.push(Violation::hard(location, "task must be a JSON object"));
            continue;
        };
        let task = normalize_task(task_map);
        for rule in TASK_RULES {
            if let Some(message) = (rule.check)(&task, expected_story_id) {
                violations.push(Violation {
                    severity: rule.severity,
                    location: format!("{location} ({})", rule.name),
                    message,
                });
            }
        }
        tasks.push(task);
    }

    let declared_story = first_string(map, STORY_ID_ALIASES).unwrap_or_default();
    if !declared_story.is_empty() && declared_story != expected_story_id {
        corrections.push(format!(
            "story_id `{declared_story}` replaced with `{expected_story_id}`"
        ));
    }

    let breakdown = TaskBreakdown {
        story_id: expected_story_id.to_string(),
        architectural_conflict: map
            .get("architectural_conflict")
            .or_else(|| map.get("conflict"))
            .and_then(normalize_conflict),
        tasks,
        tech_stack: first_field(map, TECH_STACK_ALIASES)
            .and_then(normalize_stack)
            .filter(|stack| !stack.is_empty()),
        dependencies: first_field(map, DEPENDENCY_ALIASES)
            .map(normalize_dependencies)
            .filter(|deps| !deps.is_empty()),
        conventions: first_field(map, CONVENTION_ALIASES)
            .map(normalize_conventions)
            .unwrap_or_default(),
        technical_notes: first_string(map, NOTES_ALIASES).unwrap_or_default(),
        expected_task_count: first_field(map, COUNT_ALIASES).and_then(value_as_count),
    };

    BreakdownCheck {
        breakdown: Some(breakdown),
        violations,
        corrections,
    }
}

/// Tasks from a "missing tasks only" reply, minus ids already present.
pub fn parse_missing_tasks(record: &Value, existing: &BTreeSet<String>) -> Vec<Task> {
    let items = match record {
        Value::Array(items) => items,
        Value::Object(map) => match first_field(map, TASKS_ALIASES) {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    let mut seen = existing.clone();
    items
        .iter()
        .filter_map(Value::as_object)
        .map(normalize_task)
        .filter(|task| !task.task_id.trim().is_empty() && !task.description.trim().is_empty())
        .filter(|task| seen.insert(task.task_id.clone()))
        .collect()
}

const TASKS_ALIASES: &[&str] = &["tasks", "task_list", "taskList", "breakdown"];
const STORY_ID_ALIASES: &[&str] = &["story_id", "storyId", "story"];
const TECH_STACK_ALIASES: &[&str] = &["tech_stack", "techStack", "stack"];
const DEPENDENCY_ALIASES: &[&str] = &["dependencies", "deps", "packages"];
const CONVENTION_ALIASES: &[&str] = &["conventions", "coding_conventions", "naming_conventions"];
const NOTES_ALIASES: &[&str] = &["technical_notes", "technicalNotes", "notes"];
const COUNT_ALIASES: &[&str] = &["expected_task_count", "task_count", "total_tasks"];

const TASK_ID_ALIASES: &[&str] = &["task_id", "id", "taskId"];
const DESCRIPTION_ALIASES: &[&str] = &["description", "title", "name", "summary"];
const CREATE_ALIASES: &[&str] = &["files_to_create", "files", "create", "new_files"];
const MODIFY_ALIASES: &[&str] = &["files_to_modify", "modify", "files_to_update", "update"];
const COMMAND_ALIASES: &[&str] = &["command", "cmd", "shell", "commands"];
const DEPENDS_ALIASES: &[&str] = &["depends_on", "dependencies", "dependsOn"];
const REASON_ALIASES: &[&str] = &["dependency_reason", "dependencyReason", "reason"];

fn first_field<'a>(map: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .find_map(|key| map.get(*key).filter(|value| !value.is_null()))
}

fn first_string(map: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    first_field(map, aliases)
        .and_then(value_as_text)
        .filter(|text| !text.is_empty())
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn value_as_count(value: &Value) -> Option<usize> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Lists may arrive as arrays, a single string, or `{ "path": ... }` objects.
fn value_as_list(value: &Value) -> Vec<String> {
    let items: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(obj) => obj
                    .get("path")
                    .or_else(|| obj.get("file"))
                    .or_else(|| obj.get("name"))
                    .and_then(value_as_text),
                other => value_as_text(other),
            })
            .collect(),
        other => value_as_text(other).into_iter().collect(),
    };
    items.into_iter().filter(|item| !item.is_empty()).collect()
}

/// Fold alias spellings of a task onto the canonical [`Task`].
pub fn normalize_task(map: &Map<String, Value>) -> Task {
    let command = first_field(map, COMMAND_ALIASES).and_then(|value| match value {
        Value::Array(_) => {
            let parts = value_as_list(value);
            (!parts.is_empty()).then(|| parts.join(" && "))
        }
        other => value_as_text(other).filter(|cmd| !cmd.is_empty()),
    });
    Task {
        task_id: first_string(map, TASK_ID_ALIASES).unwrap_or_default(),
        description: first_string(map, DESCRIPTION_ALIASES).unwrap_or_default(),
        files_to_create: first_field(map, CREATE_ALIASES)
            .map(value_as_list)
            .unwrap_or_default(),
        files_to_modify: first_field(map, MODIFY_ALIASES)
            .map(value_as_list)
            .unwrap_or_default(),
        command,
        depends_on: first_field(map, DEPENDS_ALIASES)
            .map(value_as_list)
            .unwrap_or_default(),
        dependency_reason: first_string(map, REASON_ALIASES),
    }
}

fn normalize_conflict(value: &Value) -> Option<ConflictFlag> {
    match value {
        Value::Bool(flag) => Some(ConflictFlag {
            flag: *flag,
            explanation: String::new(),
        }),
        Value::String(text) if !text.trim().is_empty() => Some(ConflictFlag {
            flag: true,
            explanation: text.trim().to_string(),
        }),
        Value::Object(map) => Some(ConflictFlag {
            flag: map
                .get("flag")
                .or_else(|| map.get("detected"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            explanation: first_string(map, &["explanation", "reason", "details"])
                .unwrap_or_default(),
        }),
        _ => None,
    }
}

fn stack_entry(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => first_string(map, &["name", "language", "framework"]),
        other => value_as_text(other).filter(|text| !text.is_empty()),
    }
}

fn normalize_stack(value: &Value) -> Option<StackMetadata> {
    let map = value.as_object()?;
    Some(StackMetadata {
        backend: first_field(map, &["backend", "server", "language"]).and_then(stack_entry),
        frontend: first_field(map, &["frontend", "client", "ui"]).and_then(stack_entry),
        database: first_field(map, &["database", "db", "storage"]).and_then(stack_entry),
        test_framework: first_field(map, &["test_framework", "testFramework", "testing", "tests"])
            .and_then(stack_entry),
    })
}

/// Package lists, `name -> version` maps, or `{runtime, dev}` objects.
fn normalize_dependencies(value: &Value) -> DependencyDeclaration {
    fn names(value: &Value) -> Vec<String> {
        match value {
            Value::Object(map) => map.keys().cloned().collect(),
            other => value_as_list(other),
        }
    }
    match value {
        Value::Object(map) => {
            let runtime = first_field(map, &["runtime", "prod", "production", "dependencies"]);
            let dev = first_field(map, &["dev", "development", "devDependencies", "dev_dependencies"]);
            if runtime.is_none() && dev.is_none() {
                return DependencyDeclaration {
                    runtime: map.keys().cloned().collect(),
                    dev: Vec::new(),
                };
            }
            DependencyDeclaration {
                runtime: runtime.map(names).unwrap_or_default(),
                dev: dev.map(names).unwrap_or_default(),
            }
        }
        other => DependencyDeclaration {
            runtime: value_as_list(other),
            dev: Vec::new(),
        },
    }
}

fn normalize_conventions(value: &Value) -> Vec<String> {
    match value {
        Value::Array(_) => value_as_list(value),
        Value::String(text) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter_map(|(key, value)| match value {
                Value::Array(_) => Some(format!("{key}: {}", value_as_list(value).join(", "))),
                other => value_as_text(other).map(|text| format!("{key}: {text}")),
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aliases_are_normalized_and_story_id_corrected() {
        let record = json!({
            "story_id": "S-9",
            "tasks": [{"id": "S-1-T01", "title": "add file", "files": ["a.txt"], "cmd": "npm test"}]
        });
        let check = validate_breakdown(&record, "S-1");
        assert!(check.is_clean(), "{:?}", check.violations);
        let breakdown = check.breakdown.expect("breakdown");
        assert_eq!(breakdown.story_id, "S-1");
        assert_eq!(breakdown.tasks[0].task_id, "S-1-T01");
        assert_eq!(breakdown.tasks[0].description, "add file");
        assert_eq!(breakdown.tasks[0].files_to_create, vec!["a.txt"]);
        assert_eq!(breakdown.tasks[0].command.as_deref(), Some("npm test"));
        assert_eq!(check.corrections.len(), 1);
    }

    #[test]
    fn empty_or_missing_tasks_are_hard_failures() {
        let check = validate_breakdown(&json!({"tasks": []}), "S-1");
        assert!(!check.is_accepted());
        let check = validate_breakdown(&json!({"story_id": "S-1"}), "S-1");
        assert!(check.breakdown.is_none());
        let check = validate_breakdown(&json!([1, 2]), "S-1");
        assert!(check.breakdown.is_none());
    }

    #[test]
    fn task_without_description_is_hard() {
        let record = json!({"tasks": [{"task_id": "S-1-T01", "files_to_create": ["a"]}, "oops"]});
        let check = validate_breakdown(&record, "S-1");
        let hard: Vec<String> = check.hard_violations().map(ToString::to_string).collect();
        assert_eq!(hard.len(), 2, "{hard:?}");
        assert!(hard[0].contains("missing description"));
        assert!(hard[1].contains("$.tasks[1]"));
    }

    #[test]
    fn id_format_and_empty_work_are_soft() {
        let record = json!({"tasks": [{"id": "T-1", "description": "think hard"}]});
        let check = validate_breakdown(&record, "S-1");
        assert!(check.is_accepted());
        assert!(!check.is_clean());
        let soft: Vec<String> = check.soft_violations().map(ToString::to_string).collect();
        assert_eq!(soft.len(), 2);
        assert!(soft[0].contains("S-1-T01"));
    }

    #[test]
    fn prose_wrapped_architect_reply_is_accepted_with_soft_id_warning() {
        let raw = "Sure! Here is the plan:\n{\"story_id\":\"S-1\",\"tasks\":[{\"id\":\"T-1\",\"title\":\"add file\",files_to_create:[\"a.txt\"]}]}\nLet me know!";
        let record = crate::core::extract::extract_structured(raw).expect("record");

        let check = validate_breakdown(&record, "S-1");

        assert!(check.is_accepted(), "{:?}", check.violations);
        assert!(check.corrections.is_empty());
        let soft: Vec<&Violation> = check.soft_violations().collect();
        assert_eq!(soft.len(), 1, "{soft:?}");
        assert_eq!(soft[0].location, "$.tasks[0] (task_id_format)");
        assert!(soft[0].message.contains("S-1-T01"));
        let breakdown = check.breakdown.expect("breakdown");
        assert_eq!(breakdown.tasks[0].task_id, "T-1");
        assert_eq!(breakdown.tasks[0].description, "add file");
        assert_eq!(breakdown.tasks[0].files_to_create, vec!["a.txt"]);
    }

    #[test]
    fn task_id_pattern_requires_two_digits() {
        assert!(task_id_matches("S-1-T01", "S-1"));
        assert!(task_id_matches("S-1-T123", "S-1"));
        assert!(!task_id_matches("S-1-T1", "S-1"));
        assert!(!task_id_matches("S-2-T01", "S-1"));
        assert!(task_id_matches("story.v2-T07", "story.v2"));
    }

    #[test]
    fn optional_blocks_are_normalized() {
        let record = json!({
            "tasks": [{"task_id": "S-1-T01", "description": "d", "files_to_create": ["a"]}],
            "tech_stack": {"backend": "node", "db": {"name": "sqlite"}},
            "dependencies": {"express": "^4", "jest": "^29"},
            "conventions": {"naming": "camelCase", "layout": ["src/", "tests/"]},
            "architectural_conflict": {"flag": true, "explanation": "needs a queue"},
            "expected_task_count": "3"
        });
        let check = validate_breakdown(&record, "S-1");
        let breakdown = check.breakdown.clone().expect("breakdown");
        let stack = breakdown.tech_stack.clone().expect("stack");
        assert_eq!(stack.backend.as_deref(), Some("node"));
        assert_eq!(stack.database.as_deref(), Some("sqlite"));
        let mut runtime = breakdown.dependencies.clone().expect("deps").runtime;
        runtime.sort();
        assert_eq!(runtime, vec!["express", "jest"]);
        assert!(breakdown.conventions.contains(&"layout: src/, tests/".to_string()));
        assert!(breakdown.conventions.contains(&"naming: camelCase".to_string()));
        assert!(breakdown.has_conflict());
        assert_eq!(check.missing_task_count(), Some(2));
    }

    #[test]
    fn missing_tasks_skip_known_ids() {
        let existing: BTreeSet<String> = ["S-1-T01".to_string()].into();
        let record = json!({"tasks": [
            {"id": "S-1-T01", "description": "dup"},
            {"id": "S-1-T02", "description": "new", "files": "b.txt"},
            {"id": "S-1-T02", "description": "dup again"},
            {"description": "no id"}
        ]});
        let tasks = parse_missing_tasks(&record, &existing);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].files_to_create, vec!["b.txt"]);
    }
}
