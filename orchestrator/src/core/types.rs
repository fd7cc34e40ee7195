//! Shared deterministic types for orchestrator core logic.
//!
//! These types define stable contracts between stages. They must not depend on
//! external state or I/O, and their serialized forms are persisted in sprint
//! artifacts, so field names must stay stable.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a backlog story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryStatus {
    Pending,
    Breakdown,
    Coding,
    Verifying,
    Done,
    Failed,
}

impl StoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::Breakdown => "breakdown",
            StoryStatus::Coding => "coding",
            StoryStatus::Verifying => "verifying",
            StoryStatus::Done => "done",
            StoryStatus::Failed => "failed",
        }
    }

    /// `done` and `failed` are terminal; everything else is still schedulable.
    pub fn is_terminal(self) -> bool {
        matches!(self, StoryStatus::Done | StoryStatus::Failed)
    }
}

/// Why a story (or a stage within it) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// No structured record could be extracted from agent output.
    Parse,
    /// A record was extracted but misses required fields.
    Shape,
    /// Developer output touched files or dependencies outside the contract.
    Contract,
    /// Generated content failed syntax, schema or test-pattern checks.
    ContentValidation,
    /// Verification reported failures, timed out, or could not run.
    Verification,
    /// Completion service, filesystem or process failure. Aborts the sprint.
    Infrastructure,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Parse => "parse",
            FailureCategory::Shape => "shape",
            FailureCategory::Contract => "contract",
            FailureCategory::ContentValidation => "content_validation",
            FailureCategory::Verification => "verification",
            FailureCategory::Infrastructure => "infrastructure",
        }
    }
}

/// Architect-declared conflict between the story and the existing architecture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFlag {
    #[serde(default)]
    pub flag: bool,
    #[serde(default)]
    pub explanation: String,
}

/// Backend/frontend/storage/test-framework identifiers inferred once per project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_framework: Option<String>,
}

impl StackMetadata {
    pub fn is_empty(&self) -> bool {
        self.backend.is_none()
            && self.frontend.is_none()
            && self.database.is_none()
            && self.test_framework.is_none()
    }
}

/// Package names the architect declared for a story.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDeclaration {
    #[serde(default)]
    pub runtime: Vec<String>,
    #[serde(default)]
    pub dev: Vec<String>,
}

impl DependencyDeclaration {
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.runtime
            .iter()
            .chain(self.dev.iter())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.runtime.is_empty() && self.dev.is_empty()
    }
}

/// One unit of developer work inside a breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub files_to_create: Vec<String>,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_reason: Option<String>,
}

impl Task {
    /// Every path the task claims, created or modified.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files_to_create
            .iter()
            .chain(self.files_to_modify.iter())
            .map(String::as_str)
    }

    pub fn has_command(&self) -> bool {
        self.command
            .as_deref()
            .is_some_and(|cmd| !cmd.trim().is_empty())
    }
}

/// Architect output for one story, after aliasing and normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBreakdown {
    pub story_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architectural_conflict: Option<ConflictFlag>,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tech_stack: Option<StackMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependencyDeclaration>,
    #[serde(default)]
    pub conventions: Vec<String>,
    #[serde(default)]
    pub technical_notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_task_count: Option<usize>,
}

impl TaskBreakdown {
    pub fn has_conflict(&self) -> bool {
        self.architectural_conflict
            .as_ref()
            .is_some_and(|conflict| conflict.flag)
    }

    pub fn declared_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().flat_map(DependencyDeclaration::all)
    }
}

/// A generated file: relative path plus text content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub content: String,
}

impl FileSpec {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Reason a verification run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationFailure {
    /// The tool reported one or more failing tests.
    Failures,
    /// The run exceeded the wall-clock timeout and was killed.
    Timeout,
    /// No test counts could be read from the output.
    NoTests,
    /// No stack metadata was recorded and no default command is configured.
    NoStack,
}

impl VerificationFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationFailure::Failures => "failures",
            VerificationFailure::Timeout => "timeout",
            VerificationFailure::NoTests => "no_tests",
            VerificationFailure::NoStack => "no_stack",
        }
    }
}

/// Per-story verification counts plus the raw tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub attempted: u32,
    pub passed: u32,
    pub failed: u32,
    pub output: String,
    pub reason: Option<VerificationFailure>,
}

impl VerificationResult {
    pub fn succeeded(&self) -> bool {
        self.reason.is_none()
    }

    /// A result for a run that never started.
    pub fn not_run(reason: VerificationFailure, output: impl Into<String>) -> Self {
        Self {
            attempted: 0,
            passed: 0,
            failed: 0,
            output: output.into(),
            reason: Some(reason),
        }
    }
}

/// Final result of a stage that may have been repaired or retried.
///
/// `RepairedWithWarnings` is degraded but usable; `Failed` is unusable and
/// carries the best (still invalid) value seen, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult<T> {
    Valid(T),
    RepairedWithWarnings { value: T, warnings: Vec<String> },
    Failed { best: Option<T>, errors: Vec<String> },
}

impl<T> StageResult<T> {
    pub fn is_usable(&self) -> bool {
        !matches!(self, StageResult::Failed { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            StageResult::Valid(value) | StageResult::RepairedWithWarnings { value, .. } => {
                Some(value)
            }
            StageResult::Failed { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            StageResult::Valid(value) | StageResult::RepairedWithWarnings { value, .. } => {
                Some(value)
            }
            StageResult::Failed { .. } => None,
        }
    }

    /// Warnings or errors attached to the result (empty for `Valid`).
    pub fn diagnostics(&self) -> &[String] {
        match self {
            StageResult::Valid(_) => &[],
            StageResult::RepairedWithWarnings { warnings, .. } => warnings,
            StageResult::Failed { errors, .. } => errors,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageResult::Valid(_) => "valid",
            StageResult::RepairedWithWarnings { .. } => "repaired_with_warnings",
            StageResult::Failed { .. } => "failed",
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageResult<U> {
        match self {
            StageResult::Valid(value) => StageResult::Valid(f(value)),
            StageResult::RepairedWithWarnings { value, warnings } => {
                StageResult::RepairedWithWarnings {
                    value: f(value),
                    warnings,
                }
            }
            StageResult::Failed { best, errors } => StageResult::Failed {
                best: best.map(f),
                errors,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_result_exposes_value_only_when_usable() {
        let valid: StageResult<u32> = StageResult::Valid(1);
        let repaired = StageResult::RepairedWithWarnings {
            value: 2,
            warnings: vec!["w".to_string()],
        };
        let failed: StageResult<u32> = StageResult::Failed {
            best: Some(3),
            errors: vec!["e".to_string()],
        };

        assert_eq!(valid.value(), Some(&1));
        assert_eq!(repaired.value(), Some(&2));
        assert_eq!(failed.value(), None);
        assert!(!failed.is_usable());
        assert_eq!(repaired.diagnostics(), ["w".to_string()]);
        assert_eq!(failed.label(), "failed");
    }

    #[test]
    fn task_files_chain_create_and_modify() {
        let task = Task {
            task_id: "S-1-T01".to_string(),
            description: "d".to_string(),
            files_to_create: vec!["a.txt".to_string()],
            files_to_modify: vec!["b.txt".to_string()],
            ..Task::default()
        };
        assert_eq!(task.files().collect::<Vec<_>>(), vec!["a.txt", "b.txt"]);
        assert!(!task.has_command());
    }

    #[test]
    fn statuses_serialize_lowercase() {
        let json = serde_json::to_string(&StoryStatus::Verifying).expect("serialize");
        assert_eq!(json, "\"verifying\"");
        let json = serde_json::to_string(&FailureCategory::ContentValidation).expect("serialize");
        assert_eq!(json, "\"content_validation\"");
    }
}
