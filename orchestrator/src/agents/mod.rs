//! Agent stages: prompt, complete, extract, validate, retry.
//!
//! Each stage returns a [`StageOutcome`]; only completion-service failures
//! surface as `Err`.

use anyhow::Result;
use tracing::{debug, instrument};

use crate::core::code_check::validate_files;
use crate::core::context::{StoryContext, StoryFailure};
use crate::core::contract::{ArchitecturalContract, Baseline};
use crate::core::conversation::{Completer, Conversation};
use crate::core::extract::{extract_structured, looks_truncated};
use crate::core::files::normalize_file_specs;
use crate::core::retry::{RetryPolicy, Validation, run_with_retry};
use crate::core::types::{FailureCategory, FileSpec, StageResult};

pub mod architect;
pub mod developer;
pub mod verifier;

/// Stage result plus how many completions it took and, when it failed, why.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome<T> {
    pub result: StageResult<T>,
    pub attempts: u32,
    /// Category of the last rejection. Set whenever `result` is `Failed`.
    pub category: Option<FailureCategory>,
}

impl<T> StageOutcome<T> {
    /// The story failure this outcome represents, if it is unusable.
    pub fn failure(&self) -> Option<StoryFailure> {
        match &self.result {
            StageResult::Failed { errors, .. } => Some(StoryFailure::new(
                self.category.unwrap_or(FailureCategory::Parse),
                errors.last().cloned().unwrap_or_default(),
            )),
            _ => None,
        }
    }

    /// The usable value, or the failure that replaced it.
    pub fn into_usable(self) -> std::result::Result<T, StoryFailure> {
        let failure = self.failure();
        self.result.into_value().ok_or_else(|| {
            failure.unwrap_or_else(|| StoryFailure::new(FailureCategory::Parse, "stage failed"))
        })
    }
}

/// Feedback for a reply with no recoverable record.
pub(crate) fn parse_feedback(raw: &str) -> String {
    if looks_truncated(raw) {
        "your reply was cut off before the JSON closed; reply with a complete record and keep it shorter (briefer descriptions, less prose)".to_string()
    } else {
        "no JSON record could be found in your reply; reply with the JSON record only".to_string()
    }
}

/// Which files a stage may write.
pub(crate) enum Surface<'a> {
    /// Developer output: the story contract, with or without corrective feedback.
    Contract {
        contract: &'a ArchitecturalContract,
        baseline: &'a Baseline,
        feedback: bool,
    },
    /// Verifier output: recognized test files only.
    TestsOnly,
}

impl Surface<'_> {
    fn check(&self, files: &[FileSpec]) -> Vec<String> {
        match self {
            Surface::Contract {
                contract, baseline, ..
            } => contract.enforce(files, baseline).messages(),
            Surface::TestsOnly => files
                .iter()
                .filter(|file| !crate::core::code_check::is_test_file(&file.path))
                .map(|file| format!("`{}` is not a test file", file.path))
                .collect(),
        }
    }

    fn aborts(&self) -> bool {
        matches!(self, Surface::Contract { feedback: false, .. })
    }
}

/// Files from one reply with the category of what was wrong with them, so a
/// failed stage reports the category of the attempt whose diagnostics it keeps.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    files: Vec<FileSpec>,
    category: Option<FailureCategory>,
}

impl Candidate {
    fn accepted(files: Vec<FileSpec>) -> Self {
        Self {
            files,
            category: None,
        }
    }

    fn rejected(files: Vec<FileSpec>, category: FailureCategory) -> Self {
        Self {
            files,
            category: Some(category),
        }
    }
}

/// Shared extract → normalize → surface check → code check loop for file-producing stages.
#[instrument(skip_all, fields(story = %ctx.story_id, stage))]
pub(crate) fn generate_files<C: Completer + ?Sized>(
    completer: &C,
    ctx: &mut StoryContext,
    stage: &str,
    conversation: &mut Conversation,
    policy: RetryPolicy,
    surface: &Surface<'_>,
) -> Result<StageOutcome<Vec<FileSpec>>> {
    // Category of the latest reply that produced no files at all.
    let mut fileless = FailureCategory::Parse;
    let report = run_with_retry(completer, conversation, policy, |raw| {
        let Some(record) = extract_structured(raw) else {
            fileless = FailureCategory::Parse;
            return Validation::reject(vec![parse_feedback(raw)]);
        };
        let normalized = normalize_file_specs(&record);
        if normalized.files.is_empty() {
            fileless = FailureCategory::Shape;
            let mut violations = normalized.issues;
            if violations.is_empty() {
                violations.push("no files found in output".to_string());
            }
            return Validation::reject(violations);
        }
        let files = normalized.files;

        let surface_violations = surface.check(&files);
        if !surface_violations.is_empty() {
            let best = Some(Candidate::rejected(files, FailureCategory::Contract));
            if surface.aborts() {
                return Validation::Abort {
                    best,
                    violations: surface_violations,
                };
            }
            return Validation::Reject {
                best,
                usable: false,
                violations: surface_violations,
            };
        }

        let code = validate_files(&files);
        if code.has_errors() {
            return Validation::Reject {
                best: Some(Candidate::rejected(files, FailureCategory::ContentValidation)),
                usable: false,
                violations: code.errors().map(ToString::to_string).collect(),
            };
        }

        let mut warnings = normalized.issues;
        warnings.extend(code.warnings().map(ToString::to_string));
        if warnings.is_empty() {
            Validation::Accept(Candidate::accepted(files))
        } else {
            debug!(warnings = warnings.len(), "files usable with warnings");
            Validation::Reject {
                best: Some(Candidate::accepted(files)),
                usable: true,
                violations: warnings,
            }
        }
    })?;

    let category = match &report.result {
        StageResult::Failed {
            best: Some(candidate),
            ..
        } => candidate.category.or(Some(fileless)),
        StageResult::Failed { best: None, .. } => Some(fileless),
        _ => None,
    };
    let result = report.result.map(|candidate| candidate.files);
    ctx.note_all(stage, result.diagnostics());
    Ok(StageOutcome {
        result,
        attempts: report.attempts,
        category,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_reply_asks_for_a_shorter_record() {
        assert!(parse_feedback(r#"{"files": [{"path": "a.js", "content": "x"#).contains("cut off"));
        assert!(parse_feedback("I could not do it").contains("no JSON record"));
    }

    #[test]
    fn failed_outcome_reports_its_category() {
        let outcome: StageOutcome<Vec<FileSpec>> = StageOutcome {
            result: StageResult::Failed {
                best: None,
                errors: vec!["first".to_string(), "last".to_string()],
            },
            attempts: 2,
            category: Some(FailureCategory::Shape),
        };
        let failure = outcome.failure().expect("failure");
        assert_eq!(failure.category, FailureCategory::Shape);
        assert_eq!(failure.diagnostic, "last");
    }
}
