//! Bounded retry with corrective feedback.
//!
//! Each attempt asks the completer, validates the reply, and on rejection
//! appends the reply plus a feedback message quoting every violation and
//! restating the original instructions. Exhaustion is not an error: the best
//! result seen is returned with `exhausted = true`. Completer errors propagate
//! unchanged and do not consume the budget.

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::conversation::{Completer, Conversation};
use crate::core::types::StageResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn single() -> Self {
        Self::new(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Verdict of a stage validator on one reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation<T> {
    Accept(T),
    AcceptWithWarnings(T, Vec<String>),
    /// Retry with feedback. `best` is kept when it beats earlier candidates;
    /// `usable` marks it as good enough to return on exhaustion.
    Reject {
        best: Option<T>,
        usable: bool,
        violations: Vec<String>,
    },
    /// Stop now without further attempts.
    Abort {
        best: Option<T>,
        violations: Vec<String>,
    },
}

impl<T> Validation<T> {
    pub fn reject(violations: Vec<String>) -> Self {
        Validation::Reject {
            best: None,
            usable: false,
            violations,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryReport<T> {
    pub result: StageResult<T>,
    pub attempts: u32,
    pub exhausted: bool,
    pub aborted: bool,
    /// The reply that produced `result` (or the last reply seen).
    pub last_response: String,
}

/// Feedback for a rejected reply.
pub fn feedback_message(
    violations: &[String],
    original: &str,
    attempt: u32,
    max_attempts: u32,
) -> String {
    let mut out = format!(
        "Your previous response was rejected (attempt {attempt} of {max_attempts}). Fix every problem below and reply with the complete corrected output only.\n\nProblems:\n"
    );
    for violation in violations {
        out.push_str(&format!("- \"{violation}\"\n"));
    }
    out.push_str("\nOriginal instructions (still in force):\n\n");
    out.push_str(original.trim());
    out.push('\n');
    out
}

struct Best<T> {
    value: Option<T>,
    usable: bool,
    violations: Vec<String>,
}

impl<T> Best<T> {
    /// Newer candidates replace older ones unless they would trade usable for unusable.
    fn offer(&mut self, value: Option<T>, usable: bool, violations: Vec<String>) {
        if value.is_some() && (usable || !self.usable) {
            self.value = value;
            self.usable = usable;
            self.violations = violations;
        } else if self.value.is_none() {
            self.violations = violations;
        }
    }
}

/// Run `validate` over up to `policy.max_attempts` replies.
pub fn run_with_retry<C, T, F>(
    completer: &C,
    conversation: &mut Conversation,
    policy: RetryPolicy,
    mut validate: F,
) -> Result<RetryReport<T>>
where
    C: Completer + ?Sized,
    F: FnMut(&str) -> Validation<T>,
{
    let mut best = Best {
        value: None,
        usable: false,
        violations: Vec::new(),
    };
    let mut last_response = String::new();
    let mut last_violations: Vec<String> = Vec::new();

    for attempt in 1..=policy.max_attempts {
        let response = completer.complete(conversation)?;
        debug!(attempt, bytes = response.len(), "completion received");
        match validate(&response) {
            Validation::Accept(value) => {
                return Ok(RetryReport {
                    result: StageResult::Valid(value),
                    attempts: attempt,
                    exhausted: false,
                    aborted: false,
                    last_response: response,
                });
            }
            Validation::AcceptWithWarnings(value, warnings) => {
                return Ok(RetryReport {
                    result: StageResult::RepairedWithWarnings { value, warnings },
                    attempts: attempt,
                    exhausted: false,
                    aborted: false,
                    last_response: response,
                });
            }
            Validation::Abort { best, violations } => {
                warn!(attempt, violations = violations.len(), "attempt aborted");
                return Ok(RetryReport {
                    result: StageResult::Failed {
                        best,
                        errors: violations,
                    },
                    attempts: attempt,
                    exhausted: false,
                    aborted: true,
                    last_response: response,
                });
            }
            Validation::Reject {
                best: candidate,
                usable,
                violations,
            } => {
                warn!(attempt, violations = violations.len(), "attempt rejected");
                best.offer(candidate, usable, violations.clone());
                if attempt < policy.max_attempts {
                    let feedback = feedback_message(
                        &violations,
                        conversation.original_instructions(),
                        attempt,
                        policy.max_attempts,
                    );
                    conversation.push_assistant(response.clone());
                    conversation.push_user(feedback);
                }
                last_violations = violations;
                last_response = response;
            }
        }
    }

    let result = match best.value {
        Some(value) if best.usable => StageResult::RepairedWithWarnings {
            value,
            warnings: best.violations,
        },
        value => StageResult::Failed {
            best: value,
            errors: if best.violations.is_empty() {
                last_violations
            } else {
                best.violations
            },
        },
    };
    Ok(RetryReport {
        result,
        attempts: policy.max_attempts,
        exhausted: true,
        aborted: false,
        last_response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedCompleter;

    fn parse_number(raw: &str) -> Validation<u32> {
        match raw.trim().parse::<u32>() {
            Ok(n) if n >= 10 => Validation::Accept(n),
            Ok(n) => Validation::Reject {
                best: Some(n),
                usable: n >= 5,
                violations: vec![format!("{n} is too small")],
            },
            Err(_) => Validation::reject(vec!["not a number".to_string()]),
        }
    }

    #[test]
    fn feedback_quotes_violations_and_restates_instructions() {
        let completer = ScriptedCompleter::new(["nope", "12"]);
        let mut conversation = Conversation::new("sys", "Give me a number >= 10.");
        let report = run_with_retry(&completer, &mut conversation, RetryPolicy::new(3), parse_number)
            .expect("retry");
        assert_eq!(report.result, StageResult::Valid(12));
        assert_eq!(report.attempts, 2);
        let seen = completer.conversations();
        let feedback = &seen[1].messages[2].content;
        assert!(feedback.contains("- \"not a number\""));
        assert!(feedback.contains("Give me a number >= 10."));
        completer.assert_drained();
    }

    #[test]
    fn exhaustion_returns_best_usable_result() {
        let completer = ScriptedCompleter::new(["6", "2", "x"]);
        let mut conversation = Conversation::new("sys", "number");
        let report = run_with_retry(&completer, &mut conversation, RetryPolicy::new(3), parse_number)
            .expect("retry");
        assert!(report.exhausted);
        assert_eq!(
            report.result,
            StageResult::RepairedWithWarnings {
                value: 6,
                warnings: vec!["6 is too small".to_string()]
            }
        );
    }

    #[test]
    fn exhaustion_without_usable_result_fails_with_best() {
        let completer = ScriptedCompleter::new(["1", "x"]);
        let mut conversation = Conversation::new("sys", "number");
        let report = run_with_retry(&completer, &mut conversation, RetryPolicy::new(2), parse_number)
            .expect("retry");
        assert_eq!(
            report.result,
            StageResult::Failed {
                best: Some(1),
                errors: vec!["1 is too small".to_string()]
            }
        );
    }

    #[test]
    fn abort_stops_immediately() {
        let completer = ScriptedCompleter::new(["a", "b"]);
        let mut conversation = Conversation::new("sys", "x");
        let report = run_with_retry(&completer, &mut conversation, RetryPolicy::new(3), |_| {
            Validation::<u32>::Abort {
                best: None,
                violations: vec!["out of contract".to_string()],
            }
        })
        .expect("retry");
        assert!(report.aborted);
        assert_eq!(report.attempts, 1);
        assert_eq!(completer.remaining(), 1);
    }

    #[test]
    fn completer_errors_propagate() {
        let completer = ScriptedCompleter::from_results(vec![Err("service down".to_string())]);
        let mut conversation = Conversation::new("sys", "x");
        let err = run_with_retry(&completer, &mut conversation, RetryPolicy::new(3), parse_number)
            .expect_err("infrastructure error");
        assert!(err.to_string().contains("service down"));
    }
}
