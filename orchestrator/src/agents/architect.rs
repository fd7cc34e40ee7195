//! Architect agent: story in, validated task breakdown out.

use std::collections::BTreeSet;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::breakdown::{Severity, TASK_RULES, parse_missing_tasks, validate_breakdown};
use crate::core::context::StoryContext;
use crate::core::conversation::{Completer, Conversation};
use crate::core::extract::extract_structured;
use crate::core::retry::{RetryPolicy, Validation, feedback_message, run_with_retry};
use crate::core::types::{FailureCategory, StageResult, TaskBreakdown};
use crate::io::prompt::{ArchitectInputs, PromptBuilder};

use super::{StageOutcome, parse_feedback};

const STAGE: &str = "breakdown";

/// Architect wrapper that owns the persona and prompt settings.
#[derive(Debug, Clone)]
pub struct ArchitectAgent {
    persona: String,
    prompts: PromptBuilder,
    policy: RetryPolicy,
}

impl ArchitectAgent {
    pub fn new(persona: impl Into<String>, prompt_budget_bytes: usize, policy: RetryPolicy) -> Self {
        Self {
            persona: persona.into(),
            prompts: PromptBuilder::new(prompt_budget_bytes),
            policy,
        }
    }

    /// Produce the story's breakdown.
    ///
    /// Hard schema violations are retried under the policy. Soft ones get one
    /// extra re-prompt and otherwise ride along as warnings. A breakdown that
    /// declares more tasks than it lists triggers one "missing tasks only"
    /// request whose tasks are appended.
    #[instrument(skip_all, fields(story = %ctx.story_id))]
    pub fn run<C: Completer + ?Sized>(
        &self,
        completer: &C,
        ctx: &mut StoryContext,
        inputs: &ArchitectInputs<'_>,
    ) -> Result<StageOutcome<TaskBreakdown>> {
        let story_id = ctx.story_id.clone();
        let prompt = self.prompts.architect(inputs)?;
        let mut conversation = Conversation::new(self.persona.clone(), prompt);

        let mut category = FailureCategory::Parse;
        let mut soft: Vec<String> = Vec::new();
        let report = run_with_retry(completer, &mut conversation, self.policy, |raw| {
            let Some(record) = extract_structured(raw) else {
                category = FailureCategory::Parse;
                return Validation::reject(vec![parse_feedback(raw)]);
            };
            let check = validate_breakdown(&record, &story_id);
            if !check.is_accepted() {
                category = FailureCategory::Shape;
                let violations = check.hard_violations().map(ToString::to_string).collect();
                return Validation::Reject {
                    best: check.breakdown,
                    usable: false,
                    violations,
                };
            }
            soft = check.soft_violations().map(ToString::to_string).collect();
            let warnings = check.corrections;
            match check.breakdown {
                Some(breakdown) if warnings.is_empty() => Validation::Accept(breakdown),
                Some(breakdown) => Validation::AcceptWithWarnings(breakdown, warnings),
                None => Validation::reject(vec!["breakdown missing".to_string()]),
            }
        })?;
        let mut attempts = report.attempts;

        let (mut breakdown, mut warnings) = match report.result {
            StageResult::Valid(breakdown) => (breakdown, Vec::new()),
            StageResult::RepairedWithWarnings { value, warnings } => (value, warnings),
            StageResult::Failed { best, errors } => {
                ctx.note_all(STAGE, &errors);
                return Ok(StageOutcome {
                    result: StageResult::Failed { best, errors },
                    attempts,
                    category: Some(category),
                });
            }
        };

        if !soft.is_empty() {
            attempts += 1;
            match self.reprompt_soft(completer, &mut conversation, &report.last_response, &soft, &story_id)? {
                Some(clean) => {
                    info!("soft violations fixed on re-prompt");
                    breakdown = clean;
                }
                None => {
                    warn!(violations = soft.len(), "keeping breakdown with soft violations");
                    warnings.extend(soft);
                }
            }
        }

        if let Some(expected) = breakdown.expected_task_count.filter(|n| *n > breakdown.tasks.len()) {
            attempts += 1;
            warnings.extend(self.recover_missing_tasks(completer, &mut breakdown, expected)?);
        }

        ctx.note_all(STAGE, &warnings);
        let result = if warnings.is_empty() {
            StageResult::Valid(breakdown)
        } else {
            StageResult::RepairedWithWarnings {
                value: breakdown,
                warnings,
            }
        };
        Ok(StageOutcome {
            result,
            attempts,
            category: None,
        })
    }

    /// One corrective round; only a breakdown with no violations replaces the original.
    fn reprompt_soft<C: Completer + ?Sized>(
        &self,
        completer: &C,
        conversation: &mut Conversation,
        last_response: &str,
        soft: &[String],
        story_id: &str,
    ) -> Result<Option<TaskBreakdown>> {
        let feedback = feedback_message(soft, conversation.original_instructions(), 1, 2);
        conversation.push_assistant(last_response);
        conversation.push_user(feedback);
        let report = run_with_retry(completer, conversation, RetryPolicy::single(), |raw| {
            let Some(record) = extract_structured(raw) else {
                return Validation::reject(vec![parse_feedback(raw)]);
            };
            let check = validate_breakdown(&record, story_id);
            match check.breakdown {
                Some(breakdown) if check.is_clean() => Validation::Accept(breakdown),
                _ => Validation::reject(check.violations.iter().map(ToString::to_string).collect()),
            }
        })?;
        Ok(match report.result {
            StageResult::Valid(breakdown) => Some(breakdown),
            _ => None,
        })
    }

    /// Ask for the missing tasks only and append whatever new ones arrive.
    fn recover_missing_tasks<C: Completer + ?Sized>(
        &self,
        completer: &C,
        breakdown: &mut TaskBreakdown,
        expected: usize,
    ) -> Result<Vec<String>> {
        let actual = breakdown.tasks.len();
        let existing: BTreeSet<String> = breakdown.tasks.iter().map(|t| t.task_id.clone()).collect();
        let ids: Vec<String> = existing.iter().cloned().collect();
        info!(expected, actual, "requesting missing tasks");

        let prompt = self
            .prompts
            .missing_tasks(&breakdown.story_id, &ids, expected, actual)?;
        let mut conversation = Conversation::new(self.persona.clone(), prompt);
        let report = run_with_retry(completer, &mut conversation, RetryPolicy::single(), |raw| {
            let Some(record) = extract_structured(raw) else {
                return Validation::reject(vec![parse_feedback(raw)]);
            };
            let tasks = parse_missing_tasks(&record, &existing);
            if tasks.is_empty() {
                Validation::reject(vec!["reply contained no new tasks".to_string()])
            } else {
                Validation::Accept(tasks)
            }
        })?;

        let mut warnings = Vec::new();
        match report.result.into_value() {
            Some(tasks) => {
                for task in &tasks {
                    for rule in TASK_RULES.iter().filter(|r| r.severity == Severity::Soft) {
                        if let Some(message) = (rule.check)(task, &breakdown.story_id) {
                            warnings.push(format!("{} ({}): {message}", task.task_id, rule.name));
                        }
                    }
                }
                breakdown.tasks.extend(tasks);
            }
            None => warnings.push(format!(
                "breakdown declared {expected} tasks but only {actual} were recovered"
            )),
        }
        if breakdown.tasks.len() < expected {
            warn!(expected, actual = breakdown.tasks.len(), "task count still short");
        }
        Ok(warnings)
    }
}
