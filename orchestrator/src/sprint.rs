//! Sprint coordinator: every schedulable story goes through breakdown, coding
//! and verification, strictly one after another.
//!
//! Story failures are recorded on the backlog and the sprint moves on. Only
//! infrastructure errors (completion service, filesystem, process spawn) stop
//! the sprint; the story in flight is then marked failed and the error returned.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{SecondsFormat, Utc};
use tracing::{error, info, instrument, warn};

use crate::agents::StageOutcome;
use crate::agents::architect::ArchitectAgent;
use crate::agents::developer::DeveloperAgent;
use crate::agents::verifier::VerifierAgent;
use crate::backlog::{Backlog, Story, StoryResult, VerificationSummary};
use crate::core::code_check::is_test_file;
use crate::core::context::{StoryContext, StoryFailure};
use crate::core::contract::{ArchitecturalContract, Baseline};
use crate::core::conversation::Completer;
use crate::core::types::{
    FailureCategory, StackMetadata, StoryStatus, Task, TaskBreakdown, VerificationFailure,
    VerificationResult,
};
use crate::io::backlog_store::{load_backlog, write_backlog};
use crate::io::config::{OrchestratorConfig, TaskFailurePolicy};
use crate::io::events::{EventBus, EventKind, ProgressEvent, Stage};
use crate::io::init::{ProjectPaths, parse_sprint_dir_name};
use crate::io::locks::ProjectLocks;
use crate::io::process::{run_command_with_timeout, shell_command};
use crate::io::prompt::{
    ArchitectInputs, DeveloperInputs, FixInputs, Persona, VerifierInputs, load_persona,
};
use crate::io::snapshot::SnapshotManager;
use crate::io::sprint_log::{
    SprintReport, StoryReport, append_verification_log, record_breakdown, write_report,
};
use crate::io::stack::{load_stack, record_stack_once};
use crate::io::verify::{TestRunner, dispatch};
use crate::io::workspace::Workspace;

/// Collaborators and settings for one sprint run.
pub struct SprintEnv<'a, C: ?Sized, R: ?Sized> {
    pub paths: &'a ProjectPaths,
    pub config: &'a OrchestratorConfig,
    pub completer: &'a C,
    pub runner: &'a R,
    pub locks: Arc<ProjectLocks>,
    pub events: EventBus,
    /// Checked between stories.
    pub cancel: Arc<AtomicBool>,
}

/// One past the highest `sprint-<n>` directory, or 1 for a fresh project.
pub fn next_sprint_id(paths: &ProjectPaths) -> Result<u32> {
    if !paths.sprints_dir.exists() {
        return Ok(1);
    }
    let mut highest = 0;
    for entry in fs::read_dir(&paths.sprints_dir)
        .with_context(|| format!("read {}", paths.sprints_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read {}", paths.sprints_dir.display()))?;
        if let Some(n) = parse_sprint_dir_name(&entry.file_name().to_string_lossy()) {
            highest = highest.max(n);
        }
    }
    Ok(highest + 1)
}

/// Run sprint `sprint_id` over the project's schedulable stories.
///
/// A snapshot is captured before any story runs. The returned report is also
/// written to `sprints/sprint-<n>/report.json`.
#[instrument(skip_all, fields(project = %env.paths.project, sprint_id = sprint_id))]
pub fn run_sprint<C, R>(env: &SprintEnv<'_, C, R>, sprint_id: u32) -> Result<SprintReport>
where
    C: Completer + ?Sized,
    R: TestRunner + ?Sized,
{
    if sprint_id == 0 {
        bail!("sprint ids start at 1");
    }
    let project = env.paths.project.as_str();
    let _guard = env.locks.begin_sprint(env.paths)?;
    let started_at = now();

    let mut backlog = load_backlog(&env.paths.backlog_path)?;
    let mut queue: Vec<String> = backlog.schedulable().map(|story| story.id.clone()).collect();
    if env.config.sprint.max_stories > 0 {
        queue.truncate(env.config.sprint.max_stories);
    }

    let manifest = SnapshotManager::new(env.paths.clone(), Arc::clone(&env.locks))
        .capture(sprint_id)
        .context("capture pre-sprint snapshot")?;
    let coordinator = Coordinator::new(env, sprint_id)?;
    coordinator.emit(
        None,
        Stage::Sprint,
        EventKind::SprintStarted {
            stories: queue.len(),
            backup_id: Some(manifest.backup_id.clone()),
        },
    );

    let mut report = SprintReport {
        project: project.to_string(),
        sprint_id,
        started_at,
        finished_at: String::new(),
        backup_id: Some(manifest.backup_id),
        cancelled: false,
        aborted: None,
        stories: Vec::new(),
    };

    for story_id in &queue {
        if env.cancel.load(Ordering::SeqCst) {
            warn!(story = %story_id, "sprint cancelled before story");
            report.cancelled = true;
            break;
        }
        match coordinator.run_story(&mut backlog, story_id) {
            Ok(story_report) => report.stories.push(story_report),
            Err(err) => {
                let diagnostic = format!("{err:#}");
                error!(story = %story_id, err = %diagnostic, "infrastructure failure; aborting sprint");
                coordinator.abort_story(&mut backlog, story_id, &diagnostic);
                report.stories.push(StoryReport {
                    story_id: story_id.clone(),
                    status: StoryStatus::Failed,
                    category: Some(FailureCategory::Infrastructure),
                    diagnostics: vec![diagnostic.clone()],
                    files_written: Vec::new(),
                    verification: None,
                });
                report.aborted = Some(diagnostic);
                if let Err(write_err) = coordinator.finish(&mut report) {
                    warn!(err = %format!("{write_err:#}"), "failed to write sprint report");
                }
                return Err(err.context(format!("sprint {sprint_id} aborted at story {story_id}")));
            }
        }
    }

    coordinator.finish(&mut report)?;
    Ok(report)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Design assets concatenated for the architect prompt.
fn design_notes(dir: &Path) -> Result<Option<String>> {
    let design = Workspace::new(dir);
    let files = design.read_files(design.list_files()?.iter().map(String::as_str))?;
    let notes: Vec<String> = files
        .iter()
        .filter(|file| !file.content.trim().is_empty())
        .map(|file| format!("#### {}\n\n{}", file.path, file.content.trim()))
        .collect();
    Ok((!notes.is_empty()).then(|| notes.join("\n\n")))
}

struct Agents {
    architect: ArchitectAgent,
    developer: DeveloperAgent,
    verifier: VerifierAgent,
}

impl Agents {
    fn load(paths: &ProjectPaths, config: &OrchestratorConfig) -> Result<Self> {
        let budget = config.prompts.budget_bytes;
        let policy = config.retry.policy();
        Ok(Self {
            architect: ArchitectAgent::new(
                load_persona(&paths.personas_dir, Persona::Architect)?,
                budget,
                policy,
            ),
            developer: DeveloperAgent::new(
                load_persona(&paths.personas_dir, Persona::Developer)?,
                budget,
                policy,
                config.retry.contract_feedback,
            ),
            verifier: VerifierAgent::new(
                load_persona(&paths.personas_dir, Persona::Verifier)?,
                budget,
                policy,
            ),
        })
    }
}

/// How a story ended, before it is written to the backlog.
struct Verdict {
    failure: Option<StoryFailure>,
    verification: Option<VerificationResult>,
}

impl Verdict {
    fn failed(failure: StoryFailure) -> Self {
        Self {
            failure: Some(failure),
            verification: None,
        }
    }
}

struct Coordinator<'a, C: ?Sized, R: ?Sized> {
    env: &'a SprintEnv<'a, C, R>,
    agents: Agents,
    sprint_id: u32,
    workspace: Workspace,
}

impl<'a, C, R> Coordinator<'a, C, R>
where
    C: Completer + ?Sized,
    R: TestRunner + ?Sized,
{
    fn new(env: &'a SprintEnv<'a, C, R>, sprint_id: u32) -> Result<Self> {
        Ok(Self {
            agents: Agents::load(env.paths, env.config)?,
            workspace: Workspace::new(&env.paths.workspace_dir),
            env,
            sprint_id,
        })
    }

    fn project(&self) -> &str {
        &self.env.paths.project
    }

    fn emit(&self, story_id: Option<&str>, stage: Stage, kind: EventKind) {
        self.env.events.publish(ProgressEvent {
            sprint_id: self.sprint_id,
            story_id: story_id.map(str::to_string),
            stage,
            kind,
        });
    }

    fn stage_completed<T>(&self, story_id: &str, stage: Stage, outcome: &StageOutcome<T>) {
        self.emit(
            Some(story_id),
            stage,
            EventKind::StageCompleted {
                outcome: outcome.result.label().to_string(),
                attempts: outcome.attempts,
            },
        );
    }

    fn set_status(&self, backlog: &mut Backlog, story_id: &str, status: StoryStatus) -> Result<()> {
        backlog.set_status(story_id, status)?;
        write_backlog(&self.env.paths.backlog_path, backlog)
    }

    #[instrument(skip_all, fields(story = %story_id))]
    fn run_story(&self, backlog: &mut Backlog, story_id: &str) -> Result<StoryReport> {
        let story = backlog
            .story(story_id)
            .cloned()
            .ok_or_else(|| anyhow!("story '{story_id}' not found in backlog"))?;
        let mut ctx = StoryContext::new(self.project(), self.sprint_id, story_id);
        info!(story = %ctx.label(), headline = story.headline(), "story started");
        self.emit(Some(story_id), Stage::Sprint, EventKind::StoryStarted);

        let mut written = BTreeSet::new();
        let verdict = self.process(backlog, &story, &mut ctx, &mut written)?;

        let (status, category, diagnostic) = match &verdict.failure {
            None => (StoryStatus::Done, None, String::new()),
            Some(failure) => (
                StoryStatus::Failed,
                Some(failure.category),
                failure.diagnostic.clone(),
            ),
        };
        let verification = verdict.verification.as_ref().map(VerificationSummary::from);
        backlog.finish(
            story_id,
            status,
            StoryResult {
                category,
                diagnostic,
                verification,
            },
        )?;
        write_backlog(&self.env.paths.backlog_path, backlog)?;
        self.emit(
            Some(story_id),
            Stage::Sprint,
            EventKind::StoryFinished { status, category },
        );

        Ok(StoryReport {
            story_id: story_id.to_string(),
            status,
            category,
            diagnostics: ctx.diagnostics().to_vec(),
            files_written: written.into_iter().collect(),
            verification,
        })
    }

    fn process(
        &self,
        backlog: &mut Backlog,
        story: &Story,
        ctx: &mut StoryContext,
        written: &mut BTreeSet<String>,
    ) -> Result<Verdict> {
        let paths = self.env.paths;
        self.set_status(backlog, &story.id, StoryStatus::Breakdown)?;

        let stack = load_stack(&paths.stack_path)?;
        let design = design_notes(&paths.design_dir)?;
        let workspace_files = self.workspace.list_files()?;
        let outcome = self.agents.architect.run(
            self.env.completer,
            ctx,
            &ArchitectInputs {
                story,
                stack: stack.as_ref(),
                design: design.as_deref(),
                workspace_files: &workspace_files,
            },
        )?;
        self.stage_completed(&story.id, Stage::Breakdown, &outcome);
        let breakdown = match outcome.into_usable() {
            Ok(breakdown) => breakdown,
            Err(failure) => return Ok(Verdict::failed(failure)),
        };

        record_breakdown(&paths.sprint_tasks_path(self.sprint_id), self.sprint_id, &breakdown)?;
        let stack = match &breakdown.tech_stack {
            Some(declared) if record_stack_once(&paths.stack_path, declared)? => {
                load_stack(&paths.stack_path)?
            }
            _ => stack,
        };
        if let Some(conflict) = breakdown
            .architectural_conflict
            .as_ref()
            .filter(|conflict| conflict.flag)
        {
            ctx.note(format!(
                "breakdown: architectural conflict flagged: {}",
                conflict.explanation
            ));
            self.emit(
                Some(&story.id),
                Stage::Breakdown,
                EventKind::ConflictFlagged {
                    explanation: conflict.explanation.clone(),
                },
            );
        }

        let baseline = self.workspace.baseline()?;
        let contract = ArchitecturalContract::build(&baseline, &breakdown);
        self.emit(
            Some(&story.id),
            Stage::Contract,
            EventKind::StageCompleted {
                outcome: "built".to_string(),
                attempts: 0,
            },
        );

        self.set_status(backlog, &story.id, StoryStatus::Coding)?;
        let task_failure = self.env.locks.with_workspace(self.project(), || {
            self.code_tasks(story, ctx, &breakdown, &contract, &baseline, written)
        })?;
        if let Some(failure) = task_failure {
            return Ok(Verdict::failed(failure));
        }

        self.set_status(backlog, &story.id, StoryStatus::Verifying)?;
        self.verify(story, ctx, &contract, &baseline, stack.as_ref(), written)
    }

    /// Run the developer over every task. The first failure decides the
    /// story's category; `continue` keeps going, `abort` stops there.
    fn code_tasks(
        &self,
        story: &Story,
        ctx: &mut StoryContext,
        breakdown: &TaskBreakdown,
        contract: &ArchitecturalContract,
        baseline: &Baseline,
        written: &mut BTreeSet<String>,
    ) -> Result<Option<StoryFailure>> {
        let allowed_files: Vec<String> = contract.allowed_files().iter().cloned().collect();
        let allowed_deps: Vec<String> = contract.allowed_deps().iter().cloned().collect();
        let mut completed: Vec<String> = Vec::new();
        let mut failure: Option<StoryFailure> = None;

        for task in &breakdown.tasks {
            let existing = self.workspace.read_files(task.files())?;
            let inputs = DeveloperInputs {
                story,
                breakdown,
                task,
                allowed_files: allowed_files.clone(),
                allowed_deps: allowed_deps.clone(),
                existing: &existing,
                completed: &completed,
            };
            let outcome = self.agents.developer.implement_task(
                self.env.completer,
                ctx,
                &inputs,
                contract,
                baseline,
            )?;
            self.stage_completed(&story.id, Stage::Coding, &outcome);
            let category = outcome.category;
            let diagnostics = outcome.result.diagnostics().to_vec();

            match outcome.into_usable() {
                Ok(files) => {
                    written.extend(self.workspace.write_files(&files)?);
                    completed.push(format!("{}: {}", task.task_id, task.description));
                    if self.env.config.sprint.run_task_commands {
                        self.run_task_command(ctx, task)?;
                    }
                }
                Err(task_failure) => {
                    if category == Some(FailureCategory::Contract) {
                        self.emit(
                            Some(&story.id),
                            Stage::Coding,
                            EventKind::ContractViolation {
                                task_id: task.task_id.clone(),
                                violations: diagnostics,
                            },
                        );
                    }
                    self.emit(
                        Some(&story.id),
                        Stage::Coding,
                        EventKind::TaskFailed {
                            task_id: task.task_id.clone(),
                            category: task_failure.category,
                            diagnostic: task_failure.diagnostic.clone(),
                        },
                    );
                    let task_failure = StoryFailure::new(
                        task_failure.category,
                        format!("{}: {}", task.task_id, task_failure.diagnostic),
                    );
                    failure.get_or_insert(task_failure);
                    if self.env.config.sprint.on_task_failure == TaskFailurePolicy::Abort {
                        warn!(task = %task.task_id, "task failed; skipping remaining tasks");
                        break;
                    }
                }
            }
        }
        Ok(failure)
    }

    /// Failing task commands become diagnostics; only a spawn failure is an error.
    fn run_task_command(&self, ctx: &mut StoryContext, task: &Task) -> Result<()> {
        let Some(command) = task.command.as_deref().filter(|cmd| !cmd.trim().is_empty()) else {
            return Ok(());
        };
        let config = self.env.config;
        let output = run_command_with_timeout(
            shell_command(command, self.workspace.root()),
            None,
            Duration::from_secs(config.sprint.task_command_timeout_secs),
            config.verification.output_limit_bytes,
        )
        .with_context(|| format!("run task command for {}", task.task_id))?;
        if output.success() {
            info!(task = %task.task_id, command, "task command succeeded");
            return Ok(());
        }
        let detail = if output.timed_out {
            "timed out".to_string()
        } else {
            format!("exited with status {:?}", output.status.code())
        };
        let stderr = output.stderr_text();
        let tail = stderr.trim().lines().last().unwrap_or("");
        warn!(task = %task.task_id, command, %detail, "task command failed");
        ctx.note(format!(
            "coding {}: command `{command}` {detail}: {tail}",
            task.task_id
        ));
        Ok(())
    }

    fn verify(
        &self,
        story: &Story,
        ctx: &mut StoryContext,
        contract: &ArchitecturalContract,
        baseline: &Baseline,
        stack: Option<&StackMetadata>,
        written: &mut BTreeSet<String>,
    ) -> Result<Verdict> {
        let sources: Vec<String> = written
            .iter()
            .filter(|path| !is_test_file(path))
            .cloned()
            .collect();
        let tests = self.env.locks.with_workspace(self.project(), || -> Result<_> {
            let files = self.workspace.read_files(sources.iter().map(String::as_str))?;
            let outcome = self.agents.verifier.write_tests(
                self.env.completer,
                ctx,
                &VerifierInputs {
                    story,
                    stack,
                    files: &files,
                },
            )?;
            self.stage_completed(&story.id, Stage::TestWriting, &outcome);
            Ok(match outcome.into_usable() {
                Ok(tests) => Ok(self.workspace.write_files(&tests)?),
                Err(failure) => Err(failure),
            })
        })?;
        let test_paths = match tests {
            Ok(paths) => paths,
            Err(failure) => return Ok(Verdict::failed(failure)),
        };
        written.extend(test_paths.iter().cloned());

        let mut result = self.run_tests(&story.id, "initial", stack, &test_paths)?;
        let retries = self.env.config.sprint.verification_retries;
        let mut round = 0;
        while round < retries
            && matches!(
                result.reason,
                Some(VerificationFailure::Failures | VerificationFailure::Timeout)
            )
        {
            round += 1;
            let output = result.output.clone();
            let fixed = self.env.locks.with_workspace(self.project(), || -> Result<bool> {
                let files = self.workspace.read_files(written.iter().map(String::as_str))?;
                let outcome = self.agents.developer.fix_story(
                    self.env.completer,
                    ctx,
                    &FixInputs {
                        story,
                        allowed_files: contract.allowed_files().iter().cloned().collect(),
                        allowed_deps: contract.allowed_deps().iter().cloned().collect(),
                        files: &files,
                        output: &output,
                    },
                    contract,
                    baseline,
                )?;
                self.stage_completed(&story.id, Stage::Coding, &outcome);
                match outcome.into_usable() {
                    Ok(files) => {
                        written.extend(self.workspace.write_files(&files)?);
                        Ok(true)
                    }
                    Err(failure) => {
                        warn!(round, category = failure.category.as_str(), "fix pass failed");
                        Ok(false)
                    }
                }
            })?;
            if !fixed {
                break;
            }
            result = self.run_tests(&story.id, &format!("fix {round}"), stack, &test_paths)?;
        }

        let failure = result.reason.map(|reason| {
            let diagnostic = match reason {
                VerificationFailure::Failures => {
                    format!("{} of {} tests failed", result.failed, result.attempted)
                }
                VerificationFailure::Timeout => "test run timed out".to_string(),
                VerificationFailure::NoTests => "no test results were reported".to_string(),
                VerificationFailure::NoStack => result.output.trim().to_string(),
            };
            ctx.note(format!("verification: {diagnostic}"));
            StoryFailure::new(FailureCategory::Verification, diagnostic)
        });
        Ok(Verdict {
            failure,
            verification: Some(result),
        })
    }

    fn run_tests(
        &self,
        story_id: &str,
        label: &str,
        stack: Option<&StackMetadata>,
        tests: &[String],
    ) -> Result<VerificationResult> {
        let result = dispatch(
            self.env.runner,
            &self.env.config.verification,
            stack,
            self.workspace.root().to_path_buf(),
            tests,
        )?;
        append_verification_log(
            &self.env.paths.sprint_log_path(self.sprint_id),
            story_id,
            label,
            &result,
        )?;
        self.emit(
            Some(story_id),
            Stage::Verification,
            EventKind::VerificationResult {
                attempted: result.attempted,
                passed: result.passed,
                failed: result.failed,
                reason: result.reason,
            },
        );
        Ok(result)
    }

    /// Record an infrastructure failure on the story in flight. Best effort:
    /// the original error is what the caller reports.
    fn abort_story(&self, backlog: &mut Backlog, story_id: &str, diagnostic: &str) {
        let result = StoryResult {
            category: Some(FailureCategory::Infrastructure),
            diagnostic: diagnostic.to_string(),
            verification: None,
        };
        let recorded = backlog
            .finish(story_id, StoryStatus::Failed, result)
            .and_then(|()| write_backlog(&self.env.paths.backlog_path, backlog));
        if let Err(err) = recorded {
            warn!(story = %story_id, err = %format!("{err:#}"), "failed to record aborted story");
        }
        self.emit(
            Some(story_id),
            Stage::Sprint,
            EventKind::StoryFinished {
                status: StoryStatus::Failed,
                category: Some(FailureCategory::Infrastructure),
            },
        );
    }

    fn finish(&self, report: &mut SprintReport) -> Result<()> {
        report.finished_at = now();
        write_report(&self.env.paths.sprint_report_path(self.sprint_id), report)?;
        let done = report.count(StoryStatus::Done);
        let failed = report.count(StoryStatus::Failed);
        info!(done, failed, cancelled = report.cancelled, "sprint finished");
        self.emit(
            None,
            Stage::Sprint,
            EventKind::SprintFinished {
                done,
                failed,
                cancelled: report.cancelled,
            },
        );
        Ok(())
    }
}
