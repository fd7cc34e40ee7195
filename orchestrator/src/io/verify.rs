//! Verification dispatch: pick the test command for the project stack, run it,
//! and read pass/fail counts from its output.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::test_report::parse_test_counts;
use crate::core::types::{StackMetadata, VerificationFailure, VerificationResult};
use crate::io::config::VerificationConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

pub const TESTS_PLACEHOLDER: &str = "{tests}";

#[derive(Debug, Clone)]
pub struct TestRequest {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Raw outcome of one test command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Runs test commands. Errors mean the command could not be started at all.
pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestRun>;
}

impl<R: TestRunner + ?Sized> TestRunner for &R {
    fn run(&self, request: &TestRequest) -> Result<TestRun> {
        (**self).run(request)
    }
}

/// Runs the command as a child process in the workspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTestRunner;

impl TestRunner for ProcessTestRunner {
    #[instrument(skip_all, fields(program = %request.argv.first().map_or("", String::as_str)))]
    fn run(&self, request: &TestRequest) -> Result<TestRun> {
        let cmd = command_from_argv(&request.argv, &request.workdir)?;
        let output = run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
            .context("run verification command")?;
        Ok(TestRun {
            output: output.combined_text(),
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}

/// The command template registered for the stack, or `None` when nothing applies.
///
/// Lookup order: backend (whole identifier, then each word of it), test
/// framework, then the configured default.
pub fn select_command(
    config: &VerificationConfig,
    stack: Option<&StackMetadata>,
) -> Option<Vec<String>> {
    let stack = stack.filter(|stack| !stack.is_empty());
    if let Some(stack) = stack {
        for identifier in [stack.backend.as_deref(), stack.test_framework.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Some(argv) = lookup(config, identifier) {
                return Some(argv.clone());
            }
        }
    }
    (!config.default_command.is_empty()).then(|| config.default_command.clone())
}

fn lookup<'a>(config: &'a VerificationConfig, identifier: &str) -> Option<&'a Vec<String>> {
    let whole = identifier.trim().to_ascii_lowercase();
    if let Some(argv) = config.commands.get(&whole) {
        return Some(argv);
    }
    whole
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .find_map(|word| config.commands.get(word))
}

/// Replace `{tests}` with the test paths: a bare placeholder becomes one
/// argument per path, an embedded one the space-joined list.
pub fn expand_command(template: &[String], tests: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(template.len() + tests.len());
    for arg in template {
        if arg == TESTS_PLACEHOLDER {
            argv.extend(tests.iter().cloned());
        } else if arg.contains(TESTS_PLACEHOLDER) {
            argv.push(arg.replace(TESTS_PLACEHOLDER, &tests.join(" ")));
        } else {
            argv.push(arg.clone());
        }
    }
    argv
}

/// Run the story's tests and classify the outcome.
///
/// Exit status is advisory: counts come from the output. Only a failure to
/// start the command is an error.
#[instrument(skip_all, fields(tests = test_files.len()))]
pub fn dispatch<R: TestRunner + ?Sized>(
    runner: &R,
    config: &VerificationConfig,
    stack: Option<&StackMetadata>,
    workdir: PathBuf,
    test_files: &[String],
) -> Result<VerificationResult> {
    if test_files.is_empty() {
        return Ok(VerificationResult::not_run(
            VerificationFailure::NoTests,
            "no test files were generated",
        ));
    }
    let Some(template) = select_command(config, stack) else {
        let detail = match stack.and_then(|s| s.backend.as_deref()) {
            Some(backend) => format!("no verification command registered for backend `{backend}`"),
            None => "no stack metadata recorded and no default verification command configured"
                .to_string(),
        };
        warn!(%detail, "verification skipped");
        return Ok(VerificationResult::not_run(VerificationFailure::NoStack, detail));
    };

    let request = TestRequest {
        argv: expand_command(&template, test_files),
        workdir,
        timeout: config.timeout(),
        output_limit_bytes: config.output_limit_bytes,
    };
    debug!(argv = ?request.argv, "running verification");
    let run = runner.run(&request)?;

    let counts = parse_test_counts(&run.output);
    let (passed, failed) = counts.map_or((0, 0), |(_, c)| (c.passed, c.failed));
    let attempted = passed + failed;
    let reason = if run.timed_out {
        Some(VerificationFailure::Timeout)
    } else if attempted == 0 {
        Some(VerificationFailure::NoTests)
    } else if failed > 0 {
        Some(VerificationFailure::Failures)
    } else {
        None
    };
    if reason.is_none() && run.exit_code != Some(0) {
        warn!(exit_code = ?run.exit_code, "tests passed but command exited non-zero");
    }
    info!(
        tool = counts.map_or("unknown", |(tool, _)| tool),
        attempted,
        passed,
        failed,
        reason = reason.map_or("passed", VerificationFailure::as_str),
        "verification finished"
    );
    Ok(VerificationResult {
        attempted,
        passed,
        failed,
        output: run.output,
        reason,
    })
}
