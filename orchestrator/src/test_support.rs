//! Test-only doubles and fixtures: scripted completion service, scripted test
//! runner, and a throwaway project on disk.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use serde_json::json;
use tempfile::TempDir;

use crate::backlog::{Backlog, Story};
use crate::core::conversation::{Completer, Conversation};
use crate::io::backlog_store::{load_backlog, write_backlog};
use crate::io::config::OrchestratorConfig;
use crate::io::events::EventBus;
use crate::io::init::{InitOptions, ProjectPaths, init_project};
use crate::io::locks::ProjectLocks;
use crate::io::sprint_log::SprintReport;
use crate::io::verify::{TestRequest, TestRun, TestRunner};
use crate::io::workspace::Workspace;
use crate::core::types::FileSpec;
use crate::sprint::{SprintEnv, run_sprint};

/// Replies with canned responses in order and records every conversation it saw.
#[derive(Debug, Default)]
pub struct ScriptedCompleter {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    seen: Mutex<Vec<Conversation>>,
}

impl ScriptedCompleter {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_results(replies.into_iter().map(|reply| Ok(reply.into())).collect())
    }

    /// `Err` entries simulate the completion service failing.
    pub fn from_results(replies: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Conversations as they were when each completion was requested.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn assert_drained(&self) {
        assert_eq!(self.remaining(), 0, "scripted replies left unused");
    }
}

impl Completer for ScriptedCompleter {
    fn complete(&self, conversation: &Conversation) -> Result<String> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conversation.clone());
        let next = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted completer has no replies left")),
        }
    }
}

/// Returns canned test runs in order and records each request.
#[derive(Debug, Default)]
pub struct ScriptedTestRunner {
    runs: Mutex<VecDeque<TestRun>>,
    requests: Mutex<Vec<TestRequest>>,
}

impl ScriptedTestRunner {
    pub fn new(runs: Vec<TestRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A run that finished with exit code 0 and the given output.
    pub fn output(output: &str) -> TestRun {
        TestRun {
            output: output.to_string(),
            exit_code: Some(0),
            timed_out: false,
        }
    }

    pub fn timed_out(output: &str) -> TestRun {
        TestRun {
            output: output.to_string(),
            exit_code: None,
            timed_out: true,
        }
    }

    pub fn requests(&self) -> Vec<TestRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestRun> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| anyhow!("scripted test runner has no runs left"))
    }
}

/// `{ "files": [...] }` developer/verifier reply.
pub fn files_json(files: &[(&str, &str)]) -> String {
    let files: Vec<_> = files
        .iter()
        .map(|(path, content)| json!({ "path": path, "content": content }))
        .collect();
    json!({ "files": files }).to_string()
}

/// Clean architect reply: one task per `(task_id, files_to_create)` entry.
pub fn breakdown_json(story_id: &str, tasks: &[(&str, &[&str])]) -> String {
    let tasks: Vec<_> = tasks
        .iter()
        .map(|(task_id, files)| {
            json!({
                "task_id": task_id,
                "description": format!("implement {task_id}"),
                "files_to_create": files,
            })
        })
        .collect();
    json!({ "story_id": story_id, "tasks": tasks }).to_string()
}

/// Like [`breakdown_json`] with a tech stack declaring `backend`.
pub fn breakdown_with_stack(story_id: &str, backend: &str, tasks: &[(&str, &[&str])]) -> String {
    let mut value: serde_json::Value = match serde_json::from_str(&breakdown_json(story_id, tasks)) {
        Ok(value) => value,
        Err(err) => panic!("fixture breakdown is not JSON: {err}"),
    };
    value["tech_stack"] = json!({ "backend": backend, "test_framework": "node:test" });
    value.to_string()
}

/// An initialized project in a temporary root.
pub struct TestProject {
    _temp: TempDir,
    pub paths: ProjectPaths,
    pub config: OrchestratorConfig,
    pub locks: Arc<ProjectLocks>,
    pub events: EventBus,
    pub cancel: Arc<AtomicBool>,
}

impl TestProject {
    pub fn new(project: &str) -> Self {
        let temp = match tempfile::tempdir() {
            Ok(temp) => temp,
            Err(err) => panic!("tempdir: {err}"),
        };
        let paths = match init_project(temp.path(), project, &InitOptions { force: false }) {
            Ok(paths) => paths,
            Err(err) => panic!("init project: {err:#}"),
        };
        let mut config = OrchestratorConfig::default();
        config.sprint.run_task_commands = false;
        Self {
            _temp: temp,
            paths,
            config,
            locks: Arc::new(ProjectLocks::new()),
            events: EventBus::new(256),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(&self.paths.workspace_dir)
    }

    pub fn workspace_path(&self, relative: &str) -> PathBuf {
        self.paths.workspace_dir.join(relative)
    }

    pub fn backlog(&self) -> Backlog {
        match load_backlog(&self.paths.backlog_path) {
            Ok(backlog) => backlog,
            Err(err) => panic!("load backlog: {err:#}"),
        }
    }

    pub fn add_story(&self, id: &str, description: &str) {
        let mut backlog = self.backlog();
        let added = backlog
            .add_story(Story::new(id, description))
            .and_then(|()| write_backlog(&self.paths.backlog_path, &backlog));
        if let Err(err) = added {
            panic!("add story {id}: {err:#}");
        }
    }

    pub fn write_workspace(&self, files: &[(&str, &str)]) {
        let specs: Vec<FileSpec> = files
            .iter()
            .map(|(path, content)| FileSpec::new(*path, *content))
            .collect();
        if let Err(err) = self.workspace().write_files(&specs) {
            panic!("write workspace: {err:#}");
        }
    }

    pub fn run_sprint<C, R>(&self, completer: &C, runner: &R, sprint_id: u32) -> Result<SprintReport>
    where
        C: Completer + ?Sized,
        R: TestRunner + ?Sized,
    {
        let env = SprintEnv {
            paths: &self.paths,
            config: &self.config,
            completer,
            runner,
            locks: Arc::clone(&self.locks),
            events: self.events.clone(),
            cancel: Arc::clone(&self.cancel),
        };
        run_sprint(&env, sprint_id)
    }
}
