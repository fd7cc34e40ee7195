//! Sprint artifacts under `sprints/sprint-<n>/`: breakdowns, verification log, report.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backlog::VerificationSummary;
use crate::core::types::{FailureCategory, StoryStatus, TaskBreakdown, VerificationResult};
use crate::io::atomic::write_json_atomic;

/// `tasks.json`: every breakdown produced during the sprint, keyed by story id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SprintTasks {
    pub sprint_id: u32,
    #[serde(default)]
    pub breakdowns: BTreeMap<String, TaskBreakdown>,
}

pub fn load_sprint_tasks(path: &Path) -> Result<Option<SprintTasks>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let tasks = serde_json::from_str(&contents)
        .with_context(|| format!("parse sprint tasks {}", path.display()))?;
    Ok(Some(tasks))
}

/// Add (or replace) one story's breakdown in the sprint's `tasks.json`.
pub fn record_breakdown(path: &Path, sprint_id: u32, breakdown: &TaskBreakdown) -> Result<()> {
    let mut tasks = load_sprint_tasks(path)?.unwrap_or(SprintTasks {
        sprint_id,
        breakdowns: BTreeMap::new(),
    });
    tasks
        .breakdowns
        .insert(breakdown.story_id.clone(), breakdown.clone());
    write_json_atomic(path, &tasks)
}

/// Append one verification run to the sprint's `verification.log`.
pub fn append_verification_log(
    path: &Path,
    story_id: &str,
    label: &str,
    result: &VerificationResult,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let reason = result.reason.map_or("passed", |reason| reason.as_str());
    let mut entry = format!(
        "=== {story_id} [{label}] {} attempted={} passed={} failed={} result={reason} ===\n",
        chrono::Utc::now().to_rfc3339(),
        result.attempted,
        result.passed,
        result.failed,
    );
    entry.push_str(result.output.trim_end());
    entry.push_str("\n\n");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(entry.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

/// `report.json`: the outcome of one sprint run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SprintReport {
    pub project: String,
    pub sprint_id: u32,
    pub started_at: String,
    pub finished_at: String,
    /// Backup taken before any story ran.
    pub backup_id: Option<String>,
    pub cancelled: bool,
    /// Infrastructure error that stopped the sprint.
    pub aborted: Option<String>,
    pub stories: Vec<StoryReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoryReport {
    pub story_id: String,
    pub status: StoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_written: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationSummary>,
}

impl SprintReport {
    pub fn count(&self, status: StoryStatus) -> usize {
        self.stories.iter().filter(|s| s.status == status).count()
    }

    pub fn all_done(&self) -> bool {
        !self.cancelled
            && self.aborted.is_none()
            && self.stories.iter().all(|s| s.status == StoryStatus::Done)
    }
}

pub fn write_report(path: &Path, report: &SprintReport) -> Result<()> {
    write_json_atomic(path, report)
}

pub fn load_report(path: &Path) -> Result<SprintReport> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse report {}", path.display()))
}
