//! Sprint snapshots and rollback.
//!
//! A snapshot lives in `snapshots/sprint-<n>/<backup_id>/` and is written to a
//! hidden `.partial` sibling first, so a directory with a manifest is always
//! complete. Snapshots are never modified after capture.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{SecondsFormat, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::io::atomic::{copy_tree, remove_file, remove_tree, write_json_atomic};
use crate::io::init::{ProjectPaths, parse_sprint_dir_name};
use crate::io::locks::ProjectLocks;

const MANIFEST_FILE: &str = "manifest.json";
const BACKLOG_ITEM: &str = "backlog.json";
const TASKS_ITEM: &str = "tasks.json";
const LOG_ITEM: &str = "verification.log";
const REPORT_ITEM: &str = "report.json";
const DESIGN_ITEM: &str = "design";
const WORKSPACE_ITEM: &str = "workspace";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotManifest {
    pub backup_id: String,
    pub created_at: String,
    pub sprint_id: u32,
    pub project: String,
    /// Captured item names, in capture order.
    pub items: Vec<String>,
}

impl SnapshotManifest {
    pub fn has(&self, item: &str) -> bool {
        self.items.iter().any(|i| i == item)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub backup_id: String,
    pub sprint_id: u32,
    pub restored: Vec<String>,
    pub removed: Vec<String>,
    pub pruned_sprints: Vec<u32>,
    pub pruned_snapshots: Vec<u32>,
}

pub struct SnapshotManager {
    paths: ProjectPaths,
    locks: Arc<ProjectLocks>,
}

impl SnapshotManager {
    pub fn new(paths: ProjectPaths, locks: Arc<ProjectLocks>) -> Self {
        Self { paths, locks }
    }

    /// Capture the sprint's breakdowns, log and report (when present), the
    /// backlog, design assets and the whole workspace.
    #[instrument(skip_all, fields(project = %self.paths.project, sprint_id = sprint_id))]
    pub fn capture(&self, sprint_id: u32) -> Result<SnapshotManifest> {
        self.locks
            .with_workspace(&self.paths.project, || self.capture_locked(sprint_id))
    }

    fn capture_locked(&self, sprint_id: u32) -> Result<SnapshotManifest> {
        let backup_id = generate_backup_id();
        let sprint_dir = self.paths.snapshot_sprint_dir(sprint_id);
        let final_dir = sprint_dir.join(&backup_id);
        let staging = sprint_dir.join(format!(".{backup_id}.partial"));

        let result = self.write_snapshot(&staging, &backup_id, sprint_id);
        let manifest = match result {
            Ok(manifest) => manifest,
            Err(err) => {
                if let Err(cleanup) = remove_tree(&staging) {
                    warn!(err = %cleanup, "failed to remove partial snapshot");
                }
                return Err(err);
            }
        };
        fs::rename(&staging, &final_dir)
            .with_context(|| format!("finalize snapshot {}", final_dir.display()))?;
        info!(backup_id = %manifest.backup_id, items = ?manifest.items, "snapshot captured");
        Ok(manifest)
    }

    fn write_snapshot(&self, dir: &Path, backup_id: &str, sprint_id: u32) -> Result<SnapshotManifest> {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        let mut items = Vec::new();

        if !self.paths.backlog_path.is_file() {
            bail!("backlog missing at {}", self.paths.backlog_path.display());
        }
        copy_file(&self.paths.backlog_path, &dir.join(BACKLOG_ITEM))?;
        items.push(BACKLOG_ITEM.to_string());

        for (item, source) in self.sprint_files(sprint_id) {
            if source.is_file() {
                copy_file(&source, &dir.join(item))?;
                items.push(item.to_string());
            }
        }

        if self.paths.design_dir.is_dir() {
            copy_tree(&self.paths.design_dir, &dir.join(DESIGN_ITEM))?;
            items.push(DESIGN_ITEM.to_string());
        }

        let workspace = dir.join(WORKSPACE_ITEM);
        if self.paths.workspace_dir.is_dir() {
            copy_tree(&self.paths.workspace_dir, &workspace)?;
        } else {
            fs::create_dir_all(&workspace)
                .with_context(|| format!("create directory {}", workspace.display()))?;
        }
        items.push(WORKSPACE_ITEM.to_string());

        let manifest = SnapshotManifest {
            backup_id: backup_id.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            sprint_id,
            project: self.paths.project.clone(),
            items,
        };
        write_json_atomic(&dir.join(MANIFEST_FILE), &manifest)?;
        Ok(manifest)
    }

    fn sprint_files(&self, sprint_id: u32) -> [(&'static str, PathBuf); 3] {
        [
            (TASKS_ITEM, self.paths.sprint_tasks_path(sprint_id)),
            (LOG_ITEM, self.paths.sprint_log_path(sprint_id)),
            (REPORT_ITEM, self.paths.sprint_report_path(sprint_id)),
        ]
    }

    /// Every complete snapshot, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotManifest>> {
        let mut manifests = Vec::new();
        for (_, sprint_dir) in numbered_sprint_dirs(&self.paths.snapshots_dir)? {
            for entry in read_dir_sorted(&sprint_dir)? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') || !entry.path().is_dir() {
                    continue;
                }
                let manifest_path = entry.path().join(MANIFEST_FILE);
                if !manifest_path.is_file() {
                    continue;
                }
                manifests.push(read_manifest(&manifest_path)?);
            }
        }
        manifests.sort_by(|a, b| {
            a.sprint_id
                .cmp(&b.sprint_id)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        Ok(manifests)
    }

    pub fn find(&self, backup_id: &str) -> Result<Option<(SnapshotManifest, PathBuf)>> {
        validate_backup_id(backup_id)?;
        for (_, sprint_dir) in numbered_sprint_dirs(&self.paths.snapshots_dir)? {
            let dir = sprint_dir.join(backup_id);
            let manifest_path = dir.join(MANIFEST_FILE);
            if manifest_path.is_file() {
                return Ok(Some((read_manifest(&manifest_path)?, dir)));
            }
        }
        Ok(None)
    }

    /// Restore the project to the captured state and delete every later sprint.
    ///
    /// Refuses while a sprint is running on the project.
    #[instrument(skip_all, fields(project = %self.paths.project, backup_id = %backup_id))]
    pub fn rollback(&self, backup_id: &str) -> Result<RollbackReport> {
        self.locks.with_workspace(&self.paths.project, || {
            if self.locks.is_sprint_active(&self.paths) {
                bail!(
                    "cannot roll back project '{}' while a sprint is running",
                    self.paths.project
                );
            }
            self.rollback_locked(backup_id)
        })
    }

    fn rollback_locked(&self, backup_id: &str) -> Result<RollbackReport> {
        let (manifest, dir) = self
            .find(backup_id)?
            .ok_or_else(|| anyhow!("snapshot '{backup_id}' not found"))?;
        let sprint_id = manifest.sprint_id;
        let mut report = RollbackReport {
            backup_id: manifest.backup_id.clone(),
            sprint_id,
            restored: Vec::new(),
            removed: Vec::new(),
            pruned_sprints: Vec::new(),
            pruned_snapshots: Vec::new(),
        };

        copy_file(&dir.join(BACKLOG_ITEM), &self.paths.backlog_path)?;
        report.restored.push(BACKLOG_ITEM.to_string());

        for (item, target) in self.sprint_files(sprint_id) {
            if manifest.has(item) {
                copy_file(&dir.join(item), &target)?;
                report.restored.push(item.to_string());
            } else if target.exists() {
                remove_file(&target)?;
                report.removed.push(item.to_string());
            }
        }

        if manifest.has(DESIGN_ITEM) {
            replace_tree(&dir.join(DESIGN_ITEM), &self.paths.design_dir)?;
            report.restored.push(DESIGN_ITEM.to_string());
        } else if self.paths.design_dir.exists() {
            remove_tree(&self.paths.design_dir)?;
            report.removed.push(DESIGN_ITEM.to_string());
        }

        replace_tree(&dir.join(WORKSPACE_ITEM), &self.paths.workspace_dir)?;
        report.restored.push(WORKSPACE_ITEM.to_string());

        for (n, path) in numbered_sprint_dirs(&self.paths.sprints_dir)? {
            if n > sprint_id {
                remove_tree(&path)?;
                report.pruned_sprints.push(n);
            }
        }
        for (n, path) in numbered_sprint_dirs(&self.paths.snapshots_dir)? {
            if n > sprint_id {
                remove_tree(&path)?;
                report.pruned_snapshots.push(n);
            }
        }

        info!(
            sprint_id,
            restored = ?report.restored,
            pruned_sprints = ?report.pruned_sprints,
            "rollback complete"
        );
        Ok(report)
    }
}

/// `bk-<YYYYmmdd_HHMMSS>-<6 lowercase alphanumerics>`
fn generate_backup_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("bk-{}-{suffix}", Utc::now().format("%Y%m%d_%H%M%S"))
}

fn validate_backup_id(backup_id: &str) -> Result<()> {
    if backup_id.is_empty()
        || backup_id.starts_with('.')
        || !backup_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("invalid backup id '{backup_id}'");
    }
    Ok(())
}

fn read_manifest(path: &Path) -> Result<SnapshotManifest> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse manifest {}", path.display()))
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .map(|_| ())
        .with_context(|| format!("copy {} to {}", src.display(), dst.display()))
}

/// Replace `dst` with a copy of `src`, staging next to `dst` so a failed copy
/// leaves the current tree in place.
fn replace_tree(src: &Path, dst: &Path) -> Result<()> {
    let parent = dst
        .parent()
        .with_context(|| format!("path missing parent {}", dst.display()))?;
    let name = dst
        .file_name()
        .with_context(|| format!("path missing file name {}", dst.display()))?;
    let staging = parent.join(format!(".{}.restore", name.to_string_lossy()));
    remove_tree(&staging)?;
    if let Err(err) = copy_tree(src, &staging) {
        remove_tree(&staging)?;
        return Err(err);
    }
    remove_tree(dst)?;
    fs::rename(&staging, dst).with_context(|| format!("replace {}", dst.display()))
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("read directory {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("read directory {}", dir.display()))?;
    entries.sort_by_key(fs::DirEntry::file_name);
    Ok(entries)
}

/// `sprint-<n>` directories under `dir`, ascending by `n`.
fn numbered_sprint_dirs(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out: Vec<(u32, PathBuf)> = read_dir_sorted(dir)?
        .into_iter()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            parse_sprint_dir_name(&entry.file_name().to_string_lossy()).map(|n| (n, entry.path()))
        })
        .collect();
    out.sort_by_key(|(n, _)| *n);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::init::{InitOptions, init_project};

    fn setup() -> (tempfile::TempDir, ProjectPaths, SnapshotManager) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), "demo", &InitOptions { force: false }).expect("init");
        let manager = SnapshotManager::new(paths.clone(), Arc::new(ProjectLocks::new()));
        (temp, paths, manager)
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn backup_ids_have_stable_shape() {
        let id = generate_backup_id();
        assert!(id.starts_with("bk-"));
        assert_eq!(id.len(), "bk-20250101_120000-abcdef".len());
        assert!(validate_backup_id(&id).is_ok());
        assert!(validate_backup_id("../escape").is_err());
    }

    #[test]
    fn capture_records_only_present_items() {
        let (_temp, paths, manager) = setup();
        write(&paths.workspace_dir.join("src/app.js"), "v1");
        let manifest = manager.capture(1).expect("capture");
        assert_eq!(
            manifest.items,
            vec!["backlog.json", "design", "workspace"]
        );
        let (found, dir) = manager
            .find(&manifest.backup_id)
            .expect("find")
            .expect("present");
        assert_eq!(found, manifest);
        assert_eq!(
            fs::read_to_string(dir.join("workspace/src/app.js")).expect("read"),
            "v1"
        );
        assert_eq!(manager.list().expect("list"), vec![manifest]);
    }

    #[test]
    fn rollback_removes_files_absent_at_capture() {
        let (_temp, paths, manager) = setup();
        let manifest = manager.capture(1).expect("capture");
        write(&paths.sprint_tasks_path(1), "{}");
        write(&paths.sprint_log_path(1), "log");
        write(&paths.workspace_dir.join("new.js"), "generated");

        let report = manager.rollback(&manifest.backup_id).expect("rollback");
        assert!(!paths.sprint_tasks_path(1).exists());
        assert!(!paths.sprint_log_path(1).exists());
        assert!(!paths.workspace_dir.join("new.js").exists());
        assert!(paths.workspace_dir.is_dir());
        assert_eq!(report.removed, vec!["tasks.json", "verification.log"]);
    }

    #[test]
    fn rollback_drops_design_dir_created_after_capture() {
        let (_temp, paths, manager) = setup();
        fs::remove_dir_all(&paths.design_dir).expect("remove design");
        let manifest = manager.capture(1).expect("capture");
        assert!(!manifest.has("design"));
        write(&paths.design_dir.join("notes.md"), "added later");

        let report = manager.rollback(&manifest.backup_id).expect("rollback");
        assert!(!paths.design_dir.exists());
        assert!(report.removed.iter().any(|item| item == "design"));
    }

    #[test]
    fn rollback_prunes_later_sprints_only() {
        let (_temp, paths, manager) = setup();
        write(&paths.sprint_log_path(1), "sprint one");
        let second = manager.capture(2).expect("capture 2");
        write(&paths.sprint_log_path(2), "sprint two");
        manager.capture(3).expect("capture 3");
        write(&paths.sprint_log_path(3), "sprint three");

        let report = manager.rollback(&second.backup_id).expect("rollback");
        assert_eq!(report.pruned_sprints, vec![3]);
        assert_eq!(report.pruned_snapshots, vec![3]);
        assert_eq!(
            fs::read_to_string(paths.sprint_log_path(1)).expect("read"),
            "sprint one"
        );
        assert!(!paths.sprint_log_path(2).exists());
        assert!(!paths.sprint_dir(3).exists());
        assert!(manager.find(&second.backup_id).expect("find").is_some());
    }

    #[test]
    fn rollback_refuses_during_active_sprint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), "demo", &InitOptions { force: false }).expect("init");
        let locks = Arc::new(ProjectLocks::new());
        let manager = SnapshotManager::new(paths.clone(), Arc::clone(&locks));
        let manifest = manager.capture(1).expect("capture");
        let _guard = locks.begin_sprint(&paths).expect("begin");
        let err = manager.rollback(&manifest.backup_id).expect_err("active");
        assert!(err.to_string().contains("while a sprint is running"));
    }

    #[test]
    fn unknown_backup_is_an_error() {
        let (_temp, _paths, manager) = setup();
        let err = manager.rollback("bk-missing").expect_err("missing");
        assert!(err.to_string().contains("not found"));
    }
}
