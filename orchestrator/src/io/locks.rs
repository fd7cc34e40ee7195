//! Per-project mutual exclusion for workspace mutation and sprint runs.
//!
//! The workspace lock is in-process. The active-sprint marker is a lock file
//! in the project directory, so a rollback from another process sees it too.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::io::init::ProjectPaths;
use crate::io::process::process_alive;

/// Registry of per-project workspace locks. Share one instance (behind `Arc`) per process.
#[derive(Debug, Default)]
pub struct ProjectLocks {
    projects: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, project: &str) -> Arc<Mutex<()>> {
        let mut projects = self
            .projects
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(projects.entry(project.to_string()).or_default())
    }

    /// Run `f` while holding the project's workspace lock.
    pub fn with_workspace<T>(&self, project: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.entry(project);
        let _guard: MutexGuard<'_, ()> = lock.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(project, "workspace lock acquired");
        f()
    }

    /// Mark a sprint as running on the project until the guard drops.
    ///
    /// A lock file left by a process that no longer exists is taken over.
    pub fn begin_sprint(&self, paths: &ProjectPaths) -> Result<SprintGuard> {
        let path = paths.sprint_lock_path();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("write {}", path.display()))?;
                    debug!(project = %paths.project, "sprint lock taken");
                    return Ok(SprintGuard { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if lock_owner_alive(&path) {
                        return Err(anyhow!(
                            "a sprint is already running for project '{}'",
                            paths.project
                        ));
                    }
                    warn!(path = %path.display(), "removing stale sprint lock");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => {
                            return Err(err)
                                .with_context(|| format!("remove stale {}", path.display()));
                        }
                    }
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create {}", path.display()));
                }
            }
        }
    }

    pub fn is_sprint_active(&self, paths: &ProjectPaths) -> bool {
        let path = paths.sprint_lock_path();
        path.exists() && lock_owner_alive(&path)
    }
}

/// Unreadable or malformed lock files count as held.
fn lock_owner_alive(path: &std::path::Path) -> bool {
    match fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse::<u32>()
            .map_or(true, process_alive),
        Err(err) => err.kind() != ErrorKind::NotFound,
    }
}

/// Removes the project's sprint lock file on drop.
#[derive(Debug)]
pub struct SprintGuard {
    path: PathBuf,
}

impl Drop for SprintGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to remove sprint lock");
        }
    }
}
