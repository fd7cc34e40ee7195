//! Storage layout under the orchestrator root and project scaffolding.
//!
//! ```text
//! <root>/orchestrator.toml
//! <root>/projects/<project>/{backlog.json, stack.json, design/, personas/, sprints/, snapshots/}
//! <root>/workspaces/<project>/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::backlog::Backlog;
use crate::io::backlog_store::write_backlog;
use crate::io::config::{OrchestratorConfig, write_config};
use crate::io::prompt::Persona;

pub const CONFIG_FILE: &str = "orchestrator.toml";

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// All canonical paths for one project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub project: String,
    pub project_dir: PathBuf,
    pub backlog_path: PathBuf,
    pub stack_path: PathBuf,
    pub design_dir: PathBuf,
    pub personas_dir: PathBuf,
    pub sprints_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub workspace_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>, project: &str) -> Self {
        let root = root.into();
        let project_dir = root.join("projects").join(project);
        Self {
            workspace_dir: root.join("workspaces").join(project),
            backlog_path: project_dir.join("backlog.json"),
            stack_path: project_dir.join("stack.json"),
            design_dir: project_dir.join("design"),
            personas_dir: project_dir.join("personas"),
            sprints_dir: project_dir.join("sprints"),
            snapshots_dir: project_dir.join("snapshots"),
            project_dir,
            project: project.to_string(),
            root,
        }
    }

    /// Resolve an existing project, failing when it was never initialized.
    pub fn open(root: impl Into<PathBuf>, project: &str) -> Result<Self> {
        validate_project_name(project)?;
        let paths = Self::new(root, project);
        if !paths.backlog_path.is_file() {
            return Err(anyhow!(
                "project '{project}' not found (run `orchestrator init {project}`)"
            ));
        }
        Ok(paths)
    }

    pub fn config_path(&self) -> PathBuf {
        config_path(&self.root)
    }

    pub fn sprint_dir(&self, sprint_id: u32) -> PathBuf {
        self.sprints_dir.join(sprint_dir_name(sprint_id))
    }

    pub fn sprint_tasks_path(&self, sprint_id: u32) -> PathBuf {
        self.sprint_dir(sprint_id).join("tasks.json")
    }

    pub fn sprint_log_path(&self, sprint_id: u32) -> PathBuf {
        self.sprint_dir(sprint_id).join("verification.log")
    }

    pub fn sprint_report_path(&self, sprint_id: u32) -> PathBuf {
        self.sprint_dir(sprint_id).join("report.json")
    }

    /// Present while a sprint runs on the project, holding the owner's pid.
    pub fn sprint_lock_path(&self) -> PathBuf {
        self.project_dir.join(".sprint.lock")
    }

    pub fn snapshot_sprint_dir(&self, sprint_id: u32) -> PathBuf {
        self.snapshots_dir.join(sprint_dir_name(sprint_id))
    }
}

pub fn sprint_dir_name(sprint_id: u32) -> String {
    format!("sprint-{sprint_id}")
}

/// Parse `sprint-<n>` back into its number.
pub fn parse_sprint_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix("sprint-")?.parse().ok()
}

/// Project names become directory names, so keep them to `[A-Za-z0-9._-]`.
pub fn validate_project_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("project name must not be empty"));
    }
    if name == "." || name == ".." {
        return Err(anyhow!("project name must not be '.' or '..'"));
    }
    if name
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!(
            "project name must be [A-Za-z0-9._-] only (got '{name}')"
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, reset the backlog and persona files of an existing project.
    pub force: bool,
}

/// Create the project directories, an empty backlog, persona files and the
/// root config (only when missing).
///
/// Fails if the project already exists unless `options.force` is set.
pub fn init_project(root: &Path, project: &str, options: &InitOptions) -> Result<ProjectPaths> {
    validate_project_name(project)?;
    let paths = ProjectPaths::new(root, project);
    if paths.project_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: project '{project}' already exists (use --force to overwrite)"
        ));
    }
    if paths.project_dir.exists() && !paths.project_dir.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            paths.project_dir.display()
        ));
    }

    for dir in [
        &paths.project_dir,
        &paths.design_dir,
        &paths.personas_dir,
        &paths.sprints_dir,
        &paths.snapshots_dir,
        &paths.workspace_dir,
    ] {
        create_dir(dir)?;
    }

    write_backlog(&paths.backlog_path, &Backlog::new(project))?;
    for persona in Persona::ALL {
        let path = paths.personas_dir.join(persona.file_name());
        fs::write(&path, format!("{}\n", persona.fallback()))
            .with_context(|| format!("write file {}", path.display()))?;
    }
    let config = paths.config_path();
    if !config.exists() {
        write_config(&config, &OrchestratorConfig::default())?;
    }

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::backlog_store::load_backlog;
    use crate::io::config::load_config;

    /// Verifies init_project creates the storage layout, an empty backlog and the root config.
    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths =
            init_project(temp.path(), "shop", &InitOptions { force: false }).expect("init");

        assert!(paths.design_dir.is_dir());
        assert!(paths.sprints_dir.is_dir());
        assert!(paths.snapshots_dir.is_dir());
        assert!(paths.workspace_dir.is_dir());
        assert!(paths.personas_dir.join("architect.md").is_file());
        assert_eq!(
            paths.workspace_dir,
            temp.path().join("workspaces").join("shop")
        );
        assert_eq!(
            paths.sprint_log_path(3),
            temp.path().join("projects/shop/sprints/sprint-3/verification.log")
        );

        let backlog = load_backlog(&paths.backlog_path).expect("backlog");
        assert_eq!(backlog, Backlog::new("shop"));
        assert_eq!(
            load_config(&paths.config_path()).expect("config"),
            OrchestratorConfig::default()
        );
    }

    /// Verifies init refuses to overwrite an existing project without --force,
    /// and leaves an edited root config alone when forced.
    #[test]
    fn init_twice_requires_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths =
            init_project(temp.path(), "shop", &InitOptions { force: false }).expect("init");
        let err = init_project(temp.path(), "shop", &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        fs::write(paths.config_path(), "[retry]\nmax_attempts = 7\n").expect("write config");
        init_project(temp.path(), "shop", &InitOptions { force: true }).expect("re-init");
        let cfg = load_config(&paths.config_path()).expect("config");
        assert_eq!(cfg.retry.max_attempts, 7);
    }

    #[test]
    fn project_names_are_restricted() {
        assert!(validate_project_name("shop-2.0_beta").is_ok());
        assert!(validate_project_name("").is_err());
        assert!(validate_project_name("..").is_err());
        assert!(validate_project_name("a/b").is_err());
        assert!(ProjectPaths::open(Path::new("/nonexistent"), "shop").is_err());
    }

    #[test]
    fn sprint_dir_names_round_trip() {
        assert_eq!(parse_sprint_dir_name(&sprint_dir_name(12)), Some(12));
        assert_eq!(parse_sprint_dir_name("sprint-x"), None);
        assert_eq!(parse_sprint_dir_name("notes"), None);
    }
}
