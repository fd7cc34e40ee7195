//! Sprint execution orchestrator CLI.
//!
//! Manages projects under a root directory (`orchestrator.toml`, `projects/`,
//! `workspaces/`), runs sprints over a project's backlog, and exposes the
//! extractor and breakdown validator for inspecting raw agent output.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use orchestrator::backlog::Story;
use orchestrator::core::breakdown::validate_breakdown;
use orchestrator::core::extract::extract_structured;
use orchestrator::exit_codes;
use orchestrator::io::backlog_store::{load_backlog, write_backlog};
use orchestrator::io::completer::CommandCompleter;
use orchestrator::io::config::{load_config, write_config};
use orchestrator::io::events::EventBus;
use orchestrator::io::init::{InitOptions, ProjectPaths, config_path, init_project};
use orchestrator::io::locks::ProjectLocks;
use orchestrator::io::snapshot::SnapshotManager;
use orchestrator::io::verify::ProcessTestRunner;
use orchestrator::logging;
use orchestrator::sprint::{SprintEnv, next_sprint_id, run_sprint};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Run backlog stories through architect, developer and verification agents"
)]
struct Cli {
    /// Directory holding `orchestrator.toml`, `projects/` and `workspaces/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Log stage progress to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the project layout, an empty backlog and default persona files.
    Init {
        project: String,
        /// Reset an existing project's backlog and personas.
        #[arg(short, long)]
        force: bool,
    },
    /// Append a pending story to the backlog.
    AddStory {
        project: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        title: Option<String>,
        /// Acceptance criterion (repeatable).
        #[arg(long = "criterion")]
        criteria: Vec<String>,
    },
    /// Run every pending story of the backlog.
    Sprint {
        project: String,
        /// Sprint number (default: one past the latest sprint directory).
        #[arg(long)]
        sprint: Option<u32>,
    },
    /// Capture a snapshot of the project for a sprint.
    Snapshot {
        project: String,
        #[arg(long)]
        sprint: u32,
    },
    /// List snapshots, oldest sprint first.
    Snapshots { project: String },
    /// Restore a snapshot and drop every later sprint.
    Rollback { project: String, backup_id: String },
    /// Print the structured record recovered from a file of agent output.
    Extract { file: PathBuf },
    /// Extract and validate an architect breakdown for a story.
    CheckBreakdown {
        file: PathBuf,
        #[arg(long)]
        story: String,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root;
    match cli.command {
        Command::Init { project, force } => cmd_init(&root, &project, force),
        Command::AddStory {
            project,
            id,
            description,
            title,
            criteria,
        } => cmd_add_story(&root, &project, id, description, title, criteria),
        Command::Sprint { project, sprint } => cmd_sprint(&root, &project, sprint),
        Command::Snapshot { project, sprint } => cmd_snapshot(&root, &project, sprint),
        Command::Snapshots { project } => cmd_snapshots(&root, &project),
        Command::Rollback { project, backup_id } => cmd_rollback(&root, &project, &backup_id),
        Command::Extract { file } => cmd_extract(&file),
        Command::CheckBreakdown { file, story } => cmd_check_breakdown(&file, &story),
    }
}

fn cmd_init(root: &Path, project: &str, force: bool) -> Result<i32> {
    let paths = init_project(root, project, &InitOptions { force })?;
    println!("initialized {}", paths.project_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_add_story(
    root: &Path,
    project: &str,
    id: String,
    description: String,
    title: Option<String>,
    criteria: Vec<String>,
) -> Result<i32> {
    let paths = ProjectPaths::open(root, project)?;
    let mut backlog = load_backlog(&paths.backlog_path)?;
    let mut story = Story::new(id, description);
    story.title = title;
    story.acceptance_criteria = criteria;
    let id = story.id.clone();
    backlog.add_story(story)?;
    write_backlog(&paths.backlog_path, &backlog)?;
    println!("{id}");
    Ok(exit_codes::OK)
}

fn cmd_sprint(root: &Path, project: &str, sprint: Option<u32>) -> Result<i32> {
    let paths = ProjectPaths::open(root, project)?;
    let config_file = config_path(root);
    let config = load_config(&config_file)?;
    if !config_file.exists() {
        write_config(&config_file, &config)?;
    }
    let sprint_id = match sprint {
        Some(id) => id,
        None => next_sprint_id(&paths)?,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        eprintln!("cancelling after the current story...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl+C handler")?;

    let completer = CommandCompleter::new(&config.agent, &paths.workspace_dir);
    let env = SprintEnv {
        paths: &paths,
        config: &config,
        completer: &completer,
        runner: &ProcessTestRunner,
        locks: Arc::new(ProjectLocks::new()),
        events: EventBus::new(config.events.capacity),
        cancel,
    };
    let report = run_sprint(&env, sprint_id)?;

    for story in &report.stories {
        let category = story.category.map_or("-", |category| category.as_str());
        println!("{}\t{}\t{}", story.story_id, story.status.as_str(), category);
    }
    println!(
        "sprint {}: backup {}",
        report.sprint_id,
        report.backup_id.as_deref().unwrap_or("-")
    );
    Ok(if report.cancelled {
        exit_codes::CANCELLED
    } else if report.all_done() {
        exit_codes::OK
    } else {
        exit_codes::STORIES_FAILED
    })
}

fn snapshots(root: &Path, project: &str) -> Result<SnapshotManager> {
    let paths = ProjectPaths::open(root, project)?;
    Ok(SnapshotManager::new(paths, Arc::new(ProjectLocks::new())))
}

fn cmd_snapshot(root: &Path, project: &str, sprint: u32) -> Result<i32> {
    let manifest = snapshots(root, project)?.capture(sprint)?;
    println!("{}", manifest.backup_id);
    Ok(exit_codes::OK)
}

fn cmd_snapshots(root: &Path, project: &str) -> Result<i32> {
    for manifest in snapshots(root, project)?.list()? {
        println!(
            "sprint-{}\t{}\t{}\t{}",
            manifest.sprint_id,
            manifest.backup_id,
            manifest.created_at,
            manifest.items.join(",")
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_rollback(root: &Path, project: &str, backup_id: &str) -> Result<i32> {
    let manager = snapshots(root, project)?;
    if manager.find(backup_id)?.is_none() {
        eprintln!("snapshot '{backup_id}' not found");
        return Ok(exit_codes::NOT_FOUND);
    }
    let report = manager.rollback(backup_id)?;
    println!(
        "restored sprint {} from {}: {} restored, {} removed",
        report.sprint_id,
        report.backup_id,
        report.restored.len(),
        report.removed.len()
    );
    for sprint in &report.pruned_sprints {
        println!("pruned sprint-{sprint}");
    }
    Ok(exit_codes::OK)
}

fn read_input(file: &Path) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("read {}", file.display()))
}

fn cmd_extract(file: &Path) -> Result<i32> {
    let Some(record) = extract_structured(&read_input(file)?) else {
        eprintln!("no structured record found in {}", file.display());
        return Ok(exit_codes::NOT_FOUND);
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&record).context("serialize record")?
    );
    Ok(exit_codes::OK)
}

fn cmd_check_breakdown(file: &Path, story: &str) -> Result<i32> {
    let Some(record) = extract_structured(&read_input(file)?) else {
        eprintln!("no structured record found in {}", file.display());
        return Ok(exit_codes::NOT_FOUND);
    };
    let check = validate_breakdown(&record, story);
    for correction in &check.corrections {
        eprintln!("corrected: {correction}");
    }
    for violation in &check.violations {
        eprintln!("{:?}: {violation}", violation.severity);
    }
    if let Some(breakdown) = &check.breakdown {
        println!(
            "{}",
            serde_json::to_string_pretty(breakdown).context("serialize breakdown")?
        );
    }
    Ok(if check.is_accepted() {
        exit_codes::OK
    } else {
        exit_codes::STORIES_FAILED
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["orchestrator", "init", "demo", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn root_is_global() {
        let cli = Cli::parse_from(["orchestrator", "sprint", "demo", "--root", "/tmp/x"]);
        assert_eq!(cli.root, PathBuf::from("/tmp/x"));
        assert!(matches!(cli.command, Command::Sprint { sprint: None, .. }));
    }

    #[test]
    fn parse_add_story_with_criteria() {
        let cli = Cli::parse_from([
            "orchestrator",
            "add-story",
            "demo",
            "--id",
            "S-1",
            "--description",
            "register users",
            "--criterion",
            "returns 201",
            "--criterion",
            "rejects duplicates",
        ]);
        let Command::AddStory { criteria, .. } = cli.command else {
            panic!("expected add-story");
        };
        assert_eq!(criteria, vec!["returns 201", "rejects duplicates"]);
    }
}
