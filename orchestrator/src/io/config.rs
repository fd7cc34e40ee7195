//! Orchestrator configuration stored at `<root>/orchestrator.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::io::atomic::write_atomic;

/// Orchestrator configuration (TOML).
///
/// Edited by humans; every section and field has a default so a missing file
/// or a partial file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub agent: AgentConfig,
    pub retry: RetryConfig,
    pub sprint: SprintConfig,
    pub verification: VerificationConfig,
    pub prompts: PromptConfig,
    pub events: EventConfig,
}

/// How the completion service is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command that reads a rendered conversation on stdin and prints the reply.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per agent stage, including the first.
    pub max_attempts: u32,
    /// Re-prompt the developer with contract violations instead of failing at once.
    pub contract_feedback: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            contract_feedback: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }
}

/// What happens to the rest of a story when one task fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskFailurePolicy {
    /// Run the remaining tasks; the story still ends failed.
    #[default]
    Continue,
    /// Stop the story at the first failed task.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SprintConfig {
    pub on_task_failure: TaskFailurePolicy,
    /// Developer fix passes after failing verification.
    pub verification_retries: u32,
    /// Stop after this many stories (0 = all pending stories).
    pub max_stories: usize,
    pub run_task_commands: bool,
    pub task_command_timeout_secs: u64,
}

impl Default for SprintConfig {
    fn default() -> Self {
        Self {
            on_task_failure: TaskFailurePolicy::Continue,
            verification_retries: 1,
            max_stories: 0,
            run_task_commands: true,
            task_command_timeout_secs: 10 * 60,
        }
    }
}

/// Test commands keyed by backend identifier. `{tests}` expands to the test file paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Used only when no stack metadata exists. Empty means fail fast.
    pub default_command: Vec<String>,
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        let commands = [
            ("node", vec!["node", "--test", "{tests}"]),
            ("express", vec!["node", "--test", "{tests}"]),
            ("jest", vec!["npx", "jest", "--ci", "{tests}"]),
            ("vitest", vec!["npx", "vitest", "run", "{tests}"]),
            ("python", vec!["python", "-m", "pytest", "-q", "{tests}"]),
            ("flask", vec!["python", "-m", "pytest", "-q", "{tests}"]),
            ("fastapi", vec!["python", "-m", "pytest", "-q", "{tests}"]),
            ("django", vec!["python", "-m", "pytest", "-q", "{tests}"]),
            ("pytest", vec!["python", "-m", "pytest", "-q", "{tests}"]),
            ("go", vec!["go", "test", "-v", "./..."]),
            ("rust", vec!["cargo", "test"]),
        ]
        .into_iter()
        .map(|(key, argv)| {
            (
                key.to_string(),
                argv.into_iter().map(str::to_string).collect(),
            )
        })
        .collect();
        Self {
            timeout_secs: 5 * 60,
            output_limit_bytes: 200_000,
            default_command: Vec::new(),
            commands,
        }
    }
}

impl VerificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// Rendered prompts beyond this size drop optional sections first.
    pub budget_bytes: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventConfig {
    /// Progress events buffered per subscriber before the oldest are dropped.
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.sprint.task_command_timeout_secs == 0 {
            return Err(anyhow!("sprint.task_command_timeout_secs must be > 0"));
        }
        if self.verification.timeout_secs == 0 {
            return Err(anyhow!("verification.timeout_secs must be > 0"));
        }
        if self.verification.output_limit_bytes == 0 {
            return Err(anyhow!("verification.output_limit_bytes must be > 0"));
        }
        for (key, argv) in &self.verification.commands {
            if argv.is_empty() || argv[0].trim().is_empty() {
                return Err(anyhow!("verification.commands.{key} must be a non-empty array"));
            }
        }
        if self.prompts.budget_bytes == 0 {
            return Err(anyhow!("prompts.budget_bytes must be > 0"));
        }
        if self.events.capacity == 0 {
            return Err(anyhow!("events.capacity must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
        assert!(cfg.verification.default_command.is_empty());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orchestrator.toml");
        let mut cfg = OrchestratorConfig::default();
        cfg.sprint.on_task_failure = TaskFailurePolicy::Abort;
        cfg.verification.default_command = vec!["make".to_string(), "test".to_string()];
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orchestrator.toml");
        fs::write(
            &path,
            "[retry]\nmax_attempts = 5\n\n[verification.commands]\nphp = [\"phpunit\", \"{tests}\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.retry.max_attempts, 5);
        assert!(cfg.retry.contract_feedback);
        assert_eq!(cfg.verification.commands.len(), 1);
        assert_eq!(cfg.agent, AgentConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orchestrator.toml");
        fs::write(&path, "[agent]\ncommand = []\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("agent.command"));
    }
}
