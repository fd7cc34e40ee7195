//! Live completion backend: pipe the rendered conversation into a command.
//!
//! The configured command (for example `claude -p`) reads the transcript on
//! stdin and prints the reply on stdout. Non-zero exits, timeouts and empty
//! replies are infrastructure failures.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::conversation::{Completer, Conversation};
use crate::io::config::AgentConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Completer that spawns one process per completion.
#[derive(Debug, Clone)]
pub struct CommandCompleter {
    argv: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandCompleter {
    pub fn new(config: &AgentConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            argv: config.command.clone(),
            workdir: workdir.into(),
            timeout: config.timeout(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl Completer for CommandCompleter {
    #[instrument(skip_all, fields(program = %self.argv.first().map_or("", String::as_str), turns = conversation.messages.len()))]
    fn complete(&self, conversation: &Conversation) -> Result<String> {
        let transcript = conversation.render_transcript();
        info!(bytes = transcript.len(), "requesting completion");
        let cmd = command_from_argv(&self.argv, &self.workdir)?;
        let output = run_command_with_timeout(
            cmd,
            Some(transcript.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run completion command")?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "completion timed out");
            return Err(anyhow!(
                "completion command timed out after {:?}",
                self.timeout
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "completion command failed");
            return Err(anyhow!(
                "completion command failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            ));
        }
        let reply = output.stdout_text();
        if reply.trim().is_empty() {
            return Err(anyhow!("completion command returned an empty reply"));
        }
        debug!(bytes = reply.len(), truncated = output.stdout_truncated, "completion received");
        Ok(reply)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn completer(argv: &[&str], timeout_secs: u64) -> CommandCompleter {
        let config = AgentConfig {
            command: argv.iter().map(|s| s.to_string()).collect(),
            timeout_secs,
            output_limit_bytes: 10_000,
        };
        CommandCompleter::new(&config, std::env::temp_dir())
    }

    #[test]
    fn transcript_is_piped_on_stdin() {
        let reply = completer(&["cat"], 10)
            .complete(&Conversation::new("persona", "plan the story"))
            .expect("complete");
        assert!(reply.contains("# System"));
        assert!(reply.contains("plan the story"));
    }

    #[test]
    fn failing_command_is_an_error() {
        let err = completer(&["sh", "-c", "echo boom >&2; exit 3"], 10)
            .complete(&Conversation::new("", "x"))
            .expect_err("failure");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn empty_reply_is_an_error() {
        let err = completer(&["true"], 10)
            .complete(&Conversation::new("", "x"))
            .expect_err("empty");
        assert!(err.to_string().contains("empty reply"));
    }

    #[test]
    fn timeout_is_an_error() {
        let err = completer(&["sleep", "5"], 1)
            .complete(&Conversation::new("", "x"))
            .expect_err("timeout");
        assert!(err.to_string().contains("timed out"));
    }
}
