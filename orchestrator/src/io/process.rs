//! Child processes with a wall-clock timeout and bounded captured output.
//!
//! Used by the command completer, the verification runner and task commands.
//! A child that outlives its timeout is killed before this returns.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, with truncation notices, for logs and parsers.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr_text());
        }
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        text
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

/// Build a `Command` from an argv vector, running in `workdir`.
pub fn command_from_argv(argv: &[String], workdir: &Path) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command is empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir);
    Ok(cmd)
}

/// `sh -c <script>` in `workdir`.
pub fn shell_command(script: &str, workdir: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(workdir);
    cmd
}

/// How long reader threads get to finish after the child has exited.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child runs in its own process group; on timeout the whole group is
/// killed. Both pipes are drained on reader threads and stdin is fed from a
/// writer thread, so neither side can hold the clock. Bytes beyond
/// `output_limit_bytes` per stream are counted and discarded.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, program = ?cmd.get_program(), "failed to spawn command");
            return Err(err).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = StreamReader::spawn(stdout, output_limit_bytes);
    let stderr_reader = StreamReader::spawn(stderr, output_limit_bytes);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        thread::spawn(move || {
            // A child that exits without reading stdin is reported through its status.
            if let Err(err) = child_stdin.write_all(&input) {
                warn!(err = %err, "failed to write full stdin to child");
            }
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing process group");
            timed_out = true;
            kill_tree(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    // Descendants that outlive the child keep the pipes open; stop them too.
    if !(stdout_reader.wait(READER_GRACE) && stderr_reader.wait(READER_GRACE)) {
        warn!("output pipes still open after exit, killing process group");
        kill_group(child.id());
    }
    let (stdout, stdout_truncated) = stdout_reader.finish(READER_GRACE).context("read stdout")?;
    let (stderr, stderr_truncated) = stderr_reader.finish(READER_GRACE).context("read stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    kill_group(child.id());
    match child.kill() {
        Err(err) if err.kind() != std::io::ErrorKind::InvalidInput => Err(err),
        _ => Ok(()),
    }
}

/// SIGKILL the process group led by `pid`. Missing groups are ignored.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pid: u32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only signals the group; no memory is shared.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Whether a process with this pid exists. Signal 0 delivers nothing.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) with signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

/// Drains one pipe on a thread into a shared buffer, so whatever arrived can
/// be taken even if the pipe never closes.
struct StreamReader {
    captured: Arc<Mutex<Captured>>,
    handle: thread::JoinHandle<Result<()>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize) -> Self {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&captured);
        let handle = thread::spawn(move || read_stream_limited(reader, limit, &sink));
        Self { captured, handle }
    }

    /// Whether the pipe closed within `grace`.
    fn wait(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    fn finish(self, grace: Duration) -> Result<(Vec<u8>, usize)> {
        if self.wait(grace) {
            match self.handle.join() {
                Ok(result) => result?,
                Err(_) => return Err(anyhow!("output reader thread panicked")),
            }
        } else {
            warn!("output reader still blocked; keeping bytes read so far");
        }
        let mut captured = self.captured.lock().unwrap_or_else(PoisonError::into_inner);
        let captured = std::mem::take(&mut *captured);
        Ok((captured.bytes, captured.truncated))
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Captured>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let keep = n.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_feeds_stdin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = command_from_argv(&["cat".to_string()], dir.path()).expect("argv");
        let output = run_command_with_timeout(cmd, Some(b"hello"), Duration::from_secs(10), 1024)
            .expect("run cat");
        assert!(output.success());
        assert_eq!(output.stdout_text(), "hello");
    }

    #[test]
    fn kills_child_after_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("sleep 5", dir.path());
        let output =
            run_command_with_timeout(cmd, None, Duration::from_millis(200), 1024).expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("sleep 30; echo done", dir.path());
        let started = Instant::now();
        let output =
            run_command_with_timeout(cmd, None, Duration::from_millis(200), 1024).expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!output.stdout_text().contains("done"));
    }

    #[test]
    fn unread_stdin_does_not_hold_the_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("sleep 30", dir.path());
        let input = vec![b'x'; 4 * 1024 * 1024];
        let started = Instant::now();
        let output = run_command_with_timeout(cmd, Some(&input), Duration::from_millis(200), 1024)
            .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn background_child_does_not_block_after_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("echo started; sleep 30 &", dir.path());
        let started = Instant::now();
        let output = run_command_with_timeout(cmd, None, Duration::from_secs(20), 1024).expect("run");
        assert!(!output.timed_out);
        assert!(output.stdout_text().contains("started"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("printf 'abcdefghij'", dir.path());
        let output = run_command_with_timeout(cmd, None, Duration::from_secs(10), 4).expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.combined_text().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn empty_argv_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(command_from_argv(&[], dir.path()).is_err());
    }
}
