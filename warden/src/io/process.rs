//! Child processes for agent commands and git, bounded in time and output.
//!
//! Every child runs in its own process group with stdin closed. On timeout, or
//! when the leader exits while background work still holds its output pipes,
//! the whole group is killed.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

const READ_CHUNK_BYTES: usize = 8 * 1024;
/// How long the pipes may stay open after the leader is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What a finished (or killed) child left behind.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes dropped from stdout after the limit was reached.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout then stderr, lossily decoded, with a note per truncated stream.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        push_truncation_note(&mut text, "stdout", self.stdout_truncated);
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        push_truncation_note(&mut text, "stderr", self.stderr_truncated);
        text
    }
}

fn push_truncation_note(text: &mut String, stream: &str, dropped: usize) {
    if dropped > 0 {
        text.push_str(&format!("\n[{stream} truncated {dropped} bytes]\n"));
    }
}

/// Bytes kept from one pipe plus the count of bytes discarded.
#[derive(Debug, Default)]
struct Captured {
    kept: Vec<u8>,
    dropped: usize,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Reader threads for both pipes, reporting over a channel so the caller
/// can stop waiting on them.
struct Drain {
    rx: Receiver<(Stream, Result<Captured>)>,
    stdout: Option<Captured>,
    stderr: Option<Captured>,
}

impl Drain {
    fn start(stdout: ChildStdout, stderr: ChildStderr, limit: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        spawn_reader(Stream::Stdout, stdout, limit, tx.clone());
        spawn_reader(Stream::Stderr, stderr, limit, tx);
        Self {
            rx,
            stdout: None,
            stderr: None,
        }
    }

    fn is_done(&self) -> bool {
        self.stdout.is_some() && self.stderr.is_some()
    }

    /// Collect results until both pipes closed or `deadline` passed.
    /// Returns whether both pipes closed.
    fn wait_until(&mut self, deadline: Instant) -> Result<bool> {
        while !self.is_done() {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok((Stream::Stdout, captured)) => self.stdout = Some(captured.context("read stdout")?),
                Ok((Stream::Stderr, captured)) => self.stderr = Some(captured.context("read stderr")?),
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("pipe reader thread exited without a result"));
                }
            }
        }
        Ok(true)
    }

    /// Whatever arrived; a pipe still held open counts as empty.
    fn finish(self) -> (Captured, Captured) {
        (self.stdout.unwrap_or_default(), self.stderr.unwrap_or_default())
    }
}

fn spawn_reader(
    stream: Stream,
    pipe: impl Read + Send + 'static,
    limit: usize,
    tx: Sender<(Stream, Result<Captured>)>,
) {
    thread::spawn(move || {
        // The receiver is gone only if the caller gave up on this pipe.
        let _ = tx.send((stream, capture(pipe, limit)));
    });
}

/// Run `cmd` to completion or until `timeout`, keeping at most
/// `output_limit_bytes` of each stream.
///
/// Pipes are drained on background threads so a chatty child never blocks on
/// a full pipe. When the leader exits but something it started keeps the pipes
/// open, the rest of the group is killed; the call never waits on a pipe past
/// the deadline plus a short grace period.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = cmd.spawn().context("spawn command")?;
    let pgid = child.id();
    debug!(pid = pgid, "child spawned");

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not captured"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not captured"))?;
    let mut drain = Drain::start(stdout, stderr, output_limit_bytes);

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;

    if !drain.wait_until(Instant::now() + DRAIN_GRACE)? {
        warn!(pgid, "leader exited but its process group holds the pipes; killing group");
        kill_group(pgid);
        if !drain.wait_until(Instant::now() + DRAIN_GRACE)? {
            warn!(pgid, "pipes still open after group kill; abandoning readers");
        }
    }
    let (stdout, stderr) = drain.finish();
    if stdout.dropped + stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "child output exceeded limit"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");

    Ok(CommandOutput {
        status,
        stdout: stdout.kept,
        stderr: stderr.kept,
        stdout_truncated: stdout.dropped,
        stderr_truncated: stderr.dropped,
        timed_out,
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for child")? {
        return Ok((status, false));
    }
    warn!(timeout_secs = timeout.as_secs(), pid = child.id(), "deadline passed, killing process group");
    kill_group(child.id());
    // The leader may already be gone with the group; only reaping matters here.
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill after group kill");
    }
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}

fn kill_group(pgid: u32) {
    let result = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pgid}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = result {
        warn!(err = %err, pgid, "could not signal process group");
    }
}

fn capture(mut pipe: impl Read, limit: usize) -> Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    loop {
        let n = pipe.read(&mut chunk).context("read child pipe")?;
        if n == 0 {
            return Ok(captured);
        }
        let room = limit.saturating_sub(captured.kept.len()).min(n);
        captured.kept.extend_from_slice(&chunk[..room]);
        captured.dropped += n - room;
    }
}
