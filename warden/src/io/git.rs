//! The workspace repository, driven through the `git` binary.
//!
//! Narration reads history and status; release promotion switches branches and
//! commits single paths. Each call is a subprocess bounded by a timeout.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(60);
const GIT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// One line of `git status --porcelain=v1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// XY status code; `??` for untracked files.
    pub code: String,
    /// Path relative to the repository root (the new path for renames).
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .is_ok_and(|out| out.status.success())
    }

    pub fn init(&self) -> Result<()> {
        self.exec(&["init", "--quiet"])
    }

    /// Set a repository-local config value.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.exec(&["config", key, value])
    }

    pub fn is_tracked(&self, path: &str) -> Result<bool> {
        Ok(self
            .run(&["ls-files", "--error-unmatch", "--", path])?
            .status
            .success())
    }

    /// Name of the checked-out branch. A detached HEAD is an error.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let name = self.stdout(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = name.trim();
        if name == "HEAD" {
            warn!("workspace HEAD is detached");
            return Err(anyhow!("detached HEAD"));
        }
        Ok(name.to_string())
    }

    /// Full SHA of HEAD, or `None` before the first commit.
    pub fn head_sha(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        Ok(out
            .status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Tracked changes and untracked files, one entry per path.
    pub fn status(&self) -> Result<Vec<StatusEntry>> {
        self.stdout(&["status", "--porcelain=v1", "-uall"])?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// `--oneline` entries for commits made after `since` (all of history when `None`).
    pub fn log_oneline_since(&self, since: Option<&str>) -> Result<Vec<String>> {
        if self.head_sha()?.is_none() {
            return Ok(Vec::new());
        }
        let range = since.map_or_else(|| "HEAD".to_string(), |sha| format!("{sha}..HEAD"));
        Ok(lines(&self.stdout(&["log", "--oneline", "--no-decorate", &range])?))
    }

    /// The newest `limit` commits as `--oneline` entries.
    pub fn recent_log(&self, limit: usize) -> Result<Vec<String>> {
        if self.head_sha()?.is_none() {
            return Ok(Vec::new());
        }
        let count = format!("--max-count={limit}");
        Ok(lines(&self.stdout(&["log", "--oneline", "--no-decorate", &count])?))
    }

    /// Paths touched by commits after `since` plus anything uncommitted. Sorted, unique.
    pub fn changed_files_since(&self, since: Option<&str>) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        if let Some(sha) = since
            && self.head_sha()?.is_some()
        {
            let range = format!("{sha}..HEAD");
            paths.extend(lines(&self.stdout(&["diff", "--name-only", &range])?));
        }
        paths.extend(self.status()?.into_iter().map(|entry| entry.path));
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        Ok(self
            .run(&["show-ref", "--verify", "--quiet", &reference])?
            .status
            .success())
    }

    /// Create `branch` at HEAD and switch to it.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating branch");
        self.exec(&["checkout", "--quiet", "-b", branch])
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "switching branch");
        self.exec(&["checkout", "--quiet", branch])
    }

    /// Switch to `branch`, throwing away local changes that would block it.
    #[instrument(skip_all, fields(branch))]
    pub fn force_checkout(&self, branch: &str) -> Result<()> {
        warn!(branch, "forcing checkout");
        self.exec(&["checkout", "--quiet", "--force", branch])
    }

    pub fn add_paths(&self, paths: &[&str]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.exec(&args)
    }

    /// Commit only `path`, leaving the rest of the index alone.
    ///
    /// Returns Ok(false) when the staged copy of `path` matches HEAD.
    pub fn commit_path(&self, message: &str, path: &str) -> Result<bool> {
        if self
            .run(&["diff", "--cached", "--quiet", "--", path])?
            .status
            .success()
        {
            debug!(path, "nothing staged for path");
            return Ok(false);
        }
        self.exec(&["commit", "--quiet", "-m", message, "--", path])?;
        Ok(true)
    }

    /// Bootstrap commit for a fresh repository.
    pub fn commit_allow_empty(&self, message: &str) -> Result<()> {
        self.exec(&["commit", "--quiet", "--allow-empty", "-m", message])
    }

    /// Bytes of `path` as stored at `rev`.
    pub fn show_file(&self, rev: &str, path: &str) -> Result<Vec<u8>> {
        let object = format!("{rev}:{path}");
        Ok(self.checked(&["show", &object])?.stdout)
    }

    fn exec(&self, args: &[&str]) -> Result<()> {
        self.checked(args).map(drop)
    }

    fn stdout(&self, args: &[&str]) -> Result<String> {
        let out = self.checked(args)?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Run git and require a zero exit within the timeout.
    fn checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let out = self.run(args)?;
        let command = args.join(" ");
        if out.timed_out {
            return Err(anyhow!("git {command} timed out after {}s", self.timeout.as_secs()));
        }
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("git {command} failed: {}", stderr.trim()));
        }
        Ok(out)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, self.timeout, GIT_OUTPUT_LIMIT_BYTES)
            .map_err(|err| err.context(format!("git {}", args.join(" "))))
    }
}

fn lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    let (code, rest) = match (line.get(..2), line.get(3..)) {
        (Some(code), Some(rest)) if !rest.trim().is_empty() => (code, rest),
        _ => return Err(anyhow!("malformed status line '{line}'")),
    };
    let path = rest.rsplit_once(" -> ").map_or(rest, |(_, new)| new).trim();
    Ok(StatusEntry {
        code: code.to_string(),
        path: path.to_string(),
    })
}
