//! Tool dispatch for the agent.
//!
//! The agent affects the world only through the five tools defined here. Each
//! call resolves to a [`ToolOutcome`]: policy denials and OS errors are turned
//! into text for the model, never propagated to the caller.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::paths::{ProtectedPaths, is_within, normalize, resolve_path};
use crate::core::patterns::PatternSet;
use crate::io::config::WardenConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::provider::{API_KEY_ENV, ToolDefinition};

const JOURNAL_HEADER: &str = "# Agent Journal\n\nEntries appended by the journal tool.\n\n";

/// The closed set of tools the agent can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    CreateFile,
    ReadFile,
    RunCommand,
    ListFiles,
    Journal,
}

impl ToolKind {
    pub const ALL: [ToolKind; 5] = [
        ToolKind::CreateFile,
        ToolKind::ReadFile,
        ToolKind::RunCommand,
        ToolKind::ListFiles,
        ToolKind::Journal,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::CreateFile => "create_file",
            ToolKind::ReadFile => "read_file",
            ToolKind::RunCommand => "run_command",
            ToolKind::ListFiles => "list_files",
            ToolKind::Journal => "journal",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Whether the tool can change the filesystem. Shell commands count.
    pub fn mutates(self) -> bool {
        match self {
            ToolKind::CreateFile | ToolKind::RunCommand | ToolKind::Journal => true,
            ToolKind::ReadFile | ToolKind::ListFiles => false,
        }
    }

    fn description(self) -> &'static str {
        match self {
            ToolKind::CreateFile => {
                "Create or overwrite a file in your workspace or your own code directory. Parent directories are created."
            }
            ToolKind::ReadFile => "Read a text file. Large files are truncated.",
            ToolKind::RunCommand => {
                "Run a shell command with a time limit. Output and non-zero exit codes are returned."
            }
            ToolKind::ListFiles => "List files in a directory, optionally recursively.",
            ToolKind::Journal => "Append a timestamped entry to your journal (JOURNAL.md).",
        }
    }

    fn input_schema(self) -> Value {
        match self {
            ToolKind::CreateFile => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path, relative to the workspace or absolute"},
                    "content": {"type": "string", "description": "Full file content"}
                },
                "required": ["path", "content"]
            }),
            ToolKind::ReadFile => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path, relative to the workspace or absolute"}
                },
                "required": ["path"]
            }),
            ToolKind::RunCommand => json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to run"},
                    "cwd": {"type": "string", "description": "Working directory (defaults to the workspace)"}
                },
                "required": ["command"]
            }),
            ToolKind::ListFiles => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory to list (defaults to the workspace)"},
                    "recursive": {"type": "boolean", "description": "Descend into subdirectories"}
                }
            }),
            ToolKind::Journal => json!({
                "type": "object",
                "properties": {
                    "entry": {"type": "string", "description": "Markdown text of the entry"}
                },
                "required": ["entry"]
            }),
        }
    }

    pub fn definition(self) -> ToolDefinition {
        ToolDefinition {
            name: self.name(),
            description: self.description(),
            input_schema: self.input_schema(),
        }
    }
}

/// Schema for every tool, in a stable order.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    ToolKind::ALL.into_iter().map(ToolKind::definition).collect()
}

/// A parsed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "tool", content = "input", rename_all = "snake_case")]
pub enum ToolCall {
    CreateFile {
        path: String,
        content: String,
    },
    ReadFile {
        path: String,
    },
    RunCommand {
        command: String,
        #[serde(default)]
        cwd: Option<String>,
    },
    ListFiles {
        #[serde(default = "default_list_path")]
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    Journal {
        entry: String,
    },
}

fn default_list_path() -> String {
    ".".to_string()
}

impl ToolCall {
    /// Parse a tool-use block. The error is the text returned to the model.
    pub fn parse(name: &str, input: &Value) -> std::result::Result<Self, String> {
        if ToolKind::from_name(name).is_none() {
            return Err(format!("Unknown tool: {name}"));
        }
        serde_json::from_value(json!({ "tool": name, "input": input }))
            .map_err(|err| format!("Invalid input for {name}: {err}"))
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolCall::CreateFile { .. } => ToolKind::CreateFile,
            ToolCall::ReadFile { .. } => ToolKind::ReadFile,
            ToolCall::RunCommand { .. } => ToolKind::RunCommand,
            ToolCall::ListFiles { .. } => ToolKind::ListFiles,
            ToolCall::Journal { .. } => ToolKind::Journal,
        }
    }

    /// One-line rendering for the scan transcript. File contents and journal
    /// text are left out; commands and paths are kept.
    pub fn summary(&self) -> String {
        match self {
            ToolCall::CreateFile { path, content } => {
                format!("create_file {path} ({} bytes)", content.len())
            }
            ToolCall::ReadFile { path } => format!("read_file {path}"),
            ToolCall::RunCommand { command, cwd } => match cwd {
                Some(cwd) => format!("run_command {command} (cwd {cwd})"),
                None => format!("run_command {command}"),
            },
            ToolCall::ListFiles { path, recursive } => {
                format!("list_files {path} recursive={recursive}")
            }
            ToolCall::Journal { entry } => format!("journal ({} chars)", entry.chars().count()),
        }
    }
}

/// Result of one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Completed(String),
    /// Policy rejection; nothing touched the filesystem or spawned.
    Denied(String),
    /// Runtime failure inside the tool, already rendered as `Error executing …`.
    Failed(String),
}

impl ToolOutcome {
    pub fn text(&self) -> String {
        match self {
            ToolOutcome::Completed(text) | ToolOutcome::Failed(text) => text.clone(),
            ToolOutcome::Denied(reason) => format!("Denied: {reason}"),
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, ToolOutcome::Completed(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, ToolOutcome::Denied(_))
    }
}

/// Record of one dispatched tool call. Lives only for the current iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub input: Value,
    pub summary: String,
    pub outcome: ToolOutcome,
}

/// Limits and locations the executor enforces.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub workspace_root: PathBuf,
    pub agent_root: PathBuf,
    pub journal_path: PathBuf,
    /// Files only the supervisor writes (the detention notice).
    pub reserved_paths: Vec<PathBuf>,
    pub command_timeout: Duration,
    pub command_output_limit_bytes: usize,
    pub read_limit_bytes: usize,
    pub list_limit: usize,
    pub read_deny_markers: Vec<String>,
}

impl ToolSettings {
    pub fn from_config(cfg: &WardenConfig) -> Self {
        let workspace_root = canonical_or_normalized(&cfg.workspace_root);
        let rebase = |path: PathBuf| match path.strip_prefix(&cfg.workspace_root) {
            Ok(rel) => workspace_root.join(rel),
            Err(_) => path,
        };
        Self {
            journal_path: rebase(cfg.journal_path()),
            reserved_paths: vec![rebase(cfg.notice_path())],
            workspace_root,
            agent_root: canonical_or_normalized(&cfg.agent_root),
            command_timeout: Duration::from_secs(cfg.tools.command_timeout_secs),
            command_output_limit_bytes: cfg.tools.command_output_limit_bytes,
            read_limit_bytes: cfg.tools.read_limit_bytes,
            list_limit: cfg.tools.list_limit,
            read_deny_markers: cfg.tools.read_deny_markers.clone(),
        }
    }
}

/// Dispatches tool calls under the allow/deny policy.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    settings: ToolSettings,
    protected: ProtectedPaths,
    denylist: PatternSet,
    /// While set, every tool that can change the filesystem is denied.
    detained: bool,
}

impl ToolExecutor {
    pub fn new(settings: ToolSettings, protected: ProtectedPaths) -> Result<Self> {
        Ok(Self {
            settings,
            protected,
            denylist: PatternSet::command_denylist()?,
            detained: false,
        })
    }

    /// Mirror the detention state before each iteration.
    pub fn set_detained(&mut self, detained: bool) {
        if detained != self.detained {
            info!(detained, "tool executor detention state changed");
        }
        self.detained = detained;
    }

    /// Parse and dispatch one tool-use block.
    pub fn execute(&self, name: &str, input: &Value) -> ToolInvocation {
        let (summary, outcome) = match ToolCall::parse(name, input) {
            Ok(call) => (call.summary(), self.dispatch(&call)),
            Err(message) => (
                format!("{name} {input}"),
                ToolOutcome::Failed(message),
            ),
        };
        match &outcome {
            ToolOutcome::Denied(reason) => warn!(tool = name, reason = %reason, "tool call denied"),
            ToolOutcome::Failed(message) => warn!(tool = name, error = %message, "tool call failed"),
            ToolOutcome::Completed(_) => debug!(tool = name, "tool call completed"),
        }
        ToolInvocation {
            name: name.to_string(),
            input: input.clone(),
            summary,
            outcome,
        }
    }

    pub fn dispatch(&self, call: &ToolCall) -> ToolOutcome {
        if self.detained && call.kind().mutates() {
            return ToolOutcome::Denied(format!(
                "{} is unavailable while detained; the workspace is read-only",
                call.kind().name()
            ));
        }
        let result = match call {
            ToolCall::CreateFile { path, content } => self.create_file(path, content),
            ToolCall::ReadFile { path } => self.read_file(path),
            ToolCall::RunCommand { command, cwd } => self.run_command(command, cwd.as_deref()),
            ToolCall::ListFiles { path, recursive } => self.list_files(path, *recursive),
            ToolCall::Journal { entry } => self.journal(entry),
        };
        result.unwrap_or_else(|err| {
            ToolOutcome::Failed(format!("Error executing {}: {err:#}", call.kind().name()))
        })
    }

    pub fn create_file(&self, path: &str, content: &str) -> Result<ToolOutcome> {
        let target = self.resolve(path);
        if let Some(reason) = self.write_denial(&target) {
            return Ok(ToolOutcome::Denied(reason));
        }
        // Symlinks could point a permitted path at a forbidden one.
        let effective = effective_target(&target);
        if effective != target
            && let Some(reason) = self.write_denial(&effective)
        {
            return Ok(ToolOutcome::Denied(reason));
        }

        if let Ok(meta) = fs::metadata(&effective) {
            if meta.is_dir() {
                return Err(anyhow!("{path} is a directory"));
            }
            if meta.permissions().mode() & 0o200 == 0 {
                return Err(anyhow!("{path} is read-only"));
            }
        }
        if let Some(parent) = effective.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        write_atomic(&effective, content.as_bytes())?;
        info!(path = %effective.display(), bytes = content.len(), "file written by agent");
        Ok(ToolOutcome::Completed(format!(
            "Wrote {} bytes to {}",
            content.len(),
            effective.display()
        )))
    }

    pub fn read_file(&self, path: &str) -> Result<ToolOutcome> {
        let target = self.resolve(path);
        let canonical = fs::canonicalize(&target).unwrap_or_else(|_| target.clone());
        for candidate in [path.to_string(), canonical.to_string_lossy().into_owned()] {
            if let Some(marker) = self.deny_marker(&candidate) {
                return Ok(ToolOutcome::Denied(format!(
                    "reading paths containing '{marker}' is not permitted"
                )));
            }
        }

        // Non-blocking so a FIFO cannot stall the open; the type check runs on
        // the opened handle. Reads of regular files ignore O_NONBLOCK.
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(&canonical)
            .with_context(|| format!("open {}", canonical.display()))?;
        let meta = file
            .metadata()
            .with_context(|| format!("stat {}", canonical.display()))?;
        if !meta.is_file() {
            return Err(anyhow!("{} is not a regular file", canonical.display()));
        }
        let total = meta.len();
        let mut buf = Vec::new();
        file.take(self.settings.read_limit_bytes as u64)
            .read_to_end(&mut buf)
            .with_context(|| format!("read {}", canonical.display()))?;

        let mut text = String::from_utf8_lossy(&buf).into_owned();
        if total > buf.len() as u64 {
            text.push_str(&format!("\n\n(truncated, {total} total bytes)"));
        }
        Ok(ToolOutcome::Completed(text))
    }

    pub fn run_command(&self, command: &str, cwd: Option<&str>) -> Result<ToolOutcome> {
        if let Some(rule) = self.denylist.first_match(command) {
            return Ok(ToolOutcome::Denied(format!(
                "command matches a blocked pattern ({})",
                rule.category
            )));
        }
        if let Some(protected) = self.protected.mentioned_in(command) {
            return Ok(ToolOutcome::Denied(format!(
                "command references protected file {}",
                protected.display()
            )));
        }
        let workdir = match cwd {
            Some(dir) => self.resolve(dir),
            None => self.settings.workspace_root.clone(),
        };
        if !self.within_allowed_roots(&workdir) {
            return Ok(ToolOutcome::Denied(format!(
                "working directory {} is outside the writable roots",
                workdir.display()
            )));
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&workdir)
            .env_remove(API_KEY_ENV);
        info!(command, cwd = %workdir.display(), "running agent command");
        let output = run_command_with_timeout(
            cmd,
            self.settings.command_timeout,
            self.settings.command_output_limit_bytes,
        )?;

        let mut text = output.combined_text();
        if output.timed_out {
            text.push_str(&format!(
                "\n(timed out after {}s)",
                self.settings.command_timeout.as_secs()
            ));
        } else {
            match output.status.code() {
                Some(0) => {}
                Some(code) => text.push_str(&format!("\n(exit code {code})")),
                None => text.push_str("\n(terminated by signal)"),
            }
        }
        if text.trim().is_empty() {
            text = "(no output)".to_string();
        }
        Ok(ToolOutcome::Completed(truncate_text(
            text,
            self.settings.command_output_limit_bytes,
        )))
    }

    pub fn list_files(&self, path: &str, recursive: bool) -> Result<ToolOutcome> {
        let dir = self.resolve(path);
        let meta = fs::metadata(&dir).with_context(|| format!("stat {}", dir.display()))?;
        if !meta.is_dir() {
            return Err(anyhow!("{} is not a directory", dir.display()));
        }

        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(if recursive { usize::MAX } else { 1 })
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.file_name() != ".git");

        let mut lines = Vec::new();
        let mut overflow = 0usize;
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
            if lines.len() >= self.settings.list_limit {
                overflow += 1;
                continue;
            }
            let rel = entry.path().strip_prefix(&dir).unwrap_or(entry.path());
            if entry.file_type().is_dir() {
                lines.push(format!("[dir]  {}/", rel.display()));
            } else {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                lines.push(format!("[file] {} ({size} bytes)", rel.display()));
            }
        }

        if lines.is_empty() {
            return Ok(ToolOutcome::Completed("(empty directory)".to_string()));
        }
        let mut text = lines.join("\n");
        if overflow > 0 {
            text.push_str(&format!("\n... and {overflow} more entries"));
        }
        Ok(ToolOutcome::Completed(text))
    }

    pub fn journal(&self, entry: &str) -> Result<ToolOutcome> {
        let path = &self.settings.journal_path;
        let is_new = !path.exists();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        let mut section = String::new();
        if is_new {
            section.push_str(JOURNAL_HEADER);
        }
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        section.push_str(&format!("## {stamp}\n\n{}\n\n", entry.trim_end()));
        file.write_all(section.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        Ok(ToolOutcome::Completed(format!(
            "Journal entry recorded ({} chars)",
            entry.chars().count()
        )))
    }

    fn resolve(&self, path: &str) -> PathBuf {
        resolve_path(&self.settings.workspace_root, Path::new(path))
    }

    fn within_allowed_roots(&self, path: &Path) -> bool {
        is_within(path, &self.settings.workspace_root) || is_within(path, &self.settings.agent_root)
    }

    fn write_denial(&self, target: &Path) -> Option<String> {
        if self.protected.contains(target) {
            return Some(format!("{} is a protected file", target.display()));
        }
        if self.settings.reserved_paths.iter().any(|p| normalize(p).as_path() == target) {
            return Some(format!("{} is reserved for the supervisor", target.display()));
        }
        if !self.within_allowed_roots(target) {
            return Some(format!(
                "{} is outside the writable roots ({}, {})",
                target.display(),
                self.settings.workspace_root.display(),
                self.settings.agent_root.display()
            ));
        }
        None
    }

    fn deny_marker(&self, path: &str) -> Option<&str> {
        let lowered = path.to_lowercase();
        self.settings
            .read_deny_markers
            .iter()
            .find(|marker| !marker.is_empty() && lowered.contains(&marker.to_lowercase()))
            .map(String::as_str)
    }
}

fn canonical_or_normalized(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| normalize(path))
}

/// Resolve symlinks on the deepest existing ancestor of `path`.
fn effective_target(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(&existing) {
            let mut out = canonical;
            for component in rest.iter().rev() {
                out.push(component);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Cut `text` to at most `limit` bytes on a char boundary, noting the original size.
pub fn truncate_text(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n\n(truncated, {} total bytes)", &text[..cut], text.len())
}
