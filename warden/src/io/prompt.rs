//! Prompt rendering for each iteration.
//!
//! The system prompt is built in; the per-iteration prompt can be replaced by
//! an operator template (`prompt_file`). Both are minijinja templates.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::io::config::WardenConfig;
use crate::io::git::Git;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");

const FILE_LIST_LIMIT: usize = 200;
const GIT_LOG_LIMIT: usize = 10;
const JOURNAL_TAIL_CHARS: usize = 2_000;

/// Workspace state exposed to the iteration template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptContext {
    pub iteration: u64,
    pub workspace_files: Vec<String>,
    pub file_count: usize,
    pub git_log: Vec<String>,
    pub journal_tail: Option<String>,
    pub detained: bool,
}

/// Renders the system and iteration prompts.
#[derive(Debug, Clone)]
pub struct PromptRenderer {
    iteration_template: String,
    workspace_root: PathBuf,
    max_sleep_secs: u64,
    release_branch: String,
}

impl PromptRenderer {
    pub fn from_config(cfg: &WardenConfig) -> Result<Self> {
        let iteration_template = match &cfg.prompt_file {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("read prompt template {}", path.display()))?,
            None => ITERATION_TEMPLATE.to_string(),
        };
        // Surface template syntax errors at startup instead of mid-run.
        Environment::new()
            .add_template("iteration", &iteration_template)
            .context("parse prompt template")?;
        Ok(Self {
            iteration_template,
            workspace_root: cfg.workspace_root.clone(),
            max_sleep_secs: cfg.pacing.max_secs,
            release_branch: cfg.release.branch.clone(),
        })
    }

    pub fn render_system(&self) -> Result<String> {
        let env = Environment::new();
        let rendered = env
            .render_str(
                SYSTEM_TEMPLATE,
                context! {
                    workspace_root => self.workspace_root.display().to_string(),
                    max_sleep_secs => self.max_sleep_secs,
                    release_branch => &self.release_branch,
                },
            )
            .context("render system prompt")?;
        Ok(rendered)
    }

    pub fn render_iteration(&self, ctx: &PromptContext) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("iteration", &self.iteration_template)
            .context("parse prompt template")?;
        let template = env.get_template("iteration")?;
        let rendered = template
            .render(context! {
                iteration => ctx.iteration,
                workspace_files => &ctx.workspace_files,
                file_count => ctx.file_count,
                git_log => &ctx.git_log,
                journal_tail => ctx.journal_tail.as_deref(),
                detained => ctx.detained,
            })
            .context("render iteration prompt")?;
        Ok(rendered)
    }
}

/// Collect the workspace state for one iteration.
///
/// Git problems degrade to an empty log and unreadable entries are left out
/// of the listing; neither fails the iteration.
pub fn gather_context(
    workspace_root: &Path,
    journal_path: &Path,
    git: &Git,
    iteration: u64,
    detained: bool,
) -> Result<PromptContext> {
    let mut files = Vec::new();
    let walker = WalkDir::new(workspace_root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");
    let mut unreadable = 0usize;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(err = %err, "skipping unreadable workspace entry");
                unreadable += 1;
                continue;
            }
        };
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(workspace_root).unwrap_or(entry.path());
            files.push(rel.to_string_lossy().into_owned());
        }
    }
    let file_count = files.len();
    files.truncate(FILE_LIST_LIMIT);

    let git_log = git.recent_log(GIT_LOG_LIMIT).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "git log unavailable for prompt");
        Vec::new()
    });

    let journal_tail = fs::read_to_string(journal_path)
        .ok()
        .map(|text| tail_chars(&text, JOURNAL_TAIL_CHARS))
        .filter(|text| !text.trim().is_empty());

    if unreadable > 0 {
        warn!(unreadable, "workspace listing skipped unreadable entries");
    }
    debug!(file_count, commits = git_log.len(), "gathered prompt context");
    Ok(PromptContext {
        iteration,
        workspace_files: files,
        file_count,
        git_log,
        journal_tail,
        detained,
    })
}

fn tail_chars(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(limit)).collect()
}
