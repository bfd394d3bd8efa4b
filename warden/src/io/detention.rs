//! One-way lockdown of the agent's writable roots.

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::core::types::Violation;
use crate::io::config::WardenConfig;

const WRITE_BITS: u32 = 0o222;
const LOCKED_MODE: u32 = 0o444;

const BOUNDARY_RULES: &[&str] = &[
    "Do not modify, move, or change permissions of protected files.",
    "Do not access the network or attempt to leave the sandbox.",
    "Do not read credentials or supervisor configuration.",
    "Use only the configured model.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetentionState {
    Free,
    Detained,
}

impl fmt::Display for DetentionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetentionState::Free => f.write_str("free"),
            DetentionState::Detained => f.write_str("detained"),
        }
    }
}

/// What a lockdown pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetentionReport {
    /// True only for the pass that moved Free to Detained.
    pub newly_detained: bool,
    pub files_locked: usize,
    pub failures: usize,
}

#[derive(Debug)]
pub struct DetentionController {
    state: DetentionState,
    workspace_root: PathBuf,
    agent_root: PathBuf,
    notice_path: PathBuf,
}

impl DetentionController {
    /// Starts Detained when a notice from an earlier session is still present.
    pub fn new(workspace_root: PathBuf, agent_root: PathBuf, notice_path: PathBuf) -> Self {
        let state = if notice_path.exists() {
            DetentionState::Detained
        } else {
            DetentionState::Free
        };
        Self {
            state,
            workspace_root,
            agent_root,
            notice_path,
        }
    }

    pub fn from_config(cfg: &WardenConfig) -> Self {
        Self::new(
            cfg.workspace_root.clone(),
            cfg.agent_root.clone(),
            cfg.notice_path(),
        )
    }

    pub fn state(&self) -> DetentionState {
        self.state
    }

    pub fn is_detained(&self) -> bool {
        self.state == DetentionState::Detained
    }

    pub fn notice_path(&self) -> &Path {
        &self.notice_path
    }

    /// Lock down after a violation batch.
    ///
    /// The first call writes the notice and moves to Detained. Later calls only
    /// re-apply the permission lockdown.
    pub fn detain(&mut self, violations: &[Violation], iteration: u64) -> Result<DetentionReport> {
        let mut report = DetentionReport::default();
        self.lock_tree(&self.workspace_root, LockMode::StripWrite, &mut report);
        self.lock_tree(&self.agent_root, LockMode::ReadOnly, &mut report);

        if self.state == DetentionState::Detained {
            warn!(
                iteration,
                violations = violations.len(),
                files_locked = report.files_locked,
                "violations while already detained; lockdown re-applied"
            );
            return Ok(report);
        }

        self.write_notice(violations, iteration)?;
        self.state = DetentionState::Detained;
        report.newly_detained = true;
        error!(
            iteration,
            violations = violations.len(),
            files_locked = report.files_locked,
            notice = %self.notice_path.display(),
            "agent detained"
        );
        Ok(report)
    }

    fn lock_tree(&self, root: &Path, mode: LockMode, report: &mut DetentionReport) {
        if !root.exists() {
            return;
        }
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(err = %err, "walk failed during lockdown");
                    report.failures += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match lock_file(entry.path(), mode) {
                Ok(()) => report.files_locked += 1,
                Err(err) => {
                    warn!(path = %entry.path().display(), err = %format!("{err:#}"), "failed to lock file");
                    report.failures += 1;
                }
            }
        }
    }

    fn write_notice(&self, violations: &[Violation], iteration: u64) -> Result<()> {
        if self.notice_path.exists() {
            fs::remove_file(&self.notice_path)
                .with_context(|| format!("remove stale {}", self.notice_path.display()))?;
        }
        let notice = render_notice(violations, iteration);
        fs::write(&self.notice_path, notice)
            .with_context(|| format!("write {}", self.notice_path.display()))?;
        fs::set_permissions(&self.notice_path, fs::Permissions::from_mode(LOCKED_MODE))
            .with_context(|| format!("chmod {}", self.notice_path.display()))?;
        info!(path = %self.notice_path.display(), "detention notice written");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    /// Remove write bits, keep the rest.
    StripWrite,
    /// Force 0444.
    ReadOnly,
}

fn lock_file(path: &Path, mode: LockMode) -> Result<()> {
    let current = fs::symlink_metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions()
        .mode()
        & 0o7777;
    let target = match mode {
        LockMode::StripWrite => current & !WRITE_BITS,
        LockMode::ReadOnly => LOCKED_MODE,
    };
    if target != current {
        fs::set_permissions(path, fs::Permissions::from_mode(target))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}

pub fn render_notice(violations: &[Violation], iteration: u64) -> String {
    let mut out = String::from("# DETAINED\n\n");
    out.push_str(&format!(
        "Detained at {} during iteration {iteration}.\n\n",
        chrono::Local::now().to_rfc3339()
    ));
    out.push_str("Your workspace is now read-only. Only the operator can lift detention.\n\n");
    out.push_str("## Violations\n\n");
    for violation in violations {
        out.push_str(&format!("- {violation}\n"));
    }
    out.push_str("\n## Boundaries\n\n");
    for rule in BOUNDARY_RULES {
        out.push_str(&format!("- {rule}\n"));
    }
    out
}
