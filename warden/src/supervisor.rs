//! The top-level supervisor loop.
//!
//! Each pass checks the stop conditions, runs one [`IterationRunner`]
//! iteration, updates the error budget, and rests for the resolved interval.
//! The loop never returns on its own except through a [`StopReason`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::core::paths::{ProtectedPaths, normalize};
use crate::core::types::StopReason;
use crate::io::config::WardenConfig;
use crate::io::detention::DetentionController;
use crate::io::disk::disk_usage;
use crate::io::git::Git;
use crate::io::iteration_log::IterationLog;
use crate::io::prompt::PromptRenderer;
use crate::io::provider::ModelProvider;
use crate::io::release::ReleasePromoter;
use crate::io::scanner::ViolationScanner;
use crate::io::tools::{ToolExecutor, ToolSettings};
use crate::iteration::{IterationOutcome, IterationRunner};

const SLEEP_TICK: Duration = Duration::from_secs(1);

/// Blocking wait between iterations.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeper backed by `std::thread::sleep`.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorOptions {
    /// Stop after this many iterations (unbounded when `None`).
    pub max_iterations: Option<u64>,
}

/// Summary of a supervisor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOutcome {
    pub iterations: u64,
    pub stop: StopReason,
    pub detained: bool,
}

/// Protected files, canonicalized where they exist, plus the config file when present.
pub fn build_protected_paths(cfg: &WardenConfig, config_path: &Path) -> Result<ProtectedPaths> {
    let mut paths: Vec<PathBuf> = Vec::with_capacity(cfg.protected_files.len() + 1);
    let config = config_path.exists().then_some(config_path);
    for path in cfg.protected_files.iter().map(PathBuf::as_path).chain(config) {
        let absolute = std::path::absolute(path)
            .with_context(|| format!("absolute path for {}", path.display()))?;
        let resolved = fs::canonicalize(&absolute).unwrap_or_else(|_| normalize(&absolute));
        paths.push(resolved);
    }
    Ok(ProtectedPaths::new(paths))
}

pub struct Supervisor<'a, P: ModelProvider + ?Sized, S: Sleeper + ?Sized> {
    cfg: WardenConfig,
    provider: &'a P,
    sleeper: &'a S,
    interrupt: Arc<AtomicBool>,
    executor: ToolExecutor,
    scanner: ViolationScanner,
    promoter: ReleasePromoter,
    prompts: PromptRenderer,
    git: Git,
    detention: DetentionController,
    log: Option<IterationLog>,
    consecutive_errors: u32,
}

impl<'a, P: ModelProvider + ?Sized, S: Sleeper + ?Sized> Supervisor<'a, P, S> {
    pub fn new(
        cfg: WardenConfig,
        config_path: &Path,
        provider: &'a P,
        sleeper: &'a S,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self> {
        cfg.validate()?;
        let protected = build_protected_paths(&cfg, config_path)?;
        if protected.is_empty() {
            warn!("no protected files configured");
        }
        info!(
            protected = protected.len(),
            model = %cfg.model.allowed,
            workspace = %cfg.workspace_root.display(),
            "supervisor starting"
        );
        let executor = ToolExecutor::new(ToolSettings::from_config(&cfg), protected.clone())?;
        let scanner = ViolationScanner::new(protected, cfg.model.allowed.clone())?;
        let detention = DetentionController::from_config(&cfg);
        if detention.is_detained() {
            warn!(notice = %detention.notice_path().display(), "starting detained");
        }
        Ok(Self {
            executor,
            scanner,
            promoter: ReleasePromoter::from_config(&cfg),
            prompts: PromptRenderer::from_config(&cfg)?,
            git: Git::new(&cfg.workspace_root)
                .with_timeout(Duration::from_secs(cfg.release.git_timeout_secs)),
            detention,
            log: cfg
                .logging
                .iterations_dir
                .clone()
                .map(IterationLog::for_new_session),
            consecutive_errors: 0,
            cfg,
            provider,
            sleeper,
            interrupt,
        })
    }

    pub fn is_detained(&self) -> bool {
        self.detention.is_detained()
    }

    /// Run until a stop condition fires. `on_iteration` sees every finished iteration.
    pub fn run<F: FnMut(&IterationOutcome)>(
        &mut self,
        options: &SupervisorOptions,
        mut on_iteration: F,
    ) -> Result<SupervisorOutcome> {
        let mut iterations = 0u64;
        let stop = loop {
            if self.interrupted() {
                break StopReason::Interrupted;
            }
            if let Some(stop) = self.check_quota() {
                break stop;
            }

            iterations += 1;
            let outcome = self.run_iteration(iterations);
            on_iteration(&outcome);

            if outcome.iteration.success {
                self.consecutive_errors = 0;
            } else {
                self.consecutive_errors += 1;
                warn!(
                    consecutive_errors = self.consecutive_errors,
                    max = self.cfg.safety.max_consecutive_errors,
                    "iteration failed"
                );
                if self.consecutive_errors >= self.cfg.safety.max_consecutive_errors {
                    break StopReason::ErrorBudgetExhausted {
                        consecutive_errors: self.consecutive_errors,
                    };
                }
            }

            if options.max_iterations.is_some_and(|max| iterations >= max) {
                break StopReason::IterationLimit { iterations };
            }
            if !self.rest(outcome.pacing.wait) {
                break StopReason::Interrupted;
            }
        };

        if stop.is_fatal() {
            error!(stop = %stop, iterations, "supervisor stopped");
        } else {
            info!(stop = %stop, iterations, "supervisor stopped");
        }
        Ok(SupervisorOutcome {
            iterations,
            stop,
            detained: self.detention.is_detained(),
        })
    }

    fn run_iteration(&mut self, ordinal: u64) -> IterationOutcome {
        self.executor.set_detained(self.detention.is_detained());
        let runner = IterationRunner {
            cfg: &self.cfg,
            provider: self.provider,
            executor: &self.executor,
            scanner: &self.scanner,
            promoter: &self.promoter,
            prompts: &self.prompts,
            git: &self.git,
            log: self.log.as_ref(),
        };
        runner.run(ordinal, &mut self.detention)
    }

    fn check_quota(&self) -> Option<StopReason> {
        let limit_mb = self.cfg.safety.max_disk_usage_mb;
        match disk_usage(&self.cfg.workspace_root) {
            Ok(usage) => {
                if usage.unreadable > 0 {
                    warn!(
                        unreadable = usage.unreadable,
                        "quota counts only readable entries"
                    );
                }
                let used_mb = usage.megabytes();
                (used_mb > limit_mb).then_some(StopReason::QuotaExceeded { used_mb, limit_mb })
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not measure disk usage");
                None
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Sleep `wait` in short ticks. Returns false if interrupted.
    fn rest(&self, wait: Duration) -> bool {
        if wait.is_zero() {
            return !self.interrupted();
        }
        info!(wait_secs = wait.as_secs(), "resting");
        let heartbeat = Duration::from_secs(self.cfg.pacing.heartbeat_secs);
        let mut slept = Duration::ZERO;
        let mut since_heartbeat = Duration::ZERO;
        while slept < wait {
            if self.interrupted() {
                return false;
            }
            let tick = SLEEP_TICK.min(wait - slept);
            self.sleeper.sleep(tick);
            slept += tick;
            since_heartbeat += tick;
            if since_heartbeat >= heartbeat && slept < wait {
                info!(
                    remaining_secs = (wait - slept).as_secs(),
                    "heartbeat"
                );
                since_heartbeat = Duration::ZERO;
            }
        }
        !self.interrupted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_paths_include_config_and_resolve_symlinks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fs::canonicalize(temp.path()).expect("canonicalize");
        fs::write(root.join("supervisor.py"), "pass").expect("write");
        std::os::unix::fs::symlink(root.join("supervisor.py"), root.join("alias.py"))
            .expect("symlink");
        fs::write(root.join("warden.toml"), "").expect("write");
        let cfg = WardenConfig {
            protected_files: vec![root.join("alias.py"), root.join("missing/../gone.py")],
            ..WardenConfig::default()
        };

        let protected = build_protected_paths(&cfg, &root.join("warden.toml")).expect("protected");

        assert!(protected.contains(&root.join("supervisor.py")));
        assert!(protected.contains(&root.join("gone.py")));
        assert!(protected.contains(&root.join("warden.toml")));
        assert_eq!(protected.len(), 3);
    }
}
