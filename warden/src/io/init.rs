//! Scaffolding for a fresh supervisor deployment.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::io::agent_settings::{AgentSettings, force_agent_settings};
use crate::io::config::{WardenConfig, write_config};
use crate::io::git::Git;
use crate::io::scanner::PROTECTED_MODE;

const AGENT_NAME: &str = "warden-agent";
const AGENT_EMAIL: &str = "agent@warden.local";

#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Rewrite the config file even if it exists.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub config_written: bool,
    pub repo_created: bool,
    pub locked: Vec<PathBuf>,
    pub missing_protected: Vec<PathBuf>,
}

/// Write the config if missing (always with `force`), create both roots, set
/// up the workspace repository, force the agent settings, and lock every
/// protected file to 0444.
pub fn init_workspace(config_path: &Path, cfg: &WardenConfig, options: &InitOptions) -> Result<InitReport> {
    let mut report = InitReport::default();

    if !config_path.exists() || options.force {
        if config_path.exists() {
            // A previous init left it read-only.
            fs::set_permissions(config_path, fs::Permissions::from_mode(0o644))
                .with_context(|| format!("unlock {}", config_path.display()))?;
        }
        write_config(config_path, cfg)?;
        report.config_written = true;
    }

    for dir in [&cfg.workspace_root, &cfg.agent_root] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    let git = Git::new(&cfg.workspace_root)
        .with_timeout(Duration::from_secs(cfg.release.git_timeout_secs));
    if !git.is_repo() {
        git.init()?;
        report.repo_created = true;
    }
    git.set_config("user.name", AGENT_NAME)?;
    git.set_config("user.email", AGENT_EMAIL)?;
    if git.head_sha()?.is_none() {
        git.commit_allow_empty("initial commit")?;
    }

    force_agent_settings(
        &cfg.agent_settings_path(),
        &AgentSettings {
            model: cfg.model.allowed.clone(),
            max_tokens: cfg.model.max_tokens,
        },
    )?;

    let mut targets: Vec<PathBuf> = cfg.protected_files.clone();
    targets.push(config_path.to_path_buf());
    for path in targets {
        if !path.is_file() {
            warn!(path = %path.display(), "protected file does not exist");
            report.missing_protected.push(path);
            continue;
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(PROTECTED_MODE))
            .with_context(|| format!("lock {}", path.display()))?;
        report.locked.push(path);
    }

    info!(
        config = %config_path.display(),
        workspace = %cfg.workspace_root.display(),
        locked = report.locked.len(),
        "workspace initialized"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    fn config(root: &Path) -> WardenConfig {
        WardenConfig {
            workspace_root: root.join("workspace"),
            agent_root: root.join("agent"),
            protected_files: vec![root.join("supervisor.py"), root.join("absent.py")],
            ..WardenConfig::default()
        }
    }

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).expect("stat").permissions().mode() & 0o777
    }

    #[test]
    fn scaffolds_and_locks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(temp.path());
        fs::write(temp.path().join("supervisor.py"), "pass").expect("write");
        let config_path = temp.path().join("warden.toml");

        let report = init_workspace(&config_path, &cfg, &InitOptions::default()).expect("init");

        assert!(report.repo_created);
        assert_eq!(report.locked.len(), 2);
        assert_eq!(report.missing_protected, vec![temp.path().join("absent.py")]);
        assert_eq!(mode(&temp.path().join("supervisor.py")), PROTECTED_MODE);
        assert_eq!(mode(&config_path), PROTECTED_MODE);
        assert_eq!(load_config(&config_path).expect("load"), cfg);
        let git = Git::new(&cfg.workspace_root);
        assert_eq!(git.recent_log(5).expect("log").len(), 1);
        assert!(cfg.agent_settings_path().exists());
    }

    #[test]
    fn rerun_keeps_existing_config_unless_forced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(temp.path());
        let config_path = temp.path().join("warden.toml");
        init_workspace(&config_path, &cfg, &InitOptions::default()).expect("init");

        let mut changed = cfg.clone();
        changed.safety.max_consecutive_errors = 9;
        let report = init_workspace(&config_path, &changed, &InitOptions::default()).expect("rerun");
        assert!(!report.config_written);
        assert!(!report.repo_created);
        assert_eq!(load_config(&config_path).expect("load"), cfg);

        let report = init_workspace(&config_path, &changed, &InitOptions { force: true }).expect("force");
        assert!(report.config_written);
        assert_eq!(load_config(&config_path).expect("load"), changed);
        assert_eq!(mode(&config_path), PROTECTED_MODE);
        assert_eq!(Git::new(&cfg.workspace_root).recent_log(5).expect("log").len(), 1);
    }
}
