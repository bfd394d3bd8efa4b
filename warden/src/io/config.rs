//! Supervisor configuration stored in `warden.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::pacing::PacingBounds;

pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";

/// Supervisor configuration (TOML).
///
/// Edited by the operator only; the file is always part of the protected set.
/// Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WardenConfig {
    /// Root of the agent's workspace (a git repository).
    pub workspace_root: PathBuf,
    /// Directory holding the agent's own execution code and `agent.toml`.
    pub agent_root: PathBuf,
    /// Files the agent must never modify. Kept at mode 0444.
    pub protected_files: Vec<PathBuf>,
    /// Optional minijinja prompt template. A built-in prompt is used when unset.
    pub prompt_file: Option<PathBuf>,
    pub model: ModelConfig,
    pub safety: SafetyConfig,
    pub pacing: PacingConfig,
    pub tools: ToolsConfig,
    pub release: ReleaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// The single model id the agent may use.
    pub allowed: String,
    pub max_tokens: u32,
    pub api_base: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SafetyConfig {
    pub max_disk_usage_mb: u64,
    pub max_consecutive_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PacingConfig {
    pub default_secs: u64,
    pub max_secs: u64,
    pub failure_cooldown_secs: u64,
    /// Length of one sleep chunk; a heartbeat is logged after each.
    pub heartbeat_secs: u64,
    pub skip_allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub max_rounds: u32,
    /// Tool calls allowed per iteration, denied calls included.
    pub max_tool_calls: u32,
    pub command_timeout_secs: u64,
    pub command_output_limit_bytes: usize,
    pub read_limit_bytes: usize,
    pub list_limit: usize,
    /// Case-insensitive substrings that make `read_file` refuse a path.
    pub read_deny_markers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReleaseConfig {
    pub branch: String,
    pub git_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `RUST_LOG`-style filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Log file; events are appended and written unbuffered.
    pub file: Option<PathBuf>,
    /// Directory for per-iteration records.
    pub iterations_dir: Option<PathBuf>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/workspace"),
            agent_root: PathBuf::from("/home/playground/agent"),
            protected_files: vec![PathBuf::from("/home/playground/supervisor/warden")],
            prompt_file: None,
            model: ModelConfig::default(),
            safety: SafetyConfig::default(),
            pacing: PacingConfig::default(),
            tools: ToolsConfig::default(),
            release: ReleaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            allowed: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            api_base: "https://api.anthropic.com".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_disk_usage_mb: 5 * 1024,
            max_consecutive_errors: 5,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            default_secs: 60,
            max_secs: 300,
            failure_cooldown_secs: 30,
            heartbeat_secs: 60,
            skip_allowed: true,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_rounds: 50,
            max_tool_calls: 200,
            command_timeout_secs: 120,
            command_output_limit_bytes: 50_000,
            read_limit_bytes: 100_000,
            list_limit: 500,
            read_deny_markers: vec!["supervisor".to_string(), "warden".to_string()],
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            branch: "release".to_string(),
            git_timeout_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            iterations_dir: None,
        }
    }
}

impl WardenConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.workspace_root.is_absolute() {
            return Err(anyhow!("workspace_root must be an absolute path"));
        }
        if !self.agent_root.is_absolute() {
            return Err(anyhow!("agent_root must be an absolute path"));
        }
        if let Some(path) = self.protected_files.iter().find(|p| !p.is_absolute()) {
            return Err(anyhow!(
                "protected_files entries must be absolute ({})",
                path.display()
            ));
        }
        if self.model.allowed.trim().is_empty() {
            return Err(anyhow!("model.allowed must be non-empty"));
        }
        if self.model.max_tokens == 0 {
            return Err(anyhow!("model.max_tokens must be > 0"));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(anyhow!("model.request_timeout_secs must be > 0"));
        }
        if self.safety.max_consecutive_errors == 0 {
            return Err(anyhow!("safety.max_consecutive_errors must be > 0"));
        }
        if self.pacing.heartbeat_secs == 0 {
            return Err(anyhow!("pacing.heartbeat_secs must be > 0"));
        }
        if self.pacing.default_secs > self.pacing.max_secs {
            return Err(anyhow!("pacing.default_secs must be <= pacing.max_secs"));
        }
        if self.tools.max_rounds == 0 {
            return Err(anyhow!("tools.max_rounds must be > 0"));
        }
        if self.tools.command_timeout_secs == 0 {
            return Err(anyhow!("tools.command_timeout_secs must be > 0"));
        }
        if self.tools.command_output_limit_bytes == 0 || self.tools.read_limit_bytes == 0 {
            return Err(anyhow!("tools output limits must be > 0"));
        }
        if self.tools.list_limit == 0 {
            return Err(anyhow!("tools.list_limit must be > 0"));
        }
        if self.release.branch.trim().is_empty() {
            return Err(anyhow!("release.branch must be non-empty"));
        }
        if self.release.git_timeout_secs == 0 {
            return Err(anyhow!("release.git_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn pacing_bounds(&self) -> PacingBounds {
        PacingBounds {
            default_secs: self.pacing.default_secs,
            max_secs: self.pacing.max_secs,
            failure_cooldown_secs: self.pacing.failure_cooldown_secs,
            skip_allowed: self.pacing.skip_allowed,
        }
    }

    /// Agent settings file rewritten before every iteration.
    pub fn agent_settings_path(&self) -> PathBuf {
        self.agent_root.join("agent.toml")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.workspace_root.join("JOURNAL.md")
    }

    pub fn notice_path(&self) -> PathBuf {
        self.workspace_root.join("DETAINED.md")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WardenConfig::default()`.
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    if !path.exists() {
        let cfg = WardenConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WardenConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &WardenConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
