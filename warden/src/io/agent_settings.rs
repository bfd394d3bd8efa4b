//! The agent-side settings file, rewritten by the supervisor every iteration.
//!
//! Whatever the agent wrote to `agent.toml` during the previous iteration is
//! discarded; the file always names the single allowed model.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SETTINGS_MODE: u32 = 0o444;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub model: String,
    pub max_tokens: u32,
}

/// Overwrite the settings file with the allowed model and lock it read-only.
pub fn force_agent_settings(path: &Path, settings: &AgentSettings) -> Result<()> {
    if let Ok(existing) = load_agent_settings(path)
        && existing != *settings
    {
        warn!(
            path = %path.display(),
            found = %existing.model,
            allowed = %settings.model,
            "agent settings were modified; overwriting"
        );
    }
    let parent = path
        .parent()
        .with_context(|| format!("settings path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let mut buf = toml::to_string_pretty(settings).context("serialize agent settings")?;
    buf.push('\n');
    let tmp_path = path.with_extension("toml.tmp");
    if tmp_path.exists() {
        // Left read-only by an interrupted earlier write.
        fs::remove_file(&tmp_path).with_context(|| format!("remove {}", tmp_path.display()))?;
    }
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(SETTINGS_MODE))
        .with_context(|| format!("chmod {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    debug!(path = %path.display(), model = %settings.model, "agent settings forced");
    Ok(())
}

pub fn load_agent_settings(path: &Path) -> Result<AgentSettings> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
