//! Test-only helpers: git fixtures, scripted model replies, and a recording sleeper.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tempfile::TempDir;

use crate::io::config::WardenConfig;
use crate::io::git::Git;
use crate::io::init::{InitOptions, init_workspace};
use crate::io::provider::{ContentBlock, MessageRequest, MessageResponse, ModelProvider};
use crate::supervisor::Sleeper;

pub const TEST_MODEL: &str = "claude-sonnet-4-20250514";

/// A throwaway git repository with one empty commit.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = fs::canonicalize(temp.path()).context("canonicalize tempdir")?;
        let git = Git::new(&root);
        git.init()?;
        git.set_config("user.name", "Test User")?;
        git.set_config("user.email", "test@example.com")?;
        git.set_config("commit.gpgsign", "false")?;
        git.commit_allow_empty("initial commit")?;
        Ok(Self { _temp: temp, root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

/// Provider that replays a fixed script and records every request.
///
/// `Err` entries become provider errors. Once the script is exhausted every
/// further call fails.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<std::result::Result<MessageResponse, String>>>,
    requests: Mutex<Vec<MessageRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<std::result::Result<MessageResponse, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<MessageRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

impl ModelProvider for ScriptedProvider {
    fn send(&self, request: &MessageRequest) -> Result<MessageResponse> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests lock poisoned"))?
            .push(request.clone());
        let next = self
            .replies
            .lock()
            .map_err(|_| anyhow!("replies lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted reply left")),
        }
    }
}

/// A reply with only text (ends the conversation).
pub fn text_reply(model: &str, text: &str) -> MessageResponse {
    MessageResponse {
        model: model.to_string(),
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        stop_reason: Some("end_turn".to_string()),
    }
}

/// A reply with optional text followed by `(id, tool name, input)` tool calls.
pub fn tool_reply(model: &str, text: &str, calls: Vec<(&str, &str, Value)>) -> MessageResponse {
    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::Text {
            text: text.to_string(),
        });
    }
    for (id, name, input) in calls {
        content.push(ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input,
        });
    }
    MessageResponse {
        model: model.to_string(),
        content,
        stop_reason: Some("tool_use".to_string()),
    }
}

/// Sleeper that records requested durations without sleeping.
///
/// Optionally raises an interrupt flag after a number of ticks.
#[derive(Default)]
pub struct RecordingSleeper {
    ticks: Mutex<Vec<Duration>>,
    interrupt_after: Option<(usize, Arc<AtomicBool>)>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupting_after(ticks: usize, flag: Arc<AtomicBool>) -> Self {
        Self {
            ticks: Mutex::new(Vec::new()),
            interrupt_after: Some((ticks, flag)),
        }
    }

    pub fn ticks(&self) -> Vec<Duration> {
        self.ticks.lock().expect("ticks lock").clone()
    }

    pub fn total(&self) -> Duration {
        self.ticks().into_iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        let mut ticks = self.ticks.lock().expect("ticks lock");
        ticks.push(duration);
        if let Some((after, flag)) = &self.interrupt_after
            && ticks.len() >= *after
        {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// A complete deployment in a temp directory: workspace repo, agent root,
/// a protected `supervisor.py`, and a locked `warden.toml`.
pub struct TestSandbox {
    _temp: TempDir,
    root: PathBuf,
    config: WardenConfig,
}

impl TestSandbox {
    pub fn new() -> Result<Self> {
        Self::with_config(|_| {})
    }

    /// Build a sandbox, letting `customize` adjust the config before init.
    pub fn with_config(customize: impl FnOnce(&mut WardenConfig)) -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = fs::canonicalize(temp.path()).context("canonicalize tempdir")?;
        let supervisor_dir = root.join("supervisor");
        fs::create_dir_all(&supervisor_dir).context("create supervisor dir")?;
        fs::write(supervisor_dir.join("supervisor.py"), "print('supervising')\n")
            .context("write supervisor.py")?;

        let mut config = WardenConfig {
            workspace_root: root.join("workspace"),
            agent_root: root.join("agent"),
            protected_files: vec![supervisor_dir.join("supervisor.py")],
            ..WardenConfig::default()
        };
        config.model.allowed = TEST_MODEL.to_string();
        config.tools.command_timeout_secs = 10;
        config.logging.iterations_dir = Some(root.join("iterations"));
        customize(&mut config);

        init_workspace(&root.join("warden.toml"), &config, &InitOptions::default())?;
        Git::new(&config.workspace_root).set_config("commit.gpgsign", "false")?;
        Ok(Self {
            _temp: temp,
            root,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("warden.toml")
    }

    pub fn workspace(&self) -> &Path {
        &self.config.workspace_root
    }

    pub fn agent_root(&self) -> &Path {
        &self.config.agent_root
    }

    pub fn protected_file(&self) -> PathBuf {
        self.root.join("supervisor/supervisor.py")
    }
}
