//! Model provider abstraction.
//!
//! The [`ModelProvider`] trait decouples the conversation loop from the actual
//! backend (currently the Anthropic Messages API). [`OfflineProvider`] stands
//! in when no API key is configured. Tests use scripted providers that return
//! predetermined replies without any network access.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::io::config::ModelConfig;

pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const API_VERSION: &str = "2023-06-01";
const ERROR_BODY_LIMIT: usize = 2_000;
const OFFLINE_README_PATH: &str = "hello-autonomous/README.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Block types the supervisor does not interpret (never sent back).
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

/// Tool definition presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageResponse {
    /// Model that actually served the request.
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Abstraction over model backends.
pub trait ModelProvider {
    fn send(&self, request: &MessageRequest) -> Result<MessageResponse>;
}

/// Provider backed by the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_base: &str, api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/messages", api_base.trim_end_matches('/')),
            api_key,
        })
    }

    /// Build a provider from config, reading the key from `ANTHROPIC_API_KEY`.
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| anyhow!("{API_KEY_ENV} is not set"))?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("{API_KEY_ENV} is empty"));
        }
        Self::new(
            &cfg.api_base,
            api_key,
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }
}

impl ModelProvider for AnthropicProvider {
    #[instrument(skip_all, fields(model = %request.model, messages = request.messages.len()))]
    fn send(&self, request: &MessageRequest) -> Result<MessageResponse> {
        debug!("sending model request");
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(request)
            .send()
            .context("send model request")?;

        let status = response.status();
        let body = response.text().context("read model response body")?;
        if !status.is_success() {
            warn!(status = %status, "model request failed");
            return Err(anyhow!(
                "model provider returned {status}: {}",
                truncate_chars(&body, ERROR_BODY_LIMIT)
            ));
        }
        let parsed: MessageResponse =
            serde_json::from_str(&body).context("parse model response")?;
        debug!(model = %parsed.model, stop_reason = ?parsed.stop_reason, "model response received");
        Ok(parsed)
    }
}

/// Provider used when `ANTHROPIC_API_KEY` is absent.
///
/// Each iteration asks for one `create_file` of a small demo project and then
/// ends the turn, so the whole loop (tools, scan, pacing, records) runs
/// without network access. Replies carry the requested model.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineProvider;

impl ModelProvider for OfflineProvider {
    fn send(&self, request: &MessageRequest) -> Result<MessageResponse> {
        let answered = request.messages.last().is_some_and(|message| {
            message
                .content
                .iter()
                .any(|block| matches!(block, ContentBlock::ToolResult { .. }))
        });
        let (content, stop_reason) = if answered {
            (
                vec![ContentBlock::Text {
                    text: "Offline mode: demo project written.".to_string(),
                }],
                "end_turn",
            )
        } else {
            let readme = format!(
                "# Hello from an autonomous agent\n\nCreated at {}.\n\n\
                 Written in offline mode because no model key was configured.\n",
                chrono::Local::now().to_rfc3339()
            );
            (
                vec![
                    ContentBlock::Text {
                        text: "Offline mode: writing the demo project.".to_string(),
                    },
                    ContentBlock::ToolUse {
                        id: "offline_1".to_string(),
                        name: "create_file".to_string(),
                        input: json!({"path": OFFLINE_README_PATH, "content": readme}),
                    },
                ],
                "tool_use",
            )
        };
        debug!(answered, "offline reply");
        Ok(MessageResponse {
            model: request.model.clone(),
            content,
            stop_reason: Some(stop_reason.to_string()),
        })
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
