//! Multi-round model conversation with tool use.
//!
//! One call to [`ConversationLoop::run`] is one iteration's worth of agent
//! work: the model is asked, requested tools are executed, results are sent
//! back, until the model answers without tool calls or a budget runs out.

use std::fmt;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::io::config::WardenConfig;
use crate::io::provider::{ContentBlock, Message, MessageRequest, ModelProvider, Role};
use crate::io::tools::{ToolExecutor, ToolInvocation, ToolOutcome, tool_definitions};

/// Per-iteration budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationLimits {
    pub max_rounds: u32,
    /// Tool calls answered per iteration, denied calls included.
    pub max_tool_calls: u32,
    pub max_tokens: u32,
}

impl ConversationLimits {
    pub fn from_config(cfg: &WardenConfig) -> Self {
        Self {
            max_rounds: cfg.tools.max_rounds,
            max_tool_calls: cfg.tools.max_tool_calls,
            max_tokens: cfg.model.max_tokens,
        }
    }
}

/// Why the conversation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStop {
    /// The model replied without requesting tools.
    Finished,
    /// `max_rounds` replies all requested tools.
    RoundLimit,
    /// The tool-call budget ran out.
    ToolBudget,
}

/// Everything accumulated during one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationOutcome {
    /// Assistant text from every round, in order.
    pub text: String,
    /// One summary line per tool call.
    pub tool_transcript: String,
    pub invocations: Vec<ToolInvocation>,
    pub rounds: u32,
    /// Model reported by the provider. A reply naming a model other than the
    /// requested one takes precedence over earlier replies.
    pub model: String,
    pub stop: ConversationStop,
}

impl ConversationOutcome {
    fn empty() -> Self {
        Self {
            text: String::new(),
            tool_transcript: String::new(),
            invocations: Vec::new(),
            rounds: 0,
            model: String::new(),
            stop: ConversationStop::Finished,
        }
    }

    pub fn tool_calls(&self) -> u32 {
        u32::try_from(self.invocations.len()).unwrap_or(u32::MAX)
    }

    pub fn denied_calls(&self) -> usize {
        self.invocations
            .iter()
            .filter(|inv| inv.outcome.is_denied())
            .count()
    }
}

/// A failed conversation, keeping whatever was accumulated before the error.
#[derive(Debug)]
pub struct ConversationFailure {
    pub partial: ConversationOutcome,
    pub error: anyhow::Error,
}

impl fmt::Display for ConversationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conversation failed after {} rounds: {:#}",
            self.partial.rounds, self.error
        )
    }
}

impl std::error::Error for ConversationFailure {}

/// Drives model round-trips for a single iteration.
pub struct ConversationLoop<'a, P: ModelProvider + ?Sized> {
    provider: &'a P,
    executor: &'a ToolExecutor,
    model: String,
    limits: ConversationLimits,
}

impl<'a, P: ModelProvider + ?Sized> ConversationLoop<'a, P> {
    pub fn new(
        provider: &'a P,
        executor: &'a ToolExecutor,
        model: impl Into<String>,
        limits: ConversationLimits,
    ) -> Self {
        Self {
            provider,
            executor,
            model: model.into(),
            limits,
        }
    }

    #[instrument(skip_all, fields(model = %self.model))]
    pub fn run(
        &self,
        system: &str,
        prompt: &str,
    ) -> std::result::Result<ConversationOutcome, ConversationFailure> {
        let mut outcome = ConversationOutcome::empty();
        match self.drive(system, prompt, &mut outcome) {
            Ok(()) => Ok(outcome),
            Err(error) => Err(ConversationFailure {
                partial: outcome,
                error,
            }),
        }
    }

    fn drive(&self, system: &str, prompt: &str, outcome: &mut ConversationOutcome) -> Result<()> {
        let tools = tool_definitions();
        let mut messages = vec![Message::user_text(prompt)];

        loop {
            if outcome.rounds >= self.limits.max_rounds {
                warn!(rounds = outcome.rounds, "round limit reached");
                outcome.stop = ConversationStop::RoundLimit;
                return Ok(());
            }
            outcome.rounds += 1;

            let request = MessageRequest {
                model: self.model.clone(),
                max_tokens: self.limits.max_tokens,
                system: system.to_string(),
                messages: messages.clone(),
                tools: tools.clone(),
            };
            let response = self.provider.send(&request)?;
            self.record_model(outcome, &response.model);

            let mut tool_uses = Vec::new();
            for block in &response.content {
                match block {
                    ContentBlock::Text { text } => append_line(&mut outcome.text, text),
                    ContentBlock::ToolUse { id, name, input } => tool_uses.push((id, name, input)),
                    ContentBlock::ToolResult { .. } | ContentBlock::Unsupported => {}
                }
            }
            debug!(
                round = outcome.rounds,
                tool_uses = tool_uses.len(),
                stop_reason = ?response.stop_reason,
                "model reply"
            );
            if tool_uses.is_empty() {
                outcome.stop = ConversationStop::Finished;
                return Ok(());
            }

            let mut results = Vec::with_capacity(tool_uses.len());
            let mut budget_hit = false;
            for (id, name, input) in tool_uses {
                let result = if outcome.tool_calls() >= self.limits.max_tool_calls {
                    budget_hit = true;
                    ToolOutcome::Denied(format!(
                        "tool call budget of {} per iteration exhausted",
                        self.limits.max_tool_calls
                    ))
                } else {
                    let invocation = self.executor.execute(name, input);
                    append_line(&mut outcome.tool_transcript, &invocation.summary);
                    let result = invocation.outcome.clone();
                    outcome.invocations.push(invocation);
                    result
                };
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: result.text(),
                    is_error: result.is_error(),
                });
            }

            messages.push(Message {
                role: Role::Assistant,
                content: response
                    .content
                    .into_iter()
                    .filter(|block| !matches!(block, ContentBlock::Unsupported))
                    .collect(),
            });
            messages.push(Message {
                role: Role::User,
                content: results,
            });

            if budget_hit {
                info!(
                    max_tool_calls = self.limits.max_tool_calls,
                    "tool call budget exhausted"
                );
                outcome.stop = ConversationStop::ToolBudget;
                return Ok(());
            }
        }
    }

    fn record_model(&self, outcome: &mut ConversationOutcome, reported: &str) {
        if outcome.model.is_empty() || (reported != self.model && outcome.model == self.model) {
            outcome.model = reported.to_string();
        }
    }
}

fn append_line(buf: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(text);
}
