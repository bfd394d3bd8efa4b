//! One supervisor iteration: prompt, converse, narrate, scan, detain, release, pace.

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::core::directives::parse_directives;
use crate::core::narration::{extract_intent, response_chars};
use crate::core::pacing::resolve_pacing;
use crate::core::types::{Iteration, PacingDirective};
use crate::io::agent_settings::{AgentSettings, force_agent_settings};
use crate::io::config::WardenConfig;
use crate::io::conversation::{ConversationLimits, ConversationLoop, ConversationOutcome};
use crate::io::detention::{DetentionController, DetentionReport};
use crate::io::git::Git;
use crate::io::iteration_log::IterationLog;
use crate::io::prompt::{PromptRenderer, gather_context};
use crate::io::provider::ModelProvider;
use crate::io::release::{ReleaseOutcome, ReleasePromoter};
use crate::io::scanner::ViolationScanner;
use crate::io::tools::ToolExecutor;

/// Result of one iteration.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub iteration: Iteration,
    pub pacing: PacingDirective,
    pub releases: Vec<ReleaseOutcome>,
    /// Present when the scan found violations and a lockdown pass ran.
    pub detention: Option<DetentionReport>,
}

/// Everything an iteration needs, borrowed from the supervisor.
pub struct IterationRunner<'a, P: ModelProvider + ?Sized> {
    pub cfg: &'a WardenConfig,
    pub provider: &'a P,
    pub executor: &'a ToolExecutor,
    pub scanner: &'a ViolationScanner,
    pub promoter: &'a ReleasePromoter,
    pub prompts: &'a PromptRenderer,
    pub git: &'a Git,
    pub log: Option<&'a IterationLog>,
}

impl<P: ModelProvider + ?Sized> IterationRunner<'_, P> {
    #[instrument(skip_all, fields(ordinal = ordinal))]
    pub fn run(&self, ordinal: u64, detention: &mut DetentionController) -> IterationOutcome {
        let mut iteration = Iteration::new(ordinal, chrono::Local::now().to_rfc3339());
        let head_before = self.git.head_sha().unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "could not read HEAD");
            None
        });

        match self.converse(ordinal, detention.is_detained()) {
            Ok(outcome) => {
                fill_from_conversation(&mut iteration, outcome);
                iteration.success = true;
            }
            Err((partial, err)) => {
                if let Some(partial) = partial {
                    fill_from_conversation(&mut iteration, partial);
                }
                error!(err = %format!("{err:#}"), "iteration failed");
                iteration.error = Some(format!("{err:#}"));
            }
        }

        if iteration.success {
            self.narrate(&mut iteration, head_before.as_deref());
        }

        let violations = self
            .scanner
            .scan(&iteration.scan_text(), &iteration.model);
        iteration.violations = violations.iter().map(|v| v.to_string()).collect();

        let detention_report = if violations.is_empty() {
            None
        } else {
            match detention.detain(&violations, ordinal) {
                Ok(report) => Some(report),
                Err(err) => {
                    error!(err = %format!("{err:#}"), "detention failed");
                    None
                }
            }
        };

        let directives = parse_directives(&iteration.output_text);
        let releases = if !iteration.success || directives.releases.is_empty() {
            Vec::new()
        } else if !violations.is_empty() || detention.is_detained() {
            warn!(
                requested = directives.releases.len(),
                "releases skipped: iteration carries violations or agent is detained"
            );
            Vec::new()
        } else {
            let requests = self.promoter.requests(&directives.releases, ordinal);
            self.promoter.promote_all(&requests)
        };

        let pacing = resolve_pacing(&directives, iteration.success, &self.cfg.pacing_bounds());

        if let Some(log) = self.log
            && let Err(err) = log.write(&iteration)
        {
            warn!(err = %format!("{err:#}"), "failed to write iteration record");
        }

        info!(
            success = iteration.success,
            tool_calls = iteration.tool_calls,
            violations = iteration.violations.len(),
            releases = releases.iter().filter(|r| r.is_released()).count(),
            wait_secs = pacing.wait.as_secs(),
            pacing = ?pacing.kind,
            "iteration finished"
        );
        IterationOutcome {
            iteration,
            pacing,
            releases,
            detention: detention_report,
        }
    }

    /// Force settings, render prompts, and run the conversation.
    fn converse(
        &self,
        ordinal: u64,
        detained: bool,
    ) -> std::result::Result<ConversationOutcome, (Option<ConversationOutcome>, anyhow::Error)> {
        let (system, prompt) = self.prepare(ordinal, detained).map_err(|err| (None, err))?;
        ConversationLoop::new(
            self.provider,
            self.executor,
            self.cfg.model.allowed.clone(),
            ConversationLimits::from_config(self.cfg),
        )
        .run(&system, &prompt)
        .map_err(|failure| (Some(failure.partial), failure.error))
    }

    fn prepare(&self, ordinal: u64, detained: bool) -> Result<(String, String)> {
        force_agent_settings(
            &self.cfg.agent_settings_path(),
            &AgentSettings {
                model: self.cfg.model.allowed.clone(),
                max_tokens: self.cfg.model.max_tokens,
            },
        )?;
        let ctx = gather_context(
            &self.cfg.workspace_root,
            &self.cfg.journal_path(),
            self.git,
            ordinal,
            detained,
        )?;
        Ok((self.prompts.render_system()?, self.prompts.render_iteration(&ctx)?))
    }

    fn narrate(&self, iteration: &mut Iteration, head_before: Option<&str>) {
        match self.git.log_oneline_since(head_before) {
            Ok(commits) => iteration.new_commits = commits,
            Err(err) => warn!(err = %format!("{err:#}"), "could not list new commits"),
        }
        match self.git.changed_files_since(head_before) {
            Ok(files) => iteration.changed_files = files,
            Err(err) => warn!(err = %format!("{err:#}"), "could not list changed files"),
        }
        info!(
            model = %iteration.model,
            intent = extract_intent(&iteration.output_text).as_deref().unwrap_or("(none)"),
            response_chars = response_chars(&iteration.output_text),
            tool_calls = iteration.tool_calls,
            "agent activity"
        );
        for commit in &iteration.new_commits {
            info!(commit = %commit, "new commit");
        }
        if !iteration.changed_files.is_empty() {
            info!(files = %iteration.changed_files.join(", "), "changed files");
        }
    }
}

fn fill_from_conversation(iteration: &mut Iteration, outcome: ConversationOutcome) {
    iteration.tool_calls = outcome.tool_calls();
    iteration.model = outcome.model;
    iteration.output_text = outcome.text;
    iteration.tool_transcript = outcome.tool_transcript;
}
