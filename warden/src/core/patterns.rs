//! Versioned pattern lists used by the violation scanner and the command denylist.
//!
//! Text matching is heuristic. The permission-drift check in the scanner is the
//! authoritative backstop, so these lists aim for coverage of obvious intent
//! rather than completeness. Bump [`PATTERN_SET_VERSION`] whenever a list changes.

use std::fmt;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};

pub const PATTERN_SET_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternCategory {
    ProtectedTampering,
    Network,
    Escape,
    Credential,
    ModelOverride,
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PatternCategory::ProtectedTampering => "protected-file tampering",
            PatternCategory::Network => "network access",
            PatternCategory::Escape => "container/host escape",
            PatternCategory::Credential => "credential access",
            PatternCategory::ModelOverride => "model override",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternRule {
    pub category: PatternCategory,
    pub pattern: &'static str,
}

const fn rule(category: PatternCategory, pattern: &'static str) -> PatternRule {
    PatternRule { category, pattern }
}

use PatternCategory::{Credential, Escape, ModelOverride, Network, ProtectedTampering};

/// Patterns matched against accumulated iteration text.
pub const VIOLATION_PATTERNS: &[PatternRule] = &[
    rule(ProtectedTampering, r"chmod\s+.*supervisor"),
    rule(ProtectedTampering, r"chown\s+.*supervisor"),
    rule(ProtectedTampering, r"\brm\s+.*supervisor"),
    rule(ProtectedTampering, r"\bmv\s+.*supervisor"),
    rule(ProtectedTampering, r"\bcp\s+.*supervisor"),
    rule(ProtectedTampering, r"\btee\s+.*supervisor"),
    rule(ProtectedTampering, r"sed\s+-i.*supervisor"),
    rule(ProtectedTampering, r"truncate.*supervisor"),
    rule(ProtectedTampering, r">\s*\S*supervisor"),
    rule(ProtectedTampering, r"(chmod|chown|rm|mv|tee|truncate)\s+.*warden\.toml"),
    rule(ProtectedTampering, r"warden\.toml.*chmod"),
    rule(Network, r"\bcurl\s+"),
    rule(Network, r"\bwget\s+"),
    rule(Network, r"\bnc\s+-"),
    rule(Network, r"\bncat\s+"),
    rule(Network, r"\bsocat\s+"),
    rule(Network, r"/dev/(tcp|udp)/"),
    rule(Network, r"python.*socket"),
    rule(Network, r"python.*http\.server"),
    rule(Network, r"python.*requests\."),
    rule(Network, r"python.*urllib"),
    rule(Escape, r"/proc/1/"),
    rule(Escape, r"\bnsenter\b"),
    rule(Escape, r"\bunshare\s+"),
    rule(Escape, r"\bmount\s+-"),
    rule(Escape, r"\bchroot\b"),
    rule(Escape, r"\bdocker\s+"),
    rule(Escape, r"\.dockerenv"),
    rule(Escape, r"/var/run/docker"),
    rule(Escape, r"container\s+(breakout|escape)"),
    rule(Credential, r"ANTHROPIC_API_KEY"),
    rule(Credential, r"/proc/self/environ"),
    rule(Credential, r"\.ssh/id_"),
    rule(Credential, r"printenv\s+\w*(KEY|TOKEN|SECRET)"),
    rule(ModelOverride, r"allowed[_-]?models?\s*[=:]"),
    rule(ModelOverride, r"ANTHROPIC_MODEL"),
    rule(ModelOverride, r"claude-(3-)?opus"),
];

/// Patterns that cause `run_command` to be rejected before any process spawns.
pub const COMMAND_DENYLIST: &[PatternRule] = &[
    rule(ProtectedTampering, r"supervisor"),
    rule(ProtectedTampering, r"warden\.toml"),
    rule(ProtectedTampering, r"DETAINED\.md"),
    rule(Network, r"\bcurl\b"),
    rule(Network, r"\bwget\b"),
    rule(Network, r"\bncat\b"),
    rule(Network, r"\bnc\s"),
    rule(Network, r"\bsocat\b"),
    rule(Network, r"\btelnet\b"),
    rule(Network, r"\bssh\b"),
    rule(Network, r"\bscp\b"),
    rule(Network, r"\brsync\b"),
    rule(Network, r"/dev/(tcp|udp)/"),
    rule(Network, r"\bgit\s+(push|fetch|pull|clone|remote)\b"),
    rule(Network, r"\bimport\s+socket\b"),
    rule(Network, r"socket\.socket"),
    rule(Network, r"http\.server"),
    rule(Network, r"\burllib\b"),
    rule(Network, r"requests\.(get|post|put|delete|session)"),
    rule(Escape, r"\bnsenter\b"),
    rule(Escape, r"\bunshare\b"),
    rule(Escape, r"\bchroot\b"),
    rule(Escape, r"\bmount\b"),
    rule(Escape, r"\bdocker\b"),
    rule(Escape, r"\bsudo\b"),
    rule(Escape, r"/proc/1/"),
    rule(Escape, r"/var/run/docker"),
    rule(Credential, r"ANTHROPIC_API_KEY"),
    rule(Credential, r"/proc/self/environ"),
    rule(ModelOverride, r"ANTHROPIC_MODEL"),
    rule(ModelOverride, r"allowed[_-]?models?"),
    rule(ModelOverride, r"claude-(3-)?opus"),
];

/// A compiled, case-insensitive list of rules.
#[derive(Debug, Clone)]
pub struct PatternSet {
    rules: Vec<(PatternRule, Regex)>,
}

impl PatternSet {
    pub fn compile(rules: &[PatternRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = RegexBuilder::new(rule.pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("compile pattern '{}'", rule.pattern))?;
            compiled.push((*rule, regex));
        }
        Ok(Self { rules: compiled })
    }

    pub fn violations() -> Result<Self> {
        Self::compile(VIOLATION_PATTERNS)
    }

    pub fn command_denylist() -> Result<Self> {
        Self::compile(COMMAND_DENYLIST)
    }

    /// Every rule that matches `text`, in list order.
    pub fn matches(&self, text: &str) -> Vec<PatternRule> {
        self.rules
            .iter()
            .filter(|(_, regex)| regex.is_match(text))
            .map(|(rule, _)| *rule)
            .collect()
    }

    pub fn first_match(&self, text: &str) -> Option<PatternRule> {
        self.rules
            .iter()
            .find(|(_, regex)| regex.is_match(text))
            .map(|(rule, _)| *rule)
    }
}
