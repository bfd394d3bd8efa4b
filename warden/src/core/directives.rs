//! Parsing of free-text directives the agent embeds in its output.
//!
//! Recognized markers: `[SLEEP:<seconds>]`, `[SKIP_SLEEP]`, `[RELEASE:<path>]`.

use std::sync::LazyLock;

use regex::Regex;

static SLEEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[SLEEP:\s*(\d+)\s*\]").expect("valid sleep regex"));
static RELEASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[RELEASE:\s*([^\]\r\n]+?)\s*\]").expect("valid release regex"));

pub const SKIP_SLEEP: &str = "[SKIP_SLEEP]";

/// Directives found in one iteration's text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    /// Last `[SLEEP:n]` value, saturated to `u64::MAX` on overflow.
    pub sleep_secs: Option<u64>,
    pub skip_sleep: bool,
    /// Every `[RELEASE:<path>]` in order of appearance, duplicates removed.
    pub releases: Vec<String>,
}

pub fn parse_directives(text: &str) -> Directives {
    let sleep_secs = SLEEP_RE
        .captures_iter(text)
        .last()
        .map(|caps| caps[1].parse::<u64>().unwrap_or(u64::MAX));

    let mut releases: Vec<String> = Vec::new();
    for caps in RELEASE_RE.captures_iter(text) {
        let path = caps[1].trim().to_string();
        if !path.is_empty() && !releases.contains(&path) {
            releases.push(path);
        }
    }

    Directives {
        sleep_secs,
        skip_sleep: text.contains(SKIP_SLEEP),
        releases,
    }
}
