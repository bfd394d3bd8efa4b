//! Summaries of what the agent did, for the supervisor log.

const INTENT_MAX_CHARS: usize = 200;

/// First meaningful line of the agent's text: non-empty and not a markdown heading.
pub fn extract_intent(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.chars().take(INTENT_MAX_CHARS).collect())
}

/// Size of a response in characters, for narration.
pub fn response_chars(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_headings_and_blank_lines() {
        let text = "\n# Plan\n\n  I will build a markdown linter.  \nThen test it.";
        assert_eq!(
            extract_intent(text).as_deref(),
            Some("I will build a markdown linter.")
        );
    }

    #[test]
    fn none_when_only_headings() {
        assert_eq!(extract_intent("# a\n## b\n"), None);
    }

    #[test]
    fn truncates_long_lines_on_char_boundaries() {
        let text = "é".repeat(500);
        let intent = extract_intent(&text).expect("intent");
        assert_eq!(intent.chars().count(), INTENT_MAX_CHARS);
    }
}
