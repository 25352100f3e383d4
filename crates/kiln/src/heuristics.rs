//! Lexical interactivity heuristics
//!
//! Neither check parses anything. `looks_interactive` misses programs that
//! read input through helpers it does not know, which then run in batch mode
//! and may time out; `looks_like_prompt` also fires on ordinary output that
//! happens to end in `:`, `?` or `>`.

use crate::config::Language;

/// Whether `source` contains one of the language's console-input patterns.
///
/// Whitespace is ignored, so `cin >> x` and `cin>>x` both match.
pub fn looks_interactive(source: &str, language: Language) -> bool {
    let compact = strip_whitespace(source);
    language
        .input_patterns()
        .iter()
        .any(|pattern| compact.contains(&strip_whitespace(pattern)))
}

/// Whether a line of program output looks like it is asking for input
pub fn looks_like_prompt(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.ends_with([':', '?', '>']) {
        return true;
    }
    let lower = trimmed.to_lowercase();
    PROMPT_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

const PROMPT_KEYWORDS: &[&str] = &["input", "enter"];

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}
