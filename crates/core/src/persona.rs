//! Persona prompt for the live session, built from a figure's biography.

use crate::content::FigureProfile;
use regex::Regex;
use std::sync::LazyLock;

/// Maximum number of biography characters carried into the prompt.
pub const CONTEXT_CHAR_BUDGET: usize = 1000;

const FALLBACK_CONTEXT: &str = "Historical figure.";
const FALLBACK_REIGN: &str = "Unknown";

const ROLEPLAY_RULES: &str = "Roleplay rules:
1. Speak in the first person (\"I\").
2. Use a tone befitting a ruler of your era.
3. Keep answers conversational and concise (2-3 sentences mostly).
4. Do not break character.";

// Also matches an unterminated trailing tag.
static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>?").expect("markup pattern is valid"));

/// Replaces every markup tag with a space and collapses runs of whitespace.
pub fn strip_markup(html: &str) -> String {
    let spaced = MARKUP.replace_all(html, " ");
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Returns at most `budget` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, budget: usize) -> &str {
    match text.char_indices().nth(budget) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn build_persona_prompt(profile: &FigureProfile) -> String {
    let stripped = profile
        .content
        .as_deref()
        .map(strip_markup)
        .filter(|s| !s.is_empty());
    let context = stripped
        .as_deref()
        .map(|s| truncate_chars(s, CONTEXT_CHAR_BUDGET))
        .unwrap_or(FALLBACK_CONTEXT);
    let reign = profile
        .summary
        .reign
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .unwrap_or(FALLBACK_REIGN);

    format!(
        "You are {title}.\nReign: {reign}.\nContext: {context}.\n\n{ROLEPLAY_RULES}\n",
        title = profile.summary.title,
    )
}
