// ── Kernel: Summarization Engine ────────────────────────────────────────────
//
// Bounded extractive summaries for long memory content. Deterministic,
// no I/O, no network — a learned summarizer may replace this behind the
// same contract (idempotent on short input, bounded output, offline).
//
// Summaries are computed from the REDACTED value; the raw input never
// reaches this stage.

use log::debug;

use crate::atoms::constants::{SUMMARY_LENGTH_THRESHOLD, SUMMARY_TARGET_LENGTH};
use crate::atoms::types::{RuleDecision, SummaryMode};

/// Kinds that auto-summarize when the content is long, even without an
/// explicit rule flag.
const AUTO_SUMMARIZE_KINDS: [&str; 5] = [
    "conversation.transcript",
    "recording.transcript",
    "article.ingested",
    "code.diff",
    "chat",
];

/// Content shorter than this is returned unchanged by `summarize` —
/// too short to meaningfully compress.
const MIN_SUMMARIZABLE_LEN: usize = 300;

/// Extractive summaries shorter than this fall back to truncation.
const MIN_USEFUL_SUMMARY_LEN: usize = 100;

pub struct Summarizer {
    length_threshold: usize,
    target_length: usize,
}

impl Default for Summarizer {
    fn default() -> Self {
        Self {
            length_threshold: SUMMARY_LENGTH_THRESHOLD,
            target_length: SUMMARY_TARGET_LENGTH,
        }
    }
}

impl Summarizer {
    pub fn new(length_threshold: usize, target_length: usize) -> Self {
        Self {
            length_threshold,
            target_length,
        }
    }

    /// Whether the decision and content call for a summary.
    ///
    /// Triggers on an explicit `summarize: true`, or automatically for
    /// long content of the transcript-like kinds. `full_always` wins
    /// over everything.
    pub fn should_summarize(&self, decision: &RuleDecision, value: &str, kind: &str) -> bool {
        if decision.summary_mode == SummaryMode::FullAlways {
            return false;
        }
        if decision.summarize {
            return true;
        }
        AUTO_SUMMARIZE_KINDS.contains(&kind) && value.chars().count() > self.length_threshold
    }

    /// Compute a summary when one is called for, else `None`.
    pub fn maybe_summarize(
        &self,
        decision: &RuleDecision,
        value: &str,
        kind: &str,
    ) -> Option<String> {
        if !self.should_summarize(decision, value, kind) {
            return None;
        }
        Some(self.summarize(value))
    }

    /// Naive extractive summarizer: accumulate whole sentences in order
    /// until the target length, falling back to ellipsis truncation when
    /// the split yields nothing useful (e.g. one giant sentence).
    pub fn summarize(&self, value: &str) -> String {
        if value.chars().count() < MIN_SUMMARIZABLE_LEN {
            return value.to_string();
        }

        let sentences = split_sentences(value);

        let mut summary = String::new();
        for sentence in &sentences {
            if summary.chars().count() + sentence.chars().count() + 1 > self.target_length {
                break;
            }
            summary.push_str(sentence);
            summary.push(' ');
        }
        let result = summary.trim().to_string();

        let single_giant_sentence =
            sentences.len() == 1 && value.chars().count() > self.target_length;
        if result.chars().count() < MIN_USEFUL_SUMMARY_LEN || single_giant_sentence {
            let out = truncate_fallback(value, self.target_length);
            debug!("[summarize] {} chars -> {} (truncated)", value.len(), out.len());
            return out;
        }

        debug!("[summarize] {} chars -> {} chars", value.len(), result.len());
        result
    }
}

/// Split on sentence boundaries: `.`, `!`, or `?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(next_i, next_c)) = chars.peek() {
                if next_c.is_whitespace() {
                    sentences.push(text[start..next_i].trim_end());
                    // Skip the whitespace run.
                    while let Some(&(_, w)) = chars.peek() {
                        if !w.is_whitespace() {
                            break;
                        }
                        chars.next();
                    }
                    start = chars.peek().map(|&(j, _)| j).unwrap_or(text.len());
                }
            } else {
                sentences.push(text[start..=i].trim_end());
                start = text.len();
            }
        }
    }

    if start < text.len() {
        let tail = text[start..].trim();
        if !tail.is_empty() {
            sentences.push(tail);
        }
    }

    sentences
}

/// Truncate at the target character count, preferring a word boundary
/// past the midpoint, and append an ellipsis.
fn truncate_fallback(value: &str, target: usize) -> String {
    let cut = value
        .char_indices()
        .nth(target)
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    let mut snippet = value[..cut].trim_end();

    if let Some(last_space) = snippet.rfind(' ') {
        if last_space > cut / 2 {
            snippet = snippet[..last_space].trim_end();
        }
    }

    format!("{snippet}...")
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
