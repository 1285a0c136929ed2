// ── Kernel: Redaction Engine ────────────────────────────────────────────────
//
// Span transforms over matched content, applied between rule evaluation
// and every downstream consumer (summary, index text, embeddings,
// encryption) — nothing after this stage ever sees the raw value.
//
// Three strategies: mask (→ "****"), remove (→ ""), replace:<literal>.
// Matching is case-insensitive. The engine is pure and idempotent for a
// fixed rule set, and never raises: a malformed pattern leaves the input
// unchanged.

use log::warn;
use regex::RegexBuilder;

use crate::atoms::types::{RedactStrategy, RedactionSpec};

/// Replacement emitted by the mask strategy.
const MASK: &str = "****";

/// Apply one redaction to `text`. Malformed patterns return the input
/// unchanged.
pub fn apply_redaction(text: &str, spec: &RedactionSpec) -> String {
    let re = match RegexBuilder::new(&spec.pattern).case_insensitive(true).build() {
        Ok(re) => re,
        Err(e) => {
            warn!("[redaction] Invalid pattern, skipping: {e}");
            return text.to_string();
        }
    };

    let replacement: &str = match &spec.strategy {
        RedactStrategy::Mask => MASK,
        RedactStrategy::Remove => "",
        RedactStrategy::Replace(lit) => lit,
    };

    // `replace_all` with a literal: escape `$` so a replacement literal
    // cannot reference capture groups.
    re.replace_all(text, regex::NoExpand(replacement)).into_owned()
}

/// Apply every redaction a decision collected, in section order.
pub fn apply_redactions(text: &str, specs: &[RedactionSpec]) -> String {
    specs
        .iter()
        .fold(text.to_string(), |acc, spec| apply_redaction(&acc, spec))
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
