// ── Kernel: Indexing Policy Guard ───────────────────────────────────────────
//
// Decides whether a record may enter the FTS and vector indexes given its
// rule decision. One stricter rule exists: with `disallow_strong_only`
// set, strongly-encrypted content leaves no trace in any index.
// Applied before both FTS and vector writes.

use log::info;

use crate::atoms::types::{EncryptStrength, IndexingConfig, RuleDecision};

/// Pure guard: false blocks both FTS and vector indexing.
pub fn can_index(decision: &RuleDecision, indexing: &IndexingConfig) -> bool {
    if !indexing.disallow_strong_only {
        return true;
    }

    if decision.encrypt == EncryptStrength::Strong {
        info!("[policy] Indexing blocked: encrypt=strong with disallow_strong_only enabled");
        return false;
    }

    true
}
