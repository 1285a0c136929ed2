// ── Kernel: Memory Rules Engine ─────────────────────────────────────────────
//
// Deterministic classification of incoming records to a normalized
// `RuleDecision`.
//
// The rule set is grouped into sections evaluated in a fixed order:
//   never_store → ask_before_store → context_only → redact → always_keep
//   → auto_expire
// The first matching rule per section contributes; later sections compose
// by field overwrite. Section membership carries implied defaults
// (never_store ⇒ allow_store=false, ask_before_store ⇒ requires_consent,
// context_only / always_keep / auto_expire ⇒ the matching recall policy).
//
// Rules with an invalid content regex or an unknown redact strategy are
// logged and skipped at compile time — evaluation itself never fails.
//
// Snapshots are immutable `Arc` values behind a `RwLock`; a reload swaps
// the whole snapshot atomically so no ingestion ever spans two versions.

use std::str::FromStr;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};

use crate::atoms::types::{
    EncryptField, EncryptStrength, RecallPolicy, RedactStrategy, RedactionSpec, Rule, RuleDecision,
    RuleMetadata, RuleSet, RuleSubject,
};

// ═══════════════════════════════════════════════════════════════════════════
// Compiled rules
// ═══════════════════════════════════════════════════════════════════════════

struct CompiledRule {
    rule: Rule,
    /// Pre-compiled case-insensitive content regex, when the rule has one.
    content_re: Option<Regex>,
    /// Pre-parsed redact strategy, when the rule names one.
    redact_strategy: Option<RedactStrategy>,
}

impl CompiledRule {
    /// Compile a rule; `None` means the rule is unusable and was skipped.
    fn compile(section: &str, rule: Rule) -> Option<Self> {
        let content_re = match rule.matcher.content.as_deref() {
            Some(pattern) => match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("[rules] Skipping {section} rule with invalid regex: {e}");
                    return None;
                }
            },
            None => None,
        };

        let redact_strategy = match rule.metadata.redact_strategy.as_deref() {
            Some(raw) => match RedactStrategy::from_str(raw) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("[rules] Skipping {section} rule: {e}");
                    return None;
                }
            },
            None => None,
        };

        Some(Self {
            rule,
            content_re,
            redact_strategy,
        })
    }

    /// A rule matches when every present match field matches the record.
    fn matches(&self, m: &RuleSubject) -> bool {
        let matcher = &self.rule.matcher;

        if let Some(kind) = &matcher.kind {
            if kind != &m.kind {
                return false;
            }
        }
        if let Some(key) = &matcher.key {
            if key != &m.key {
                return false;
            }
        }
        if let Some(speaker) = &matcher.speaker {
            if m.speaker.as_deref() != Some(speaker.as_str()) {
                return false;
            }
        }
        if let Some(tags) = &matcher.tags {
            if !tags.iter().all(|t| m.tags.iter().any(|mt| mt == t)) {
                return false;
            }
        }
        if let Some(re) = &self.content_re {
            if !re.is_match(&m.value) {
                return false;
            }
        }
        true
    }
}

/// An immutable, pre-compiled rule set snapshot. Evaluation over a
/// snapshot is a pure function: same subject, same decision.
pub struct CompiledRuleSet {
    sections: Vec<(&'static str, Vec<CompiledRule>)>,
}

impl CompiledRuleSet {
    pub fn compile(rules: &RuleSet) -> Self {
        let by_section: [(&'static str, &[Rule]); 6] = [
            ("never_store", &rules.never_store),
            ("ask_before_store", &rules.ask_before_store),
            ("context_only", &rules.context_only),
            ("redact", &rules.redact),
            ("always_keep", &rules.always_keep),
            ("auto_expire", &rules.auto_expire),
        ];

        let sections = by_section
            .into_iter()
            .map(|(name, section_rules)| {
                let compiled = section_rules
                    .iter()
                    .cloned()
                    .filter_map(|r| CompiledRule::compile(name, r))
                    .collect();
                (name, compiled)
            })
            .collect();

        Self { sections }
    }

    /// Evaluate the snapshot against a record, composing section
    /// contributions in priority order.
    pub fn evaluate(&self, subject: &RuleSubject) -> RuleDecision {
        let mut decision = RuleDecision::default();

        for (section, rules) in &self.sections {
            let Some(rule) = rules.iter().find(|r| r.matches(subject)) else {
                continue;
            };
            decision.matched_sections.push((*section).to_string());
            apply_section_defaults(section, &mut decision);
            apply_metadata(rule, &mut decision);
            collect_redaction(section, rule, &mut decision);
        }

        decision
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|(_, rules)| rules.is_empty())
    }
}

fn apply_section_defaults(section: &str, decision: &mut RuleDecision) {
    match section {
        "never_store" => decision.allow_store = false,
        "ask_before_store" => decision.requires_consent = true,
        "context_only" => decision.recall_policy = RecallPolicy::ContextOnly,
        "always_keep" => decision.recall_policy = RecallPolicy::AlwaysKeep,
        "auto_expire" => decision.recall_policy = RecallPolicy::AutoExpire,
        _ => {}
    }
}

fn apply_metadata(rule: &CompiledRule, decision: &mut RuleDecision) {
    let meta: &RuleMetadata = &rule.rule.metadata;

    if let Some(v) = meta.allow_store {
        decision.allow_store = v;
    }
    if let Some(v) = meta.requires_consent {
        decision.requires_consent = v;
    }
    if let Some(v) = meta.recall_policy {
        decision.recall_policy = v;
    }
    if let Some(strategy) = &rule.redact_strategy {
        decision.redact_strategy = Some(strategy.clone());
    } else if meta.redact == Some(true) && decision.redact_strategy.is_none() {
        // `redact: true` without a strategy defaults to mask.
        decision.redact_strategy = Some(RedactStrategy::Mask);
    }
    if let Some(enc) = &meta.encrypt {
        if let Some(strength) = normalize_encrypt(enc) {
            decision.encrypt = strength;
        }
    }
    if let Some(v) = meta.summarize {
        decision.summarize = v;
    }
    if let Some(v) = meta.summary_mode {
        decision.summary_mode = v;
    }
    if let Some(v) = meta.embed {
        decision.embed = v;
    }
    if let Some(v) = meta.embed_store {
        decision.embed_store = v;
    }
    if let Some(v) = meta.embed_remote_ok {
        decision.embed_remote_ok = v;
    }
    if let Some(v) = meta.fts_index {
        decision.fts_index = v;
    }
    if let Some(v) = meta.fts_index_mode {
        decision.fts_index_mode = v;
    }
    if let Some(retrieval) = &meta.retrieval {
        if let Some(boost) = retrieval.boost {
            decision.retrieval_boost = boost;
        }
    }
}

/// A contributing rule with a content pattern and an effective strategy
/// adds one redaction. Rules in the `redact` section default to mask.
fn collect_redaction(section: &str, rule: &CompiledRule, decision: &mut RuleDecision) {
    let Some(pattern) = rule.rule.matcher.content.clone() else {
        return;
    };

    let strategy = rule
        .redact_strategy
        .clone()
        .or_else(|| {
            (rule.rule.metadata.redact == Some(true) || section == "redact")
                .then_some(RedactStrategy::Mask)
        });

    if let Some(strategy) = strategy {
        decision.redactions.push(RedactionSpec { pattern, strategy });
    }
}

/// `encrypt` aliases: `true` → standard, `false` → none. Unknown strings
/// are logged and ignored.
fn normalize_encrypt(field: &EncryptField) -> Option<EncryptStrength> {
    match field {
        EncryptField::Flag(true) => Some(EncryptStrength::Standard),
        EncryptField::Flag(false) => Some(EncryptStrength::None),
        EncryptField::Strength(s) => match s.trim().to_lowercase().as_str() {
            "standard" | "yes" | "true" => Some(EncryptStrength::Standard),
            "strong" => Some(EncryptStrength::Strong),
            "none" | "no" | "false" => Some(EncryptStrength::None),
            other => {
                warn!("[rules] Ignoring unknown encrypt value: {other}");
                None
            }
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine (snapshot holder)
// ═══════════════════════════════════════════════════════════════════════════

/// Holds the current compiled snapshot and swaps it atomically on reload.
pub struct RulesEngine {
    snapshot: RwLock<Arc<CompiledRuleSet>>,
}

impl RulesEngine {
    pub fn new(rules: &RuleSet) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(CompiledRuleSet::compile(rules))),
        }
    }

    /// Atomically install a new rule set. Readers holding the previous
    /// snapshot finish their operation on it.
    pub fn install(&self, rules: &RuleSet) {
        let compiled = Arc::new(CompiledRuleSet::compile(rules));
        *self.snapshot.write() = compiled;
        info!("[rules] Installed new rule snapshot");
    }

    /// The current snapshot. Pipelines take one snapshot up front so a
    /// single ingestion never observes two rule versions.
    pub fn snapshot(&self) -> Arc<CompiledRuleSet> {
        self.snapshot.read().clone()
    }

    /// Convenience: evaluate against the current snapshot.
    pub fn evaluate(&self, subject: &RuleSubject) -> RuleDecision {
        self.snapshot().evaluate(subject)
    }
}

impl Default for RulesEngine {
    fn default() -> Self {
        Self::new(&RuleSet::default())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{EmbedMode, FtsIndexMode, RuleMatch};

    fn subject(kind: &str, value: &str) -> RuleSubject {
        RuleSubject {
            kind: kind.to_string(),
            key: "k".to_string(),
            value: value.to_string(),
            tags: vec![],
            speaker: None,
        }
    }

    fn rules_json(json: &str) -> RuleSet {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_unmatched_record_gets_defaults() {
        let engine = RulesEngine::default();
        let d = engine.evaluate(&subject("chat", "hello"));
        assert!(d.allow_store);
        assert!(!d.requires_consent);
        assert_eq!(d.recall_policy, RecallPolicy::None);
        assert_eq!(d.encrypt, EncryptStrength::None);
        assert_eq!(d.embed, EmbedMode::Summary);
        assert!(!d.embed_store);
        assert!(d.fts_index);
        assert_eq!(d.fts_index_mode, FtsIndexMode::SummaryPreferred);
        assert_eq!(d.retrieval_boost, 1.0);
        assert!(d.matched_sections.is_empty());
    }

    #[test]
    fn test_never_store_section_implies_allow_store_false() {
        let rules = rules_json(
            r#"{"never_store": [{"match": {"content": "(?i)ssn"}, "metadata": {}}]}"#,
        );
        let engine = RulesEngine::new(&rules);
        let d = engine.evaluate(&subject("chat", "my SSN is 123"));
        assert!(!d.allow_store);
        assert_eq!(d.matched_sections, vec!["never_store"]);
    }

    #[test]
    fn test_ask_before_store_implies_requires_consent() {
        let rules = rules_json(
            r#"{"ask_before_store": [{"match": {"content": "password"}, "metadata": {}}]}"#,
        );
        let engine = RulesEngine::new(&rules);
        assert!(engine.evaluate(&subject("chat", "my PASSWORD is x")).requires_consent);
        assert!(!engine.evaluate(&subject("chat", "nothing here")).requires_consent);
    }

    #[test]
    fn test_sections_compose_by_overwrite_in_order() {
        // ask_before_store sets encrypt=standard; always_keep (later)
        // overwrites to strong and contributes its recall policy.
        let rules = rules_json(
            r#"{
                "ask_before_store": [
                    {"match": {"kind": "chat"}, "metadata": {"encrypt": "standard"}}
                ],
                "always_keep": [
                    {"match": {"kind": "chat"}, "metadata": {"encrypt": "strong"}}
                ]
            }"#,
        );
        let engine = RulesEngine::new(&rules);
        let d = engine.evaluate(&subject("chat", "x"));
        assert!(d.requires_consent);
        assert_eq!(d.encrypt, EncryptStrength::Strong);
        assert_eq!(d.recall_policy, RecallPolicy::AlwaysKeep);
        assert_eq!(d.matched_sections, vec!["ask_before_store", "always_keep"]);
    }

    #[test]
    fn test_first_matching_rule_per_section_wins() {
        let rules = rules_json(
            r#"{"redact": [
                {"match": {"content": "alpha"}, "metadata": {"redact_strategy": "remove"}},
                {"match": {"content": "alpha"}, "metadata": {"redact_strategy": "mask"}}
            ]}"#,
        );
        let engine = RulesEngine::new(&rules);
        let d = engine.evaluate(&subject("chat", "alpha beta"));
        assert_eq!(d.redactions.len(), 1);
        assert_eq!(d.redactions[0].strategy, RedactStrategy::Remove);
    }

    #[test]
    fn test_encrypt_boolean_aliases() {
        let rules = rules_json(
            r#"{
                "redact": [{"match": {"content": "a"}, "metadata": {"encrypt": true}}],
                "always_keep": [{"match": {"content": "b"}, "metadata": {"encrypt": false}}]
            }"#,
        );
        let engine = RulesEngine::new(&rules);
        assert_eq!(
            engine.evaluate(&subject("chat", "a only")).encrypt,
            EncryptStrength::Standard
        );
        assert_eq!(
            engine.evaluate(&subject("chat", "a and b")).encrypt,
            EncryptStrength::None
        );
    }

    #[test]
    fn test_invalid_regex_rule_is_skipped() {
        let rules = rules_json(
            r#"{"never_store": [
                {"match": {"content": "([unclosed"}, "metadata": {}},
                {"match": {"content": "valid"}, "metadata": {}}
            ]}"#,
        );
        let engine = RulesEngine::new(&rules);
        // The invalid rule neither matches nor panics; the valid one works.
        assert!(engine.evaluate(&subject("chat", "nothing")).allow_store);
        assert!(!engine.evaluate(&subject("chat", "valid here")).allow_store);
    }

    #[test]
    fn test_unknown_redact_strategy_skips_rule() {
        let rules = rules_json(
            r#"{"redact": [
                {"match": {"content": "x"}, "metadata": {"redact_strategy": "scramble"}}
            ]}"#,
        );
        let engine = RulesEngine::new(&rules);
        let d = engine.evaluate(&subject("chat", "x marks the spot"));
        assert!(d.redactions.is_empty());
        assert!(d.matched_sections.is_empty());
    }

    #[test]
    fn test_redact_true_defaults_to_mask() {
        let rules = rules_json(
            r#"{"always_keep": [
                {"match": {"content": "secret"}, "metadata": {"redact": true}}
            ]}"#,
        );
        let engine = RulesEngine::new(&rules);
        let d = engine.evaluate(&subject("chat", "a secret thing"));
        assert_eq!(d.redact_strategy, Some(RedactStrategy::Mask));
        assert_eq!(d.redactions.len(), 1);
    }

    #[test]
    fn test_redact_section_defaults_to_mask() {
        let rules = rules_json(r#"{"redact": [{"match": {"content": "pw"}, "metadata": {}}]}"#);
        let engine = RulesEngine::new(&rules);
        let d = engine.evaluate(&subject("chat", "pw here"));
        assert_eq!(d.redactions.len(), 1);
        assert_eq!(d.redactions[0].strategy, RedactStrategy::Mask);
    }

    #[test]
    fn test_tag_match_requires_all_listed_tags() {
        let mut rule = Rule::default();
        rule.matcher = RuleMatch {
            tags: Some(vec!["work".to_string(), "private".to_string()]),
            ..Default::default()
        };
        let rules = RuleSet {
            context_only: vec![rule],
            ..Default::default()
        };
        let engine = RulesEngine::new(&rules);

        let mut s = subject("note", "x");
        s.tags = vec!["work".to_string()];
        assert_eq!(engine.evaluate(&s).recall_policy, RecallPolicy::None);

        s.tags = vec!["private".to_string(), "work".to_string(), "misc".to_string()];
        assert_eq!(engine.evaluate(&s).recall_policy, RecallPolicy::ContextOnly);
    }

    #[test]
    fn test_speaker_and_kind_matching() {
        let rules = rules_json(
            r#"{"never_store": [
                {"match": {"kind": "chat", "speaker": "guest"}, "metadata": {}}
            ]}"#,
        );
        let engine = RulesEngine::new(&rules);

        let mut s = subject("chat", "x");
        assert!(engine.evaluate(&s).allow_store);
        s.speaker = Some("guest".to_string());
        assert!(!engine.evaluate(&s).allow_store);
        s.kind = "note".to_string();
        assert!(engine.evaluate(&s).allow_store);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let rules = rules_json(
            r#"{
                "redact": [{"match": {"content": "(?i)password"}, "metadata": {"redact_strategy": "mask", "encrypt": "strong"}}],
                "context_only": [{"match": {"kind": "chat"}, "metadata": {}}]
            }"#,
        );
        let engine = RulesEngine::new(&rules);
        let s = subject("chat", "my Password is hunter2");
        let a = engine.evaluate(&s);
        let b = engine.evaluate(&s);
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }

    #[test]
    fn test_install_swaps_snapshot_atomically() {
        let engine = RulesEngine::default();
        let s = subject("chat", "password");
        assert!(engine.evaluate(&s).allow_store);

        // A snapshot taken before the swap keeps the old behavior.
        let old = engine.snapshot();
        engine.install(&rules_json(
            r#"{"never_store": [{"match": {"content": "password"}, "metadata": {}}]}"#,
        ));
        assert!(old.evaluate(&s).allow_store);
        assert!(!engine.evaluate(&s).allow_store);
    }

    #[test]
    fn test_retrieval_boost_from_rule() {
        let rules = rules_json(
            r#"{"always_keep": [
                {"match": {"kind": "user_profile"}, "metadata": {"retrieval": {"boost": 2.5}}}
            ]}"#,
        );
        let engine = RulesEngine::new(&rules);
        let d = engine.evaluate(&subject("user_profile", "likes tea"));
        assert_eq!(d.retrieval_boost, 2.5);
    }
}
