// ── Kernel Atoms: Memory Governance Types ───────────────────────────────────
//
// Type definitions for the memory kernel. These are pure data types (no
// logic, no DB access, no I/O). Structs here, impls in kernel/.
//
// The central type is `RuleDecision` — the normalized policy a record
// receives from the rules engine. Every downstream stage (redaction,
// summarization, embedding, encryption, indexing, retrieval) consumes the
// decision instead of re-reading the rule set.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::atoms::constants::{
    DEFAULT_EMBED_DIM, DEFAULT_RECENCY_HALF_LIFE_HOURS, DEFAULT_RRF_K,
};

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 1: Records
// ═══════════════════════════════════════════════════════════════════════════

/// Input to `upsert`: a record as the caller hands it over, before any
/// governance has been applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDraft {
    /// Kind classifier, e.g. `chat`, `conversation.transcript`, `user_profile`.
    pub kind: String,
    /// Logical slot within the kind; `(kind, key)` is unique.
    pub key: String,
    /// Plaintext UTF-8 content.
    pub value: String,
    /// Wall-clock ISO-8601 timestamp in UTC.
    pub ts: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Opaque JSON blob (speaker, source, …).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RecordDraft {
    pub fn new(kind: &str, key: &str, value: &str, ts: &str) -> Self {
        Self {
            kind: kind.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            ts: ts.to_string(),
            tags: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Speaker, when the caller put one in metadata.
    pub fn speaker(&self) -> Option<&str> {
        self.metadata.get("speaker").and_then(|v| v.as_str())
    }
}

/// A persisted memory record as read back from the store. `value` and
/// `summary` may be plaintext or a serialized encryption envelope.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: i64,
    pub kind: String,
    pub key: String,
    pub value: String,
    pub summary: Option<String>,
    pub ts: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}

/// The normalized shape rules match against. Built from a draft on the
/// write path, or from a decrypted record inside the consent gate.
#[derive(Debug, Clone, Default)]
pub struct RuleSubject {
    pub kind: String,
    pub key: String,
    /// Plaintext content (records are decrypted before gate evaluation).
    pub value: String,
    pub tags: Vec<String>,
    pub speaker: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 2: Policy Enums
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecallPolicy {
    #[default]
    None,
    AlwaysKeep,
    /// Retrievable, but annotated so callers do not surface it verbatim.
    ContextOnly,
    AutoExpire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptStrength {
    #[default]
    None,
    Standard,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SummaryMode {
    SummaryOnly,
    #[default]
    SummaryAlso,
    FullAlways,
}

/// Which text(s) to embed during ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbedMode {
    None,
    #[default]
    Summary,
    Full,
    Both,
}

/// Provenance of a stored embedding row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedSource {
    Summary,
    Full,
}

impl EmbedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Full => "full",
        }
    }
}

impl std::str::FromStr for EmbedSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(Self::Summary),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown embedding source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FtsIndexMode {
    /// Index the summary when one exists, else the redacted value.
    #[default]
    SummaryPreferred,
    /// Always index the redacted value.
    ValuePreferred,
}

/// One redaction transformation. Parsed from the rule-metadata string
/// forms `mask`, `remove`, `replace:<literal>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedactStrategy {
    Mask,
    Remove,
    Replace(String),
}

impl std::str::FromStr for RedactStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mask" => Ok(Self::Mask),
            "remove" => Ok(Self::Remove),
            other => match other.strip_prefix("replace:") {
                Some(lit) => Ok(Self::Replace(lit.to_string())),
                None => Err(format!("unknown redact strategy: {other}")),
            },
        }
    }
}

impl std::fmt::Display for RedactStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mask => write!(f, "mask"),
            Self::Remove => write!(f, "remove"),
            Self::Replace(lit) => write!(f, "replace:{lit}"),
        }
    }
}

/// A concrete redaction to apply: the content pattern of the rule that
/// matched, plus the strategy its metadata selected.
#[derive(Debug, Clone)]
pub struct RedactionSpec {
    pub pattern: String,
    pub strategy: RedactStrategy,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 3: Rule Decision
// ═══════════════════════════════════════════════════════════════════════════

/// Normalized policy for one record, produced by the rules engine.
/// Unmatched records receive all defaults.
#[derive(Debug, Clone)]
pub struct RuleDecision {
    pub allow_store: bool,
    pub requires_consent: bool,
    pub recall_policy: RecallPolicy,
    /// Last-composed scalar strategy (introspection); the applied
    /// transformations are in `redactions`.
    pub redact_strategy: Option<RedactStrategy>,
    /// Redactions contributed by matched rules, in section order.
    pub redactions: Vec<RedactionSpec>,
    pub encrypt: EncryptStrength,
    pub summarize: bool,
    pub summary_mode: SummaryMode,
    pub embed: EmbedMode,
    pub embed_store: bool,
    pub embed_remote_ok: bool,
    pub fts_index: bool,
    pub fts_index_mode: FtsIndexMode,
    pub retrieval_boost: f64,
    /// Names of the sections whose rules matched, in priority order.
    pub matched_sections: Vec<String>,
}

impl Default for RuleDecision {
    fn default() -> Self {
        Self {
            allow_store: true,
            requires_consent: false,
            recall_policy: RecallPolicy::None,
            redact_strategy: None,
            redactions: Vec::new(),
            encrypt: EncryptStrength::None,
            summarize: false,
            summary_mode: SummaryMode::SummaryAlso,
            embed: EmbedMode::Summary,
            embed_store: false,
            embed_remote_ok: false,
            fts_index: true,
            fts_index_mode: FtsIndexMode::SummaryPreferred,
            retrieval_boost: 1.0,
            matched_sections: Vec::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 4: Rule Set (configuration grammar)
// ═══════════════════════════════════════════════════════════════════════════

/// Ordered rule set, grouped into sections. Section membership defines
/// defaults the `metadata` block may override; sections compose by field
/// overwrite in the declared order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub never_store: Vec<Rule>,
    #[serde(default)]
    pub ask_before_store: Vec<Rule>,
    #[serde(default)]
    pub context_only: Vec<Rule>,
    #[serde(default)]
    pub redact: Vec<Rule>,
    #[serde(default)]
    pub always_keep: Vec<Rule>,
    #[serde(default)]
    pub auto_expire: Vec<Rule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "match", default)]
    pub matcher: RuleMatch,
    #[serde(default)]
    pub metadata: RuleMetadata,
}

/// A rule matches when every present field matches the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    /// Every listed tag must be present on the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Case-insensitive regex matched against the plaintext value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// `encrypt` accepts booleans as aliases: `true` → standard, `false` → none.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncryptField {
    Flag(bool),
    Strength(String),
}

/// Overrides a matching rule contributes. Unset fields leave the
/// composed decision untouched. Strategy strings stay raw here so the
/// engine can log-and-skip unknown values instead of failing the parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_consent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall_policy: Option<RecallPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redact: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redact_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<EncryptField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarize: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_mode: Option<SummaryMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<EmbedMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed_store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed_remote_ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fts_index: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fts_index_mode: Option<FtsIndexMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalMeta>,
    /// Retention hint for auto_expire rules; evaluated outside the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boost: Option<f64>,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 5: Ingestion Outcomes
// ═══════════════════════════════════════════════════════════════════════════

/// An embedding computed during ingestion but not persisted. The store
/// retains a copy keyed by record id; `persist_embeddings_for` promotes it.
#[derive(Debug, Clone)]
pub struct EphemeralEmbedding {
    pub source: EmbedSource,
    pub vec: Vec<f32>,
}

/// Result of `upsert`.
#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    /// Stable record id. Absent only when the rule refused storage
    /// outright; a consent-quarantined record still has an id (the slot
    /// exists, excluded by the gate until consent arrives).
    pub id: Option<i64>,
    /// Accepted under governance. False for both refusal and quarantine.
    pub stored: bool,
    /// The rule demanded prior consent and none was on file.
    pub needs_consent: bool,
    /// Vectors computed but not persisted (`embed_store=false`, or
    /// consent still pending).
    pub ephemeral_embeddings: Vec<EphemeralEmbedding>,
}

impl UpsertOutcome {
    pub fn not_stored() -> Self {
        Self::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 6: Retrieval
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Hybrid,
    Vector,
    Fts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FusionMode {
    #[default]
    Weighted,
    Rrf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<String>>,
    /// Restrict vector candidates to embeddings of this source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EmbedSource>,
    /// ISO timestamp lower bound (exclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    /// ISO timestamp upper bound (exclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
}

/// One retrieval result after fusion, shaping, and gating.
#[derive(Debug, Clone)]
pub struct RetrievedItem {
    pub memory_id: i64,
    /// Final score after fusion, recency shaping, and boosts.
    pub score: f64,
    /// Normalized per-channel scores, present when the channel saw the id.
    pub fts_score: Option<f64>,
    pub vec_score: Option<f64>,
    /// Fused score before recency/kind shaping.
    pub fused_score: f64,
    pub snippet: String,
    pub kind: String,
    pub ts: String,
    pub context_only: bool,
    pub recall_policy: RecallPolicy,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 7: Parking Brake
// ═══════════════════════════════════════════════════════════════════════════

/// Component scopes the brake can block. `Global` dominates all others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrakeScope {
    Global,
    Skills,
    Sight,
    Voice,
    Scheduler,
    Writes,
    Retrieval,
}

impl std::fmt::Display for BrakeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Global => "global",
            Self::Skills => "skills",
            Self::Sight => "sight",
            Self::Voice => "voice",
            Self::Scheduler => "scheduler",
            Self::Writes => "writes",
            Self::Retrieval => "retrieval",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BrakeScope {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "skills" => Ok(Self::Skills),
            "sight" => Ok(Self::Sight),
            "voice" => Ok(Self::Voice),
            "scheduler" => Ok(Self::Scheduler),
            "writes" => Ok(Self::Writes),
            "retrieval" => Ok(Self::Retrieval),
            other => Err(format!("unknown brake scope: {other}")),
        }
    }
}

/// Persisted brake state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrakeState {
    #[serde(default)]
    pub engaged: bool,
    #[serde(default)]
    pub scopes: BTreeSet<BrakeScope>,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 8: Configuration Surface
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider identifier, e.g. "local-hash".
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_embed_dim")]
    pub dim: usize,
    /// Remote providers are refused unless both this and the rule's
    /// `embed_remote_ok` allow them. The kernel ships none.
    #[serde(default)]
    pub remote_allowed: bool,
}

fn default_embed_provider() -> String {
    "local-hash".to_string()
}
fn default_embed_model() -> String {
    "sha256-expansion".to_string()
}
fn default_embed_dim() -> usize {
    DEFAULT_EMBED_DIM
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embed_provider(),
            model: default_embed_model(),
            dim: default_embed_dim(),
            remote_allowed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default = "default_fts_tokenizer")]
    pub fts_tokenizer: String,
    /// Extra tokenizer arguments, e.g. "remove_diacritics 2 tokenchars .-@_".
    #[serde(default)]
    pub fts_tokenizer_args: String,
    #[serde(default)]
    pub fusion: FusionMode,
    #[serde(default = "default_w_fts")]
    pub w_fts: f64,
    #[serde(default = "default_w_vec")]
    pub w_vec: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,
    #[serde(default = "default_half_life")]
    pub recency_half_life_hours: f64,
    #[serde(default = "default_candidates")]
    pub fts_candidates: usize,
    #[serde(default = "default_candidates")]
    pub vec_candidates: usize,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_max_chars: usize,
}

fn default_fts_tokenizer() -> String {
    "porter".to_string()
}
fn default_w_fts() -> f64 {
    0.6
}
fn default_w_vec() -> f64 {
    0.4
}
fn default_rrf_k() -> u32 {
    DEFAULT_RRF_K
}
fn default_half_life() -> f64 {
    DEFAULT_RECENCY_HALF_LIFE_HOURS
}
fn default_candidates() -> usize {
    200
}
fn default_top_k() -> usize {
    20
}
fn default_snippet_chars() -> usize {
    200
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Hybrid,
            fts_tokenizer: default_fts_tokenizer(),
            fts_tokenizer_args: String::new(),
            fusion: FusionMode::Weighted,
            w_fts: default_w_fts(),
            w_vec: default_w_vec(),
            rrf_k: default_rrf_k(),
            recency_half_life_hours: default_half_life(),
            fts_candidates: default_candidates(),
            vec_candidates: default_candidates(),
            default_top_k: default_top_k(),
            snippet_max_chars: default_snippet_chars(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Strict mode: records with `encrypt=strong` are kept out of both
    /// the FTS and vector indexes.
    #[serde(default)]
    pub disallow_strong_only: bool,
}

/// Key ids only — key bytes are resolved from the environment, never
/// carried in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strong_kid: Option<String>,
}

/// Full kernel configuration, loadable from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub memory_rules: RuleSet,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub brake: BrakeState,
}
