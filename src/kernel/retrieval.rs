// ── Kernel: Hybrid Retriever ────────────────────────────────────────────────
//
// Fuses FTS and vector candidates behind the consent gate:
//
//   1. pull 3·k candidates per channel (gated)
//   2. min-max normalize each channel over its pulled set
//   3. fuse — weighted average (default) or RRF
//   4. recency shaping: × exp(-Δt_hours / τ)
//   5. per-kind rule boost
//   6. rank with tie-breaks (both channels > one, newer ts, higher id)
//   7. truncate to top_k, attach policy flags and snippets
//
// Weighted fusion imputes a missing channel as the mean of the item's
// present channel scores, so a strong single-channel hit is not cliffed
// to a fraction of itself; the both-channels tie-break still prefers
// dual-channel hits.
//
// Query-aware weighting nudges the balance per call: lexical queries
// (quotes, booleans, field:value) lean on FTS, natural-language
// questions lean on the vector channel.
//
// A failing channel degrades to empty (logged once per process); a
// record that no longer decrypts is elided by the gate. Retrieval only
// refuses outright when the brake blocks the `retrieval` scope.

use std::collections::HashMap;
use std::sync::{Arc, Once};

use chrono::{DateTime, Utc};
use log::{debug, error, warn};

use crate::atoms::error::{KernelError, KernelResult};
use crate::atoms::types::{
    BrakeScope, FusionMode, RecallPolicy, RetrievalConfig, RetrievalFilters, RetrievalMode,
    RetrievedItem,
};
use crate::kernel::brake::ParkingBrake;
use crate::kernel::consent::{ConsentGate, GatedCandidate};
use crate::kernel::embedding::EmbeddingEngine;
use crate::kernel::encryption::EncryptionEngine;
use crate::kernel::fts::FtsIndex;
use crate::kernel::rules::RulesEngine;
use crate::kernel::schema::SharedConn;
use crate::kernel::vector::{VectorIdentity, VectorStore};

static FTS_DEGRADED_LOG: Once = Once::new();
static VEC_DEGRADED_LOG: Once = Once::new();

// ═══════════════════════════════════════════════════════════════════════════
// Options
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct RetrieveOptions {
    pub top_k: Option<usize>,
    pub filters: RetrievalFilters,
    pub mode: Option<RetrievalMode>,
    pub fusion: Option<FusionMode>,
    /// Explicit (w_fts, w_vec) for this call; wins over query-aware
    /// adjustment.
    pub weight_override: Option<(f64, f64)>,
    pub query_aware_weighting: bool,
    /// Administrative bypass of the consent gate. Audited.
    pub apply_gate: bool,
    /// Reference time for recency shaping; defaults to now. Pinning it
    /// makes retrieval a pure function of the store.
    pub now: Option<DateTime<Utc>>,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            filters: RetrievalFilters::default(),
            mode: None,
            fusion: None,
            weight_override: None,
            query_aware_weighting: true,
            apply_gate: true,
            now: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Query analysis heuristics
// ═══════════════════════════════════════════════════════════════════════════

/// Quoted phrases, booleans, or field:value syntax mark a lexical query.
fn looks_lexical(query: &str) -> bool {
    let q = query.trim();
    if q.contains('"') || q.contains('\'') {
        return true;
    }
    if q
        .split_whitespace()
        .any(|w| matches!(w, "AND" | "OR" | "NOT"))
    {
        return true;
    }
    q.split_whitespace().any(|w| {
        w.split_once(':')
            .is_some_and(|(a, b)| !a.is_empty() && !b.is_empty())
    })
}

/// Question marks, interrogative openers, or long prose mark a semantic
/// query.
fn looks_semantic(query: &str) -> bool {
    let q = query.trim();
    if q.contains('?') {
        return true;
    }
    let lower = q.to_lowercase();
    for word in ["who ", "what ", "when ", "where ", "why ", "how "] {
        if lower.starts_with(word) {
            return true;
        }
    }
    q.split_whitespace().count() >= 8 && !looks_lexical(q)
}

/// Adjust fusion weights for the query type: lexical boosts FTS 1.3×,
/// semantic boosts the vector channel; results are normalized and
/// clamped to [0.1, 0.9].
fn query_aware_weights(query: &str, base_fts: f64, base_vec: f64) -> (f64, f64) {
    let lexical = looks_lexical(query);
    let semantic = looks_semantic(query);
    if lexical == semantic {
        return (base_fts, base_vec);
    }

    let (mut fts, mut vec) = if lexical {
        (base_fts * 1.3, base_vec * 0.8)
    } else {
        (base_fts * 0.8, base_vec * 1.3)
    };

    let total = fts + vec;
    if total > 0.0 {
        fts /= total;
        vec /= total;
    } else {
        fts = 0.5;
        vec = 0.5;
    }

    fts = fts.clamp(0.1, 0.9);
    vec = vec.clamp(0.1, 0.9);
    let total = fts + vec;
    (fts / total, vec / total)
}

// ═══════════════════════════════════════════════════════════════════════════
// Retriever
// ═══════════════════════════════════════════════════════════════════════════

struct CandidateMeta {
    kind: String,
    value: String,
    summary: Option<String>,
    ts: String,
}

pub struct HybridRetriever {
    conn: SharedConn,
    fts: Arc<FtsIndex>,
    vectors: Arc<VectorStore>,
    embeddings: Arc<EmbeddingEngine>,
    crypto: Arc<EncryptionEngine>,
    gate: ConsentGate,
    brake: Arc<ParkingBrake>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: SharedConn,
        fts: Arc<FtsIndex>,
        vectors: Arc<VectorStore>,
        embeddings: Arc<EmbeddingEngine>,
        rules: Arc<RulesEngine>,
        crypto: Arc<EncryptionEngine>,
        brake: Arc<ParkingBrake>,
        config: RetrievalConfig,
    ) -> Self {
        let gate = ConsentGate::new(conn.clone(), rules, crypto.clone());
        Self {
            conn,
            fts,
            vectors,
            embeddings,
            crypto,
            gate,
            brake,
            config,
        }
    }

    /// Retrieve with defaults: configured mode, gated, recency at now.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        filters: Option<RetrievalFilters>,
        mode: Option<RetrievalMode>,
    ) -> KernelResult<Vec<RetrievedItem>> {
        self.retrieve_opts(
            query,
            RetrieveOptions {
                top_k,
                filters: filters.unwrap_or_default(),
                mode,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn retrieve_opts(
        &self,
        query: &str,
        opts: RetrieveOptions,
    ) -> KernelResult<Vec<RetrievedItem>> {
        if self.brake.is_blocked(BrakeScope::Retrieval) {
            return Err(KernelError::BrakeEngaged(BrakeScope::Retrieval.to_string()));
        }

        let top_k = opts.top_k.unwrap_or(self.config.default_top_k);
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mode = opts.mode.unwrap_or(self.config.mode);
        let fusion = opts.fusion.unwrap_or(self.config.fusion);
        if !opts.apply_gate {
            warn!("[retrieval] Consent gate bypassed (administrative path)");
        }

        // 1. Pull candidates per channel, ≥3× over-fetched (bounded
        //    below by the configured candidate pool), then gated.
        let fetch = (top_k * crate::atoms::constants::GATE_OVERFETCH).max(self.config.fts_candidates);

        let (fts_ranked, fts_snippets) = if mode == RetrievalMode::Vector {
            (Vec::new(), HashMap::new())
        } else {
            self.pull_fts_candidates(query, fetch, opts.apply_gate)?
        };
        let vec_ranked = if mode == RetrievalMode::Fts {
            Vec::new()
        } else {
            self.pull_vector_candidates(query, fetch, &opts.filters, opts.apply_gate)
                .await?
        };

        // 2. Union, metadata, filters.
        let mut union_ids: Vec<i64> = Vec::new();
        for c in fts_ranked.iter().chain(vec_ranked.iter()) {
            if !union_ids.contains(&c.id) {
                union_ids.push(c.id);
            }
        }
        if union_ids.is_empty() {
            return Ok(Vec::new());
        }

        let meta = self.load_metadata(&union_ids)?;
        let passes: Vec<i64> = union_ids
            .iter()
            .copied()
            .filter(|id| {
                meta.get(id)
                    .map(|m| passes_filters(m, &opts.filters))
                    .unwrap_or(false)
            })
            .collect();
        if passes.is_empty() {
            return Ok(Vec::new());
        }
        let passes_set: std::collections::HashSet<i64> = passes.iter().copied().collect();

        let fts_ranked: Vec<&GatedCandidate> = fts_ranked
            .iter()
            .filter(|c| passes_set.contains(&c.id))
            .collect();
        let vec_ranked: Vec<&GatedCandidate> = vec_ranked
            .iter()
            .filter(|c| passes_set.contains(&c.id))
            .collect();

        // 3. Per-channel min-max normalization.
        // FTS ranks are bm25 values where lower is better — invert.
        let fts_norm = normalize_inverted(&fts_ranked);
        let vec_norm = normalize_direct(&vec_ranked);

        // 4. Fuse.
        let fused: HashMap<i64, f64> = match fusion {
            FusionMode::Weighted => {
                let (w_fts, w_vec) = match opts.weight_override {
                    Some(w) => w,
                    None if opts.query_aware_weighting => {
                        query_aware_weights(query, self.config.w_fts, self.config.w_vec)
                    }
                    None => (self.config.w_fts, self.config.w_vec),
                };
                fuse_weighted(&fts_norm, &vec_norm, w_fts, w_vec)
            }
            FusionMode::Rrf => fuse_rrf(&fts_ranked, &vec_ranked, self.config.rrf_k as f64),
        };

        // Policy annotations from whichever channel carried the id.
        let mut policy: HashMap<i64, (bool, RecallPolicy, f64)> = HashMap::new();
        for c in fts_ranked.iter().chain(vec_ranked.iter()) {
            policy
                .entry(c.id)
                .or_insert((c.context_only, c.recall_policy, c.boost));
        }

        // 5./6. Recency shaping and per-kind boost.
        let now = opts.now.unwrap_or_else(Utc::now);
        let tau = self.config.recency_half_life_hours;
        let mut scored: Vec<(i64, f64, f64)> = fused
            .iter()
            .map(|(&id, &fused_score)| {
                let recency = meta
                    .get(&id)
                    .map(|m| recency_factor(&m.ts, now, tau))
                    .unwrap_or(1.0);
                let boost = policy.get(&id).map(|p| p.2).unwrap_or(1.0);
                (id, fused_score, fused_score * recency * boost)
            })
            .collect();

        // 7. Rank with tie-breaks.
        let in_both: std::collections::HashSet<i64> = fts_norm
            .keys()
            .filter(|id| vec_norm.contains_key(*id))
            .copied()
            .collect();
        scored.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| in_both.contains(&b.0).cmp(&in_both.contains(&a.0)))
                .then_with(|| {
                    let ts_a = meta.get(&a.0).map(|m| m.ts.as_str()).unwrap_or("");
                    let ts_b = meta.get(&b.0).map(|m| m.ts.as_str()).unwrap_or("");
                    ts_b.cmp(ts_a)
                })
                .then_with(|| b.0.cmp(&a.0))
        });
        scored.truncate(top_k);

        // 8. Materialize results with snippets and policy flags.
        let mut results = Vec::with_capacity(scored.len());
        for (id, fused_score, final_score) in scored {
            let Some(m) = meta.get(&id) else { continue };
            let (context_only, recall_policy, _) = policy
                .get(&id)
                .copied()
                .unwrap_or((false, RecallPolicy::None, 1.0));

            let snippet = match fts_snippets.get(&id) {
                Some(s) => s.clone(),
                None => self.fallback_snippet(m),
            };

            results.push(RetrievedItem {
                memory_id: id,
                score: final_score,
                fts_score: fts_norm.get(&id).copied(),
                vec_score: vec_norm.get(&id).copied(),
                fused_score,
                snippet,
                kind: m.kind.clone(),
                ts: m.ts.clone(),
                context_only,
                recall_policy,
            });
        }

        debug!(
            "[retrieval] {} results (mode={mode:?}, fusion={fusion:?})",
            results.len()
        );
        Ok(results)
    }

    // ── Channel pulls ──────────────────────────────────────────────────

    fn pull_fts_candidates(
        &self,
        query: &str,
        fetch: usize,
        apply_gate: bool,
    ) -> KernelResult<(Vec<GatedCandidate>, HashMap<i64, String>)> {
        let hits = match self.fts.search(query, fetch) {
            Ok(hits) => hits,
            Err(e) => {
                FTS_DEGRADED_LOG.call_once(|| {
                    error!("[retrieval] FTS channel degraded: {e}");
                });
                return Ok((Vec::new(), HashMap::new()));
            }
        };

        let snippets: HashMap<i64, String> = hits
            .iter()
            .filter_map(|h| h.snippet.clone().map(|s| (h.id, s)))
            .collect();
        let scored: Vec<(i64, f64)> = hits.iter().map(|h| (h.id, h.rank)).collect();

        let gated = if apply_gate {
            self.gate.apply(&scored)?
        } else {
            ungated(&scored)
        };
        Ok((gated, snippets))
    }

    async fn pull_vector_candidates(
        &self,
        query: &str,
        fetch: usize,
        filters: &RetrievalFilters,
        apply_gate: bool,
    ) -> KernelResult<Vec<GatedCandidate>> {
        if !self.embeddings.is_enabled() {
            return Ok(Vec::new());
        }

        let config = self.embeddings.config();
        let identity = VectorIdentity {
            provider: config.provider.clone(),
            model: config.model.clone(),
            dim: config.dim,
        };

        let result = async {
            let qvec = self.embeddings.embed_query(query).await?;
            self.vectors
                .search(&qvec, fetch, Some(&identity), filters.source, false)
        }
        .await;

        let scored = match result {
            Ok(scored) => scored,
            Err(e) => {
                VEC_DEGRADED_LOG.call_once(|| {
                    error!("[retrieval] Vector channel degraded: {e}");
                });
                return Ok(Vec::new());
            }
        };

        if apply_gate {
            self.gate.apply(&scored)
        } else {
            Ok(ungated(&scored))
        }
    }

    // ── Metadata & snippets ────────────────────────────────────────────

    fn load_metadata(&self, ids: &[i64]) -> KernelResult<HashMap<i64, CandidateMeta>> {
        let conn = self.conn.lock();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT id, kind, value, summary, ts FROM memories WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                CandidateMeta {
                    kind: row.get(1)?,
                    value: row.get(2)?,
                    summary: row.get(3)?,
                    ts: row.get(4)?,
                },
            ))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (id, meta) = row?;
            map.insert(id, meta);
        }
        Ok(map)
    }

    /// Snippet when the FTS highlight is unavailable: a bounded excerpt
    /// of the decrypted summary, else the decrypted value. Ciphertext is
    /// never emitted — a failed decrypt yields an empty snippet.
    fn fallback_snippet(&self, meta: &CandidateMeta) -> String {
        let max = self.config.snippet_max_chars;
        if let Some(summary) = &meta.summary {
            if let Ok(text) = self.crypto.open_value(summary) {
                return center_excerpt(&text, max);
            }
        }
        match self.crypto.open_value(&meta.value) {
            Ok(text) => center_excerpt(&text, max),
            Err(e) => {
                error!("[retrieval] Snippet suppressed: {e}");
                String::new()
            }
        }
    }
}

fn ungated(scored: &[(i64, f64)]) -> Vec<GatedCandidate> {
    scored
        .iter()
        .map(|&(id, score)| GatedCandidate {
            id,
            score,
            context_only: false,
            recall_policy: RecallPolicy::None,
            boost: 1.0,
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Fusion math
// ═══════════════════════════════════════════════════════════════════════════

/// Min-max over bm25 ranks, inverted so lower rank → higher score.
/// A single-candidate (or all-equal) channel normalizes to 1.0.
fn normalize_inverted(ranked: &[&GatedCandidate]) -> HashMap<i64, f64> {
    if ranked.is_empty() {
        return HashMap::new();
    }
    let min = ranked.iter().map(|c| c.score).fold(f64::INFINITY, f64::min);
    let max = ranked
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);

    ranked
        .iter()
        .map(|c| {
            let s = if max > min {
                (max - c.score) / (max - min)
            } else {
                1.0
            };
            (c.id, s)
        })
        .collect()
}

/// Plain min-max; all-equal normalizes to 1.0.
fn normalize_direct(ranked: &[&GatedCandidate]) -> HashMap<i64, f64> {
    if ranked.is_empty() {
        return HashMap::new();
    }
    let min = ranked.iter().map(|c| c.score).fold(f64::INFINITY, f64::min);
    let max = ranked
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);

    ranked
        .iter()
        .map(|c| {
            let s = if max > min {
                (c.score - min) / (max - min)
            } else {
                1.0
            };
            (c.id, s)
        })
        .collect()
}

/// Weighted fusion with missing-channel imputation: an id absent from a
/// channel gets that channel's score imputed as the mean of its present
/// scores — never zero, so there is no cliff at the channel boundary.
fn fuse_weighted(
    fts: &HashMap<i64, f64>,
    vec: &HashMap<i64, f64>,
    w_fts: f64,
    w_vec: f64,
) -> HashMap<i64, f64> {
    let ids: std::collections::HashSet<i64> = fts.keys().chain(vec.keys()).copied().collect();
    ids.into_iter()
        .map(|id| {
            let (s_fts, s_vec) = match (fts.get(&id), vec.get(&id)) {
                (Some(&f), Some(&v)) => (f, v),
                (Some(&f), None) => (f, f),
                (None, Some(&v)) => (v, v),
                (None, None) => (0.0, 0.0),
            };
            (id, w_fts * s_fts + w_vec * s_vec)
        })
        .collect()
}

/// Reciprocal rank fusion: Σ 1/(k + rank) over the channels where the
/// id appears (1-based ranks); absent channels contribute 0.
fn fuse_rrf(
    fts_ranked: &[&GatedCandidate],
    vec_ranked: &[&GatedCandidate],
    k: f64,
) -> HashMap<i64, f64> {
    let mut scores: HashMap<i64, f64> = HashMap::new();
    for (rank, c) in fts_ranked.iter().enumerate() {
        *scores.entry(c.id).or_default() += 1.0 / (k + rank as f64 + 1.0);
    }
    for (rank, c) in vec_ranked.iter().enumerate() {
        *scores.entry(c.id).or_default() += 1.0 / (k + rank as f64 + 1.0);
    }
    scores
}

/// Recency shaping factor: exp(-Δt_hours / τ), clamped at 1.0 for
/// future-dated records. Unparseable timestamps shape to 1.0.
fn recency_factor(ts: &str, now: DateTime<Utc>, tau_hours: f64) -> f64 {
    if tau_hours <= 0.0 {
        return 1.0;
    }
    let Ok(parsed) = DateTime::parse_from_rfc3339(&ts.replace(' ', "T")) else {
        return 1.0;
    };
    let age_hours = (now - parsed.with_timezone(&Utc)).num_seconds().max(0) as f64 / 3600.0;
    (-age_hours / tau_hours).exp()
}

fn passes_filters(meta: &CandidateMeta, filters: &RetrievalFilters) -> bool {
    if let Some(kinds) = &filters.kinds {
        if !kinds.iter().any(|k| k == &meta.kind) {
            return false;
        }
    }
    if let Some(after) = &filters.after {
        if meta.ts.as_str() <= after.as_str() {
            return false;
        }
    }
    if let Some(before) = &filters.before {
        if meta.ts.as_str() >= before.as_str() {
            return false;
        }
    }
    true
}

/// Centered excerpt with ellipses, for snippet fallback.
fn center_excerpt(text: &str, max_len: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_len {
        return text.to_string();
    }
    let start = (chars.len() - max_len) / 2;
    let end = start + max_len;
    let mut excerpt: String = chars[start..end].iter().collect();
    if start > 0 {
        excerpt = format!(" … {excerpt}");
    }
    if end < chars.len() {
        excerpt = format!("{excerpt} … ");
    }
    excerpt
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
