// ── Memory Kernel Module ────────────────────────────────────────────────────
//
// The governance and retrieval engines, leaves first:
//   - encryption: authenticated envelope codec + key provider
//   - rules: rule-set evaluation producing a normalized RuleDecision
//   - redaction: mask/remove/replace span transforms
//   - summarize: bounded deterministic extractive summaries
//   - embedding: L2-normalized vectors with a deterministic offline fallback
//   - policy: indexing guard (strict mode vs strong encryption)
//   - schema: SQLite schema, migrations, WAL discipline
//   - fts: FTS5 index keyed by record id
//   - vector: embedding rows + exact cosine search
//   - consent: read-path privacy gate (the single filtering authority)
//   - brake: persistent scoped fail-closed kill-switch
//   - store: transactional ingestion pipeline composing the above
//   - retrieval: hybrid FTS/vector fusion with recency and boosts
//   - config: configuration surface + atomic rule-snapshot reload

pub mod brake;
pub mod config;
pub mod consent;
pub mod embedding;
pub mod encryption;
pub mod fts;
pub mod policy;
pub mod redaction;
pub mod retrieval;
pub mod rules;
pub mod schema;
pub mod store;
pub mod summarize;
pub mod vector;
