// ── Kernel: Memory Store (Ingestion Pipeline) ───────────────────────────────
//
// Owns the record store and composes the governance engines into the
// staged write path:
//
//   brake → rules → allow_store → consent → redact → summarize →
//   index text → embed → encrypt → one transaction (record + FTS +
//   vector rows) → outcome
//
// Two properties the stages must preserve:
//   • After redaction, the raw value is out of scope — summary, index
//     text, and embeddings all derive from the redacted value.
//   • Record row and index rows mutate inside a single transaction; no
//     reader ever observes a half-indexed record, and any failure
//     between the stages rolls the whole write back.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::atoms::error::{KernelError, KernelResult};
use crate::atoms::types::{
    BrakeScope, EmbedMode, EmbedSource, EphemeralEmbedding, FtsIndexMode, KernelConfig,
    IndexingConfig, MemoryRecord, RecordDraft, RuleDecision, RuleSubject, UpsertOutcome,
};
use crate::kernel::brake::ParkingBrake;
use crate::kernel::embedding::EmbeddingEngine;
use crate::kernel::encryption::{build_aad, build_summary_aad, EncryptionEngine, EnvKeyProvider};
use crate::kernel::fts::FtsIndex;
use crate::kernel::policy::can_index;
use crate::kernel::redaction::apply_redactions;
use crate::kernel::retrieval::HybridRetriever;
use crate::kernel::rules::RulesEngine;
use crate::kernel::schema::{open_database, open_in_memory, wal_checkpoint_truncate, SharedConn};
use crate::kernel::summarize::Summarizer;
use crate::kernel::vector::{VectorStore, VectorIdentity};

pub struct MemoryStore {
    conn: SharedConn,
    rules: Arc<RulesEngine>,
    crypto: Arc<EncryptionEngine>,
    embeddings: Arc<EmbeddingEngine>,
    summarizer: Summarizer,
    fts: Arc<FtsIndex>,
    brake: Arc<ParkingBrake>,
    indexing: IndexingConfig,
    /// Ephemeral embeddings awaiting promotion, keyed by record id.
    pending_embeddings: Mutex<HashMap<i64, Vec<EphemeralEmbedding>>>,
    #[cfg(test)]
    pub(crate) fail_before_index: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: SharedConn,
        rules: Arc<RulesEngine>,
        crypto: Arc<EncryptionEngine>,
        embeddings: Arc<EmbeddingEngine>,
        fts: Arc<FtsIndex>,
        brake: Arc<ParkingBrake>,
        indexing: IndexingConfig,
    ) -> Self {
        Self {
            conn,
            rules,
            crypto,
            embeddings,
            summarizer: Summarizer::default(),
            fts,
            brake,
            indexing,
            pending_embeddings: Mutex::new(HashMap::new()),
            #[cfg(test)]
            fail_before_index: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> SharedConn {
        self.conn.clone()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Upsert
    // ═══════════════════════════════════════════════════════════════════

    pub async fn upsert(&self, draft: RecordDraft) -> KernelResult<UpsertOutcome> {
        // 1. Safety gate.
        if self.brake.is_blocked(BrakeScope::Writes) {
            return Err(KernelError::BrakeEngaged(BrakeScope::Writes.to_string()));
        }

        // 2. One rule snapshot for the whole ingestion.
        let snapshot = self.rules.snapshot();
        let subject = RuleSubject {
            kind: draft.kind.clone(),
            key: draft.key.clone(),
            value: draft.value.clone(),
            tags: draft.tags.clone(),
            speaker: draft.speaker().map(str::to_string),
        };
        let decision = snapshot.evaluate(&subject);

        // 3. Hard refusal: no side effects at all.
        if !decision.allow_store {
            debug!("[store] Refusing {}:{}: never_store", draft.kind, draft.key);
            return Ok(UpsertOutcome::not_stored());
        }

        // 4. Consent barrier for this logical slot. The record is still
        //    written (quarantined — the consent gate excludes it on every
        //    read path until a consent row exists), so consent can later
        //    be granted against the slot; embeddings stay ephemeral.
        let needs_consent = decision.requires_consent && !self.has_consent(&draft.kind, &draft.key)?;

        // 5. Redact. The raw value is out of scope from here on.
        let redacted = apply_redactions(&draft.value, &decision.redactions);

        // 6. Summarize the redacted value.
        let summary = self
            .summarizer
            .maybe_summarize(&decision, &redacted, &draft.kind);

        // 7. Index text: summary when preferred and present, else the
        //    redacted value. Raw input is never eligible.
        let index_text = match (&summary, decision.fts_index_mode) {
            (Some(s), FtsIndexMode::SummaryPreferred) => s.clone(),
            _ => redacted.clone(),
        };

        // 8. Embeddings over the configured sources (never raw).
        let computed = self.compute_embeddings(&decision, &redacted, summary.as_deref()).await?;

        // 9. Encrypt the redacted value / summary under one key id with
        //    distinct context bindings.
        let value_aad = build_aad(&draft.kind, &draft.key, &draft.ts);
        let stored_value = self
            .crypto
            .encrypt_for_policy(&redacted, &decision, &value_aad)?
            .unwrap_or_else(|| redacted.clone());
        let stored_summary = match &summary {
            Some(s) => {
                let aad = build_summary_aad(&draft.kind, &draft.key, &draft.ts);
                Some(
                    self.crypto
                        .encrypt_for_policy(s, &decision, &aad)?
                        .unwrap_or_else(|| s.clone()),
                )
            }
            None => None,
        };

        // 10. One transaction for the record row and all index rows.
        let indexable = can_index(&decision, &self.indexing);
        let persist_vectors =
            indexable && decision.embed_store && !computed.is_empty() && !needs_consent;
        let identity = self.embeddings.config();

        let id = {
            let mut guard = self.conn.lock();
            let tx = guard.transaction()?;

            tx.execute(
                "INSERT INTO memories(kind, key, value, summary, ts, tags, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(kind, key) DO UPDATE SET
                 value=excluded.value, summary=excluded.summary, ts=excluded.ts,
                 tags=excluded.tags, metadata=excluded.metadata",
                rusqlite::params![
                    draft.kind,
                    draft.key,
                    stored_value,
                    stored_summary,
                    draft.ts,
                    serde_json::to_string(&draft.tags)?,
                    serde_json::to_string(&draft.metadata)?,
                ],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM memories WHERE kind = ?1 AND key = ?2",
                rusqlite::params![draft.kind, draft.key],
                |r| r.get(0),
            )?;

            #[cfg(test)]
            if self.fail_before_index.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(KernelError::index("injected fault before index write"));
            }

            if self.fts.available() {
                if indexable && decision.fts_index {
                    FtsIndex::upsert_row(&tx, id, &index_text)?;
                } else {
                    FtsIndex::delete_row(&tx, id)?;
                }
            }

            VectorStore::delete_for_memory(&tx, id)?;
            if persist_vectors {
                for emb in &computed {
                    VectorStore::insert_row(
                        &tx,
                        id,
                        emb.source,
                        &emb.vec,
                        &identity.provider,
                        &identity.model,
                    )?;
                }
            }

            tx.commit()?;
            id
        };

        // 11. Retain un-persisted vectors for later promotion.
        let ephemeral = if !persist_vectors && !computed.is_empty() {
            self.pending_embeddings
                .lock()
                .insert(id, computed.clone());
            computed
        } else {
            Vec::new()
        };

        if needs_consent {
            debug!(
                "[store] Quarantined {}:{} as id {} pending consent",
                draft.kind, draft.key, id
            );
        } else {
            debug!("[store] Stored {}:{} as id {}", draft.kind, draft.key, id);
        }
        Ok(UpsertOutcome {
            id: Some(id),
            stored: !needs_consent,
            needs_consent,
            ephemeral_embeddings: ephemeral,
        })
    }

    /// Compute embeddings per the decision. A failing provider fails the
    /// ingestion only when the rule demanded persistence; otherwise the
    /// stage is logged and skipped.
    async fn compute_embeddings(
        &self,
        decision: &RuleDecision,
        redacted: &str,
        summary: Option<&str>,
    ) -> KernelResult<Vec<EphemeralEmbedding>> {
        if decision.embed == EmbedMode::None || !self.embeddings.is_enabled() {
            return Ok(Vec::new());
        }

        // Summary source falls back to the redacted value when no
        // summary was produced (short content is its own summary).
        let summary_text = summary.unwrap_or(redacted).to_string();
        let sources: Vec<(EmbedSource, String)> = match decision.embed {
            EmbedMode::Summary => vec![(EmbedSource::Summary, summary_text)],
            EmbedMode::Full => vec![(EmbedSource::Full, redacted.to_string())],
            EmbedMode::Both => vec![
                (EmbedSource::Summary, summary_text),
                (EmbedSource::Full, redacted.to_string()),
            ],
            EmbedMode::None => unreachable!(),
        };

        let texts: Vec<String> = sources.iter().map(|(_, t)| t.clone()).collect();
        match self.embeddings.embed_texts(&texts).await {
            Ok(vectors) => Ok(sources
                .into_iter()
                .zip(vectors)
                .map(|((source, _), vec)| EphemeralEmbedding { source, vec })
                .collect()),
            Err(e) if decision.embed_store => Err(e),
            Err(e) => {
                warn!("[store] Embedding skipped: {e}");
                Ok(Vec::new())
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Delete / consent / promotion
    // ═══════════════════════════════════════════════════════════════════

    /// Remove a record and every row derived from it, atomically.
    pub fn delete(&self, kind: &str, key: &str) -> KernelResult<bool> {
        if self.brake.is_blocked(BrakeScope::Writes) {
            return Err(KernelError::BrakeEngaged(BrakeScope::Writes.to_string()));
        }

        let mut guard = self.conn.lock();
        let tx = guard.transaction()?;

        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM memories WHERE kind = ?1 AND key = ?2",
                rusqlite::params![kind, key],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some(id) = id else {
            return Ok(false);
        };

        if self.fts.available() {
            FtsIndex::delete_row(&tx, id)?;
        }
        VectorStore::delete_for_memory(&tx, id)?;
        tx.execute("DELETE FROM memory_consent WHERE memory_id = ?1", [id])?;
        tx.execute("DELETE FROM memories WHERE id = ?1", [id])?;
        tx.commit()?;

        self.pending_embeddings.lock().remove(&id);
        info!("[store] Deleted {kind}:{key} (id {id})");
        Ok(true)
    }

    /// Record explicit consent for an existing record. Returns false when
    /// the record does not exist.
    pub fn grant_consent(&self, kind: &str, key: &str) -> KernelResult<bool> {
        let conn = self.conn.lock();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM memories WHERE kind = ?1 AND key = ?2",
                rusqlite::params![kind, key],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some(id) = id else {
            return Ok(false);
        };
        conn.execute(
            "INSERT OR IGNORE INTO memory_consent(memory_id) VALUES (?1)",
            [id],
        )?;
        info!("[store] Consent granted for {kind}:{key} (id {id})");
        Ok(true)
    }

    fn has_consent(&self, kind: &str, key: &str) -> KernelResult<bool> {
        let conn = self.conn.lock();
        let consented: bool = conn
            .query_row(
                "SELECT 1 FROM memory_consent c
                 JOIN memories m ON m.id = c.memory_id
                 WHERE m.kind = ?1 AND m.key = ?2",
                rusqlite::params![kind, key],
                |_| Ok(()),
            )
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })?;
        Ok(consented)
    }

    /// Promote previously-returned ephemeral embeddings to stored rows,
    /// applying the indexing guard. Returns the number of rows written.
    pub fn persist_embeddings_for(&self, id: i64) -> KernelResult<usize> {
        let Some(pending) = self.pending_embeddings.lock().remove(&id) else {
            return Ok(0);
        };

        // Re-evaluate the record so the guard sees current policy.
        let Some(record) = self.get_record_by_id(id)? else {
            return Ok(0);
        };
        let decision = self.evaluate_record(&record)?;
        if !can_index(&decision, &self.indexing) {
            info!("[store] Embeddings for id {id} dropped by indexing policy");
            return Ok(0);
        }

        let identity = self.embeddings.config();
        let mut guard = self.conn.lock();
        let tx = guard.transaction()?;
        VectorStore::delete_for_memory(&tx, id)?;
        for emb in &pending {
            VectorStore::insert_row(
                &tx,
                id,
                emb.source,
                &emb.vec,
                &identity.provider,
                &identity.model,
            )?;
        }
        tx.commit()?;

        info!("[store] Persisted {} embeddings for id {id}", pending.len());
        Ok(pending.len())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Reads & maintenance
    // ═══════════════════════════════════════════════════════════════════

    /// Load a record as stored (value/summary possibly enveloped).
    pub fn get_record(&self, kind: &str, key: &str) -> KernelResult<Option<MemoryRecord>> {
        let conn = self.conn.lock();
        Self::query_record(
            &conn,
            "SELECT id, kind, key, value, summary, ts, tags, metadata
             FROM memories WHERE kind = ?1 AND key = ?2",
            rusqlite::params![kind, key],
        )
    }

    pub fn get_record_by_id(&self, id: i64) -> KernelResult<Option<MemoryRecord>> {
        let conn = self.conn.lock();
        Self::query_record(
            &conn,
            "SELECT id, kind, key, value, summary, ts, tags, metadata
             FROM memories WHERE id = ?1",
            rusqlite::params![id],
        )
    }

    fn query_record(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> KernelResult<Option<MemoryRecord>> {
        conn.query_row(sql, params, |row| {
            let tags_json: String = row.get(6)?;
            let metadata_json: String = row.get(7)?;
            Ok(MemoryRecord {
                id: row.get(0)?,
                kind: row.get(1)?,
                key: row.get(2)?,
                value: row.get(3)?,
                summary: row.get(4)?,
                ts: row.get(5)?,
                tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
            })
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    /// Decrypted view of a record's value, for callers holding a result.
    pub fn open_value(&self, record: &MemoryRecord) -> KernelResult<String> {
        self.crypto.open_value(&record.value)
    }

    fn evaluate_record(&self, record: &MemoryRecord) -> KernelResult<RuleDecision> {
        let value = self.crypto.open_value(&record.value)?;
        let subject = RuleSubject {
            kind: record.kind.clone(),
            key: record.key.clone(),
            value,
            tags: record.tags.clone(),
            speaker: record
                .metadata
                .get("speaker")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        };
        Ok(self.rules.snapshot().evaluate(&subject))
    }

    /// Rebuild the whole FTS index from the record store, re-deriving
    /// every row's index text (decrypting where needed). Records whose
    /// envelopes no longer authenticate are skipped and logged.
    pub fn rebuild_fts_index(&self) -> KernelResult<usize> {
        if !self.fts.available() {
            return Ok(0);
        }

        let records: Vec<MemoryRecord> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id, kind, key, value, summary, ts, tags, metadata FROM memories",
            )?;
            let rows = stmt.query_map([], |row| {
                let tags_json: String = row.get(6)?;
                let metadata_json: String = row.get(7)?;
                Ok(MemoryRecord {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    key: row.get(2)?,
                    value: row.get(3)?,
                    summary: row.get(4)?,
                    ts: row.get(5)?,
                    tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                    metadata: serde_json::from_str(&metadata_json)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut rows = Vec::new();
        for record in &records {
            let value = match self.crypto.open_value(&record.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!("[store] Skipping id {} during rebuild: {e}", record.id);
                    continue;
                }
            };
            let summary = match &record.summary {
                Some(s) => self.crypto.open_value(s).ok(),
                None => None,
            };

            let subject = RuleSubject {
                kind: record.kind.clone(),
                key: record.key.clone(),
                value: value.clone(),
                tags: record.tags.clone(),
                speaker: record
                    .metadata
                    .get("speaker")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            };
            let decision = self.rules.snapshot().evaluate(&subject);
            if !decision.fts_index || !can_index(&decision, &self.indexing) {
                continue;
            }

            let text = match (&summary, decision.fts_index_mode) {
                (Some(s), FtsIndexMode::SummaryPreferred) => s.clone(),
                _ => value,
            };
            rows.push((record.id, text));
        }

        self.fts.rebuild(&rows)
    }

    /// Weekly maintenance: merge FTS segments.
    pub fn optimize_indexes(&self) -> KernelResult<()> {
        self.fts.optimize()
    }

    /// Admin rebuild after an embedding model change: recompute and
    /// replace stored vectors for every record whose rules demand
    /// persisted embeddings. Rows from the previous (provider, model,
    /// dim) are dropped in the same transaction as their replacements.
    pub async fn rebuild_embeddings(&self) -> KernelResult<usize> {
        if !self.embeddings.is_enabled() {
            return Ok(0);
        }

        let ids: Vec<i64> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT id FROM memories ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let identity = self.embeddings.config();
        let mut updated = 0usize;
        for id in ids {
            let Some(record) = self.get_record_by_id(id)? else {
                continue;
            };
            let value = match self.crypto.open_value(&record.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!("[store] Skipping id {id} during embedding rebuild: {e}");
                    continue;
                }
            };
            let summary = record
                .summary
                .as_deref()
                .and_then(|s| self.crypto.open_value(s).ok());

            let decision = {
                let subject = RuleSubject {
                    kind: record.kind.clone(),
                    key: record.key.clone(),
                    value: value.clone(),
                    tags: record.tags.clone(),
                    speaker: record
                        .metadata
                        .get("speaker")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                };
                self.rules.snapshot().evaluate(&subject)
            };
            if decision.embed == EmbedMode::None
                || !decision.embed_store
                || !can_index(&decision, &self.indexing)
            {
                continue;
            }

            let computed = self
                .compute_embeddings(&decision, &value, summary.as_deref())
                .await?;
            if computed.is_empty() {
                continue;
            }

            let mut guard = self.conn.lock();
            let tx = guard.transaction()?;
            VectorStore::delete_for_memory(&tx, id)?;
            for emb in &computed {
                VectorStore::insert_row(
                    &tx,
                    id,
                    emb.source,
                    &emb.vec,
                    &identity.provider,
                    &identity.model,
                )?;
            }
            tx.commit()?;
            updated += 1;
        }

        info!("[store] Embedding rebuild updated {updated} records");
        Ok(updated)
    }

    /// Producer identity for vector queries.
    pub fn vector_identity(&self) -> VectorIdentity {
        let config = self.embeddings.config();
        VectorIdentity {
            provider: config.provider.clone(),
            model: config.model.clone(),
            dim: config.dim,
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let conn = self.conn.lock();
        wal_checkpoint_truncate(&conn);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Kernel factory
// ═══════════════════════════════════════════════════════════════════════════

/// Assembles the default dependency graph for callers who do not want to
/// wire the engines themselves. Everything is injected; nothing is a
/// process-wide singleton.
pub struct Kernel {
    pub store: Arc<MemoryStore>,
    pub retriever: HybridRetriever,
    pub brake: Arc<ParkingBrake>,
    pub rules: Arc<RulesEngine>,
}

impl Kernel {
    pub fn open(path: &Path, config: KernelConfig) -> KernelResult<Self> {
        let conn = open_database(path)?;
        Self::assemble(conn, config)
    }

    /// In-memory kernel for tests and throwaway sessions.
    pub fn open_ephemeral(config: KernelConfig) -> KernelResult<Self> {
        let conn = open_in_memory()?;
        Self::assemble(conn, config)
    }

    fn assemble(conn: SharedConn, config: KernelConfig) -> KernelResult<Self> {
        let rules = Arc::new(RulesEngine::new(&config.memory_rules));
        let crypto = Arc::new(EncryptionEngine::new(Arc::new(EnvKeyProvider::with_kids(
            config.encryption.standard_kid.clone(),
            config.encryption.strong_kid.clone(),
        ))));
        let embeddings = Arc::new(EmbeddingEngine::with_default_provider(
            config.embedding.clone(),
        ));
        let fts = Arc::new(FtsIndex::open(
            conn.clone(),
            &config.retrieval.fts_tokenizer,
            &config.retrieval.fts_tokenizer_args,
        )?);

        // Apply the configured initial brake state only when nothing is
        // persisted yet; a persisted state always wins.
        let flag_exists: bool = {
            let guard = conn.lock();
            guard
                .query_row(
                    "SELECT 1 FROM system_flags WHERE key = ?1",
                    [crate::atoms::constants::BRAKE_FLAG_KEY],
                    |_| Ok(()),
                )
                .map(|_| true)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(false),
                    other => Err(other),
                })?
        };
        let brake = Arc::new(ParkingBrake::load(conn.clone())?);
        if !flag_exists && config.brake.engaged {
            let scopes: Vec<_> = config.brake.scopes.iter().copied().collect();
            brake.engage(&scopes)?;
        }

        let store = Arc::new(MemoryStore::new(
            conn.clone(),
            rules.clone(),
            crypto.clone(),
            embeddings.clone(),
            fts.clone(),
            brake.clone(),
            config.indexing.clone(),
        ));

        // Self-healing startup migration: rebuild on rowid mismatch.
        if fts.has_identity_mismatch()? {
            warn!("[store] FTS rowid mismatch detected, rebuilding index");
            store.rebuild_fts_index()?;
        }

        let retriever = HybridRetriever::new(
            conn,
            fts,
            Arc::new(VectorStore::new(store.connection())),
            embeddings,
            rules.clone(),
            crypto,
            brake.clone(),
            config.retrieval.clone(),
        );

        Ok(Self {
            store,
            retriever,
            brake,
            rules,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
