// ── Kernel: Consent Gate ────────────────────────────────────────────────────
//
// The single privacy authority on the read path. Every retriever passes
// its candidate ids through this gate before scores are fused or results
// returned.
//
// For each candidate the gate loads the record, decrypts it (content
// regexes need plaintext — decryption happens only inside the gate),
// re-evaluates the rule snapshot, and then:
//   - excludes records whose rules say allow_store=false (defensive;
//     such rows should not exist),
//   - excludes records requiring consent with no consent row,
//   - annotates survivors with context_only / recall policy.
//
// A record that fails decryption is elided from results and logged —
// one bad envelope never fails a retrieval.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error};

use crate::atoms::error::{KernelError, KernelResult};
use crate::atoms::types::{MemoryRecord, RecallPolicy, RuleSubject};
use crate::kernel::encryption::EncryptionEngine;
use crate::kernel::rules::RulesEngine;
use crate::kernel::schema::SharedConn;

/// Gate verdict for one candidate id.
#[derive(Debug, Clone)]
pub struct PolicyVerdict {
    pub include: bool,
    pub context_only: bool,
    pub recall_policy: RecallPolicy,
    /// Per-kind retrieval boost from the matched rules.
    pub boost: f64,
}

/// A candidate that survived the gate, with its policy annotations.
#[derive(Debug, Clone)]
pub struct GatedCandidate {
    pub id: i64,
    pub score: f64,
    pub context_only: bool,
    pub recall_policy: RecallPolicy,
    pub boost: f64,
}

pub struct ConsentGate {
    conn: SharedConn,
    rules: Arc<RulesEngine>,
    crypto: Arc<EncryptionEngine>,
}

impl ConsentGate {
    pub fn new(conn: SharedConn, rules: Arc<RulesEngine>, crypto: Arc<EncryptionEngine>) -> Self {
        Self { conn, rules, crypto }
    }

    /// All record ids with an explicit consent row.
    pub fn consented_ids(&self) -> KernelResult<HashSet<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT memory_id FROM memory_consent")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        Ok(rows.collect::<Result<HashSet<_>, _>>()?)
    }

    /// Evaluate the gate for a set of candidate ids.
    pub fn filter(&self, ids: &[i64]) -> KernelResult<HashMap<i64, PolicyVerdict>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let consented = self.consented_ids()?;
        let records = self.load_records(ids)?;
        let snapshot = self.rules.snapshot();

        let mut verdicts = HashMap::with_capacity(ids.len());
        for &id in ids {
            let Some(record) = records.get(&id) else {
                verdicts.insert(
                    id,
                    PolicyVerdict {
                        include: false,
                        context_only: false,
                        recall_policy: RecallPolicy::None,
                        boost: 1.0,
                    },
                );
                continue;
            };

            // Content rules need plaintext; a bad envelope elides the
            // candidate instead of failing the retrieval.
            let value = match self.crypto.open_value(&record.value) {
                Ok(v) => v,
                Err(KernelError::Crypto(e)) => {
                    error!("[consent] Eliding record {id}: {e}");
                    verdicts.insert(
                        id,
                        PolicyVerdict {
                            include: false,
                            context_only: false,
                            recall_policy: RecallPolicy::None,
                            boost: 1.0,
                        },
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

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
            let decision = snapshot.evaluate(&subject);

            let mut include = true;
            if !decision.allow_store {
                debug!("[consent] Excluding record {id}: never_store policy");
                include = false;
            }
            if decision.requires_consent && !consented.contains(&id) {
                debug!("[consent] Excluding record {id}: consent required, none on file");
                include = false;
            }

            verdicts.insert(
                id,
                PolicyVerdict {
                    include,
                    context_only: decision.recall_policy == RecallPolicy::ContextOnly,
                    recall_policy: decision.recall_policy,
                    boost: decision.retrieval_boost,
                },
            );
        }

        Ok(verdicts)
    }

    /// Gate an ordered candidate list, dropping excluded ids and
    /// preserving order with policy annotations.
    pub fn apply(&self, candidates: &[(i64, f64)]) -> KernelResult<Vec<GatedCandidate>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = candidates.iter().map(|(id, _)| *id).collect();
        let verdicts = self.filter(&ids)?;

        let survivors = candidates
            .iter()
            .filter_map(|&(id, score)| {
                let verdict = verdicts.get(&id)?;
                verdict.include.then(|| GatedCandidate {
                    id,
                    score,
                    context_only: verdict.context_only,
                    recall_policy: verdict.recall_policy,
                    boost: verdict.boost,
                })
            })
            .collect::<Vec<_>>();

        debug!(
            "[consent] Gate: {} -> {} candidates",
            candidates.len(),
            survivors.len()
        );
        Ok(survivors)
    }

    fn load_records(&self, ids: &[i64]) -> KernelResult<HashMap<i64, MemoryRecord>> {
        let conn = self.conn.lock();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT id, kind, key, value, summary, ts, tags, metadata
             FROM memories WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
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

        let mut map = HashMap::new();
        for row in rows {
            let record = row?;
            map.insert(record.id, record);
        }
        Ok(map)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::RuleSet;
    use crate::kernel::encryption::EnvKeyProvider;
    use crate::kernel::schema::open_in_memory;

    fn gate_with_rules(rules_json: &str) -> (SharedConn, ConsentGate) {
        let conn = open_in_memory().unwrap();
        let rules: RuleSet = serde_json::from_str(rules_json).unwrap();
        let gate = ConsentGate::new(
            conn.clone(),
            Arc::new(RulesEngine::new(&rules)),
            Arc::new(EncryptionEngine::new(Arc::new(EnvKeyProvider::new()))),
        );
        (conn, gate)
    }

    fn insert(conn: &SharedConn, kind: &str, key: &str, value: &str) -> i64 {
        let guard = conn.lock();
        guard
            .execute(
                "INSERT INTO memories(kind, key, value, ts) VALUES (?1, ?2, ?3, 't')",
                rusqlite::params![kind, key, value],
            )
            .unwrap();
        guard.last_insert_rowid()
    }

    fn grant(conn: &SharedConn, id: i64) {
        let guard = conn.lock();
        guard
            .execute("INSERT INTO memory_consent(memory_id) VALUES (?1)", [id])
            .unwrap();
    }

    #[test]
    fn test_plain_records_pass() {
        let (conn, gate) = gate_with_rules("{}");
        let id = insert(&conn, "chat", "k", "hello");
        let verdicts = gate.filter(&[id]).unwrap();
        assert!(verdicts[&id].include);
        assert!(!verdicts[&id].context_only);
    }

    #[test]
    fn test_missing_record_excluded() {
        let (_conn, gate) = gate_with_rules("{}");
        let verdicts = gate.filter(&[999]).unwrap();
        assert!(!verdicts[&999].include);
    }

    #[test]
    fn test_consent_required_without_row_excluded() {
        let (conn, gate) = gate_with_rules(
            r#"{"ask_before_store": [{"match": {"content": "password"}, "metadata": {}}]}"#,
        );
        let id = insert(&conn, "chat", "k", "my password is hunter2");
        assert!(!gate.filter(&[id]).unwrap()[&id].include);

        // Monotonicity: adding the consent row can only add results.
        grant(&conn, id);
        assert!(gate.filter(&[id]).unwrap()[&id].include);
    }

    #[test]
    fn test_never_store_excluded_defensively() {
        let (conn, gate) = gate_with_rules(
            r#"{"never_store": [{"match": {"kind": "secrets"}, "metadata": {}}]}"#,
        );
        let id = insert(&conn, "secrets", "k", "should not exist");
        assert!(!gate.filter(&[id]).unwrap()[&id].include);
    }

    #[test]
    fn test_context_only_annotated_not_excluded() {
        let (conn, gate) = gate_with_rules(
            r#"{"context_only": [{"match": {"kind": "sensitive_joke"}, "metadata": {}}]}"#,
        );
        let id = insert(&conn, "sensitive_joke", "j1", "why did the kernel...");
        let verdicts = gate.filter(&[id]).unwrap();
        assert!(verdicts[&id].include);
        assert!(verdicts[&id].context_only);
        assert_eq!(verdicts[&id].recall_policy, RecallPolicy::ContextOnly);
    }

    #[test]
    fn test_gate_evaluates_decrypted_content() {
        // Content regex must match against plaintext inside the gate,
        // even when the stored value is an envelope.
        let conn = open_in_memory().unwrap();
        let crypto = Arc::new(EncryptionEngine::new(Arc::new(EnvKeyProvider::new())));
        let rules: RuleSet = serde_json::from_str(
            r#"{"ask_before_store": [{"match": {"content": "hunter2"}, "metadata": {}}]}"#,
        )
        .unwrap();
        let gate = ConsentGate::new(conn.clone(), Arc::new(RulesEngine::new(&rules)), crypto.clone());

        let envelope = crypto
            .encrypt("the secret is hunter2", crate::atoms::types::EncryptStrength::Standard, "aad")
            .unwrap()
            .to_json()
            .unwrap();
        let id = insert(&conn, "chat", "k", &envelope);

        assert!(!gate.filter(&[id]).unwrap()[&id].include);
        grant(&conn, id);
        assert!(gate.filter(&[id]).unwrap()[&id].include);
    }

    #[test]
    fn test_tampered_envelope_is_elided() {
        let conn = open_in_memory().unwrap();
        let crypto = Arc::new(EncryptionEngine::new(Arc::new(EnvKeyProvider::new())));
        let gate = ConsentGate::new(
            conn.clone(),
            Arc::new(RulesEngine::default()),
            crypto.clone(),
        );

        let envelope = crypto
            .encrypt("payload", crate::atoms::types::EncryptStrength::Standard, "aad")
            .unwrap();
        let mut json: serde_json::Value =
            serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        // Flip the ciphertext to an unauthenticated value.
        json["ct"] = serde_json::Value::String("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAA==".to_string());
        let id = insert(&conn, "chat", "k", &json.to_string());

        let verdicts = gate.filter(&[id]).unwrap();
        assert!(!verdicts[&id].include);
    }

    #[test]
    fn test_apply_preserves_order_and_drops_excluded() {
        let (conn, gate) = gate_with_rules(
            r#"{"ask_before_store": [{"match": {"content": "secret"}, "metadata": {}}]}"#,
        );
        let a = insert(&conn, "chat", "a", "plain one");
        let b = insert(&conn, "chat", "b", "a secret thing");
        let c = insert(&conn, "chat", "c", "plain two");

        let gated = gate
            .apply(&[(c, 0.9), (b, 0.8), (a, 0.7)])
            .unwrap();
        let ids: Vec<i64> = gated.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![c, a]);
        assert_eq!(gated[0].score, 0.9);
    }
}
