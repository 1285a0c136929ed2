// ── Kernel: Full-Text Search Index ──────────────────────────────────────────
//
// FTS5 index over the sanitized index text of each record. The FTS rowid
// IS the record id — a startup migration verifies that identity and a
// rebuild restores it on mismatch.
//
// The indexed content is always the summary or the redacted value; raw
// input and ciphertext never reach this table. Mutations take the
// caller's connection so the store can run them inside the same
// transaction as the record row.
//
// If this SQLite build lacks FTS5 (probed once per process), search
// degrades to an empty candidate set and the degradation is logged
// exactly once.

use std::sync::Once;

use log::{debug, info, warn};
use rusqlite::Connection;

use crate::atoms::error::{KernelError, KernelResult};
use crate::kernel::schema::{fts5_available, SharedConn};

static DEGRADED_LOG: Once = Once::new();

/// One FTS candidate. `rank` is the raw bm25() value — lower is better.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub id: i64,
    pub rank: f64,
    pub snippet: Option<String>,
}

pub struct FtsIndex {
    conn: SharedConn,
    available: bool,
}

impl FtsIndex {
    /// Probe FTS5, create the index schema, and verify rowid identity.
    /// `tokenizer` and `tokenizer_args` form the FTS5 tokenize spec,
    /// e.g. ("porter", "") or ("unicode61", "remove_diacritics 2 tokenchars .-@_").
    pub fn open(conn: SharedConn, tokenizer: &str, tokenizer_args: &str) -> KernelResult<Self> {
        let available = {
            let guard = conn.lock();
            fts5_available(&guard)
        };

        if !available {
            DEGRADED_LOG.call_once(|| {
                warn!(
                    "[fts] FTS5 unavailable in this SQLite build; \
                     full-text search degrades to an empty candidate set"
                );
            });
            return Ok(Self {
                conn,
                available: false,
            });
        }

        let tokenize = if tokenizer_args.is_empty() {
            tokenizer.to_string()
        } else {
            format!("{tokenizer} {tokenizer_args}")
        };

        {
            let guard = conn.lock();
            guard.execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
                    content,
                    tokenize='{tokenize}'
                );
                CREATE TABLE IF NOT EXISTS memory_fts_map (
                    memory_id INTEGER PRIMARY KEY,
                    indexed_at TEXT NOT NULL DEFAULT (datetime('now'))
                );"
            ))?;
        }
        info!("[fts] Schema initialized (tokenize='{tokenize}')");

        Ok(Self {
            conn,
            available: true,
        })
    }

    pub fn available(&self) -> bool {
        self.available
    }

    // ── Mutations (caller's connection, so they join its transaction) ──

    /// Insert or replace the index row for a record.
    pub fn upsert_row(conn: &Connection, memory_id: i64, text: &str) -> KernelResult<()> {
        conn.execute("DELETE FROM memory_fts WHERE rowid = ?1", [memory_id])?;
        conn.execute(
            "INSERT INTO memory_fts(rowid, content) VALUES (?1, ?2)",
            rusqlite::params![memory_id, text],
        )?;
        conn.execute(
            "INSERT INTO memory_fts_map(memory_id) VALUES (?1)
             ON CONFLICT(memory_id) DO UPDATE SET indexed_at=datetime('now')",
            [memory_id],
        )?;
        Ok(())
    }

    /// Remove a record from the index.
    pub fn delete_row(conn: &Connection, memory_id: i64) -> KernelResult<()> {
        conn.execute("DELETE FROM memory_fts WHERE rowid = ?1", [memory_id])?;
        conn.execute("DELETE FROM memory_fts_map WHERE memory_id = ?1", [memory_id])?;
        Ok(())
    }

    // ── Identity check & rebuild ───────────────────────────────────────

    /// True when the index holds a rowid with no matching record.
    pub fn has_identity_mismatch(&self) -> KernelResult<bool> {
        if !self.available {
            return Ok(false);
        }
        let conn = self.conn.lock();
        let mismatch = conn
            .query_row(
                "SELECT 1 FROM memory_fts f
                 LEFT JOIN memories m ON f.rowid = m.id
                 WHERE m.id IS NULL LIMIT 1",
                [],
                |_| Ok(()),
            )
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })?;
        Ok(mismatch)
    }

    /// Replace the whole index with the provided `(id, text)` rows.
    /// The store derives the texts (summary / redacted value, decrypted
    /// where needed) so this layer never sees policy.
    pub fn rebuild(&self, rows: &[(i64, String)]) -> KernelResult<usize> {
        if !self.available {
            return Ok(0);
        }
        let conn = self.conn.lock();
        conn.execute("DELETE FROM memory_fts", [])?;
        conn.execute("DELETE FROM memory_fts_map", [])?;
        for (id, text) in rows {
            Self::upsert_row(&conn, *id, text)?;
        }
        info!("[fts] Index rebuilt: {} rows", rows.len());
        Ok(rows.len())
    }

    /// Merge index segments to reduce fragmentation. Intended for a
    /// periodic (weekly) maintenance call.
    pub fn optimize(&self) -> KernelResult<()> {
        if !self.available {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_fts(memory_fts) VALUES ('optimize')",
            [],
        )?;
        info!("[fts] Index optimized");
        Ok(())
    }

    // ── Search ─────────────────────────────────────────────────────────

    /// Search the index, best rank first. Raw FTS5 syntax is honored;
    /// on a syntax error the query is retried sanitized, so arbitrary
    /// user text cannot fail the channel.
    pub fn search(&self, query: &str, limit: usize) -> KernelResult<Vec<FtsHit>> {
        if !self.available || query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        match self.run_match(query, limit) {
            Ok(hits) => Ok(hits),
            Err(KernelError::Database(rusqlite::Error::SqliteFailure(_, _))) => {
                let cleaned = sanitize_fts5_query(query);
                if cleaned.is_empty() {
                    return Ok(Vec::new());
                }
                debug!("[fts] Retrying with sanitized query");
                self.run_match(&cleaned, limit)
            }
            Err(e) => Err(e),
        }
    }

    fn run_match(&self, query: &str, limit: usize) -> KernelResult<Vec<FtsHit>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT rowid, bm25(memory_fts),
                    snippet(memory_fts, 0, '[', ']', ' … ', 8)
             FROM memory_fts
             WHERE memory_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![query, limit as i64], |row| {
            Ok(FtsHit {
                id: row.get(0)?,
                rank: row.get(1)?,
                snippet: row.get(2)?,
            })
        })?;
        let hits = rows.collect::<Result<Vec<_>, _>>()?;
        debug!("[fts] {} candidates", hits.len());
        Ok(hits)
    }

    /// Highlighted excerpt for one indexed record, or None when the
    /// record is not in the index.
    pub fn snippet_for(
        &self,
        memory_id: i64,
        query: &str,
        start_mark: &str,
        end_mark: &str,
        tokens: u32,
    ) -> KernelResult<Option<String>> {
        if !self.available {
            return Ok(None);
        }
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT snippet(memory_fts, 0, ?2, ?3, ' … ', ?4)
                 FROM memory_fts
                 WHERE rowid = ?1 AND memory_fts MATCH ?5",
                rusqlite::params![memory_id, start_mark, end_mark, tokens, query],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(result)
    }
}

/// Strip FTS5 operator syntax from a user query so it cannot break the
/// MATCH expression: special characters become spaces and boolean
/// keywords are dropped.
pub fn sanitize_fts5_query(query: &str) -> String {
    let mut cleaned = String::with_capacity(query.len());
    for c in query.chars() {
        match c {
            '"' | '*' | '+' | '-' | '^' | ':' | '(' | ')' | '{' | '}' => cleaned.push(' '),
            _ => cleaned.push(c),
        }
    }

    cleaned
        .split_whitespace()
        .filter(|w| !matches!(*w, "AND" | "OR" | "NOT" | "NEAR"))
        .collect::<Vec<_>>()
        .join(" ")
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::schema::open_in_memory;

    fn index() -> (SharedConn, FtsIndex) {
        let conn = open_in_memory().unwrap();
        let fts = FtsIndex::open(conn.clone(), "porter", "").unwrap();
        (conn, fts)
    }

    fn insert_record(conn: &SharedConn, kind: &str, key: &str, value: &str) -> i64 {
        let guard = conn.lock();
        guard
            .execute(
                "INSERT INTO memories(kind, key, value, ts) VALUES (?1, ?2, ?3, 't')",
                rusqlite::params![kind, key, value],
            )
            .unwrap();
        guard.last_insert_rowid()
    }

    #[test]
    fn test_upsert_and_search() {
        let (conn, fts) = index();
        let id = insert_record(&conn, "chat", "k1", "the quick brown fox");
        {
            let guard = conn.lock();
            FtsIndex::upsert_row(&guard, id, "the quick brown fox").unwrap();
        }

        let hits = fts.search("fox", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!(hits[0].snippet.as_deref().unwrap().contains("[fox]"));
    }

    #[test]
    fn test_rowid_is_record_id() {
        let (conn, fts) = index();
        let id = insert_record(&conn, "chat", "k1", "alpha");
        {
            let guard = conn.lock();
            FtsIndex::upsert_row(&guard, id, "alpha content").unwrap();
        }
        let hits = fts.search("alpha", 10).unwrap();
        assert_eq!(hits[0].id, id);
        assert!(!fts.has_identity_mismatch().unwrap());
    }

    #[test]
    fn test_upsert_replaces_previous_text() {
        let (conn, fts) = index();
        let id = insert_record(&conn, "chat", "k1", "v");
        {
            let guard = conn.lock();
            FtsIndex::upsert_row(&guard, id, "original words").unwrap();
            FtsIndex::upsert_row(&guard, id, "replacement text").unwrap();
        }
        assert!(fts.search("original", 10).unwrap().is_empty());
        assert_eq!(fts.search("replacement", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_removes_from_index() {
        let (conn, fts) = index();
        let id = insert_record(&conn, "chat", "k1", "v");
        {
            let guard = conn.lock();
            FtsIndex::upsert_row(&guard, id, "findable words").unwrap();
            FtsIndex::delete_row(&guard, id).unwrap();
        }
        assert!(fts.search("findable", 10).unwrap().is_empty());
    }

    #[test]
    fn test_identity_mismatch_detected_and_rebuilt() {
        let (conn, fts) = index();
        let id = insert_record(&conn, "chat", "k1", "kept");
        {
            let guard = conn.lock();
            FtsIndex::upsert_row(&guard, id, "kept").unwrap();
            // Orphan: an FTS row whose record does not exist.
            FtsIndex::upsert_row(&guard, id + 100, "orphan").unwrap();
        }
        assert!(fts.has_identity_mismatch().unwrap());

        fts.rebuild(&[(id, "kept".to_string())]).unwrap();
        assert!(!fts.has_identity_mismatch().unwrap());
        assert!(fts.search("orphan", 10).unwrap().is_empty());
        assert_eq!(fts.search("kept", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_rank_orders_better_matches_first() {
        let (conn, fts) = index();
        let a = insert_record(&conn, "chat", "a", "v");
        let b = insert_record(&conn, "chat", "b", "v");
        {
            let guard = conn.lock();
            FtsIndex::upsert_row(&guard, a, "privacy privacy privacy policy").unwrap();
            FtsIndex::upsert_row(&guard, b, "one mention of privacy in a much longer body of text about other things entirely").unwrap();
        }
        let hits = fts.search("privacy", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, a);
        assert!(hits[0].rank <= hits[1].rank);
    }

    #[test]
    fn test_malformed_query_falls_back_to_sanitized() {
        let (conn, fts) = index();
        let id = insert_record(&conn, "chat", "k1", "v");
        {
            let guard = conn.lock();
            FtsIndex::upsert_row(&guard, id, "some searchable text").unwrap();
        }
        // Unbalanced quote is an FTS5 syntax error when passed raw.
        let hits = fts.search("searchable\" AND (", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_empty_query_and_zero_limit() {
        let (_conn, fts) = index();
        assert!(fts.search("", 10).unwrap().is_empty());
        assert!(fts.search("anything", 0).unwrap().is_empty());
    }

    #[test]
    fn test_optimize_runs() {
        let (conn, fts) = index();
        let id = insert_record(&conn, "chat", "k1", "v");
        {
            let guard = conn.lock();
            FtsIndex::upsert_row(&guard, id, "text to merge").unwrap();
        }
        fts.optimize().unwrap();
        assert_eq!(fts.search("merge", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_sanitize_strips_operators() {
        assert_eq!(sanitize_fts5_query("hello world"), "hello world");
        assert_eq!(sanitize_fts5_query("hello* OR world"), "hello world");
        assert_eq!(sanitize_fts5_query("\"exact phrase\""), "exact phrase");
        assert_eq!(sanitize_fts5_query("kind:event NOT x"), "kind event x");
    }
}
