// ── Kernel: Vector Store ────────────────────────────────────────────────────
//
// Persistent embeddings keyed by record id, with exact cosine search.
//
// Vectors are float32 little-endian BLOBs, L2-normalized on write, so
// cosine similarity is a dot product. Every row records its producer
// identity (provider, model, dim); at query time only matching rows are
// eligible unless the caller explicitly allows a mismatch — vectors from
// different models never mix silently.
//
// Brute-force scan is the default backend (fine below ~10⁴ rows); an
// approximate index may replace the scan behind the same interface
// without touching gate correctness.

use log::debug;
use rusqlite::Connection;

use crate::atoms::error::KernelResult;
use crate::atoms::types::EmbedSource;
use crate::kernel::embedding::{l2_norm, l2_normalize};
use crate::kernel::schema::SharedConn;

/// Producer identity a query can pin.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIdentity {
    pub provider: String,
    pub model: String,
    pub dim: usize,
}

pub struct VectorStore {
    conn: SharedConn,
}

impl VectorStore {
    pub fn new(conn: SharedConn) -> Self {
        Self { conn }
    }

    // ── Mutations (caller's connection, so they join its transaction) ──

    /// Insert one embedding row. The vector is normalized before storage
    /// and its norm recorded for audit.
    pub fn insert_row(
        conn: &Connection,
        memory_id: i64,
        source: EmbedSource,
        vec: &[f32],
        provider: &str,
        model: &str,
    ) -> KernelResult<()> {
        let mut normalized = vec.to_vec();
        l2_normalize(&mut normalized);
        let norm = l2_norm(&normalized) as f64;

        conn.execute(
            "INSERT INTO memory_embeddings (memory_id, source, dim, vec, norm, provider, model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                memory_id,
                source.as_str(),
                normalized.len() as i64,
                encode_vec(&normalized),
                norm,
                provider,
                model
            ],
        )?;
        Ok(())
    }

    /// Remove every embedding row for a record.
    pub fn delete_for_memory(conn: &Connection, memory_id: i64) -> KernelResult<usize> {
        let n = conn.execute(
            "DELETE FROM memory_embeddings WHERE memory_id = ?1",
            [memory_id],
        )?;
        Ok(n)
    }

    // ── Search ─────────────────────────────────────────────────────────

    /// Exact cosine search. With `identity` set and `allow_mismatch`
    /// false, only rows from that (provider, model, dim) are eligible.
    /// Returns `(memory_id, score)` sorted by descending score, scores
    /// clamped to [0, 1].
    pub fn search(
        &self,
        qvec: &[f32],
        top_k: usize,
        identity: Option<&VectorIdentity>,
        source: Option<EmbedSource>,
        allow_mismatch: bool,
    ) -> KernelResult<Vec<(i64, f64)>> {
        if top_k == 0 || qvec.is_empty() {
            return Ok(Vec::new());
        }

        let mut query_vec = qvec.to_vec();
        l2_normalize(&mut query_vec);

        let mut sql = String::from(
            "SELECT memory_id, vec, dim FROM memory_embeddings WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let (Some(ident), false) = (identity, allow_mismatch) {
            sql.push_str(" AND provider = ? AND model = ? AND dim = ?");
            params.push(Box::new(ident.provider.clone()));
            params.push(Box::new(ident.model.clone()));
            params.push(Box::new(ident.dim as i64));
        }
        if let Some(source) = source {
            sql.push_str(" AND source = ?");
            params.push(Box::new(source.as_str().to_string()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)? as usize,
                ))
            },
        )?;

        let mut results: Vec<(i64, f64)> = Vec::new();
        for row in rows {
            let (memory_id, blob, dim) = row?;
            if dim != query_vec.len() {
                continue;
            }
            let vec = decode_vec(&blob);
            let score = dot(&query_vec, &vec).clamp(0.0, 1.0);
            results.push((memory_id, score));
        }

        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.0.cmp(&a.0))
        });
        results.truncate(top_k);
        debug!("[vector] {} candidates", results.len());
        Ok(results)
    }

    pub fn count(&self) -> KernelResult<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row("SELECT COUNT(*) FROM memory_embeddings", [], |r| r.get(0))?;
        Ok(n)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

pub fn encode_vec(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub fn decode_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::schema::open_in_memory;

    fn store() -> (SharedConn, VectorStore) {
        let conn = open_in_memory().unwrap();
        (conn.clone(), VectorStore::new(conn))
    }

    fn insert_record(conn: &SharedConn, key: &str) -> i64 {
        let guard = conn.lock();
        guard
            .execute(
                "INSERT INTO memories(kind, key, value, ts) VALUES ('chat', ?1, 'v', 't')",
                [key],
            )
            .unwrap();
        guard.last_insert_rowid()
    }

    fn ident() -> VectorIdentity {
        VectorIdentity {
            provider: "local-hash".to_string(),
            model: "sha256-expansion".to_string(),
            dim: 3,
        }
    }

    #[test]
    fn test_roundtrip_blob_encoding() {
        let v = vec![0.25f32, -1.5, 3.75];
        assert_eq!(decode_vec(&encode_vec(&v)), v);
    }

    #[test]
    fn test_search_orders_by_cosine() {
        let (conn, store) = store();
        let a = insert_record(&conn, "a");
        let b = insert_record(&conn, "b");
        {
            let guard = conn.lock();
            VectorStore::insert_row(&guard, a, EmbedSource::Full, &[1.0, 0.0, 0.0], "local-hash", "sha256-expansion").unwrap();
            VectorStore::insert_row(&guard, b, EmbedSource::Full, &[0.0, 1.0, 0.0], "local-hash", "sha256-expansion").unwrap();
        }

        let hits = store
            .search(&[0.9, 0.1, 0.0], 10, Some(&ident()), None, false)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, a);
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_strict_identity_excludes_other_models() {
        let (conn, store) = store();
        let a = insert_record(&conn, "a");
        {
            let guard = conn.lock();
            VectorStore::insert_row(&guard, a, EmbedSource::Full, &[1.0, 0.0, 0.0], "other", "model-x", ).unwrap();
        }

        let strict = store
            .search(&[1.0, 0.0, 0.0], 10, Some(&ident()), None, false)
            .unwrap();
        assert!(strict.is_empty());

        let relaxed = store
            .search(&[1.0, 0.0, 0.0], 10, Some(&ident()), None, true)
            .unwrap();
        assert_eq!(relaxed.len(), 1);
    }

    #[test]
    fn test_dim_mismatch_rows_are_skipped() {
        let (conn, store) = store();
        let a = insert_record(&conn, "a");
        {
            let guard = conn.lock();
            VectorStore::insert_row(&guard, a, EmbedSource::Full, &[1.0, 0.0], "local-hash", "sha256-expansion").unwrap();
        }
        // Query dim 3 vs stored dim 2, no identity pin.
        let hits = store.search(&[1.0, 0.0, 0.0], 10, None, None, true).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_source_filter() {
        let (conn, store) = store();
        let a = insert_record(&conn, "a");
        {
            let guard = conn.lock();
            VectorStore::insert_row(&guard, a, EmbedSource::Summary, &[1.0, 0.0, 0.0], "local-hash", "sha256-expansion").unwrap();
            VectorStore::insert_row(&guard, a, EmbedSource::Full, &[1.0, 0.0, 0.0], "local-hash", "sha256-expansion").unwrap();
        }
        let hits = store
            .search(&[1.0, 0.0, 0.0], 10, Some(&ident()), Some(EmbedSource::Summary), false)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_vectors_normalized_on_write() {
        let (conn, store) = store();
        let a = insert_record(&conn, "a");
        {
            let guard = conn.lock();
            VectorStore::insert_row(&guard, a, EmbedSource::Full, &[3.0, 0.0, 0.0], "local-hash", "sha256-expansion").unwrap();
        }
        let norm: f64 = {
            let guard = conn.lock();
            guard
                .query_row("SELECT norm FROM memory_embeddings", [], |r| r.get(0))
                .unwrap()
        };
        assert!((norm - 1.0).abs() < 1e-5);

        let hits = store
            .search(&[1.0, 0.0, 0.0], 1, Some(&ident()), None, false)
            .unwrap();
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_delete_for_memory() {
        let (conn, store) = store();
        let a = insert_record(&conn, "a");
        {
            let guard = conn.lock();
            VectorStore::insert_row(&guard, a, EmbedSource::Full, &[1.0, 0.0, 0.0], "local-hash", "sha256-expansion").unwrap();
            assert_eq!(VectorStore::delete_for_memory(&guard, a).unwrap(), 1);
        }
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_top_k_zero_and_empty_query() {
        let (_conn, store) = store();
        assert!(store.search(&[1.0], 0, None, None, true).unwrap().is_empty());
        assert!(store.search(&[], 5, None, None, true).unwrap().is_empty());
    }
}
