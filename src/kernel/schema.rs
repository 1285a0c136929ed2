// ── Kernel: Record Store Schema ─────────────────────────────────────────────
//
// Single-file SQLite layout for the memory kernel:
//   - memories: the record rows; (kind, key) unique, id monotonic
//   - memory_embeddings: float32 BLOB vectors keyed by memory id
//   - memory_consent: explicit consent rows
//   - system_flags: brake state, schema version
// The FTS5 virtual table lives in fts.rs because its tokenizer comes
// from configuration.
//
// WAL journal mode with synchronous=NORMAL; auxiliary -wal/-shm files
// are checkpoint-truncated on clean shutdown. All statements are
// idempotent (CREATE IF NOT EXISTS) so migrations can re-run safely.

use std::path::Path;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::atoms::error::KernelResult;

/// The record store connection: single writer, shared between the store
/// and its index/gate components.
pub type SharedConn = Arc<Mutex<Connection>>;

/// Current schema version, recorded in system_flags.
const SCHEMA_VERSION: i64 = 1;

const CORE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS memories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        summary TEXT,
        ts TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '[]',
        metadata TEXT NOT NULL DEFAULT 'null'
    );
    CREATE UNIQUE INDEX IF NOT EXISTS uq_memories_kind_key ON memories(kind, key);
    CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind);
    CREATE INDEX IF NOT EXISTS idx_memories_ts ON memories(ts);

    CREATE TABLE IF NOT EXISTS memory_embeddings (
        embedding_id INTEGER PRIMARY KEY AUTOINCREMENT,
        memory_id INTEGER NOT NULL,
        source TEXT NOT NULL CHECK(source IN ('summary','full')),
        dim INTEGER NOT NULL,
        vec BLOB NOT NULL,
        norm REAL NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        FOREIGN KEY(memory_id) REFERENCES memories(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_mememb_memory_id ON memory_embeddings(memory_id);
    CREATE INDEX IF NOT EXISTS idx_mememb_identity ON memory_embeddings(provider, model, dim);

    CREATE TABLE IF NOT EXISTS memory_consent (
        memory_id INTEGER PRIMARY KEY,
        granted_at TEXT NOT NULL DEFAULT (datetime('now')),
        FOREIGN KEY(memory_id) REFERENCES memories(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS system_flags (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
";

/// Apply the WAL pragmas every connection needs.
pub fn set_wal_pragmas(conn: &Connection) -> KernelResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(())
}

/// Open (or create) the record store and run core migrations.
pub fn open_database(path: &Path) -> KernelResult<SharedConn> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    info!("[schema] Opening record store at {}", path.display());
    let conn = Connection::open(path)?;
    set_wal_pragmas(&conn)?;
    run_migrations(&conn)?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory store for tests (no WAL, same schema).
pub fn open_in_memory() -> KernelResult<SharedConn> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    run_migrations(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn run_migrations(conn: &Connection) -> KernelResult<()> {
    conn.execute_batch(CORE_SCHEMA)?;
    conn.execute(
        "INSERT INTO system_flags(key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value,
         updated_at=datetime('now')",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Runtime probe for FTS5 support in this SQLite build.
pub fn fts5_available(conn: &Connection) -> bool {
    let probe = conn
        .execute_batch("CREATE VIRTUAL TABLE temp.__fts5_probe USING fts5(x)")
        .is_ok();
    if probe {
        let _ = conn.execute_batch("DROP TABLE temp.__fts5_probe");
    }
    probe
}

/// Checkpoint and truncate the WAL so -wal/-shm shrink on clean shutdown.
pub fn wal_checkpoint_truncate(conn: &Connection) {
    let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creates_all_tables() {
        let conn = open_in_memory().unwrap();
        let conn = conn.lock();
        for table in ["memories", "memory_embeddings", "memory_consent", "system_flags"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = open_in_memory().unwrap();
        let conn = conn.lock();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
    }

    #[test]
    fn test_kind_key_unique_constraint() {
        let conn = open_in_memory().unwrap();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO memories(kind, key, value, ts) VALUES ('chat','k','v','t')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO memories(kind, key, value, ts) VALUES ('chat','k','v2','t')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_embedding_cascade_on_record_delete() {
        let conn = open_in_memory().unwrap();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO memories(kind, key, value, ts) VALUES ('chat','k','v','t')",
            [],
        )
        .unwrap();
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO memory_embeddings(memory_id, source, dim, vec, norm, provider, model)
             VALUES (?1, 'full', 2, x'0000803f00000000', 1.0, 'p', 'm')",
            [id],
        )
        .unwrap();

        conn.execute("DELETE FROM memories WHERE id=?1", [id]).unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn test_fts5_probe() {
        let conn = open_in_memory().unwrap();
        let conn = conn.lock();
        // The bundled SQLite ships FTS5; the probe must not alter state.
        assert!(fts5_available(&conn));
        assert!(fts5_available(&conn));
    }

    #[test]
    fn test_schema_version_recorded() {
        let conn = open_in_memory().unwrap();
        let conn = conn.lock();
        let version: String = conn
            .query_row(
                "SELECT value FROM system_flags WHERE key='schema_version'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }
}
