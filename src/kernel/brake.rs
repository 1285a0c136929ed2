// ── Kernel: Parking Brake ───────────────────────────────────────────────────
//
// Fail-closed safety gate over the kernel's autonomy scopes. One global
// brake with optional scopes (global, skills, sight, voice, scheduler,
// writes, retrieval); `global` dominates. When a scope is blocked, the
// gated path refuses to execute.
//
// State survives restarts in the system_flags table. Every transition
// appends a `safety.audit` record — the default rule set must allow that
// kind, so the audit row is stored plain and indexed like any other
// default record.

use chrono::Utc;
use log::info;
use parking_lot::RwLock;
use rusqlite::Connection;

use crate::atoms::constants::{BRAKE_FLAG_KEY, SAFETY_AUDIT_KIND};
use crate::atoms::error::KernelResult;
use crate::atoms::types::{BrakeScope, BrakeState};
use crate::kernel::fts::FtsIndex;
use crate::kernel::schema::SharedConn;

pub struct ParkingBrake {
    conn: SharedConn,
    cache: RwLock<BrakeState>,
}

impl ParkingBrake {
    /// Load persisted state (OFF when none exists).
    pub fn load(conn: SharedConn) -> KernelResult<Self> {
        let state = {
            let guard = conn.lock();
            Self::read_state(&guard)?
        };
        Ok(Self {
            conn,
            cache: RwLock::new(state),
        })
    }

    fn read_state(conn: &Connection) -> KernelResult<BrakeState> {
        let row: Option<String> = conn
            .query_row(
                "SELECT value FROM system_flags WHERE key = ?1",
                [BRAKE_FLAG_KEY],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(match row {
            Some(json) => serde_json::from_str(&json).unwrap_or_default(),
            None => BrakeState::default(),
        })
    }

    /// Current state snapshot.
    pub fn state(&self) -> BrakeState {
        self.cache.read().clone()
    }

    /// Engage with the union of current scopes and the arguments.
    /// No scopes means `global`.
    pub fn engage(&self, scopes: &[BrakeScope]) -> KernelResult<()> {
        let mut next = self.state();
        next.engaged = true;
        if scopes.is_empty() {
            next.scopes.insert(BrakeScope::Global);
        } else {
            next.scopes.extend(scopes.iter().copied());
        }
        self.write(next, "engaged")
    }

    /// Disengage entirely (all scopes cleared).
    pub fn disengage(&self) -> KernelResult<()> {
        self.write(BrakeState::default(), "disengaged")
    }

    /// Whether a scope is blocked: engaged and (global or the scope itself).
    pub fn is_blocked(&self, scope: BrakeScope) -> bool {
        let state = self.cache.read();
        state.engaged
            && (state.scopes.contains(&BrakeScope::Global) || state.scopes.contains(&scope))
    }

    fn write(&self, state: BrakeState, action: &str) -> KernelResult<()> {
        let payload = serde_json::to_string(&state)?;
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO system_flags(key, value, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET
                 value=excluded.value, updated_at=excluded.updated_at",
                rusqlite::params![BRAKE_FLAG_KEY, payload],
            )?;
            self.audit(&conn, action, &state)?;
        }
        info!("[brake] {action}: scopes={:?}", state.scopes);
        *self.cache.write() = state;
        Ok(())
    }

    /// Append a safety.audit record. Audit rows bypass the governance
    /// pipeline (the rule set is required to allow this kind) but keep
    /// the record invariants: stored plain, FTS-indexed when available.
    fn audit(&self, conn: &Connection, action: &str, state: &BrakeState) -> KernelResult<()> {
        let now = Utc::now();
        let key = format!("{}::{}", now.timestamp_micros(), action);
        let value = serde_json::to_string(&serde_json::json!({
            "action": action,
            "scopes": state.scopes,
        }))?;
        let ts = now.to_rfc3339();

        conn.execute(
            "INSERT INTO memories(kind, key, value, ts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, key) DO UPDATE SET
             value=excluded.value, ts=excluded.ts",
            rusqlite::params![SAFETY_AUDIT_KIND, key, value, ts],
        )?;
        let id = conn.last_insert_rowid();

        let has_fts: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name='memory_fts'",
                [],
                |_| Ok(()),
            )
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })?;
        if has_fts {
            FtsIndex::upsert_row(conn, id, &value)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::schema::{open_database, open_in_memory};

    #[test]
    fn test_initial_state_is_off() {
        let brake = ParkingBrake::load(open_in_memory().unwrap()).unwrap();
        let state = brake.state();
        assert!(!state.engaged);
        assert!(state.scopes.is_empty());
        assert!(!brake.is_blocked(BrakeScope::Writes));
    }

    #[test]
    fn test_engage_blocks_named_scope_only() {
        let brake = ParkingBrake::load(open_in_memory().unwrap()).unwrap();
        brake.engage(&[BrakeScope::Writes]).unwrap();
        assert!(brake.is_blocked(BrakeScope::Writes));
        assert!(!brake.is_blocked(BrakeScope::Retrieval));
        assert!(!brake.is_blocked(BrakeScope::Skills));
    }

    #[test]
    fn test_global_dominates() {
        let brake = ParkingBrake::load(open_in_memory().unwrap()).unwrap();
        brake.engage(&[]).unwrap();
        for scope in [
            BrakeScope::Writes,
            BrakeScope::Retrieval,
            BrakeScope::Skills,
            BrakeScope::Scheduler,
        ] {
            assert!(brake.is_blocked(scope));
        }
    }

    #[test]
    fn test_engage_unions_scopes() {
        let brake = ParkingBrake::load(open_in_memory().unwrap()).unwrap();
        brake.engage(&[BrakeScope::Writes]).unwrap();
        brake.engage(&[BrakeScope::Voice]).unwrap();
        let state = brake.state();
        assert!(state.scopes.contains(&BrakeScope::Writes));
        assert!(state.scopes.contains(&BrakeScope::Voice));
    }

    #[test]
    fn test_disengage_clears_everything() {
        let brake = ParkingBrake::load(open_in_memory().unwrap()).unwrap();
        brake.engage(&[BrakeScope::Writes, BrakeScope::Sight]).unwrap();
        brake.disengage().unwrap();
        let state = brake.state();
        assert!(!state.engaged);
        assert!(state.scopes.is_empty());
        assert!(!brake.is_blocked(BrakeScope::Writes));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memories.db");

        {
            let conn = open_database(&path).unwrap();
            let brake = ParkingBrake::load(conn).unwrap();
            brake.engage(&[BrakeScope::Writes]).unwrap();
        }

        let conn = open_database(&path).unwrap();
        let brake = ParkingBrake::load(conn).unwrap();
        let state = brake.state();
        assert!(state.engaged);
        assert!(state.scopes.contains(&BrakeScope::Writes));
        assert!(brake.is_blocked(BrakeScope::Writes));
    }

    #[test]
    fn test_transitions_write_audit_records() {
        let conn = open_in_memory().unwrap();
        let brake = ParkingBrake::load(conn.clone()).unwrap();
        brake.engage(&[BrakeScope::Writes]).unwrap();
        brake.disengage().unwrap();

        let guard = conn.lock();
        let count: i64 = guard
            .query_row(
                "SELECT COUNT(*) FROM memories WHERE kind = ?1",
                [SAFETY_AUDIT_KIND],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);

        let actions: Vec<String> = guard
            .prepare("SELECT value FROM memories WHERE kind = ?1 ORDER BY id")
            .unwrap()
            .query_map([SAFETY_AUDIT_KIND], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(actions[0].contains("engaged"));
        assert!(actions[1].contains("disengaged"));
    }
}
