//! Heartbeat rows and the maintenance operations the daemon runs on a
//! coarser cadence.

use rusqlite::{OptionalExtension, params};

use super::{Store, StoreError};
use crate::model::{Heartbeat, WorkerState, now_ms};

/// Per-state row counts and sums, for the maintenance metrics beat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerStats {
    /// `(state, row count)` pairs.
    pub by_state: Vec<(String, u32)>,
}

impl Store {
    /// Upsert the heartbeat row of a worker. Payloads are deliberately
    /// small: one row per worker, overwritten in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub fn heartbeat(
        &self,
        worker_name: &str,
        state: WorkerState,
        panic_snapshot: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO heartbeats (worker_name, pid, last_beat_at, state, panic_snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(worker_name) DO UPDATE SET
                   pid = excluded.pid,
                   last_beat_at = excluded.last_beat_at,
                   state = excluded.state,
                   panic_snapshot = COALESCE(excluded.panic_snapshot, panic_snapshot)",
                params![
                    worker_name,
                    std::process::id(),
                    now_ms(),
                    state.as_str(),
                    panic_snapshot,
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch the heartbeat row of a worker, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn heartbeat_of(&self, worker_name: &str) -> Result<Option<Heartbeat>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT worker_name, pid, last_beat_at, state, panic_snapshot
                     FROM heartbeats WHERE worker_name = ?1",
                    params![worker_name],
                    |row| {
                        let state: String = row.get(3)?;
                        Ok(Heartbeat {
                            worker_name: row.get(0)?,
                            pid: row.get(1)?,
                            last_beat_at: row.get(2)?,
                            state: WorkerState::parse(&state).unwrap_or(WorkerState::Dead),
                            panic_snapshot: row.get(4)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Return advisory locks whose holder has been beat-less for longer than
    /// the lock timeout to `PROPOSED`. Run by the maintenance pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn clean_orphaned_locks(&self) -> Result<u32, StoreError> {
        let timeout = self.lock_timeout_ms();
        self.with_tx(|tx| {
            let now = now_ms();
            let changed = tx.execute(
                "UPDATE ledger_entries
                 SET state = 'PROPOSED', lock_owner = NULL, locked_at = NULL, updated_at = ?1
                 WHERE state = 'LOCKING'
                   AND locked_at < ?2
                   AND lock_owner NOT IN
                       (SELECT worker_name FROM heartbeats
                        WHERE state = 'ALIVE' AND last_beat_at >= ?2)",
                params![now, now - timeout],
            )?;
            let cleaned = u32::try_from(changed).unwrap_or(u32::MAX);
            if cleaned > 0 {
                tracing::warn!(cleaned, "cleaned orphaned entry locks");
            }
            Ok(cleaned)
        })
    }

    /// Flush the write-ahead log into the main file.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint fails.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
            Ok(())
        })
    }

    /// Refresh the query planner statistics. Run daily.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh fails.
    pub fn refresh_statistics(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch("ANALYZE")?;
            Ok(())
        })
    }

    /// `PRAGMA integrity_check` over the whole file.
    ///
    /// # Errors
    ///
    /// Returns an error if the check cannot run.
    pub fn integrity_check(&self) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let verdict: String =
                conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            Ok(verdict == "ok")
        })
    }

    /// Row counts per ledger state.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn ledger_stats(&self) -> Result<LedgerStats, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT state, COUNT(*) FROM ledger_entries GROUP BY state ORDER BY state",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut by_state = Vec::new();
            for row in rows {
                let (state, count) = row?;
                by_state.push((state, u32::try_from(count).unwrap_or(u32::MAX)));
            }
            Ok(LedgerStats { by_state })
        })
    }
}
