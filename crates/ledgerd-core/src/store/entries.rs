//! Ledger entry operations: chained append, advisory locks, chain
//! verification, and logical reversal.

use std::str::FromStr;

use rusqlite::{OptionalExtension, Row, params};
use rust_decimal::Decimal;

use super::{GENESIS_HASH, Store, StoreError, canonical_amount, chain_hash};
use crate::model::{EntryState, InferenceLog, InferenceStep, LedgerEntry, NewEntry, now_ms};

/// Result of a chain verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainReport {
    /// Every row in the range verified.
    Intact {
        /// Rows checked.
        checked: u32,
    },
    /// The chain is broken.
    Broken {
        /// First row at which verification failed.
        at: i64,
    },
}

impl ChainReport {
    /// Whether the verified range was intact.
    #[must_use]
    pub const fn is_intact(&self) -> bool {
        matches!(self, Self::Intact { .. })
    }
}

fn map_entry(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let amount: String = row.get("amount")?;
    let inference_log: String = row.get("inference_log")?;
    let state: String = row.get("state")?;

    Ok(LedgerEntry {
        id: row.get("id")?,
        trace_id: row.get("trace_id")?,
        amount: Decimal::from_str(&amount).unwrap_or_default(),
        vendor: row.get("vendor")?,
        category: row.get("category")?,
        occurred_at: row.get("occurred_at")?,
        group_id: row.get("group_id")?,
        project_id: row.get("project_id")?,
        inference_log: serde_json::from_str(&inference_log).unwrap_or_default(),
        matched_rule: row.get("matched_rule")?,
        prev_hash: row.get("prev_hash")?,
        chain_hash: row.get("chain_hash")?,
        state: EntryState::parse(&state).unwrap_or(EntryState::Proposed),
        lock_owner: row.get("lock_owner")?,
        locked_at: row.get("locked_at")?,
        reverted_by: row.get("reverted_by")?,
        tenant_id: row.get("tenant_id")?,
        inserted_at: row.get("inserted_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const ENTRY_COLUMNS: &str = "id, trace_id, amount, vendor, category, occurred_at, group_id, \
     project_id, inference_log, matched_rule, prev_hash, chain_hash, state, \
     lock_owner, locked_at, reverted_by, tenant_id, inserted_at, updated_at";

/// Chained insert shared by [`Store::append_entry`] and
/// [`Store::mark_reverted`]. Runs inside the caller's transaction.
fn append_row(
    tx: &rusqlite::Transaction<'_>,
    entry: &NewEntry,
    state: EntryState,
) -> Result<i64, StoreError> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM ledger_entries WHERE trace_id = ?1",
            params![entry.trace_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing_id) = existing {
        return Err(StoreError::DuplicateTrace {
            trace_id: entry.trace_id.clone(),
            existing_id,
        });
    }

    let head: Option<(i64, String, String, String, String, String, i64, String)> = tx
        .query_row(
            "SELECT id, prev_hash, chain_hash, amount, vendor, category, occurred_at, trace_id
             FROM ledger_entries ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            },
        )
        .optional()?;

    let prev_hash = match head {
        None => GENESIS_HASH.to_string(),
        Some((id, head_prev, head_hash, amount, vendor, category, occurred_at, trace)) => {
            let recomputed =
                chain_hash(&head_prev, &amount, &vendor, &category, &trace, occurred_at);
            if recomputed != head_hash {
                return Err(StoreError::ChainMismatch { at: id });
            }
            head_hash
        }
    };

    let amount = canonical_amount(entry.amount);
    let hash = chain_hash(
        &prev_hash,
        &amount,
        &entry.vendor,
        &entry.category,
        &entry.trace_id,
        entry.occurred_at,
    );
    let now = now_ms();
    let log = serde_json::to_string(&entry.inference_log).map_err(|e| StoreError::Corrupt {
        column: "inference_log",
        message: e.to_string(),
    })?;

    tx.execute(
        "INSERT INTO ledger_entries
           (trace_id, amount, vendor, category, occurred_at, group_id, project_id,
            inference_log, matched_rule, prev_hash, chain_hash, state, tenant_id,
            inserted_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
        params![
            entry.trace_id,
            amount,
            entry.vendor,
            entry.category,
            entry.occurred_at,
            entry.group_id,
            entry.project_id,
            log,
            entry.matched_rule,
            prev_hash,
            hash,
            state.as_str(),
            entry.tenant_id,
            now,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

impl Store {
    /// Append a proposed entry to the hash chain.
    ///
    /// Reads the committed chain head, verifies it against its own fields,
    /// computes the new row's `chain_hash`, and inserts. The whole operation
    /// runs in one immediate transaction, so the pre-read head cannot be
    /// superseded before the insert commits.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ChainViolation`] while the refuse-appends latch is set
    /// - [`StoreError::DuplicateTrace`] if the trace id is already present;
    ///   the existing row id is returned inside the error
    /// - [`StoreError::ChainMismatch`] if the committed head fails its own
    ///   hash check (the latch is set before returning)
    pub fn append_entry(&self, entry: &NewEntry) -> Result<i64, StoreError> {
        if self.chain_violation() {
            return Err(StoreError::ChainViolation);
        }

        let result = self.with_tx(|tx| append_row(tx, entry, EntryState::Proposed));

        if let Err(StoreError::ChainMismatch { at }) = &result {
            tracing::error!(at = *at, "chain head failed self-check; latching store");
            self.latch_chain_violation();
        }
        result
    }

    /// Fetch an entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such row exists.
    pub fn entry(&self, id: i64) -> Result<LedgerEntry, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = ?1"),
                params![id],
                map_entry,
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "entry",
                key: id.to_string(),
            })
        })
    }

    /// Fetch an entry by trace id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such row exists.
    pub fn entry_by_trace(&self, trace_id: &str) -> Result<LedgerEntry, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE trace_id = ?1"),
                params![trace_id],
                map_entry,
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "entry",
                key: trace_id.to_string(),
            })
        })
    }

    /// Entries in a given state, oldest first, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn entries_in_state(
        &self,
        state: EntryState,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE state = ?1
                 ORDER BY id ASC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![state.as_str(), limit], map_entry)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Posted entries of a vendor, newest first, up to `limit`. Used by the
    /// auditor's historical-consistency check.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn entries_by_vendor(
        &self,
        vendor: &str,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries
                 WHERE vendor = ?1 AND state IN ('POSTED', 'RISK')
                 ORDER BY occurred_at DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![vendor, limit], map_entry)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Posted entries whose amount lies in `[lo, hi]` and occurred within
    /// `[from_ms, to_ms]`. Candidate query for the match engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn posted_candidates(
        &self,
        lo: Decimal,
        hi: Decimal,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries
                 WHERE state IN ('AUDITED', 'POSTED', 'RISK')
                   AND occurred_at BETWEEN ?1 AND ?2
                 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![from_ms, to_ms], map_entry)?;
            let mut out = Vec::new();
            for row in rows {
                let entry = row?;
                let abs = entry.amount.abs();
                if abs >= lo.abs() && abs <= hi.abs() {
                    out.push(entry);
                }
            }
            Ok(out)
        })
    }

    /// Move an entry to a new lifecycle state.
    ///
    /// Terminal rows are frozen by the storage triggers; an attempt to move
    /// one surfaces as [`StoreError::SchemaViolation`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such row exists.
    pub fn set_entry_state(&self, id: i64, state: EntryState) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE ledger_entries SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![state.as_str(), now_ms(), id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "entry",
                    key: id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Take the advisory lock on a proposed entry.
    ///
    /// Claims the lock outright when the row is `PROPOSED`. A row already
    /// `LOCKING` is claimable only when its lock is older than the configured
    /// lock timeout and the owner has no live heartbeat; otherwise
    /// [`StoreError::Locked`] is returned.
    ///
    /// # Errors
    ///
    /// See above; also [`StoreError::NotFound`].
    pub fn lock_entry(&self, id: i64, owner: &str) -> Result<(), StoreError> {
        let timeout = self.lock_timeout_ms();
        self.with_tx(|tx| {
            let now = now_ms();
            let row: Option<(String, Option<String>, Option<i64>)> = tx
                .query_row(
                    "SELECT state, lock_owner, locked_at FROM ledger_entries WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((state, lock_owner, locked_at)) = row else {
                return Err(StoreError::NotFound {
                    entity: "entry",
                    key: id.to_string(),
                });
            };

            match state.as_str() {
                "PROPOSED" => {}
                "LOCKING" => {
                    let holder = lock_owner.unwrap_or_default();
                    let stale = locked_at.is_some_and(|at| now - at > timeout);
                    let holder_alive: bool = tx
                        .query_row(
                            "SELECT state = 'ALIVE' FROM heartbeats WHERE worker_name = ?1",
                            params![holder],
                            |row| row.get(0),
                        )
                        .optional()?
                        .unwrap_or(false);
                    if holder_alive || !stale {
                        return Err(StoreError::Locked { id, owner: holder });
                    }
                    tracing::warn!(id, holder = %holder, "claiming stale entry lock");
                }
                other => {
                    return Err(StoreError::SchemaViolation {
                        message: format!("entry {id} is not lockable in state {other}"),
                    });
                }
            }

            tx.execute(
                "UPDATE ledger_entries
                 SET state = 'LOCKING', lock_owner = ?1, locked_at = ?2, updated_at = ?2
                 WHERE id = ?3",
                params![owner, now, id],
            )?;
            Ok(())
        })
    }

    /// Release an advisory lock, moving the entry to `state`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if the lock is not held by `owner`.
    pub fn release_lock(
        &self,
        id: i64,
        owner: &str,
        state: EntryState,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE ledger_entries
                 SET state = ?1, lock_owner = NULL, locked_at = NULL, updated_at = ?2
                 WHERE id = ?3 AND state = 'LOCKING' AND lock_owner = ?4",
                params![state.as_str(), now_ms(), id, owner],
            )?;
            if changed == 0 {
                let holder: Option<String> = tx
                    .query_row(
                        "SELECT lock_owner FROM ledger_entries WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?
                    .flatten();
                return Err(StoreError::Locked {
                    id,
                    owner: holder.unwrap_or_default(),
                });
            }
            Ok(())
        })
    }

    /// Release every lock held by `owner`, returning the rows to `PROPOSED`.
    /// Called on worker shutdown and by maintenance.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn release_locks_of(&self, owner: &str) -> Result<u32, StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE ledger_entries
                 SET state = 'PROPOSED', lock_owner = NULL, locked_at = NULL, updated_at = ?1
                 WHERE state = 'LOCKING' AND lock_owner = ?2",
                params![now_ms(), owner],
            )?;
            Ok(u32::try_from(changed).unwrap_or(u32::MAX))
        })
    }

    /// Recompute chain hashes over `[from_id, to_id]` and report the first
    /// break, if any. A detected break sets the refuse-appends latch.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan query fails.
    pub fn verify_chain(&self, from_id: i64, to_id: i64) -> Result<ChainReport, StoreError> {
        let report = self.with_conn(|conn| {
            let expected_prev: String = if from_id <= 1 {
                GENESIS_HASH.to_string()
            } else {
                conn.query_row(
                    "SELECT chain_hash FROM ledger_entries WHERE id < ?1
                     ORDER BY id DESC LIMIT 1",
                    params![from_id],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or_else(|| GENESIS_HASH.to_string())
            };

            let mut stmt = conn.prepare(
                "SELECT id, trace_id, amount, vendor, category, occurred_at, prev_hash, chain_hash
                 FROM ledger_entries WHERE id BETWEEN ?1 AND ?2 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![from_id, to_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?;

            let mut prev = expected_prev;
            let mut checked = 0u32;
            for row in rows {
                let (id, trace_id, amount, vendor, category, occurred_at, prev_hash, stored) =
                    row?;
                if prev_hash != prev {
                    return Ok(ChainReport::Broken { at: id });
                }
                let recomputed =
                    chain_hash(&prev_hash, &amount, &vendor, &category, &trace_id, occurred_at);
                if recomputed != stored {
                    return Ok(ChainReport::Broken { at: id });
                }
                prev = stored;
                checked += 1;
            }
            Ok(ChainReport::Intact { checked })
        })?;

        if let ChainReport::Broken { at } = report {
            tracing::error!(at, "chain verification failed; latching store");
            self.latch_chain_violation();
        }
        Ok(report)
    }

    /// Highest ledger row id, or 0 when the ledger is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn max_entry_id(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(id), 0) FROM ledger_entries",
                [],
                |row| row.get(0),
            )?)
        })
    }

    /// Logically revert a posted entry.
    ///
    /// Flips the original to `REVERTED` and appends a reversing entry whose
    /// payload mirrors the original with a sign-flipped amount and a
    /// back-reference in its inference log. Nothing is ever deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for a missing row and
    /// [`StoreError::SchemaViolation`] when the entry is not `POSTED`.
    pub fn mark_reverted(&self, id: i64, reason: &str) -> Result<i64, StoreError> {
        if self.chain_violation() {
            return Err(StoreError::ChainViolation);
        }

        let reversing_id = self.with_tx(|tx| {
            let original = tx
                .query_row(
                    &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = ?1"),
                    params![id],
                    map_entry,
                )
                .optional()?
                .ok_or(StoreError::NotFound {
                    entity: "entry",
                    key: id.to_string(),
                })?;
            if original.state != EntryState::Posted {
                return Err(StoreError::SchemaViolation {
                    message: format!("entry {id} is {} and cannot be reverted", original.state),
                });
            }

            let reversing = NewEntry {
                trace_id: format!("{}:rev", original.trace_id),
                amount: -original.amount,
                vendor: original.vendor.clone(),
                category: original.category.clone(),
                occurred_at: now_ms(),
                group_id: original.group_id.clone(),
                project_id: original.project_id.clone(),
                inference_log: InferenceLog {
                    engine: "revert".to_string(),
                    rule_id: None,
                    confidence: 1.0,
                    steps: vec![InferenceStep {
                        step: 1,
                        action: format!("reverses entry {id}"),
                        result: reason.to_string(),
                    }],
                },
                matched_rule: None,
                tenant_id: original.tenant_id.clone(),
            };

            let reversing_id = append_row(tx, &reversing, EntryState::Posted)?;
            tx.execute(
                "UPDATE ledger_entries
                 SET state = 'REVERTED', reverted_by = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![reversing_id, now_ms(), id],
            )?;
            Ok(reversing_id)
        })?;

        tracing::info!(id, reversing_id, "entry logically reverted");
        Ok(reversing_id)
    }

    /// Attach dimension tags to an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn tag_entry(&self, id: i64, tags: &[(String, String)]) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for (key, value) in tags {
                tx.execute(
                    "INSERT INTO entry_tags (entry_id, tag_key, tag_value) VALUES (?1, ?2, ?3)",
                    params![id, key, value],
                )?;
            }
            Ok(())
        })
    }
}
