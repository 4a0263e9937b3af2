//! Physical snapshots of the store and rollback.
//!
//! A snapshot is an atomic copy of the store file taken after flushing the
//! WAL: the copy is produced with `VACUUM INTO` against a temporary name and
//! then renamed into place, so a crash can never leave a half-written
//! snapshot behind. Rollback replaces the live file and reopens the
//! connection under the exclusive store lock.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use super::{Store, StoreError};
use crate::model::{Snapshot, now_ms};

impl Store {
    /// Take a snapshot into `snapshot_dir`, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Snapshot`] when the copy fails; the live store
    /// is unaffected in that case.
    pub fn snapshot(
        &self,
        snapshot_dir: &Path,
        description: &str,
    ) -> Result<String, StoreError> {
        std::fs::create_dir_all(snapshot_dir).map_err(|e| StoreError::Snapshot {
            message: format!("cannot create snapshot directory: {e}"),
        })?;

        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let final_path = snapshot_dir.join(format!("snapshot-{snapshot_id}-{now}"));
        let temp_path = snapshot_dir.join(format!(".snapshot-{snapshot_id}.tmp"));

        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
            conn.execute(
                "VACUUM INTO ?1",
                params![temp_path.to_string_lossy()],
            )?;
            Ok(())
        })
        .map_err(|e| StoreError::Snapshot {
            message: format!("vacuum into failed: {e}"),
        })?;

        std::fs::rename(&temp_path, &final_path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            StoreError::Snapshot {
                message: format!("rename failed: {e}"),
            }
        })?;

        let size_bytes = std::fs::metadata(&final_path)
            .map(|m| m.len())
            .unwrap_or(0);

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO snapshots (snapshot_id, created_at, description, size_bytes, path)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    snapshot_id,
                    now,
                    description,
                    i64::try_from(size_bytes).unwrap_or(i64::MAX),
                    final_path.to_string_lossy(),
                ],
            )?;
            Ok(())
        })?;

        tracing::info!(snapshot_id = %snapshot_id, size_bytes, "snapshot created");
        Ok(snapshot_id)
    }

    /// Metadata of a recorded snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id is unknown.
    pub fn snapshot_meta(&self, snapshot_id: &str) -> Result<Snapshot, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT snapshot_id, created_at, description, size_bytes, path
                 FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id],
                |row| {
                    let path: String = row.get(4)?;
                    let size: i64 = row.get(3)?;
                    Ok(Snapshot {
                        snapshot_id: row.get(0)?,
                        created_at: row.get(1)?,
                        description: row.get(2)?,
                        size_bytes: u64::try_from(size).unwrap_or(0),
                        path: path.into(),
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "snapshot",
                key: snapshot_id.to_string(),
            })
        })
    }

    /// Replace the live store with a snapshot.
    ///
    /// Holds the connection lock for the whole swap, so no other store call
    /// can interleave. The previous connection is dropped, the snapshot file
    /// is copied over the live path (WAL/SHM residues removed), and a fresh
    /// connection is opened. Clears the chain-violation latch on success.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Snapshot`] if the swap fails. The store may be
    /// unusable afterwards if the copy succeeded but the reopen failed.
    pub fn rollback_to(&self, snapshot_id: &str) -> Result<(), StoreError> {
        let meta = self.snapshot_meta(snapshot_id)?;
        if !meta.path.exists() {
            return Err(StoreError::Snapshot {
                message: format!("snapshot file {} is missing", meta.path.display()),
            });
        }

        let mut guard = self.inner.conn.lock().map_err(|_| StoreError::Poisoned)?;
        guard
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")
            .map_err(StoreError::from)?;

        let live = self.inner.path.clone();
        let staged = live.with_extension("rollback.tmp");
        std::fs::copy(&meta.path, &staged).map_err(|e| StoreError::Snapshot {
            message: format!("staging copy failed: {e}"),
        })?;
        std::fs::rename(&staged, &live).map_err(|e| {
            let _ = std::fs::remove_file(&staged);
            StoreError::Snapshot {
                message: format!("rename over live store failed: {e}"),
            }
        })?;
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = live.as_os_str().to_owned();
            sidecar.push(suffix);
            let _ = std::fs::remove_file(std::path::PathBuf::from(sidecar));
        }

        let conn = Connection::open(&live)?;
        Self::apply_pragmas(&conn, &self.inner.config)?;
        super::schema::init_schema(&conn)?;
        *guard = conn;
        drop(guard);

        self.clear_chain_violation();
        tracing::warn!(snapshot_id = %snapshot_id, "store rolled back to snapshot");
        Ok(())
    }
}
