//! Persistence and integrity layer.
//!
//! Single source of truth for all durable state, backed by `SQLite`. All
//! writes are transactional; concurrent writers are serialized by the
//! connection lock and, across processes, by a busy-retry loop with
//! exponential backoff plus random jitter.
//!
//! The ledger table is tamper-evident: every row carries
//! `chain_hash = SHA-256(prev_hash | amount | vendor | category | trace_id |
//! occurred_at)`, rows in a terminal state are frozen by triggers, and a
//! detected chain break latches the store into a refuse-appends state until a
//! snapshot is rolled back or an operator override clears it.

mod entries;
mod heartbeat;
mod outbox;
mod rules;
mod schema;
mod shadow;
mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rusqlite::{Connection, TransactionBehavior};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::config::StoreConfig;

/// Chain hash of the (absent) predecessor of the first row.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store stayed busy past the retry budget.
    #[error("store busy after {attempts} attempts")]
    Busy {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// A row with this trace id already exists.
    ///
    /// Surfaced idempotently: the caller receives the id of the prior row.
    #[error("duplicate trace id {trace_id} (existing entry {existing_id})")]
    DuplicateTrace {
        /// The offending trace id.
        trace_id: String,
        /// Id of the previously inserted entry.
        existing_id: i64,
    },

    /// The committed chain head no longer verifies against its own fields.
    #[error("chain head mismatch at entry {at}")]
    ChainMismatch {
        /// Row at which the mismatch was observed.
        at: i64,
    },

    /// The store is latched after a detected chain break.
    #[error("chain integrity violation latched; appends are refused")]
    ChainViolation,

    /// An advisory entry lock is held by a live owner.
    #[error("entry {id} is locked by {owner}")]
    Locked {
        /// The locked entry.
        id: i64,
        /// Current lock owner.
        owner: String,
    },

    /// A storage-layer constraint rejected the write.
    #[error("schema violation: {message}")]
    SchemaViolation {
        /// Constraint description.
        message: String,
    },

    /// The requested row does not exist.
    #[error("{entity} {key} not found")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Lookup key.
        key: String,
    },

    /// Snapshot creation or restore failed.
    #[error("snapshot operation failed: {message}")]
    Snapshot {
        /// Failure description.
        message: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt column {column}: {message}")]
    Corrupt {
        /// Offending column.
        column: &'static str,
        /// Decode failure description.
        message: String,
    },

    /// Connection lock was poisoned by a panicking writer.
    #[error("store connection lock poisoned")]
    Poisoned,

    /// Any other `SQLite` failure.
    #[error("sqlite error")]
    Sqlite(#[from] rusqlite::Error),
}

struct StoreInner {
    conn: Mutex<Connection>,
    path: PathBuf,
    config: StoreConfig,
    /// Latched on the first detected chain break; cleared only by rollback
    /// or an explicit operator override.
    chain_violation: AtomicBool,
    /// Busy retries performed since open; exposed for tests and metrics.
    busy_retries: AtomicU64,
}

/// Handle to the embedded transactional store. Cheap to clone; all clones
/// share one serialized connection.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .field("chain_violation", &self.chain_violation())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if needed) the store at `path` and initialize the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be
    /// applied.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Snapshot {
                    message: format!("cannot create store directory: {e}"),
                })?;
            }
        }

        let conn = Connection::open(path.as_ref())?;
        Self::apply_pragmas(&conn, config)?;
        schema::init_schema(&conn)?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                path: path.as_ref().to_path_buf(),
                config: config.clone(),
                chain_violation: AtomicBool::new(false),
                busy_retries: AtomicU64::new(0),
            }),
        })
    }

    fn apply_pragmas(conn: &Connection, config: &StoreConfig) -> Result<(), StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", config.sync_mode.as_pragma())?;
        conn.pragma_update(None, "busy_timeout", i64::try_from(config.busy_timeout_ms).unwrap_or(5_000))?;
        #[allow(clippy::cast_possible_wrap)]
        conn.pragma_update(None, "cache_size", -((config.cache_mb * 1024) as i64))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    /// Path of the live store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether the refuse-appends latch is set.
    #[must_use]
    pub fn chain_violation(&self) -> bool {
        self.inner.chain_violation.load(Ordering::SeqCst)
    }

    /// Explicit operator override clearing the refuse-appends latch.
    pub fn clear_chain_violation(&self) {
        tracing::warn!("chain violation latch cleared by operator override");
        self.inner.chain_violation.store(false, Ordering::SeqCst);
    }

    pub(crate) fn latch_chain_violation(&self) {
        self.inner.chain_violation.store(true, Ordering::SeqCst);
    }

    /// Busy retries performed since open.
    #[must_use]
    pub fn busy_retry_count(&self) -> u64 {
        self.inner.busy_retries.load(Ordering::Relaxed)
    }

    /// Run `f` on the raw connection, without a transaction.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.inner.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction, retrying on a busy store
    /// with exponential backoff plus random jitter.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl Fn(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let retries = self.inner.config.retry_count;
        let base = self.inner.config.retry_base_ms;

        for attempt in 0..=retries {
            let mut conn = self.inner.conn.lock().map_err(|_| StoreError::Poisoned)?;
            let result = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StoreError::from)
                .and_then(|tx| {
                    let value = f(&tx)?;
                    tx.commit()?;
                    Ok(value)
                });
            drop(conn);

            match result {
                Err(StoreError::Sqlite(e)) if is_busy(&e) && attempt < retries => {
                    self.inner.busy_retries.fetch_add(1, Ordering::Relaxed);
                    let jitter = rand::thread_rng().gen_range(0..=base);
                    let delay = base.saturating_mul(1 << attempt.min(10)) + jitter;
                    tracing::debug!(attempt, delay_ms = delay, "store busy, backing off");
                    std::thread::sleep(Duration::from_millis(delay));
                }
                Err(StoreError::Sqlite(e)) if is_busy(&e) => {
                    return Err(StoreError::Busy {
                        attempts: retries + 1,
                    });
                }
                other => return other.map_err(map_constraint),
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }

    pub(crate) fn lock_timeout_ms(&self) -> i64 {
        i64::try_from(self.inner.config.lock_timeout_s).unwrap_or(300) * 1_000
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Rewrite trigger aborts into the integrity error they stand for.
fn map_constraint(e: StoreError) -> StoreError {
    if let StoreError::Sqlite(inner) = &e {
        let message = inner.to_string();
        if message.contains("ledger row is immutable") {
            return StoreError::SchemaViolation {
                message: "attempted mutation of an immutable ledger row".to_string(),
            };
        }
    }
    e
}

/// Canonical string form of an amount, used both for storage and for chain
/// hashing. Round-trips exactly through `Decimal::from_str`.
#[must_use]
pub fn canonical_amount(amount: Decimal) -> String {
    amount.round_dp(2).normalize().to_string()
}

/// Compute the chain hash of one row.
#[must_use]
pub fn chain_hash(
    prev_hash: &str,
    amount: &str,
    vendor: &str,
    category: &str,
    trace_id: &str,
    occurred_at: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(amount.as_bytes());
    hasher.update(b"|");
    hasher.update(vendor.as_bytes());
    hasher.update(b"|");
    hasher.update(category.as_bytes());
    hasher.update(b"|");
    hasher.update(trace_id.as_bytes());
    hasher.update(b"|");
    hasher.update(occurred_at.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub use entries::ChainReport;
pub use heartbeat::LedgerStats;
