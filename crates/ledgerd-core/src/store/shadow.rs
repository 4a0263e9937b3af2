//! Shadow rows: pending bank/payment entries and ingested source documents.

use std::path::Path;
use std::str::FromStr;

use rusqlite::{OptionalExtension, Row, params};
use rust_decimal::Decimal;

use super::{Store, StoreError, canonical_amount};
use crate::model::{
    DocumentKind, DocumentStatus, FlowSource, PendingEntry, PendingStatus, SourceDocument, now_ms,
};

fn map_pending(row: &Row<'_>) -> rusqlite::Result<PendingEntry> {
    let source: String = row.get("source")?;
    let amount: String = row.get("amount")?;
    let status: String = row.get("status")?;
    Ok(PendingEntry {
        id: row.get("id")?,
        source: FlowSource::parse(&source).unwrap_or(FlowSource::Bank),
        counterparty: row.get("counterparty")?,
        amount: Decimal::from_str(&amount).unwrap_or_default(),
        occurred_at: row.get("occurred_at")?,
        description: row.get("description")?,
        status: PendingStatus::parse(&status).unwrap_or(PendingStatus::Unreconciled),
        matched_ledger_id: row.get("matched_ledger_id")?,
        tenant_id: row.get("tenant_id")?,
        inserted_at: row.get("inserted_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn map_document(row: &Row<'_>) -> rusqlite::Result<SourceDocument> {
    let kind: String = row.get("doc_kind")?;
    let status: String = row.get("status")?;
    let path: String = row.get("path")?;
    Ok(SourceDocument {
        doc_id: row.get("doc_id")?,
        path: path.into(),
        content_hash: row.get("content_hash")?,
        doc_kind: DocumentKind::parse(&kind).unwrap_or(DocumentKind::Other),
        status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Pending),
        failure_cause: row.get("failure_cause")?,
        group_id: row.get("group_id")?,
        trace_id: row.get("trace_id")?,
        inserted_at: row.get("inserted_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const PENDING_COLUMNS: &str = "id, source, counterparty, amount, occurred_at, description, \
     status, matched_ledger_id, tenant_id, inserted_at, updated_at";

const DOCUMENT_COLUMNS: &str = "doc_id, path, content_hash, doc_kind, status, failure_cause, \
     group_id, trace_id, inserted_at, updated_at";

impl Store {
    /// Insert a pending entry parsed from a statement line.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn add_pending_entry(
        &self,
        source: FlowSource,
        counterparty: &str,
        amount: Decimal,
        occurred_at: i64,
        description: &str,
    ) -> Result<i64, StoreError> {
        self.with_tx(|tx| {
            let now = now_ms();
            tx.execute(
                "INSERT INTO pending_entries
                   (source, counterparty, amount, occurred_at, description, status,
                    inserted_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'UNRECONCILED', ?6, ?6)",
                params![
                    source.as_str(),
                    counterparty,
                    canonical_amount(amount),
                    occurred_at,
                    description,
                    now,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Fetch a pending entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such row exists.
    pub fn pending_entry(&self, id: i64) -> Result<PendingEntry, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {PENDING_COLUMNS} FROM pending_entries WHERE id = ?1"),
                params![id],
                map_pending,
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "pending entry",
                key: id.to_string(),
            })
        })
    }

    /// Page of pending entries in a status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending_entries_page(
        &self,
        status: PendingStatus,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PENDING_COLUMNS} FROM pending_entries WHERE status = ?1
                 ORDER BY id ASC LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(params![status.as_str(), limit, offset], map_pending)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Unreconciled entries older than `cutoff_ms`, for the evidence hunter.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn stale_unreconciled(&self, cutoff_ms: i64) -> Result<Vec<PendingEntry>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PENDING_COLUMNS} FROM pending_entries
                 WHERE status = 'UNRECONCILED' AND inserted_at < ?1
                 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![cutoff_ms], map_pending)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Record a match decision on a pending entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such row exists.
    pub fn set_pending_status(
        &self,
        id: i64,
        status: PendingStatus,
        matched_ledger_id: Option<i64>,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE pending_entries
                 SET status = ?1, matched_ledger_id = COALESCE(?2, matched_ledger_id),
                     updated_at = ?3
                 WHERE id = ?4",
                params![status.as_str(), matched_ledger_id, now_ms(), id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "pending entry",
                    key: id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Confirm a batch of matched pending entries in one transaction.
    ///
    /// Each listed pending entry in `MATCHED` flips to `RECONCILED`; its
    /// linked ledger entry, when still `AUDITED`, is promoted to `POSTED`.
    /// Rows not in `MATCHED` are skipped. Returns how many were confirmed.
    ///
    /// # Errors
    ///
    /// Returns an error if any update fails; the whole batch rolls back.
    pub fn batch_confirm(&self, pending_ids: &[i64]) -> Result<u32, StoreError> {
        self.with_tx(|tx| {
            let now = now_ms();
            let mut confirmed = 0;
            for &id in pending_ids {
                let row: Option<(String, Option<i64>)> = tx
                    .query_row(
                        "SELECT status, matched_ledger_id FROM pending_entries WHERE id = ?1",
                        params![id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((status, matched_ledger_id)) = row else {
                    continue;
                };
                if status != "MATCHED" {
                    continue;
                }

                tx.execute(
                    "UPDATE pending_entries SET status = 'RECONCILED', updated_at = ?1
                     WHERE id = ?2",
                    params![now, id],
                )?;
                if let Some(ledger_id) = matched_ledger_id {
                    tx.execute(
                        "UPDATE ledger_entries SET state = 'POSTED', updated_at = ?1
                         WHERE id = ?2 AND state = 'AUDITED'",
                        params![now, ledger_id],
                    )?;
                }
                confirmed += 1;
            }
            Ok(confirmed)
        })
    }

    /// Record an ingested file. Duplicate content hashes are surfaced with
    /// the existing document id so ingestion stays idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateTrace`] when the content hash is
    /// already present.
    pub fn add_document(
        &self,
        path: &Path,
        content_hash: &str,
        doc_kind: DocumentKind,
        trace_id: &str,
    ) -> Result<i64, StoreError> {
        self.with_tx(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT doc_id FROM source_documents WHERE content_hash = ?1",
                    params![content_hash],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing_id) = existing {
                return Err(StoreError::DuplicateTrace {
                    trace_id: trace_id.to_string(),
                    existing_id,
                });
            }

            let now = now_ms();
            tx.execute(
                "INSERT INTO source_documents
                   (path, content_hash, doc_kind, status, trace_id, inserted_at, updated_at)
                 VALUES (?1, ?2, ?3, 'PENDING', ?4, ?5, ?5)",
                params![
                    path.to_string_lossy(),
                    content_hash,
                    doc_kind.as_str(),
                    trace_id,
                    now,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Fetch a document by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such row exists.
    pub fn document(&self, doc_id: i64) -> Result<SourceDocument, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM source_documents WHERE doc_id = ?1"),
                params![doc_id],
                map_document,
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "document",
                key: doc_id.to_string(),
            })
        })
    }

    /// Documents awaiting classification, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending_documents(&self, limit: u32) -> Result<Vec<SourceDocument>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM source_documents WHERE status = 'PENDING'
                 ORDER BY doc_id ASC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], map_document)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Mark a document parsed, failed, or grouped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such row exists.
    pub fn update_document(
        &self,
        doc_id: i64,
        status: DocumentStatus,
        failure_cause: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE source_documents
                 SET status = ?1,
                     failure_cause = ?2,
                     group_id = COALESCE(?3, group_id),
                     updated_at = ?4
                 WHERE doc_id = ?5",
                params![status.as_str(), failure_cause, group_id, now_ms(), doc_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "document",
                    key: doc_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Fetch a document by its content hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn document_by_hash(&self, content_hash: &str) -> Result<Option<SourceDocument>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {DOCUMENT_COLUMNS} FROM source_documents WHERE content_hash = ?1"
                    ),
                    params![content_hash],
                    map_document,
                )
                .optional()?)
        })
    }

    /// Assign a multimodal group to a document without touching its status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such row exists.
    pub fn set_document_group(&self, doc_id: i64, group_id: &str) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE source_documents SET group_id = ?1, updated_at = ?2 WHERE doc_id = ?3",
                params![group_id, now_ms(), doc_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "document",
                    key: doc_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Whether a file with this content hash was already ingested.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn document_seen(&self, content_hash: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT doc_id FROM source_documents WHERE content_hash = ?1",
                    params![content_hash],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }
}
