//! Collector: files in, records out.
//!
//! Each ingested file flows through magic-number/extension consistency,
//! content-hash dedup, encoding detection, header sniff, and a streaming
//! parse. Every step fails soft: a bad file is recorded `FAILED` with its
//! cause and never stalls the worker. Statements become pending entries;
//! invoice images become source documents awaiting OCR and classification.

mod encoding;
mod grouping;
mod normalize;
mod parsers;

pub use encoding::{DetectedEncoding, decode};
pub use grouping::{GroupCandidate, assign_groups};
pub use normalize::{parse_amount, parse_timestamp};
pub use parsers::{
    AlipayParser, GenericBankParser, ParsedFlow, ParserRegistry, StatementParser, WechatParser,
    parse_statement,
};

use std::path::Path;

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::model::{DocumentKind, DocumentStatus};
use crate::store::{Store, StoreError};
use crate::trace::TraceContext;

/// OCR seam for invoice images. The concrete pipeline is an external
/// collaborator; the core only consumes its structured output.
pub trait OcrEngine: Send + Sync {
    /// Extract structured fields from an invoice image.
    ///
    /// # Errors
    ///
    /// Returns a human-readable cause on failure; the document is marked
    /// `FAILED` with it.
    fn extract(&self, path: &Path) -> Result<OcrResult, String>;
}

/// Structured output of the OCR pipeline.
#[derive(Debug, Clone)]
pub struct OcrResult {
    /// Full recognised text.
    pub text: String,
    /// Extracted vendor, if found.
    pub vendor: String,
    /// Extracted amount, if found.
    pub amount: Option<Decimal>,
    /// Extracted document date, if found.
    pub occurred_at: Option<i64>,
}

/// Outcome of ingesting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A statement was parsed into pending entries.
    Statement {
        /// The document row.
        doc_id: i64,
        /// Rows written.
        rows: u32,
        /// Rows skipped by the parser.
        skipped: u32,
    },
    /// An invoice image was recorded for classification.
    Document {
        /// The document row.
        doc_id: i64,
    },
    /// The file failed a pipeline step; recorded with its cause.
    Failed {
        /// The document row.
        doc_id: i64,
        /// Why.
        cause: String,
    },
    /// Content hash already ingested.
    Duplicate {
        /// The earlier document row.
        existing_doc_id: i64,
    },
}

/// Full SHA-256 of the file contents.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// File kind detection by extension plus magic number.
///
/// Returns the detected kind, or an inconsistency description when the
/// extension promises one thing and the leading bytes another.
fn detect_kind(path: &Path, bytes: &[u8]) -> Result<DocumentKind, String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let magic_image = bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(&[0x89, b'P', b'N', b'G'])
        || bytes.starts_with(b"%PDF");
    let magic_zip = bytes.starts_with(&[0x50, 0x4B, 0x03, 0x04]);

    match extension.as_str() {
        "jpg" | "jpeg" | "png" | "pdf" => {
            if magic_image {
                Ok(DocumentKind::InvoiceImage)
            } else {
                Err(format!("extension .{extension} but magic number disagrees"))
            }
        }
        "csv" => {
            if magic_image || magic_zip {
                Err("extension .csv but binary magic number".to_string())
            } else {
                Ok(DocumentKind::Statement)
            }
        }
        "xlsx" => {
            if magic_zip {
                // Recognised so it is never silently lost; decoding waits
                // for a workbook parser to be registered.
                Ok(DocumentKind::Other)
            } else {
                Err("extension .xlsx but magic number disagrees".to_string())
            }
        }
        other => Err(format!("unsupported extension .{other}")),
    }
}

/// Ingest one file's bytes.
///
/// Dedup is by full content hash; the same receipt dropped twice yields
/// exactly one document. All failures are recorded on the document row and
/// surfaced as [`IngestOutcome::Failed`], never as an error, so the caller
/// loop survives any single bad file.
///
/// # Errors
///
/// Returns an error only on store failures.
pub fn ingest_file(
    store: &Store,
    registry: &ParserRegistry,
    path: &Path,
    bytes: &[u8],
) -> Result<IngestOutcome, StoreError> {
    let hash = content_hash(bytes);
    let trace = TraceContext::new("collector");

    let kind = match detect_kind(path, bytes) {
        Ok(kind) => kind,
        Err(cause) => {
            let doc_id =
                match store.add_document(path, &hash, DocumentKind::Other, &trace.trace_id) {
                    Ok(doc_id) => doc_id,
                    Err(StoreError::DuplicateTrace { existing_id, .. }) => {
                        return Ok(IngestOutcome::Duplicate {
                            existing_doc_id: existing_id,
                        });
                    }
                    Err(e) => return Err(e),
                };
            store.update_document(doc_id, DocumentStatus::Failed, Some(&cause), None)?;
            tracing::warn!(path = %path.display(), cause = %cause, "file failed ingestion");
            return Ok(IngestOutcome::Failed { doc_id, cause });
        }
    };

    let doc_id = match store.add_document(path, &hash, kind, &trace.trace_id) {
        Ok(doc_id) => doc_id,
        Err(StoreError::DuplicateTrace { existing_id, .. }) => {
            tracing::info!(
                path = %path.display(),
                existing_doc_id = existing_id,
                "duplicate content hash; skipping"
            );
            return Ok(IngestOutcome::Duplicate {
                existing_doc_id: existing_id,
            });
        }
        Err(e) => return Err(e),
    };

    match kind {
        DocumentKind::Statement => {
            let (text, detected) = decode(bytes);
            tracing::debug!(path = %path.display(), encoding = detected.as_str(), "statement decoded");

            let mut rows = 0u32;
            let mut write_error = None;
            let parsed = parse_statement(registry, &text, |flow| {
                if write_error.is_some() {
                    return;
                }
                match store.add_pending_entry(
                    flow.source,
                    &flow.counterparty,
                    flow.amount,
                    flow.occurred_at,
                    &flow.description,
                ) {
                    Ok(_) => rows += 1,
                    Err(e) => write_error = Some(e),
                }
            });
            if let Some(e) = write_error {
                return Err(e);
            }

            match parsed {
                Some((parser, skipped)) => {
                    store.update_document(doc_id, DocumentStatus::Parsed, None, None)?;
                    tracing::info!(
                        path = %path.display(),
                        parser,
                        rows,
                        skipped,
                        "statement ingested"
                    );
                    Ok(IngestOutcome::Statement {
                        doc_id,
                        rows,
                        skipped,
                    })
                }
                None => {
                    let cause = "no registered parser recognises the header row".to_string();
                    store.update_document(doc_id, DocumentStatus::Failed, Some(&cause), None)?;
                    Ok(IngestOutcome::Failed { doc_id, cause })
                }
            }
        }
        DocumentKind::InvoiceImage => Ok(IngestOutcome::Document { doc_id }),
        DocumentKind::Other => {
            let cause = "no decoder registered for this format".to_string();
            store.update_document(doc_id, DocumentStatus::Failed, Some(&cause), None)?;
            Ok(IngestOutcome::Failed { doc_id, cause })
        }
    }
}
