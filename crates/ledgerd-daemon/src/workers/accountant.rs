//! Accounting worker: pending documents in, proposed entries out.
//!
//! Each tick refreshes the rule snapshot, pulls a page of pending invoice
//! documents, runs OCR through the external seam, classifies, and appends a
//! `PROPOSED` entry. A duplicate trace (same receipt dropped twice) is
//! logged once and the document closed; a chain-violation latch leaves the
//! document pending for after recovery.

use std::sync::Arc;

use ledgerd_core::classify::DocumentInput;
use ledgerd_core::config::LedgerConfig;
use ledgerd_core::model::{
    DocumentKind, DocumentStatus, InferenceStep, NewEntry, now_ms,
};
use ledgerd_core::store::StoreError;
use ledgerd_core::trace::TraceContext;
use tracing::{error, info, warn};

use super::Services;

/// Worker name.
pub const NAME: &str = "accountant";

/// Documents classified per tick.
const PAGE: u32 = 20;

/// One classification tick.
///
/// # Errors
///
/// Returns an error on store failure; per-document failures are recorded
/// on the document row.
pub async fn tick(services: Arc<Services>, _config: Arc<LedgerConfig>) -> anyhow::Result<()> {
    services
        .agent
        .refresh_rules(services.bridge.active_rules()?);

    let documents = services.store.pending_documents(PAGE)?;
    for doc in documents {
        if doc.doc_kind != DocumentKind::InvoiceImage {
            continue;
        }

        let ocr = Arc::clone(&services.ocr);
        let path = doc.path.clone();
        let extracted = tokio::task::spawn_blocking(move || ocr.extract(&path)).await?;

        let extracted = match extracted {
            Ok(extracted) => extracted,
            Err(cause) => {
                warn!(doc_id = doc.doc_id, cause = %cause, "OCR failed");
                services.store.update_document(
                    doc.doc_id,
                    DocumentStatus::Failed,
                    Some(&cause),
                    None,
                )?;
                continue;
            }
        };

        let Some(amount) = extracted.amount else {
            services.store.update_document(
                doc.doc_id,
                DocumentStatus::Failed,
                Some("no amount recognised"),
                None,
            )?;
            continue;
        };

        let now = now_ms();
        let input = DocumentInput {
            trace: TraceContext::resume(doc.trace_id.clone(), NAME),
            text: extracted.text.clone(),
            vendor: extracted.vendor.clone(),
            amount,
            occurred_at: extracted.occurred_at.unwrap_or(now),
            group_id: doc.group_id.clone(),
        };
        let mut proposal = services.agent.classify(&input, now);

        // Persist the source text with the reasoning so audit red lines can
        // see what the proposal was derived from.
        let step = u32::try_from(proposal.inference_log.steps.len()).unwrap_or(0) + 1;
        proposal.inference_log.steps.push(InferenceStep {
            step,
            action: "source_text".to_string(),
            result: extracted.text.chars().take(240).collect(),
        });

        let entry = NewEntry {
            trace_id: doc.trace_id.clone(),
            amount,
            vendor: extracted.vendor.clone(),
            category: proposal.category.clone(),
            occurred_at: input.occurred_at,
            group_id: doc.group_id.clone(),
            project_id: None,
            inference_log: proposal.inference_log.clone(),
            matched_rule: proposal.matched_rule,
            tenant_id: None,
        };

        match services.store.append_entry(&entry) {
            Ok(entry_id) => {
                if proposal.requires_shadow_audit {
                    services
                        .store
                        .tag_entry(entry_id, &[("audit_priority".to_string(), "HIGH".to_string())])?;
                }
                services
                    .store
                    .update_document(doc.doc_id, DocumentStatus::Parsed, None, None)?;
                info!(
                    entry_id,
                    doc_id = doc.doc_id,
                    category = %proposal.category,
                    confidence = proposal.confidence,
                    "entry proposed"
                );
            }
            Err(StoreError::DuplicateTrace { existing_id, .. }) => {
                warn!(
                    doc_id = doc.doc_id,
                    existing_id,
                    "duplicate trace; document already ledgered"
                );
                services
                    .store
                    .update_document(doc.doc_id, DocumentStatus::Parsed, None, None)?;
            }
            Err(e @ (StoreError::ChainViolation | StoreError::ChainMismatch { .. })) => {
                error!(doc_id = doc.doc_id, error = %e, "appends refused; leaving document pending");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
