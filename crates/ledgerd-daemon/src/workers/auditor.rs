//! Auditor worker: judges proposed entries under the advisory lock.
//!
//! For each `PROPOSED` entry: take the lock, rebuild the audit input from
//! the entry and the vendor's knowledge/history, run the deterministic
//! audit, then release the lock into the decided state. Knowledge feedback
//! flows through the bridge from here, not from the audit engine, so no
//! object cycle exists between the two.

use std::sync::Arc;

use ledgerd_core::audit::{AuditDecision, AuditInput, VendorHistory};
use ledgerd_core::config::LedgerConfig;
use ledgerd_core::model::{AuditLevel, EntryState, LedgerEntry, OutboxKind, now_ms};
use ledgerd_core::store::StoreError;
use ledgerd_core::trace::TraceContext;
use serde_json::json;
use tracing::{debug, info};

use super::Services;

/// Worker name.
pub const NAME: &str = "auditor";

/// Entries audited per tick.
const PAGE: u32 = 20;

/// One audit tick.
///
/// # Errors
///
/// Returns an error on store failure.
pub async fn tick(services: Arc<Services>, _config: Arc<LedgerConfig>) -> anyhow::Result<()> {
    let proposed = services.store.entries_in_state(EntryState::Proposed, PAGE)?;

    for entry in proposed {
        match services.store.lock_entry(entry.id, NAME) {
            Ok(()) => {}
            Err(StoreError::Locked { .. }) => {
                debug!(entry_id = entry.id, "entry locked elsewhere; skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        let input = build_input(&services, &entry)?;
        let verdict = services.auditor.audit(&input, now_ms());

        match verdict.decision {
            AuditDecision::Approved => {
                services
                    .store
                    .release_lock(entry.id, NAME, EntryState::Audited)?;
                let posted_state = if verdict.risky {
                    EntryState::Risk
                } else {
                    EntryState::Posted
                };
                services.store.set_entry_state(entry.id, posted_state)?;
                if let Some(rule_id) = entry.matched_rule {
                    services.bridge.record_hit(rule_id)?;
                }
                info!(
                    entry_id = entry.id,
                    state = %posted_state,
                    confidence = verdict.confidence,
                    "entry approved"
                );
            }
            AuditDecision::NeedsReview => {
                services
                    .store
                    .release_lock(entry.id, NAME, EntryState::Audited)?;
                let payload = json!({
                    "vendor": entry.vendor,
                    "amount": entry.amount.to_string(),
                    "category": entry.category,
                    "reasons": verdict.reasons,
                    "confidence": verdict.confidence,
                });
                services.hub.create_card(
                    OutboxKind::PushCard,
                    &payload,
                    "owner",
                    &format!("entry:{}", entry.id),
                    &TraceContext::resume(entry.trace_id.clone(), NAME),
                )?;
                info!(entry_id = entry.id, "entry sent to review");
            }
            AuditDecision::Rejected => {
                services
                    .store
                    .release_lock(entry.id, NAME, EntryState::Rejected)?;
                if let Some(rule_id) = input.matched_gray_rule {
                    services.bridge.record_reject(rule_id)?;
                }
                info!(
                    entry_id = entry.id,
                    reasons = ?verdict.reasons,
                    "entry rejected"
                );
            }
        }
    }

    Ok(())
}

/// Rebuild the audit input from the entry and the knowledge base.
fn build_input(services: &Services, entry: &LedgerEntry) -> Result<AuditInput, StoreError> {
    let vendor_rule = services.store.active_rule_for_keyword(&entry.vendor)?;
    let vendor_blocked = vendor_rule
        .as_ref()
        .is_some_and(|rule| rule.audit_level == AuditLevel::Blocked);

    let (rule_trusted, matched_gray_rule) = match entry.matched_rule {
        Some(rule_id) => match services.store.rule(rule_id) {
            Ok(rule) => (
                rule.audit_level.is_trusted(),
                (rule.audit_level == AuditLevel::Gray).then_some(rule_id),
            ),
            Err(StoreError::NotFound { .. }) => (false, None),
            Err(e) => return Err(e),
        },
        None => (false, None),
    };

    let history = services
        .store
        .entries_by_vendor(&entry.vendor, 50)?
        .into_iter()
        .filter(|prior| prior.id != entry.id)
        .map(|prior| (prior.category, prior.amount, prior.occurred_at))
        .collect();

    // Audit sees what the classifier saw: the recorded reasoning steps
    // (including the persisted source text) plus the vendor name.
    let text = entry
        .inference_log
        .steps
        .iter()
        .map(|step| step.result.as_str())
        .chain([entry.vendor.as_str()])
        .collect::<Vec<_>>()
        .join("\n");

    let confidence = entry.inference_log.confidence;
    Ok(AuditInput {
        text,
        vendor: entry.vendor.clone(),
        category: entry.category.clone(),
        category_label: String::new(),
        amount: entry.amount,
        proposal_confidence: confidence,
        rule_trusted,
        matched_gray_rule,
        requires_shadow_audit: matched_gray_rule.is_some() || confidence < 0.9,
        vendor_blocked,
        history: VendorHistory::new(history),
    })
}
