//! Match worker: reconciliation batches, the evidence hunter, and the
//! periodic chain integrity check.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use ledgerd_core::config::LedgerConfig;
use ledgerd_core::model::{OutboxKind, now_ms};
use ledgerd_core::store::ChainReport;
use ledgerd_core::trace::TraceContext;
use serde_json::json;
use tracing::{info, warn};

use super::Services;

/// Worker name.
pub const NAME: &str = "matcher";

/// Cadence of the proactive evidence hunter.
const HUNT_EVERY_MS: i64 = 4 * 3_600_000;

/// Cadence of the sampled chain verification.
const VERIFY_EVERY_MS: i64 = 3_600_000;

/// Cross-tick cadence state.
#[derive(Debug, Default)]
pub struct MatcherState {
    last_hunt_ms: AtomicI64,
    last_verify_ms: AtomicI64,
}

/// One reconciliation tick.
///
/// # Errors
///
/// Returns an error on store failure.
pub async fn tick(
    services: Arc<Services>,
    config: Arc<LedgerConfig>,
    state: Arc<MatcherState>,
) -> anyhow::Result<()> {
    let now = now_ms();
    let report = services.engine.run_batch(0)?;

    if !report.matched.is_empty() && !config.matching.auto_post {
        let ids: Vec<String> = report
            .matched
            .iter()
            .map(|pair| pair.pending_id.to_string())
            .collect();
        let payload = json!({
            "count": report.matched.len(),
            "pairs": report
                .matched
                .iter()
                .map(|pair| json!({
                    "pending_id": pair.pending_id,
                    "entry_id": pair.entry_id,
                    "score": pair.score,
                }))
                .collect::<Vec<_>>(),
        });
        services.hub.create_card(
            OutboxKind::BatchConfirm,
            &payload,
            "owner",
            &format!("batch:{}", ids.join(",")),
            &TraceContext::new(NAME),
        )?;
        info!(pairs = report.matched.len(), "batch confirmation card raised");
    }

    if !report.suggestions.is_empty() {
        let payload = json!({
            "count": report.suggestions.len(),
            "candidates": report
                .suggestions
                .iter()
                .map(|pair| json!({
                    "pending_id": pair.pending_id,
                    "entry_id": pair.entry_id,
                    "score": pair.score,
                }))
                .collect::<Vec<_>>(),
        });
        services.hub.create_card(
            OutboxKind::PushCard,
            &payload,
            "owner",
            "batch:candidates",
            &TraceContext::new(NAME),
        )?;
    }

    // Proactive evidence hunter over stale unmatched flows.
    if now - state.last_hunt_ms.load(Ordering::Relaxed) >= HUNT_EVERY_MS {
        state.last_hunt_ms.store(now, Ordering::Relaxed);
        let mut requested = 0;
        for pending in services.engine.stale_flows(now)? {
            if services.hub.push_evidence_request(&pending)? {
                requested += 1;
            }
        }
        if requested > 0 {
            warn!(requested, "evidence requests raised for stale flows");
        }
    }

    // Sampled chain verification over a sliding tail window.
    if now - state.last_verify_ms.load(Ordering::Relaxed) >= VERIFY_EVERY_MS {
        state.last_verify_ms.store(now, Ordering::Relaxed);
        let max_id = services.store.max_entry_id()?;
        if max_id > 0 {
            let from = (max_id - i64::from(config.daemon.verify_window)).max(1);
            match services.store.verify_chain(from, max_id)? {
                ChainReport::Intact { checked } => {
                    info!(checked, "sampled chain verification passed");
                }
                ChainReport::Broken { at } => {
                    services.hub.push_critical_alert(
                        "CHAIN_BREAK",
                        &format!("chain verification failed at entry {at}"),
                    )?;
                }
            }
        }
    }

    Ok(())
}
