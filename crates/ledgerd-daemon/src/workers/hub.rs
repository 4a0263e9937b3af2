//! Hub worker: outbox dispatch and card expiry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ledgerd_core::config::LedgerConfig;
use ledgerd_core::model::now_ms;
use tracing::{debug, warn};

use super::Services;

/// Worker name.
pub const NAME: &str = "interaction-hub";

/// Events dispatched per tick.
const BATCH: u32 = 50;

/// Cross-tick alarm latch so a sustained backlog alerts once, not every
/// poll.
#[derive(Debug, Default)]
pub struct HubState {
    backlog_alarmed: AtomicBool,
}

/// One dispatch tick.
///
/// # Errors
///
/// Returns an error on store failure.
pub async fn tick(
    services: Arc<Services>,
    _config: Arc<LedgerConfig>,
    state: Arc<HubState>,
) -> anyhow::Result<()> {
    let now = now_ms();

    let expired = services.store.expire_cards(now)?;
    if expired > 0 {
        debug!(expired, "cards expired");
    }

    let report = services.dispatcher.process_due(now, BATCH)?;
    if report.delivered + report.retried + report.failed > 0 {
        debug!(
            delivered = report.delivered,
            retried = report.retried,
            failed = report.failed,
            backlog = report.backlog,
            "outbox pass"
        );
    }

    if report.backlog_alarm {
        if !state.backlog_alarmed.swap(true, Ordering::SeqCst) {
            warn!(backlog = report.backlog, "outbox backlog above threshold");
            services.hub.push_critical_alert(
                "OUTBOX_BACKLOG",
                &format!("{} undelivered events", report.backlog),
            )?;
        }
    } else {
        state.backlog_alarmed.store(false, Ordering::SeqCst);
    }

    Ok(())
}
