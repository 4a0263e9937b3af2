//! Outbox dispatch.
//!
//! At-least-once delivery of outbound notifications: a polling worker
//! claims due `PENDING` events, renders the platform JSON envelope,
//! dispatches through the channel seam, and acknowledges. Failures
//! reschedule with exponential backoff plus jitter until the retry budget
//! is spent; depth past the threshold raises a self-monitoring alert.

use std::sync::Arc;

use rand::Rng;
use serde_json::{Value, json};

use crate::config::EgressConfig;
use crate::model::{OutboxEvent, OutboxKind, OutboxStatus};
use crate::store::{Store, StoreError};

/// Delivery seam toward the review channel. Platform connectors implement
/// this outside the core.
pub trait CardChannel: Send + Sync {
    /// Deliver one rendered envelope.
    ///
    /// # Errors
    ///
    /// Returns a human-readable cause on failure; the event is retried.
    fn dispatch(&self, envelope: &Value) -> Result<(), String>;
}

/// Render the platform envelope for an event.
///
/// Shape: `{kind, title, body, fields?, buttons, metadata}` with buttons
/// derived from the event kind.
#[must_use]
pub fn render_envelope(event: &OutboxEvent) -> Value {
    let (title, buttons) = match event.kind {
        OutboxKind::PushCard => (
            "Entry awaiting review",
            vec![
                json!({"action": "CONFIRM", "value": "approve"}),
                json!({"action": "REJECT", "value": "refuse"}),
            ],
        ),
        OutboxKind::EvidenceRequest => (
            "Missing document for a bank flow",
            vec![json!({"action": "CLICK", "value": "upload"})],
        ),
        OutboxKind::BatchConfirm => (
            "Reconciliation batch ready",
            vec![json!({"action": "BATCH_CONFIRM", "value": "confirm all"})],
        ),
        OutboxKind::CriticalAlert => ("Operator attention required", Vec::new()),
    };

    json!({
        "kind": event.kind.as_str(),
        "title": title,
        "body": event.payload,
        "buttons": buttons,
        "metadata": {
            "event_id": event.event_id,
            "attempt": event.attempts + 1,
        },
    })
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Events acknowledged this pass.
    pub delivered: u32,
    /// Events rescheduled for retry.
    pub retried: u32,
    /// Events that spent their retry budget.
    pub failed: u32,
    /// Undelivered events after the pass.
    pub backlog: u32,
    /// Whether the backlog crossed the alert threshold.
    pub backlog_alarm: bool,
}

/// The polling dispatcher.
pub struct OutboxDispatcher {
    store: Store,
    channel: Arc<dyn CardChannel>,
    max_retries: u32,
    backoff_base_ms: u64,
    backlog_alert: u32,
}

impl std::fmt::Debug for OutboxDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxDispatcher")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl OutboxDispatcher {
    /// Create a dispatcher over the store and a channel.
    #[must_use]
    pub fn new(store: Store, channel: Arc<dyn CardChannel>, config: &EgressConfig) -> Self {
        Self {
            store,
            channel,
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
            backlog_alert: config.backlog_alert,
        }
    }

    /// Dispatch up to `limit` due events.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure; channel failures are absorbed
    /// into the retry schedule.
    pub fn process_due(&self, now_ms: i64, limit: u32) -> Result<DispatchReport, StoreError> {
        let due = self.store.outbox_due(now_ms, limit)?;
        let mut report = DispatchReport::default();

        for event in due {
            let envelope = render_envelope(&event);
            match self.channel.dispatch(&envelope) {
                Ok(()) => {
                    self.store.outbox_mark(
                        &event.event_id,
                        OutboxStatus::Ack,
                        event.attempts + 1,
                        now_ms,
                    )?;
                    report.delivered += 1;
                }
                Err(cause) => {
                    let attempts = event.attempts + 1;
                    if attempts > i64::from(self.max_retries) {
                        tracing::error!(
                            event_id = %event.event_id,
                            cause = %cause,
                            "outbox event failed permanently"
                        );
                        self.store.outbox_mark(
                            &event.event_id,
                            OutboxStatus::Failed,
                            attempts,
                            now_ms,
                        )?;
                        report.failed += 1;
                    } else {
                        let next = now_ms + self.backoff_delay(attempts);
                        tracing::warn!(
                            event_id = %event.event_id,
                            attempts,
                            cause = %cause,
                            "outbox dispatch failed; rescheduled"
                        );
                        self.store.outbox_mark(
                            &event.event_id,
                            OutboxStatus::Pending,
                            attempts,
                            next,
                        )?;
                        report.retried += 1;
                    }
                }
            }
        }

        report.backlog = self.store.outbox_backlog()?;
        report.backlog_alarm = report.backlog >= self.backlog_alert;
        Ok(report)
    }

    /// Exponential backoff with jitter: `base * 2^(attempts-1) + U(0, base)`.
    fn backoff_delay(&self, attempts: i64) -> i64 {
        let exponent = u32::try_from(attempts.max(1) - 1).unwrap_or(0).min(10);
        let base = i64::try_from(self.backoff_base_ms).unwrap_or(500);
        let jitter = rand::thread_rng().gen_range(0..=base);
        base * (1 << exponent) + jitter
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::config::StoreConfig;

    /// Channel that fails the first `failures` dispatches.
    struct FlakyChannel {
        failures: AtomicU32,
        delivered: Mutex<Vec<Value>>,
    }

    impl CardChannel for FlakyChannel {
        fn dispatch(&self, envelope: &Value) -> Result<(), String> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err("simulated channel outage".to_string());
            }
            self.delivered.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    fn dispatcher(dir: &TempDir, failures: u32, max_retries: u32) -> (OutboxDispatcher, Store) {
        let store = Store::open(dir.path().join("ledger.db"), &StoreConfig::default()).unwrap();
        let config = EgressConfig {
            max_retries,
            backoff_base_ms: 10,
            ..EgressConfig::default()
        };
        let channel = Arc::new(FlakyChannel {
            failures: AtomicU32::new(failures),
            delivered: Mutex::new(Vec::new()),
        });
        (
            OutboxDispatcher::new(store.clone(), channel, &config),
            store,
        )
    }

    fn enqueue(store: &Store, event_id: &str) {
        store
            .outbox_enqueue(event_id, OutboxKind::PushCard, &json!({"x": 1}))
            .unwrap();
    }

    #[test]
    fn test_delivers_and_acks() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, store) = dispatcher(&dir, 0, 3);
        enqueue(&store, "e-1");

        let report = dispatcher.process_due(crate::model::now_ms() + 1, 10).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.backlog, 0);
    }

    #[test]
    fn test_failure_schedules_retry_then_delivers() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, store) = dispatcher(&dir, 1, 3);
        enqueue(&store, "e-1");

        let now = crate::model::now_ms() + 1;
        let report = dispatcher.process_due(now, 10).unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.backlog, 1);

        // Not due yet right away; due after the backoff window.
        let report = dispatcher.process_due(now, 10).unwrap();
        assert_eq!(report.delivered, 0);
        let report = dispatcher.process_due(now + 60_000, 10).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.backlog, 0);
    }

    #[test]
    fn test_retry_budget_exhausted_marks_failed() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, store) = dispatcher(&dir, 10, 2);
        enqueue(&store, "e-1");

        let mut now = crate::model::now_ms() + 1;
        for _ in 0..3 {
            dispatcher.process_due(now, 10).unwrap();
            now += 600_000;
        }
        let report = dispatcher.process_due(now, 10).unwrap();
        assert_eq!(report.delivered + report.retried, 0);

        let backlog = store.outbox_backlog().unwrap();
        assert_eq!(backlog, 0, "failed events leave the backlog");
    }

    #[test]
    fn test_backlog_alarm() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("ledger.db"), &StoreConfig::default()).unwrap();
        let config = EgressConfig {
            backlog_alert: 2,
            backoff_base_ms: 10,
            ..EgressConfig::default()
        };
        let channel = Arc::new(FlakyChannel {
            failures: AtomicU32::new(100),
            delivered: Mutex::new(Vec::new()),
        });
        let dispatcher = OutboxDispatcher::new(store.clone(), channel, &config);

        enqueue(&store, "e-1");
        enqueue(&store, "e-2");
        let report = dispatcher
            .process_due(crate::model::now_ms() + 1, 10)
            .unwrap();
        assert!(report.backlog_alarm);
    }

    #[test]
    fn test_envelope_shape() {
        let event = OutboxEvent {
            event_id: "e-1".to_string(),
            kind: OutboxKind::BatchConfirm,
            payload: json!({"count": 3}),
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: 0,
            tenant_id: None,
            inserted_at: 0,
            updated_at: 0,
        };
        let envelope = render_envelope(&event);
        assert_eq!(envelope["kind"], "BATCH_CONFIRM");
        assert_eq!(envelope["buttons"][0]["action"], "BATCH_CONFIRM");
        assert_eq!(envelope["body"]["count"], 3);
    }
}
