//! Pipeline workers.
//!
//! One supervised tokio task per actor. Every worker runs the same harness:
//! an interval tick doing the actual work, a control channel answering the
//! daemon's logical probes, and cooperative cancellation. On the way out a
//! worker releases its entry locks, writes a final `DEAD` heartbeat, and
//! closes its channels.

pub mod accountant;
pub mod auditor;
pub mod collector;
pub mod hub;
pub mod matcher;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ledgerd_core::audit::AuditorAgent;
use ledgerd_core::classify::AccountingAgent;
use ledgerd_core::collect::{OcrEngine, ParserRegistry};
use ledgerd_core::config::LedgerConfig;
use ledgerd_core::interact::InteractionHub;
use ledgerd_core::knowledge::KnowledgeBridge;
use ledgerd_core::matching::MatchEngine;
use ledgerd_core::model::WorkerState;
use ledgerd_core::outbox::OutboxDispatcher;
use ledgerd_core::store::Store;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Control messages the daemon sends into a worker.
#[derive(Debug)]
pub enum ControlMsg {
    /// Logical health probe; the worker acknowledges promptly.
    Probe(oneshot::Sender<()>),
}

/// Shared services handed to every worker.
pub struct Services {
    /// The store.
    pub store: Store,
    /// Rule lifecycle manager.
    pub bridge: KnowledgeBridge,
    /// Interaction hub (the only outbox producer).
    pub hub: Arc<InteractionHub>,
    /// Classifier.
    pub agent: Arc<AccountingAgent>,
    /// Audit engine.
    pub auditor: Arc<AuditorAgent>,
    /// Reconciliation engine.
    pub engine: Arc<MatchEngine>,
    /// Outbox dispatcher.
    pub dispatcher: Arc<OutboxDispatcher>,
    /// Statement parser registry.
    pub registry: Arc<ParserRegistry>,
    /// OCR seam for invoice images.
    pub ocr: Arc<dyn OcrEngine>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Per-worker runtime context, consumed by the harness.
pub struct WorkerContext {
    /// Worker name; also the heartbeat row key.
    pub name: &'static str,
    /// Shared services.
    pub services: Arc<Services>,
    /// Configuration snapshot channel; re-read at every tick.
    pub config: watch::Receiver<Arc<LedgerConfig>>,
    /// Cooperative cancellation.
    pub cancel: CancellationToken,
    /// Probe channel.
    pub control: mpsc::Receiver<ControlMsg>,
}

/// Run the common worker harness around a tick function.
///
/// The initial `ALIVE` heartbeat is written before the first tick so the
/// daemon's boot gate observes it promptly. Tick errors are logged and the
/// loop continues; only cancellation (or a closed control channel) ends it.
pub async fn run_harness<F, Fut>(ctx: WorkerContext, period: Duration, mut tick: F)
where
    F: FnMut(Arc<Services>, Arc<LedgerConfig>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let WorkerContext {
        name,
        services,
        config,
        cancel,
        mut control,
    } = ctx;

    if let Err(e) = services.store.heartbeat(name, WorkerState::Alive, None) {
        warn!(worker = name, error = %e, "initial heartbeat failed");
    }

    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = control.recv() => {
                match message {
                    Some(ControlMsg::Probe(reply)) => {
                        let _ = reply.send(());
                    }
                    None => break,
                }
            }
            _ = timer.tick() => {
                let snapshot = Arc::clone(&config.borrow());
                if let Err(e) = tick(Arc::clone(&services), snapshot).await {
                    warn!(worker = name, error = %e, "tick failed");
                }
                if let Err(e) = services.store.heartbeat(name, WorkerState::Alive, None) {
                    warn!(worker = name, error = %e, "heartbeat failed");
                }
            }
        }
    }

    // Drain: flush locks, final beat, close channels.
    let released = services.store.release_locks_of(name).unwrap_or(0);
    if released > 0 {
        debug!(worker = name, released, "released entry locks on shutdown");
    }
    if let Err(e) = services
        .store
        .heartbeat(name, WorkerState::Dead, Some("cancelled"))
    {
        warn!(worker = name, error = %e, "final heartbeat failed");
    }
    debug!(worker = name, "worker drained");
}
