//! MasterDaemon: supervision of the worker set.
//!
//! Boots workers in dependency order (hub first, collector last) gated on
//! their initial `ALIVE` heartbeats, runs the triple health check every
//! cycle, restarts with full-jitter backoff, quarantines workers that come
//! back beat-less three times, and owns process-wide cancellation plus the
//! coarser maintenance cadences (checkpoint, lock cleanup, daily snapshot
//! and statistics, sliding-window chain verification).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use ledgerd_core::config::LedgerConfig;
use ledgerd_core::health::{TripleCheck, assess};
use ledgerd_core::model::{WorkerState, now_ms};
use ledgerd_core::restart::RestartConfig;
use ledgerd_core::store::ChainReport;
use ledgerd_core::supervisor::{Supervisor, WorkerSpec};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::workers::{
    ControlMsg, Services, WorkerContext, accountant, auditor, collector, hub, matcher,
    run_harness,
};

/// Tick period of the accountant and auditor workers.
const PIPELINE_PERIOD: Duration = Duration::from_secs(2);
/// Tick period of the match engine worker.
const MATCHER_PERIOD: Duration = Duration::from_secs(5);
/// Tick period of the outbox dispatch worker.
const HUB_PERIOD: Duration = Duration::from_secs(1);

/// Maintenance cadences.
const LOCK_CLEAN_EVERY_MS: i64 = 5 * 60_000;
const VERIFY_EVERY_MS: i64 = 3_600_000;
const DAILY_EVERY_MS: i64 = 86_400_000;

struct WorkerRuntime {
    handle: JoinHandle<()>,
    control: mpsc::Sender<ControlMsg>,
    cancel: CancellationToken,
    started_at: i64,
}

/// The supervising daemon.
pub struct MasterDaemon {
    services: Arc<Services>,
    config_tx: watch::Sender<Arc<LedgerConfig>>,
    supervisor: Supervisor,
    root_cancel: CancellationToken,
    runtimes: HashMap<&'static str, WorkerRuntime>,
    pending_restarts: HashMap<&'static str, i64>,
    matcher_state: Arc<matcher::MatcherState>,
    hub_state: Arc<hub::HubState>,
    last_checkpoint_ms: i64,
    last_lock_clean_ms: i64,
    last_verify_ms: i64,
    last_daily_ms: i64,
}

impl std::fmt::Debug for MasterDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterDaemon")
            .field("workers", &self.runtimes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MasterDaemon {
    /// Create a daemon over the shared services.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker registry rejects a spec.
    pub fn new(services: Arc<Services>, config: LedgerConfig) -> anyhow::Result<Self> {
        let mut supervisor = Supervisor::new();
        // Hub first so review/alert delivery is up before anything needs
        // it; collector last so nothing is ingested into a half-started
        // pipeline.
        for (name, boot_order) in [
            (hub::NAME, 10),
            (accountant::NAME, 20),
            (auditor::NAME, 30),
            (matcher::NAME, 40),
            (collector::NAME, 50),
        ] {
            supervisor.register(
                WorkerSpec {
                    name: name.to_string(),
                    boot_order,
                },
                RestartConfig::default(),
                2,
            )?;
        }

        let (config_tx, _) = watch::channel(Arc::new(config));
        Ok(Self {
            services,
            config_tx,
            supervisor,
            root_cancel: CancellationToken::new(),
            runtimes: HashMap::new(),
            pending_restarts: HashMap::new(),
            matcher_state: Arc::new(matcher::MatcherState::default()),
            hub_state: Arc::new(hub::HubState::default()),
            last_checkpoint_ms: 0,
            last_lock_clean_ms: 0,
            last_verify_ms: 0,
            last_daily_ms: now_ms(),
        })
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<LedgerConfig> {
        Arc::clone(&self.config_tx.borrow())
    }

    /// Root cancellation token; cancelling it drains the daemon.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.root_cancel.clone()
    }

    /// Swap in a reloaded configuration. Workers observe the new snapshot
    /// at their next idle point.
    pub fn reload_config(&self, config: LedgerConfig) {
        info!("configuration reloaded");
        let _ = self.config_tx.send(Arc::new(config));
    }

    /// Bring up the worker set in dependency order.
    ///
    /// Returns once every worker has written its initial `ALIVE` heartbeat,
    /// or fails when the boot timeout elapses first.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker misses the boot deadline.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let config = self.config();
        let boot_timeout = Duration::from_secs(config.daemon.boot_timeout_s);

        let order: Vec<String> = self
            .supervisor
            .boot_sequence()
            .iter()
            .map(|spec| spec.name.clone())
            .collect();

        for name in order {
            let static_name = static_worker_name(&name)
                .with_context(|| format!("unknown worker '{name}'"))?;
            let runtime = self.spawn_worker(static_name);
            let started_at = runtime.started_at;
            self.runtimes.insert(static_name, runtime);

            self.wait_for_alive(static_name, started_at, boot_timeout)
                .await?;
            info!(worker = static_name, "worker up");
        }
        info!(workers = self.runtimes.len(), "daemon started");
        Ok(())
    }

    async fn wait_for_alive(
        &self,
        name: &'static str,
        since_ms: i64,
        boot_timeout: Duration,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + boot_timeout;
        loop {
            let beat = self.services.store.heartbeat_of(name)?;
            if beat.is_some_and(|b| b.state == WorkerState::Alive && b.last_beat_at >= since_ms) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("worker '{name}' missed its boot deadline");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn spawn_worker(&self, name: &'static str) -> WorkerRuntime {
        // Captured before the task starts so the boot gate can never see a
        // heartbeat older than this mark.
        let started_at = now_ms() - 1;
        let cancel = self.root_cancel.child_token();
        let (control_tx, control_rx) = mpsc::channel(8);
        let config = self.config();
        let ctx = WorkerContext {
            name,
            services: Arc::clone(&self.services),
            config: self.config_tx.subscribe(),
            cancel: cancel.clone(),
            control: control_rx,
        };

        let handle = match name {
            collector::NAME => {
                let period = config.collector.scan_interval;
                tokio::spawn(run_harness(ctx, period, collector::tick))
            }
            accountant::NAME => tokio::spawn(run_harness(ctx, PIPELINE_PERIOD, accountant::tick)),
            auditor::NAME => tokio::spawn(run_harness(ctx, PIPELINE_PERIOD, auditor::tick)),
            matcher::NAME => {
                let state = Arc::clone(&self.matcher_state);
                tokio::spawn(run_harness(ctx, MATCHER_PERIOD, move |services, config| {
                    matcher::tick(services, config, Arc::clone(&state))
                }))
            }
            _ => {
                let state = Arc::clone(&self.hub_state);
                tokio::spawn(run_harness(ctx, HUB_PERIOD, move |services, config| {
                    hub::tick(services, config, Arc::clone(&state))
                }))
            }
        };

        WorkerRuntime {
            handle,
            control: control_tx,
            cancel,
            started_at,
        }
    }

    /// Run the supervision loop until the root token is cancelled.
    ///
    /// Reloaded configurations arriving on `reload` are swapped in between
    /// health cycles; workers observe the new snapshot at their next tick.
    ///
    /// # Errors
    ///
    /// Never returns an error today; the signature leaves room for fatal
    /// supervision failures.
    pub async fn run(
        &mut self,
        mut reload: mpsc::Receiver<LedgerConfig>,
    ) -> anyhow::Result<()> {
        let interval = self.config().daemon.health_interval;
        let mut timer = tokio::time::interval(interval.max(Duration::from_secs(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let cancel = self.root_cancel.clone();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(config) = reload.recv() => {
                    self.reload_config(config);
                }
                _ = timer.tick() => {
                    self.respawn_due().await;
                    self.health_pass().await;
                    self.maintenance_pass();
                }
            }
        }
        Ok(())
    }

    async fn health_pass(&mut self) {
        let config = self.config();
        let health_timeout_ms =
            i64::try_from(config.daemon.health_timeout_s).unwrap_or(60) * 1_000;
        let probe_timeout = Duration::from_secs(config.daemon.probe_timeout_s);
        let now = now_ms();

        let names: Vec<&'static str> = self.runtimes.keys().copied().collect();
        for name in names {
            let Some(runtime) = self.runtimes.get(name) else {
                continue;
            };
            let task_alive = !runtime.handle.is_finished();

            let beat = self.services.store.heartbeat_of(name).ok().flatten();
            let beat_age_ms = beat.as_ref().map(|b| now - b.last_beat_at);

            let probe_ok = if task_alive {
                let (reply_tx, reply_rx) = oneshot::channel();
                let sent = runtime
                    .control
                    .send(ControlMsg::Probe(reply_tx))
                    .await
                    .is_ok();
                sent && tokio::time::timeout(probe_timeout, reply_rx)
                    .await
                    .map_or(false, |reply| reply.is_ok())
            } else {
                false
            };

            let observed = assess(
                &TripleCheck {
                    task_alive,
                    beat_age_ms,
                    probe_ok,
                },
                health_timeout_ms,
            );

            let Ok(tracker) = self.supervisor.health_tracker(name) else {
                continue;
            };
            if let Some(acted) = tracker.record(observed) {
                warn!(worker = name, state = %acted, "worker unhealthy");
                let _ = self.services.store.heartbeat(
                    name,
                    acted,
                    Some(&format!("supervision verdict: {acted}")),
                );
                self.schedule_restart(name, beat.map(|b| b.last_beat_at)).await;
            }
        }
    }

    /// Kill the current task and queue a jittered respawn, or quarantine.
    async fn schedule_restart(&mut self, name: &'static str, last_beat_at: Option<i64>) {
        let Some(runtime) = self.runtimes.remove(name) else {
            return;
        };
        runtime.cancel.cancel();
        runtime.handle.abort();

        let beat_since_restart = last_beat_at.is_some_and(|at| at >= runtime.started_at);
        let Ok(manager) = self.supervisor.restart_manager(name) else {
            return;
        };
        if beat_since_restart {
            manager.record_healthy();
        } else if manager.record_beatless() {
            error!(worker = name, "worker quarantined after repeated beat-less restarts");
            let _ = self.services.store.heartbeat(
                name,
                WorkerState::Quarantined,
                Some("no heartbeat across three restarts"),
            );
            let _ = self
                .services
                .hub
                .push_critical_alert("WORKER_QUARANTINED", name);
            return;
        }

        let delay = manager.next_delay();
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(0);
        let due = now_ms() + delay_ms;
        warn!(worker = name, delay_ms, "restart scheduled");
        self.pending_restarts.insert(name, due);
    }

    async fn respawn_due(&mut self) {
        let now = now_ms();
        let due: Vec<&'static str> = self
            .pending_restarts
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(name, _)| *name)
            .collect();
        for name in due {
            self.pending_restarts.remove(name);
            if let Ok(tracker) = self.supervisor.health_tracker(name) {
                tracker.reset();
            }
            let runtime = self.spawn_worker(name);
            info!(worker = name, "worker restarted");
            self.runtimes.insert(name, runtime);
        }
    }

    fn maintenance_pass(&mut self) {
        let config = self.config();
        let now = now_ms();
        let store = &self.services.store;

        let checkpoint_every =
            i64::try_from(config.daemon.checkpoint_interval.as_millis()).unwrap_or(60_000);
        if now - self.last_checkpoint_ms >= checkpoint_every {
            self.last_checkpoint_ms = now;
            if let Err(e) = store.checkpoint() {
                warn!(error = %e, "checkpoint failed");
            }
        }

        if now - self.last_lock_clean_ms >= LOCK_CLEAN_EVERY_MS {
            self.last_lock_clean_ms = now;
            if let Err(e) = store.clean_orphaned_locks() {
                warn!(error = %e, "orphaned lock cleanup failed");
            }
        }

        if now - self.last_verify_ms >= VERIFY_EVERY_MS {
            self.last_verify_ms = now;
            match store.max_entry_id() {
                Ok(0) | Err(_) => {}
                Ok(max_id) => {
                    let from = (max_id - i64::from(config.daemon.verify_window)).max(1);
                    match store.verify_chain(from, max_id) {
                        Ok(ChainReport::Intact { .. }) | Err(_) => {}
                        Ok(ChainReport::Broken { at }) => {
                            let _ = self.services.hub.push_critical_alert(
                                "CHAIN_BREAK",
                                &format!("maintenance verification failed at entry {at}"),
                            );
                        }
                    }
                }
            }
        }

        if now - self.last_daily_ms >= DAILY_EVERY_MS {
            self.last_daily_ms = now;
            if let Err(e) = store.refresh_statistics() {
                warn!(error = %e, "statistics refresh failed");
            }
            match store.integrity_check() {
                Ok(true) => {}
                Ok(false) => {
                    let _ = self
                        .services
                        .hub
                        .push_critical_alert("STORE_INTEGRITY", "PRAGMA integrity_check failed");
                }
                Err(e) => warn!(error = %e, "integrity check failed to run"),
            }
            if let Err(e) = store.snapshot(&config.paths.snapshot_dir, "daily maintenance") {
                error!(error = %e, "daily snapshot failed");
                let _ = self
                    .services
                    .hub
                    .push_critical_alert("SNAPSHOT_FAILED", &e.to_string());
            }
            if let Err(e) = self.services.bridge.cleanup_stale_rules(30) {
                warn!(error = %e, "stale rule cleanup failed");
            }
            if let Err(e) = self.services.bridge.distill() {
                warn!(error = %e, "rule distillation failed");
            }
            if let Ok(stats) = store.ledger_stats() {
                info!(by_state = ?stats.by_state, "daily ledger statistics");
            }
        }
    }

    /// Drain the worker set: cooperative cancellation, a grace window, then
    /// force-termination with the cause recorded in `panic_snapshot`.
    pub async fn shutdown(&mut self) {
        let config = self.config();
        let grace = Duration::from_secs(config.daemon.grace_shutdown_s);
        info!(grace_s = grace.as_secs(), "shutdown initiated");
        self.root_cancel.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        let order: Vec<String> = self
            .supervisor
            .shutdown_sequence()
            .iter()
            .map(|spec| spec.name.clone())
            .collect();

        for name in order {
            let Some(static_name) = static_worker_name(&name) else {
                continue;
            };
            let Some(mut runtime) = self.runtimes.remove(static_name) else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut runtime.handle).await {
                Ok(_) => info!(worker = static_name, "worker drained"),
                Err(_) => {
                    warn!(worker = static_name, "grace elapsed; force terminating");
                    runtime.handle.abort();
                    let _ = self.services.store.heartbeat(
                        static_name,
                        WorkerState::Dead,
                        Some("force terminated after grace period"),
                    );
                }
            }
        }

        if let Err(e) = self.services.store.checkpoint() {
            warn!(error = %e, "final checkpoint failed");
        }
        info!("daemon stopped");
    }
}

/// Worker names are `&'static str` keys; map the registry's strings back.
fn static_worker_name(name: &str) -> Option<&'static str> {
    [
        hub::NAME,
        accountant::NAME,
        auditor::NAME,
        matcher::NAME,
        collector::NAME,
    ]
    .into_iter()
    .find(|known| *known == name)
}
