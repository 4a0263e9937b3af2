//! Health check module.
//!
//! The daemon runs a triple check per worker: task liveness (is the future
//! still scheduled), persistent heartbeat freshness (is the worker writing
//! its row), and a logical probe over the worker's control channel (does it
//! still answer). This module holds the pure assessment and the per-worker
//! trend tracking; the daemon supplies the observations.

use crate::model::WorkerState;

/// One round of observations for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripleCheck {
    /// The worker task has not exited or been aborted.
    pub task_alive: bool,
    /// Age of the heartbeat row, if one exists.
    pub beat_age_ms: Option<i64>,
    /// The control-channel probe answered within the probe timeout.
    pub probe_ok: bool,
}

/// Assess one round of observations.
///
/// A dead task is `DEAD` regardless of the other signals. A scheduled task
/// with a stale (or missing) heartbeat or an unanswered probe is `STUCK`.
#[must_use]
pub fn assess(check: &TripleCheck, health_timeout_ms: i64) -> WorkerState {
    if !check.task_alive {
        return WorkerState::Dead;
    }
    let beat_fresh = check
        .beat_age_ms
        .is_some_and(|age| age <= health_timeout_ms);
    if !beat_fresh || !check.probe_ok {
        return WorkerState::Stuck;
    }
    WorkerState::Alive
}

/// Per-worker health trend.
///
/// Tracks consecutive unhealthy rounds so one missed probe under load does
/// not bounce a healthy worker.
#[derive(Debug)]
pub struct HealthTracker {
    unhealthy_threshold: u32,
    consecutive_unhealthy: u32,
    last_state: WorkerState,
}

impl HealthTracker {
    /// Create a tracker requiring `unhealthy_threshold` consecutive bad
    /// rounds before reporting a worker unhealthy.
    #[must_use]
    pub const fn new(unhealthy_threshold: u32) -> Self {
        Self {
            unhealthy_threshold,
            consecutive_unhealthy: 0,
            last_state: WorkerState::Alive,
        }
    }

    /// Record one assessed round; returns the state the daemon should act
    /// on (`None` while the trend is still within tolerance).
    pub fn record(&mut self, state: WorkerState) -> Option<WorkerState> {
        self.last_state = state;
        match state {
            WorkerState::Alive => {
                self.consecutive_unhealthy = 0;
                None
            }
            // Death is acted on immediately; stuckness needs a trend.
            WorkerState::Dead | WorkerState::Quarantined => {
                self.consecutive_unhealthy += 1;
                Some(state)
            }
            WorkerState::Stuck => {
                self.consecutive_unhealthy += 1;
                (self.consecutive_unhealthy >= self.unhealthy_threshold).then_some(state)
            }
        }
    }

    /// Last assessed state.
    #[must_use]
    pub const fn last_state(&self) -> WorkerState {
        self.last_state
    }

    /// Reset after a restart.
    pub fn reset(&mut self) {
        self.consecutive_unhealthy = 0;
        self.last_state = WorkerState::Alive;
    }
}
