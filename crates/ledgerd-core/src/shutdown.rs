//! Graceful shutdown module.
//!
//! Tracks the drain of one worker: cooperative cancellation first, a grace
//! period, then force-termination with the cause recorded in the worker's
//! heartbeat row.

use std::time::Duration;

/// Shutdown state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Not shutting down.
    Running,
    /// Cancellation signalled; waiting within the grace period.
    Draining,
    /// Grace elapsed; the task is being aborted.
    ForceTerminating,
    /// The worker exited.
    Completed,
}

impl std::fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::ForceTerminating => write!(f, "force_terminating"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Manages the shutdown of a single worker.
#[derive(Debug)]
pub struct ShutdownManager {
    grace: Duration,
    state: ShutdownState,
    drain_started_at: Option<std::time::Instant>,
}

impl ShutdownManager {
    /// Create a manager with the given grace period.
    #[must_use]
    pub const fn new(grace: Duration) -> Self {
        Self {
            grace,
            state: ShutdownState::Running,
            drain_started_at: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ShutdownState {
        self.state
    }

    /// Whether a drain or force-kill is in progress.
    #[must_use]
    pub const fn is_shutting_down(&self) -> bool {
        !matches!(
            self.state,
            ShutdownState::Running | ShutdownState::Completed
        )
    }

    /// Cancellation has been signalled.
    pub fn initiate(&mut self) {
        if self.state == ShutdownState::Running {
            self.state = ShutdownState::Draining;
            self.drain_started_at = Some(std::time::Instant::now());
        }
    }

    /// Whether the grace period has elapsed without the worker exiting.
    #[must_use]
    pub fn grace_elapsed(&self) -> bool {
        self.state == ShutdownState::Draining
            && self
                .drain_started_at
                .is_some_and(|started| started.elapsed() >= self.grace)
    }

    /// Escalate to force-termination.
    pub fn force(&mut self) {
        if self.state == ShutdownState::Draining {
            self.state = ShutdownState::ForceTerminating;
        }
    }

    /// The worker exited (cleanly or by abort).
    pub const fn complete(&mut self) {
        self.state = ShutdownState::Completed;
    }

    /// Grace period.
    #[must_use]
    pub const fn grace(&self) -> Duration {
        self.grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let mut manager = ShutdownManager::new(Duration::from_secs(5));
        assert_eq!(manager.state(), ShutdownState::Running);
        assert!(!manager.is_shutting_down());

        manager.initiate();
        assert_eq!(manager.state(), ShutdownState::Draining);
        assert!(manager.is_shutting_down());

        manager.force();
        assert_eq!(manager.state(), ShutdownState::ForceTerminating);

        manager.complete();
        assert_eq!(manager.state(), ShutdownState::Completed);
        assert!(!manager.is_shutting_down());
    }

    #[test]
    fn test_grace_elapsed() {
        let mut manager = ShutdownManager::new(Duration::from_millis(5));
        manager.initiate();
        assert!(!manager.grace_elapsed() || manager.state() == ShutdownState::Draining);
        std::thread::sleep(Duration::from_millis(10));
        assert!(manager.grace_elapsed());
    }

    #[test]
    fn test_force_only_from_draining() {
        let mut manager = ShutdownManager::new(Duration::from_secs(1));
        manager.force();
        assert_eq!(manager.state(), ShutdownState::Running);
    }
}
