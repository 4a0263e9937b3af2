//! Restart policy module.
//!
//! Exponential backoff with full jitter, capped, plus the quarantine rule:
//! a worker that comes back without ever writing an `ALIVE` heartbeat three
//! times in a row is pulled from the rotation and an operator alert is
//! raised by the daemon.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Restart configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Base delay for the first restart.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Backoff cap.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Beat-less restarts before quarantine.
    #[serde(default = "default_quarantine_after")]
    pub quarantine_after: u32,
}

const fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

const fn default_quarantine_after() -> u32 {
    3
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            quarantine_after: default_quarantine_after(),
        }
    }
}

/// Manages restart decisions for one worker.
#[derive(Debug)]
pub struct RestartManager {
    config: RestartConfig,
    attempt: u32,
    beatless_restarts: u32,
    quarantined: bool,
}

impl RestartManager {
    /// Create a manager.
    #[must_use]
    pub const fn new(config: RestartConfig) -> Self {
        Self {
            config,
            attempt: 0,
            beatless_restarts: 0,
            quarantined: false,
        }
    }

    /// Whether the worker may be restarted at all.
    #[must_use]
    pub const fn is_quarantined(&self) -> bool {
        self.quarantined
    }

    /// Record a restart and return the delay to wait before it.
    ///
    /// Full jitter: the delay is uniform in `[0, min(cap, base * 2^n)]`,
    /// so a crashing worker fleet does not restart in lockstep.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(10);
        self.attempt += 1;
        let ceiling = self
            .config
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.config.max_delay);
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// The worker wrote an `ALIVE` heartbeat after its last restart.
    pub const fn record_healthy(&mut self) {
        self.attempt = 0;
        self.beatless_restarts = 0;
    }

    /// The worker died (or was killed) without ever beating `ALIVE` since
    /// the previous restart. Returns `true` when this tips it into
    /// quarantine.
    pub fn record_beatless(&mut self) -> bool {
        self.beatless_restarts += 1;
        if self.beatless_restarts >= self.config.quarantine_after {
            self.quarantined = true;
        }
        self.quarantined
    }

    /// Restarts since the last healthy beat.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Operator override returning a quarantined worker to the rotation.
    pub const fn release(&mut self) {
        self.quarantined = false;
        self.beatless_restarts = 0;
        self.attempt = 0;
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_jitter_bounds() {
        let mut manager = RestartManager::new(RestartConfig {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            quarantine_after: 3,
        });

        // Attempt n draws from [0, min(60s, 2 * 2^n)].
        for expected_ceiling in [2u64, 4, 8, 16, 32, 60, 60] {
            let delay = manager.next_delay();
            assert!(
                delay <= Duration::from_secs(expected_ceiling),
                "delay {delay:?} above ceiling {expected_ceiling}s"
            );
        }
    }

    #[test]
    fn test_healthy_beat_resets_backoff() {
        let mut manager = RestartManager::new(RestartConfig::default());
        manager.next_delay();
        manager.next_delay();
        assert_eq!(manager.attempt(), 2);

        manager.record_healthy();
        assert_eq!(manager.attempt(), 0);
    }

    #[test]
    fn test_quarantine_after_three_beatless_restarts() {
        let mut manager = RestartManager::new(RestartConfig::default());
        assert!(!manager.record_beatless());
        assert!(!manager.record_beatless());
        assert!(manager.record_beatless());
        assert!(manager.is_quarantined());

        manager.release();
        assert!(!manager.is_quarantined());
    }

    #[test]
    fn test_healthy_beat_resets_quarantine_count() {
        let mut manager = RestartManager::new(RestartConfig::default());
        manager.record_beatless();
        manager.record_beatless();
        manager.record_healthy();
        assert!(!manager.record_beatless());
        assert!(!manager.is_quarantined());
    }
}
