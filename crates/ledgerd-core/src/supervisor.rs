//! Supervision bookkeeping.
//!
//! The registry of supervised workers: declared boot order, per-worker
//! restart manager and health tracker. The daemon owns the tokio tasks;
//! this type owns the decisions about them.

use std::collections::HashMap;

use crate::health::HealthTracker;
use crate::restart::{RestartConfig, RestartManager};

/// Declaration of one supervised worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Unique worker name; also the heartbeat row key.
    pub name: String,
    /// Boot position, ascending. Shutdown walks the reverse order.
    pub boot_order: u32,
}

/// Supervisor registry.
#[derive(Debug)]
pub struct Supervisor {
    specs: Vec<WorkerSpec>,
    restart: HashMap<String, RestartManager>,
    health: HashMap<String, HealthTracker>,
}

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Worker with this name already registered.
    #[error("worker '{0}' already registered")]
    DuplicateName(String),

    /// Worker not registered.
    #[error("worker '{0}' not found")]
    NotFound(String),
}

impl Supervisor {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            specs: Vec::new(),
            restart: HashMap::new(),
            health: HashMap::new(),
        }
    }

    /// Register a worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is already taken.
    pub fn register(
        &mut self,
        spec: WorkerSpec,
        restart: RestartConfig,
        unhealthy_threshold: u32,
    ) -> Result<(), SupervisorError> {
        if self.specs.iter().any(|s| s.name == spec.name) {
            return Err(SupervisorError::DuplicateName(spec.name));
        }
        self.restart
            .insert(spec.name.clone(), RestartManager::new(restart));
        self.health
            .insert(spec.name.clone(), HealthTracker::new(unhealthy_threshold));
        self.specs.push(spec);
        self.specs.sort_by_key(|s| s.boot_order);
        Ok(())
    }

    /// Workers in boot order.
    #[must_use]
    pub fn boot_sequence(&self) -> Vec<&WorkerSpec> {
        self.specs.iter().collect()
    }

    /// Workers in shutdown (reverse boot) order.
    #[must_use]
    pub fn shutdown_sequence(&self) -> Vec<&WorkerSpec> {
        self.specs.iter().rev().collect()
    }

    /// Restart manager of a worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is not registered.
    pub fn restart_manager(&mut self, name: &str) -> Result<&mut RestartManager, SupervisorError> {
        self.restart
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    /// Health tracker of a worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is not registered.
    pub fn health_tracker(&mut self, name: &str) -> Result<&mut HealthTracker, SupervisorError> {
        self.health
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    /// Names of quarantined workers.
    #[must_use]
    pub fn quarantined(&self) -> Vec<&str> {
        self.restart
            .iter()
            .filter(|(_, manager)| manager.is_quarantined())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Number of registered workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether no workers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, boot_order: u32) -> WorkerSpec {
        WorkerSpec {
            name: name.to_string(),
            boot_order,
        }
    }

    #[test]
    fn test_boot_and_shutdown_order() {
        let mut supervisor = Supervisor::new();
        supervisor
            .register(spec("collector", 40), RestartConfig::default(), 2)
            .unwrap();
        supervisor
            .register(spec("hub", 10), RestartConfig::default(), 2)
            .unwrap();
        supervisor
            .register(spec("auditor", 20), RestartConfig::default(), 2)
            .unwrap();

        let boot: Vec<_> = supervisor
            .boot_sequence()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(boot, ["hub", "auditor", "collector"]);

        let down: Vec<_> = supervisor
            .shutdown_sequence()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(down, ["collector", "auditor", "hub"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut supervisor = Supervisor::new();
        supervisor
            .register(spec("hub", 1), RestartConfig::default(), 2)
            .unwrap();
        let result = supervisor.register(spec("hub", 2), RestartConfig::default(), 2);
        assert!(matches!(result, Err(SupervisorError::DuplicateName(_))));
    }

    #[test]
    fn test_quarantine_listing() {
        let mut supervisor = Supervisor::new();
        supervisor
            .register(spec("matcher", 1), RestartConfig::default(), 2)
            .unwrap();

        let manager = supervisor.restart_manager("matcher").unwrap();
        manager.record_beatless();
        manager.record_beatless();
        manager.record_beatless();
        assert_eq!(supervisor.quarantined(), ["matcher"]);
    }
}
