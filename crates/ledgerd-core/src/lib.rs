//! # ledgerd-core
//!
//! Core library for ledgerd - an automated bookkeeping daemon for a single
//! small enterprise.
//!
//! This crate provides the building blocks for the supervised pipeline:
//! ingesting source documents, proposing double-entry records, auditing them
//! against policy, reconciling bank flows, and driving a human-in-the-loop
//! review channel over a tamper-evident ledger.
//!
//! ## Features
//!
//! - **Persistence & Integrity**: hash-chained SQLite ledger with entry
//!   locking, heartbeats, outbox, and snapshot/rollback
//! - **Classification**: rule-routed L1 engine with an L2 reason-act tier
//!   behind a sanitizing egress proxy
//! - **Audit**: deterministic multi-judge consensus with red-line vetoes
//! - **Reconciliation**: scored matching of bank flows against posted entries
//! - **Supervision**: health checks, restart policies, and graceful shutdown
//!   for the worker set
//!
//! ## Example
//!
//! ```rust,no_run
//! use ledgerd_core::config::LedgerConfig;
//! use ledgerd_core::store::Store;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LedgerConfig::default();
//! let store = Store::open("ledger.db", &config.store)?;
//! store.heartbeat("collector", ledgerd_core::model::WorkerState::Alive, None)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod classify;
pub mod collect;
pub mod config;
pub mod egress;
pub mod health;
pub mod interact;
pub mod knowledge;
pub mod matching;
pub mod model;
pub mod outbox;
pub mod privacy;
pub mod restart;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod trace;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::LedgerConfig;
    pub use crate::model::{EntryState, LedgerEntry, PendingEntry, WorkerState};
    pub use crate::store::{Store, StoreError};
    pub use crate::trace::TraceContext;
}

pub use config::LedgerConfig;
pub use store::{Store, StoreError};
pub use trace::TraceContext;
