//! Trace context module.
//!
//! A [`TraceContext`] is a small value carried on every cross-boundary call:
//! it identifies the originating document (trace id) and the worker acting on
//! it. Log records and egress requests attach it as structured metadata
//! instead of relying on process-local state.

use serde::{Deserialize, Serialize};

/// Identity of a request as it moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Globally unique trace id, assigned at ingestion.
    pub trace_id: String,

    /// Name of the worker currently acting on the request.
    pub worker: String,
}

impl TraceContext {
    /// Create a context with a fresh trace id.
    #[must_use]
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            worker: worker.into(),
        }
    }

    /// Create a context for an already-assigned trace id.
    #[must_use]
    pub fn resume(trace_id: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            worker: worker.into(),
        }
    }

    /// Derive a context for the same trace handled by a different worker.
    #[must_use]
    pub fn handoff(&self, worker: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            worker: worker.into(),
        }
    }
}

impl std::fmt::Display for TraceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.trace_id, self.worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids_are_unique() {
        let a = TraceContext::new("collector");
        let b = TraceContext::new("collector");
        assert_ne!(a.trace_id, b.trace_id);
    }

    #[test]
    fn test_handoff_preserves_trace_id() {
        let a = TraceContext::new("collector");
        let b = a.handoff("auditor");
        assert_eq!(a.trace_id, b.trace_id);
        assert_eq!(b.worker, "auditor");
    }
}
