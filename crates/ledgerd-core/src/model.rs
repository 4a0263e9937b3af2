//! Data model module.
//!
//! Entity types shared across the pipeline. All monetary values are
//! fixed-precision [`Decimal`]s (scale 2 at rest, scale 6 during
//! aggregation); all timestamps are UTC epoch milliseconds.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current UTC time as epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lifecycle state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    /// Proposed by the classifier, not yet audited.
    Proposed,
    /// Advisory lock held by an auditor worker.
    Locking,
    /// Audit passed, awaiting posting.
    Audited,
    /// Posted to the books. Immutable from here on.
    Posted,
    /// Rejected by audit or by the reviewer. Immutable.
    Rejected,
    /// Posted but flagged for risk follow-up.
    Risk,
    /// Logically reverted by a reversing entry. Immutable.
    Reverted,
}

impl EntryState {
    /// Whether the state forbids further mutation (append-only from here).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Posted | Self::Rejected | Self::Reverted)
    }

    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "PROPOSED",
            Self::Locking => "LOCKING",
            Self::Audited => "AUDITED",
            Self::Posted => "POSTED",
            Self::Rejected => "REJECTED",
            Self::Risk => "RISK",
            Self::Reverted => "REVERTED",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROPOSED" => Some(Self::Proposed),
            "LOCKING" => Some(Self::Locking),
            "AUDITED" => Some(Self::Audited),
            "POSTED" => Some(Self::Posted),
            "REJECTED" => Some(Self::Rejected),
            "RISK" => Some(Self::Risk),
            "REVERTED" => Some(Self::Reverted),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the classifier's reasoning, persisted with the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceStep {
    /// Ordinal within the log.
    pub step: u32,
    /// What was done (input analysis, routing, rule match, ...).
    pub action: String,
    /// Outcome summary.
    pub result: String,
}

/// Structured provenance for a proposed entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceLog {
    /// Classification engine that produced the proposal (`L1` or `L2`).
    pub engine: String,
    /// Rule id that matched, if any.
    pub rule_id: Option<i64>,
    /// Final confidence in `[0, 1]`.
    pub confidence: f64,
    /// Ordered reasoning steps.
    pub steps: Vec<InferenceStep>,
}

/// One chain-linked double-entry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonic row id.
    pub id: i64,
    /// Globally unique trace id (unique index).
    pub trace_id: String,
    /// Signed amount.
    pub amount: Decimal,
    /// Counterparty / vendor name.
    pub vendor: String,
    /// Account code, `NNNN` or `NNNN-NN`.
    pub category: String,
    /// When the underlying business event occurred.
    pub occurred_at: i64,
    /// Links multimodal captures of the same event.
    pub group_id: Option<String>,
    /// Optional project dimension.
    pub project_id: Option<String>,
    /// Structured reasoning that produced this entry.
    pub inference_log: InferenceLog,
    /// Rule that matched, if classification went through L1.
    pub matched_rule: Option<i64>,
    /// Chain hash of the logical predecessor.
    pub prev_hash: String,
    /// `SHA-256(prev_hash | amount | vendor | category | trace_id | occurred_at)`.
    pub chain_hash: String,
    /// Lifecycle state.
    pub state: EntryState,
    /// Worker holding the advisory lock, when `state == Locking`.
    pub lock_owner: Option<String>,
    /// When the advisory lock was taken.
    pub locked_at: Option<i64>,
    /// Id of the reversing entry, set by `mark_reverted`.
    pub reverted_by: Option<i64>,
    /// Optional tenant discriminator; never enforced by the core.
    pub tenant_id: Option<String>,
    /// Row insertion time.
    pub inserted_at: i64,
    /// Last update time.
    pub updated_at: i64,
}

/// Fields the caller supplies when appending an entry; identity, chain and
/// bookkeeping columns are filled in by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    /// Trace id assigned at ingestion.
    pub trace_id: String,
    /// Signed amount.
    pub amount: Decimal,
    /// Counterparty / vendor name.
    pub vendor: String,
    /// Account code.
    pub category: String,
    /// Business event time.
    pub occurred_at: i64,
    /// Multimodal group, if any.
    pub group_id: Option<String>,
    /// Project dimension, if any.
    pub project_id: Option<String>,
    /// Classifier provenance.
    pub inference_log: InferenceLog,
    /// Matched rule id, if any.
    pub matched_rule: Option<i64>,
    /// Optional tenant discriminator.
    pub tenant_id: Option<String>,
}

/// Origin channel of a bank/payment line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowSource {
    /// Alipay statement export.
    Alipay,
    /// WeChat Pay statement export.
    Wechat,
    /// Generic bank statement.
    Bank,
}

impl FlowSource {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alipay => "ALIPAY",
            Self::Wechat => "WECHAT",
            Self::Bank => "BANK",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALIPAY" => Some(Self::Alipay),
            "WECHAT" => Some(Self::Wechat),
            "BANK" => Some(Self::Bank),
            _ => None,
        }
    }
}

/// Reconciliation status of a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingStatus {
    /// No ledger entry paired yet.
    Unreconciled,
    /// Paired, awaiting user confirmation.
    Matched,
    /// Confirmed against a posted ledger entry.
    Reconciled,
}

impl PendingStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unreconciled => "UNRECONCILED",
            Self::Matched => "MATCHED",
            Self::Reconciled => "RECONCILED",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNRECONCILED" => Some(Self::Unreconciled),
            "MATCHED" => Some(Self::Matched),
            "RECONCILED" => Some(Self::Reconciled),
            _ => None,
        }
    }
}

/// A bank/payment line awaiting reconciliation (shadow row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Row id.
    pub id: i64,
    /// Origin channel.
    pub source: FlowSource,
    /// Counterparty as reported by the channel.
    pub counterparty: String,
    /// Signed amount.
    pub amount: Decimal,
    /// When the flow occurred.
    pub occurred_at: i64,
    /// Free-form line description.
    pub description: String,
    /// Reconciliation status.
    pub status: PendingStatus,
    /// Paired ledger entry, once matched.
    pub matched_ledger_id: Option<i64>,
    /// Optional tenant discriminator.
    pub tenant_id: Option<String>,
    /// Row insertion time.
    pub inserted_at: i64,
    /// Last update time.
    pub updated_at: i64,
}

/// Lifecycle stage of a knowledge-base rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditLevel {
    /// Probation: matches are accepted but shadow-audited.
    Gray,
    /// Promoted after consecutive clean approvals.
    Stable,
    /// Entered by a user correction; stable from birth.
    Manual,
    /// Vendor blocked outright; matches are rejected.
    Blocked,
    /// Demoted after repeated rejections; never matched again.
    Failed,
}

impl AuditLevel {
    /// Whether the rule feeds the unconditional fast path.
    #[must_use]
    pub const fn is_trusted(self) -> bool {
        matches!(self, Self::Stable | Self::Manual)
    }

    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gray => "GRAY",
            Self::Stable => "STABLE",
            Self::Manual => "MANUAL",
            Self::Blocked => "BLOCKED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GRAY" => Some(Self::Gray),
            "STABLE" => Some(Self::Stable),
            "MANUAL" => Some(Self::Manual),
            "BLOCKED" => Some(Self::Blocked),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleSource {
    /// Learned from a user correction.
    Manual,
    /// Learned from an L2 decision.
    L2,
    /// Seeded from the rules file.
    Seed,
}

impl RuleSource {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::L2 => "L2",
            Self::Seed => "SEED",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MANUAL" => Some(Self::Manual),
            "L2" => Some(Self::L2),
            "SEED" => Some(Self::Seed),
            _ => None,
        }
    }
}

/// Optional predicates restricting when a rule applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    /// Inclusive lower amount bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_min: Option<Decimal>,
    /// Inclusive upper amount bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_max: Option<Decimal>,
    /// Substring the vendor must contain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_contains: Option<String>,
}

impl RuleConditions {
    /// True when no predicate is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.amount_min.is_none() && self.amount_max.is_none() && self.vendor_contains.is_none()
    }

    /// Evaluate the predicates against a document.
    #[must_use]
    pub fn matches(&self, amount: Decimal, vendor: &str) -> bool {
        if let Some(min) = self.amount_min {
            if amount.abs() < min {
                return false;
            }
        }
        if let Some(max) = self.amount_max {
            if amount.abs() > max {
                return false;
            }
        }
        if let Some(needle) = &self.vendor_contains {
            if !vendor.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One knowledge-base rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule id.
    pub rule_id: i64,
    /// Literal keyword or regex source, per `is_regex`.
    pub keyword_pattern: String,
    /// Whether `keyword_pattern` is a regex.
    pub is_regex: bool,
    /// Extra predicates.
    pub conditions: RuleConditions,
    /// Account code the rule proposes.
    pub proposed_category: String,
    /// Higher wins.
    pub priority: i64,
    /// Lifecycle stage.
    pub audit_level: AuditLevel,
    /// Audit approvals observed.
    pub hit_count: i64,
    /// Audit rejections observed.
    pub reject_count: i64,
    /// Consecutive approvals since the last rejection.
    pub consecutive_success: i64,
    /// Bumped on every promotion/demotion.
    pub version: i64,
    /// Set on supersession so old entries stay attributable.
    pub valid_until: Option<i64>,
    /// Provenance.
    pub source: RuleSource,
    /// Optional tenant discriminator.
    pub tenant_id: Option<String>,
    /// Row insertion time.
    pub inserted_at: i64,
    /// Last update time.
    pub updated_at: i64,
}

/// Kind of an outbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxKind {
    /// Push an interaction card to the review channel.
    PushCard,
    /// Solicit a missing document for an unmatched flow.
    EvidenceRequest,
    /// Batch reconciliation confirmation request.
    BatchConfirm,
    /// Operator attention required (chain break, quarantine, backlog, ...).
    CriticalAlert,
}

impl OutboxKind {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PushCard => "PUSH_CARD",
            Self::EvidenceRequest => "EVIDENCE_REQUEST",
            Self::BatchConfirm => "BATCH_CONFIRM",
            Self::CriticalAlert => "CRITICAL_ALERT",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PUSH_CARD" => Some(Self::PushCard),
            "EVIDENCE_REQUEST" => Some(Self::EvidenceRequest),
            "BATCH_CONFIRM" => Some(Self::BatchConfirm),
            "CRITICAL_ALERT" => Some(Self::CriticalAlert),
            _ => None,
        }
    }
}

/// Delivery status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Awaiting dispatch.
    Pending,
    /// Handed to the channel, awaiting acknowledgement.
    Sent,
    /// Acknowledged by the channel.
    Ack,
    /// Gave up after the retry budget.
    Failed,
}

impl OutboxStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Ack => "ACK",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "ACK" => Some(Self::Ack),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A durable outbound notification. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Event id.
    pub event_id: String,
    /// Notification kind.
    pub kind: OutboxKind,
    /// Opaque payload rendered by the outbox worker.
    pub payload: serde_json::Value,
    /// Delivery status.
    pub status: OutboxStatus,
    /// Dispatch attempts so far.
    pub attempts: i64,
    /// Earliest next dispatch time.
    pub next_attempt_at: i64,
    /// Optional tenant discriminator.
    pub tenant_id: Option<String>,
    /// Row insertion time.
    pub inserted_at: i64,
    /// Last update time.
    pub updated_at: i64,
}

/// Lifecycle status of an interaction card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardStatus {
    /// Delivered to the channel.
    Sent,
    /// User opened the card.
    Clicked,
    /// Action completed.
    Completed,
    /// TTL elapsed before completion.
    Expired,
}

impl CardStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Clicked => "CLICKED",
            Self::Completed => "COMPLETED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SENT" => Some(Self::Sent),
            "CLICKED" => Some(Self::Clicked),
            "COMPLETED" => Some(Self::Completed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Expired)
    }
}

/// A signed, expiring, role-scoped request for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionCard {
    /// Card id.
    pub card_id: String,
    /// Card kind (mirrors the outbox kind that carried it).
    pub kind: OutboxKind,
    /// HMAC-signed callback token.
    pub callback_token: String,
    /// Creation time.
    pub created_at: i64,
    /// Expiry time.
    pub expires_at: i64,
    /// Role allowed to act on the card.
    pub required_role: String,
    /// Lifecycle status.
    pub status: CardStatus,
    /// Entity the card refers to, e.g. `entry:42` or `batch:7,9,12`.
    pub linked_entity_ref: String,
    /// One-shot replay marker; set when a callback is consumed.
    pub consumed: bool,
    /// Optional tenant discriminator.
    pub tenant_id: Option<String>,
}

/// Health state of a supervised worker, as persisted in its heartbeat row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Beating within the health timeout.
    Alive,
    /// Exited (cleanly or not).
    Dead,
    /// Scheduled but heartbeat is stale.
    Stuck,
    /// Removed from the restart rotation after repeated beat-less restarts.
    Quarantined,
}

impl WorkerState {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alive => "ALIVE",
            Self::Dead => "DEAD",
            Self::Stuck => "STUCK",
            Self::Quarantined => "QUARANTINED",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALIVE" => Some(Self::Alive),
            "DEAD" => Some(Self::Dead),
            "STUCK" => Some(Self::Stuck),
            "QUARANTINED" => Some(Self::Quarantined),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One heartbeat row per supervised worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Worker name (primary key).
    pub worker_name: String,
    /// OS process id of the hosting daemon.
    pub pid: u32,
    /// Last beat time.
    pub last_beat_at: i64,
    /// Health state.
    pub state: WorkerState,
    /// Cause recorded when the worker was force-terminated or panicked.
    pub panic_snapshot: Option<String>,
}

/// Metadata for a physical store snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id.
    pub snapshot_id: String,
    /// Creation time.
    pub created_at: i64,
    /// Operator-supplied description.
    pub description: String,
    /// Size of the snapshot file.
    pub size_bytes: u64,
    /// Snapshot file location.
    pub path: std::path::PathBuf,
}

/// Detected kind of an ingested file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentKind {
    /// Invoice or receipt image awaiting OCR.
    InvoiceImage,
    /// Bank/payment statement.
    Statement,
    /// Recognised but not parseable by the registered set.
    Other,
}

impl DocumentKind {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvoiceImage => "INVOICE_IMAGE",
            Self::Statement => "STATEMENT",
            Self::Other => "OTHER",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INVOICE_IMAGE" => Some(Self::InvoiceImage),
            "STATEMENT" => Some(Self::Statement),
            "OTHER" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Processing status of an ingested file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    /// Recorded, awaiting parse.
    Pending,
    /// Parsed into records.
    Parsed,
    /// Parse failed; `failure_cause` says why.
    Failed,
}

impl DocumentStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Parsed => "PARSED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PARSED" => Some(Self::Parsed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Record of one ingested file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Document id.
    pub doc_id: i64,
    /// Path the file was picked up from.
    pub path: std::path::PathBuf,
    /// Full SHA-256 of the file contents (unique; dedup key).
    pub content_hash: String,
    /// Detected kind.
    pub doc_kind: DocumentKind,
    /// Processing status.
    pub status: DocumentStatus,
    /// Failure cause when `status == Failed`.
    pub failure_cause: Option<String>,
    /// Multimodal group, if clustered.
    pub group_id: Option<String>,
    /// Trace id assigned at ingestion.
    pub trace_id: String,
    /// Row insertion time.
    pub inserted_at: i64,
    /// Last update time.
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_entry_state_round_trip() {
        for state in [
            EntryState::Proposed,
            EntryState::Locking,
            EntryState::Audited,
            EntryState::Posted,
            EntryState::Rejected,
            EntryState::Risk,
            EntryState::Reverted,
        ] {
            assert_eq!(EntryState::parse(state.as_str()), Some(state));
        }
        assert_eq!(EntryState::parse("BOGUS"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(EntryState::Posted.is_terminal());
        assert!(EntryState::Rejected.is_terminal());
        assert!(EntryState::Reverted.is_terminal());
        assert!(!EntryState::Proposed.is_terminal());
        assert!(!EntryState::Risk.is_terminal());
    }

    #[test]
    fn test_rule_conditions_amount_range() {
        let conditions = RuleConditions {
            amount_min: Some(dec!(100)),
            amount_max: Some(dec!(1000)),
            vendor_contains: None,
        };

        assert!(conditions.matches(dec!(500), "any"));
        assert!(conditions.matches(dec!(-500), "any"));
        assert!(!conditions.matches(dec!(50), "any"));
        assert!(!conditions.matches(dec!(5000), "any"));
    }

    #[test]
    fn test_rule_conditions_vendor_predicate() {
        let conditions = RuleConditions {
            vendor_contains: Some("Cloud".to_string()),
            ..RuleConditions::default()
        };

        assert!(conditions.matches(dec!(1), "ACME Cloud Inc."));
        assert!(!conditions.matches(dec!(1), "Starbucks"));
    }

    #[test]
    fn test_trusted_audit_levels() {
        assert!(AuditLevel::Stable.is_trusted());
        assert!(AuditLevel::Manual.is_trusted());
        assert!(!AuditLevel::Gray.is_trusted());
        assert!(!AuditLevel::Failed.is_trusted());
        assert!(!AuditLevel::Blocked.is_trusted());
    }
}
