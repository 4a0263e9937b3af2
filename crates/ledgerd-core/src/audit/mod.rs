//! Auditor: rule-plus-consensus check over each proposed entry.
//!
//! The same input and clock always produce the same verdict, so policy
//! behavior can be pinned in tests. Order of checks:
//!
//! 1. hard red lines (keyword blacklist, absolute amount cap, blocked
//!    vendor) short-circuit to `Rejected`
//! 2. heterogeneous consensus of three judges, with CRITICAL overrides
//! 3. historical consistency against the vendor's prior entries
//! 4. confidence banding into approve / review
//!
//! Knowledge feedback (`record_hit` / `record_reject`) is applied by the
//! auditor worker from the verdict, not by this module, so there is no
//! object cycle between auditor and knowledge bridge.

mod history;
mod judges;

pub use history::VendorHistory;
pub use judges::{Judge, JudgeVerdict};

use rust_decimal::Decimal;

use crate::config::{AuditConfig, AuditStrategy};

/// Everything the auditor needs to judge one proposal.
#[derive(Debug, Clone)]
pub struct AuditInput {
    /// Document text the proposal was derived from.
    pub text: String,
    /// Vendor name.
    pub vendor: String,
    /// Proposed account code.
    pub category: String,
    /// Human-readable category label, if known (red lines match labels).
    pub category_label: String,
    /// Signed amount.
    pub amount: Decimal,
    /// Classifier confidence.
    pub proposal_confidence: f64,
    /// Whether a STABLE/MANUAL rule produced the proposal.
    pub rule_trusted: bool,
    /// The grey rule cited by the proposal, if any.
    pub matched_gray_rule: Option<i64>,
    /// Shadow-audit flag from the classifier.
    pub requires_shadow_audit: bool,
    /// Whether the vendor is blocked in the knowledge base.
    pub vendor_blocked: bool,
    /// Prior posted entries of the vendor.
    pub history: VendorHistory,
}

/// Audit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditDecision {
    /// Post the entry.
    Approved,
    /// Raise a card and wait for a human.
    NeedsReview,
    /// Refuse the entry.
    Rejected,
}

/// Full verdict with the reason vector.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// The decision.
    pub decision: AuditDecision,
    /// Why, in evaluation order.
    pub reasons: Vec<String>,
    /// Combined confidence in `[0, 1]`.
    pub confidence: f64,
    /// Post as `RISK` instead of `POSTED` when approved.
    pub risky: bool,
    /// Individual judge verdicts, for the audit trail.
    pub votes: Vec<JudgeVerdict>,
}

/// Absolute amount above which an entry is vetoed outright, as a multiple
/// of tier 1.
const HARD_CAP_MULTIPLIER: i64 = 20;

/// Weights of the confidence combination.
const WEIGHT_RULE: f64 = 0.4;
const WEIGHT_CONSENSUS: f64 = 0.35;
const WEIGHT_HISTORY: f64 = 0.25;

/// Deterministic audit engine.
#[derive(Debug, Clone)]
pub struct AuditorAgent {
    config: AuditConfig,
}

impl AuditorAgent {
    /// Create an auditor with the given policy.
    #[must_use]
    pub const fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    /// Judge one proposal.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn audit(&self, input: &AuditInput, now_ms: i64) -> Verdict {
        let mut reasons = Vec::new();

        // 1. Hard red lines: one hit vetoes everything downstream.
        if input.vendor_blocked {
            return Verdict {
                decision: AuditDecision::Rejected,
                reasons: vec![format!("vendor {} is blocked", input.vendor)],
                confidence: 0.0,
                risky: true,
                votes: Vec::new(),
            };
        }
        let hard_cap = self.config.amount_tier1 * Decimal::from(HARD_CAP_MULTIPLIER);
        if input.amount.abs() > hard_cap {
            return Verdict {
                decision: AuditDecision::Rejected,
                reasons: vec![format!(
                    "amount {} above the absolute cap {hard_cap}",
                    input.amount.abs()
                )],
                confidence: 0.0,
                risky: true,
                votes: Vec::new(),
            };
        }

        // 2. Heterogeneous consensus.
        let votes: Vec<JudgeVerdict> = Judge::ALL
            .iter()
            .map(|judge| judge.evaluate(input, &self.config))
            .collect();

        if let Some(critical) = votes.iter().find(|vote| vote.critical) {
            return Verdict {
                decision: AuditDecision::Rejected,
                reasons: vec![format!("CRITICAL from {:?}: {}", critical.judge, critical.reason)],
                confidence: 0.0,
                risky: true,
                votes,
            };
        }

        let passed = votes.iter().filter(|vote| vote.passed).count();
        let required = match self.config.strategy {
            AuditStrategy::Strict => 3,
            AuditStrategy::Balanced => 2,
            AuditStrategy::Growth => 1,
        };
        let consensus_ok = passed >= required;
        for vote in votes.iter().filter(|vote| !vote.passed) {
            reasons.push(format!("{:?}: {}", vote.judge, vote.reason));
        }

        // 3. Historical consistency.
        let mut risk_points: f64 = 0.0;
        if !input.history.is_empty() {
            let share = input.history.category_share(&input.category);
            if share < 1.0 - self.config.history_deviation {
                risk_points += 0.2;
                reasons.push(format!(
                    "category deviates from vendor history (share {share:.2})"
                ));
            }
            if let Some(ratio) = input.history.price_deviation_ratio(input.amount, now_ms) {
                if ratio > self.config.price_deviation || ratio < 1.0 / self.config.price_deviation
                {
                    risk_points += 0.2;
                    reasons.push(format!(
                        "price deviates from decayed vendor mean (ratio {ratio:.2})"
                    ));
                }
            }
        }

        // 4. Combined confidence.
        let rule_quality = if input.rule_trusted {
            1.0
        } else if input.matched_gray_rule.is_some() {
            0.6
        } else {
            input.proposal_confidence.clamp(0.0, 1.0)
        };
        #[allow(clippy::cast_precision_loss)]
        let consensus_margin = passed as f64 / Judge::ALL.len() as f64;
        let history_consistency = (1.0 - risk_points).clamp(0.0, 1.0);
        let confidence = WEIGHT_RULE * rule_quality
            + WEIGHT_CONSENSUS * consensus_margin
            + WEIGHT_HISTORY * history_consistency;

        let risky = input.requires_shadow_audit || risk_points > 0.0;

        let decision = if !consensus_ok || confidence < self.config.review_band {
            if reasons.is_empty() {
                reasons.push(format!("combined confidence {confidence:.2} below band"));
            }
            AuditDecision::NeedsReview
        } else {
            if reasons.is_empty() {
                reasons.push("within policy and vendor history".to_string());
            }
            AuditDecision::Approved
        };

        Verdict {
            decision,
            reasons,
            confidence,
            risky,
            votes,
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn input(amount: Decimal, category: &str, trusted: bool) -> AuditInput {
        AuditInput {
            text: "ordinary invoice".to_string(),
            vendor: "Vendor".to_string(),
            category: category.to_string(),
            category_label: String::new(),
            amount,
            proposal_confidence: if trusted { 0.95 } else { 0.72 },
            rule_trusted: trusted,
            matched_gray_rule: None,
            requires_shadow_audit: false,
            vendor_blocked: false,
            history: VendorHistory::default(),
        }
    }

    fn auditor() -> AuditorAgent {
        AuditorAgent::new(AuditConfig::default())
    }

    #[test]
    fn test_clean_trusted_proposal_approved() {
        let verdict = auditor().audit(&input(dec!(500), "6602-03", true), 0);
        assert_eq!(verdict.decision, AuditDecision::Approved);
        assert!(!verdict.risky);
        assert!(verdict.confidence >= 0.75);
    }

    #[test]
    fn test_red_line_short_circuits_regardless_of_tally() {
        let mut subject = input(dec!(100), "6601-01", true);
        subject.text = "差旅 奢侈品 采购".to_string();
        let verdict = auditor().audit(&subject, 0);
        assert_eq!(verdict.decision, AuditDecision::Rejected);
        assert!(verdict.reasons[0].contains("CRITICAL"));
    }

    #[test]
    fn test_blocked_vendor_rejected() {
        let mut subject = input(dec!(100), "6601-01", true);
        subject.vendor_blocked = true;
        let verdict = auditor().audit(&subject, 0);
        assert_eq!(verdict.decision, AuditDecision::Rejected);
    }

    #[test]
    fn test_absolute_cap_rejected() {
        let verdict = auditor().audit(&input(dec!(2_000_000), "6601-01", true), 0);
        assert_eq!(verdict.decision, AuditDecision::Rejected);
    }

    #[test]
    fn test_large_untrusted_amount_needs_review() {
        // 120k from an unknown vendor at confidence 0.72: above tier 1,
        // finance escalates, proposal lands in review.
        let verdict = auditor().audit(&input(dec!(120_000), "6604-01", false), 0);
        assert_eq!(verdict.decision, AuditDecision::NeedsReview);
    }

    #[test]
    fn test_history_deviation_adds_risk() {
        let mut subject = input(dec!(5_000), "6604-01", true);
        subject.history = VendorHistory::new(vec![
            ("6602-03".to_string(), dec!(50), 0),
            ("6602-03".to_string(), dec!(55), 0),
            ("6602-03".to_string(), dec!(45), 0),
        ]);
        let verdict = auditor().audit(&subject, 86_400_000);
        // Tax judge fails and history deviates twice over: review, flagged.
        assert_eq!(verdict.decision, AuditDecision::NeedsReview);
        assert!(verdict.risky);
    }

    #[test]
    fn test_strict_strategy_requires_unanimity() {
        let config = AuditConfig {
            strategy: AuditStrategy::Strict,
            ..AuditConfig::default()
        };
        let auditor = AuditorAgent::new(config);

        // Finance escalates above tier 1 for untrusted proposals; under
        // STRICT one failed judge is enough for review.
        let verdict = auditor.audit(&input(dec!(120_000), "6601-01", false), 0);
        assert_eq!(verdict.decision, AuditDecision::NeedsReview);
    }

    #[test]
    fn test_shadow_audit_flag_marks_risky() {
        let mut subject = input(dec!(100), "6601-01", false);
        subject.matched_gray_rule = Some(9);
        subject.requires_shadow_audit = true;
        let verdict = auditor().audit(&subject, 0);
        assert!(verdict.risky);
    }

    #[test]
    fn test_determinism() {
        let subject = input(dec!(777), "6601-01", true);
        let auditor = auditor();
        let first = auditor.audit(&subject, 123);
        let second = auditor.audit(&subject, 123);
        assert_eq!(first.decision, second.decision);
        assert!((first.confidence - second.confidence).abs() < f64::EPSILON);
        assert_eq!(first.reasons, second.reasons);
    }
}
