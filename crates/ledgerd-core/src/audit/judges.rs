//! The three audit judges.
//!
//! Each judge evaluates one facet of a proposal through a common contract.
//! A judge can flag its verdict CRITICAL, which overrides any vote tally.

use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::Decimal;

use super::AuditInput;
use crate::config::AuditConfig;

fn account_code() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}(-\d{2})?$").expect("static pattern"))
}

/// The judge roles. A closed set: dispatch is a `match`, not a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Judge {
    /// Keywords, red lines, and account-code form.
    Compliance,
    /// Amount-tier escalation.
    Finance,
    /// Vendor-vs-category plausibility.
    Tax,
}

/// Verdict of one judge.
#[derive(Debug, Clone)]
pub struct JudgeVerdict {
    /// Who voted.
    pub judge: Judge,
    /// Whether the facet passed.
    pub passed: bool,
    /// A critical verdict forces rejection regardless of the tally.
    pub critical: bool,
    /// Human-readable reason.
    pub reason: String,
}

impl Judge {
    /// All judges, in evaluation order.
    pub const ALL: [Self; 3] = [Self::Compliance, Self::Finance, Self::Tax];

    /// Evaluate one facet of the proposal.
    #[must_use]
    pub fn evaluate(self, input: &AuditInput, config: &AuditConfig) -> JudgeVerdict {
        match self {
            Self::Compliance => Self::compliance(input, config),
            Self::Finance => Self::finance(input, config),
            Self::Tax => Self::tax(input),
        }
    }

    fn compliance(input: &AuditInput, config: &AuditConfig) -> JudgeVerdict {
        for red_line in &config.red_lines {
            if red_line.is_empty() {
                continue;
            }
            let hit = input.text.contains(red_line.as_str())
                || input.vendor.contains(red_line.as_str())
                || input.category_label.contains(red_line.as_str());
            if hit {
                return JudgeVerdict {
                    judge: Self::Compliance,
                    passed: false,
                    critical: true,
                    reason: format!("red-line keyword '{red_line}'"),
                };
            }
        }

        if !account_code().is_match(&input.category) {
            return JudgeVerdict {
                judge: Self::Compliance,
                passed: false,
                critical: false,
                reason: format!("malformed account code {}", input.category),
            };
        }

        JudgeVerdict {
            judge: Self::Compliance,
            passed: true,
            critical: false,
            reason: "no red lines".to_string(),
        }
    }

    fn finance(input: &AuditInput, config: &AuditConfig) -> JudgeVerdict {
        let amount = input.amount.abs();
        let tier1 = config.amount_tier1;
        let extreme = tier1 * Decimal::from(10);

        if amount > extreme {
            return JudgeVerdict {
                judge: Self::Finance,
                passed: false,
                critical: false,
                reason: format!("amount {amount} above extreme tier {extreme}"),
            };
        }
        if amount > tier1 {
            // Above tier 1 the bar tightens: only trusted-rule proposals
            // pass without review.
            let passed = input.rule_trusted && input.proposal_confidence >= 0.9;
            return JudgeVerdict {
                judge: Self::Finance,
                passed,
                critical: false,
                reason: format!("amount {amount} above tier {tier1}"),
            };
        }
        JudgeVerdict {
            judge: Self::Finance,
            passed: true,
            critical: false,
            reason: "within linear tier".to_string(),
        }
    }

    fn tax(input: &AuditInput) -> JudgeVerdict {
        match input.history.dominant_category() {
            Some((dominant, share)) if share >= 0.6 && dominant != input.category => JudgeVerdict {
                judge: Self::Tax,
                passed: false,
                critical: false,
                reason: format!("vendor usually books to {dominant} ({share:.0}% of history)"),
            },
            _ => JudgeVerdict {
                judge: Self::Tax,
                passed: true,
                critical: false,
                reason: "plausible for vendor".to_string(),
            },
        }
    }
}
