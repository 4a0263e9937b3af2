//! L1 rule engine.
//!
//! Rules are compiled into an immutable snapshot ordered by priority
//! descending, then specificity (longer keyword, narrower amount range).
//! Two matching paths: a fast exact-keyword map for plain rules, and a full
//! scan evaluating regexes and conditions.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use rust_decimal::Decimal;

use crate::model::{AuditLevel, Rule};

/// One compiled rule.
#[derive(Debug)]
pub struct CompiledRule {
    /// The source rule.
    pub rule: Rule,
    regex: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, text: &str, amount: Decimal, vendor: &str) -> bool {
        let keyword_hit = match &self.regex {
            Some(regex) => regex.is_match(text),
            None => text.contains(self.rule.keyword_pattern.as_str()),
        };
        keyword_hit && self.rule.conditions.matches(amount, vendor)
    }
}

/// How a rule was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPath {
    /// Exact-keyword hash lookup.
    Fast,
    /// Ordered regex/condition scan.
    Full,
}

/// Immutable compiled rule snapshot. Rebuilt on change and swapped
/// atomically by the holder.
#[derive(Debug)]
pub struct RuleSet {
    ordered: Vec<CompiledRule>,
    fast: HashMap<String, usize>,
}

impl RuleSet {
    /// Compile active rules into a snapshot.
    ///
    /// `FAILED` and `BLOCKED` rules never match; a malformed regex disables
    /// its rule rather than poisoning the snapshot.
    #[must_use]
    pub fn build(rules: Vec<Rule>) -> Arc<Self> {
        let mut matchable: Vec<Rule> = rules
            .into_iter()
            .filter(|rule| {
                matches!(
                    rule.audit_level,
                    AuditLevel::Gray | AuditLevel::Stable | AuditLevel::Manual
                )
            })
            .collect();

        matchable.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.keyword_pattern.len().cmp(&a.keyword_pattern.len()))
                .then_with(|| range_width(a).cmp(&range_width(b)))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });

        let mut ordered = Vec::with_capacity(matchable.len());
        let mut fast = HashMap::new();
        for rule in matchable {
            let regex = if rule.is_regex {
                match Regex::new(&rule.keyword_pattern) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        tracing::warn!(
                            rule_id = rule.rule_id,
                            error = %e,
                            "rule regex failed to compile; rule disabled"
                        );
                        continue;
                    }
                }
            } else {
                None
            };

            let index = ordered.len();
            if !rule.is_regex && rule.conditions.is_empty() {
                fast.entry(rule.keyword_pattern.clone()).or_insert(index);
            }
            ordered.push(CompiledRule { rule, regex });
        }

        Arc::new(Self { ordered, fast })
    }

    /// Match a document against the snapshot.
    ///
    /// The fast path requires the text to equal a plain keyword exactly;
    /// otherwise rules are scanned in snapshot order and the first hit wins.
    #[must_use]
    pub fn find(
        &self,
        text: &str,
        amount: Decimal,
        vendor: &str,
    ) -> Option<(&CompiledRule, MatchPath)> {
        if let Some(&index) = self.fast.get(text) {
            return Some((&self.ordered[index], MatchPath::Fast));
        }
        self.ordered
            .iter()
            .find(|compiled| compiled.matches(text, amount, vendor))
            .map(|compiled| (compiled, MatchPath::Full))
    }

    /// Number of matchable rules in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Width of the amount range, for specificity ordering. Unbounded rules get
/// the widest width.
fn range_width(rule: &Rule) -> Decimal {
    match (rule.conditions.amount_min, rule.conditions.amount_max) {
        (Some(min), Some(max)) => max - min,
        _ => Decimal::MAX,
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::model::{RuleConditions, RuleSource};

    fn rule(id: i64, keyword: &str, category: &str, priority: i64) -> Rule {
        Rule {
            rule_id: id,
            keyword_pattern: keyword.to_string(),
            is_regex: false,
            conditions: RuleConditions::default(),
            proposed_category: category.to_string(),
            priority,
            audit_level: AuditLevel::Stable,
            hit_count: 0,
            reject_count: 0,
            consecutive_success: 0,
            version: 1,
            valid_until: None,
            source: RuleSource::Seed,
            tenant_id: None,
            inserted_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_fast_path_exact_keyword() {
        let set = RuleSet::build(vec![rule(1, "Starbucks", "6602-03", 10)]);
        let (hit, path) = set.find("Starbucks", dec!(500), "Starbucks").unwrap();
        assert_eq!(hit.rule.proposed_category, "6602-03");
        assert_eq!(path, MatchPath::Fast);
    }

    #[test]
    fn test_full_path_substring() {
        let set = RuleSet::build(vec![rule(1, "Cloud", "6604-01", 10)]);
        let (hit, path) = set
            .find("ACME Cloud Inc. monthly invoice", dec!(4980), "ACME Cloud Inc.")
            .unwrap();
        assert_eq!(hit.rule.proposed_category, "6604-01");
        assert_eq!(path, MatchPath::Full);
    }

    #[test]
    fn test_priority_then_specificity_order() {
        let mut broad = rule(1, "Cloud", "1111", 5);
        broad.priority = 5;
        let narrow = rule(2, "ACME Cloud", "2222", 5);
        let high = rule(3, "Cloud", "3333", 20);

        let set = RuleSet::build(vec![broad, narrow, high]);
        // Highest priority first.
        let (hit, _) = set.find("ACME Cloud services", dec!(1), "ACME").unwrap();
        assert_eq!(hit.rule.proposed_category, "3333");

        // Same priority: the longer keyword wins.
        let set = RuleSet::build(vec![rule(1, "Cloud", "1111", 5), rule(2, "ACME Cloud", "2222", 5)]);
        let (hit, _) = set.find("ACME Cloud services", dec!(1), "ACME").unwrap();
        assert_eq!(hit.rule.proposed_category, "2222");
    }

    #[test]
    fn test_conditions_gate_the_match() {
        let mut conditional = rule(1, "Didi", "6601-02", 10);
        conditional.conditions = RuleConditions {
            amount_max: Some(dec!(200)),
            ..RuleConditions::default()
        };
        let fallback = rule(2, "Didi", "6601-09", 1);

        let set = RuleSet::build(vec![conditional, fallback]);
        let (hit, _) = set.find("Didi trip", dec!(150), "Didi").unwrap();
        assert_eq!(hit.rule.proposed_category, "6601-02");
        let (hit, _) = set.find("Didi trip", dec!(900), "Didi").unwrap();
        assert_eq!(hit.rule.proposed_category, "6601-09");
    }

    #[test]
    fn test_regex_rules() {
        let mut re_rule = rule(1, r"(?i)starbucks|costa", "6602-03", 10);
        re_rule.is_regex = true;
        let set = RuleSet::build(vec![re_rule]);
        assert!(set.find("STARBUCKS receipt", dec!(1), "x").is_some());
        assert!(set.find("Luckin receipt", dec!(1), "x").is_none());
    }

    #[test]
    fn test_failed_and_blocked_never_match() {
        let mut failed = rule(1, "Scam", "6699-01", 10);
        failed.audit_level = AuditLevel::Failed;
        let mut blocked = rule(2, "Scam", "6699-01", 10);
        blocked.audit_level = AuditLevel::Blocked;

        let set = RuleSet::build(vec![failed, blocked]);
        assert!(set.is_empty());
        assert!(set.find("Scam vendor", dec!(1), "Scam").is_none());
    }

    #[test]
    fn test_bad_regex_disables_only_that_rule() {
        let mut bad = rule(1, "(unclosed", "1111", 99);
        bad.is_regex = true;
        let good = rule(2, "Cloud", "2222", 1);
        let set = RuleSet::build(vec![bad, good]);
        assert_eq!(set.len(), 1);
        assert!(set.find("Cloud bill", dec!(1), "x").is_some());
    }
}
