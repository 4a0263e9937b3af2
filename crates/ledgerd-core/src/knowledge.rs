//! Knowledge bridge: the rule lifecycle.
//!
//! Rules move `GRAY → STABLE` after consecutive clean audit approvals,
//! `GRAY → FAILED` after repeated rejections, and user corrections enter
//! `STABLE` directly. Promotions and demotions never rewrite a rule in
//! place: the old version is expired with `valid_until` and a successor row
//! is inserted, so historical entries stay attributable to the version that
//! matched them.
//!
//! The active trusted set is mirrored to a local rules file, but only after
//! the proposed category passes syntactic validation.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{AuditLevel, Rule, RuleConditions, RuleSource};
use crate::store::{Store, StoreError};

/// Consecutive clean approvals required for `GRAY → STABLE`.
pub const PROMOTE_AFTER: i64 = 3;

/// Rejections at which a `GRAY` rule is demoted to `FAILED`.
pub const DEMOTE_AFTER: i64 = 2;

/// Account codes are `NNNN` or `NNNN-NN`.
fn account_code() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}(-\d{2})?$").expect("static pattern"))
}

/// Knowledge bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    /// The proposed category fails syntactic validation.
    #[error("invalid account code: {0}")]
    InvalidCategory(String),

    /// The rules file could not be written or verified.
    #[error("rules file sync failed: {0}")]
    FileSync(String),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fields of a rule being learned.
#[derive(Debug, Clone)]
pub struct LearnFields {
    /// Literal keyword (or regex source when `is_regex`).
    pub keyword: String,
    /// Proposed account code.
    pub category: String,
    /// Whether the keyword is a regex.
    pub is_regex: bool,
    /// Extra predicates.
    pub conditions: RuleConditions,
    /// Match priority.
    pub priority: i64,
}

/// One line of the mirrored rules file.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct FileRule {
    keyword: String,
    category: String,
    priority: i64,
}

/// Rule lifecycle manager over the store.
#[derive(Debug, Clone)]
pub struct KnowledgeBridge {
    store: Store,
    rules_path: PathBuf,
}

impl KnowledgeBridge {
    /// Create a bridge writing its mirror to `rules_path`.
    #[must_use]
    pub fn new(store: Store, rules_path: PathBuf) -> Self {
        Self { store, rules_path }
    }

    /// Record an audit approval of the rule.
    ///
    /// Increments hit and consecutive-success counters; a `GRAY` rule that
    /// reaches [`PROMOTE_AFTER`] consecutive approvals with zero rejections
    /// is promoted to `STABLE` and the mirror is re-synced. Returns the rule
    /// id now active for the keyword.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule is missing or the update fails.
    pub fn record_hit(&self, rule_id: i64) -> Result<i64, KnowledgeError> {
        let rule = self.store.rule(rule_id)?;
        let hits = rule.hit_count + 1;
        let streak = rule.consecutive_success + 1;
        self.store
            .update_rule_feedback(rule_id, hits, rule.reject_count, streak)?;

        if rule.audit_level == AuditLevel::Gray
            && streak >= PROMOTE_AFTER
            && rule.reject_count == 0
        {
            let promoted = self.store.supersede_rule(rule_id, AuditLevel::Stable)?;
            tracing::info!(
                rule_id,
                promoted,
                keyword = %rule.keyword_pattern,
                "rule promoted to STABLE after consecutive clean approvals"
            );
            self.sync_to_file()?;
            return Ok(promoted);
        }
        Ok(rule_id)
    }

    /// Record an audit rejection of the rule.
    ///
    /// Resets the success streak; a `GRAY` rule reaching [`DEMOTE_AFTER`]
    /// rejections is demoted to `FAILED` and never matched again. Returns
    /// the rule id now active for the keyword.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule is missing or the update fails.
    pub fn record_reject(&self, rule_id: i64) -> Result<i64, KnowledgeError> {
        let rule = self.store.rule(rule_id)?;
        let rejects = rule.reject_count + 1;
        self.store
            .update_rule_feedback(rule_id, rule.hit_count, rejects, 0)?;

        if rule.audit_level == AuditLevel::Gray && rejects >= DEMOTE_AFTER {
            let demoted = self.store.supersede_rule(rule_id, AuditLevel::Failed)?;
            tracing::warn!(
                rule_id,
                demoted,
                keyword = %rule.keyword_pattern,
                "rule demoted to FAILED after repeated rejections"
            );
            return Ok(demoted);
        }
        Ok(rule_id)
    }

    /// Learn a rule from a user correction or an L2 decision.
    ///
    /// `MANUAL` rules enter `STABLE` directly, replacing any active rule for
    /// the keyword. An `L2` rule enters `GRAY`; if a trusted rule already
    /// covers the keyword the newcomer is discarded and the trusted rule id
    /// is returned (stable rules are protected).
    ///
    /// # Errors
    ///
    /// Returns [`KnowledgeError::InvalidCategory`] before any write when the
    /// account code is malformed.
    pub fn learn(&self, fields: &LearnFields, source: RuleSource) -> Result<i64, KnowledgeError> {
        if !account_code().is_match(&fields.category) {
            return Err(KnowledgeError::InvalidCategory(fields.category.clone()));
        }

        let existing = self.store.active_rule_for_keyword(&fields.keyword)?;
        let level = match source {
            RuleSource::Manual => AuditLevel::Stable,
            RuleSource::L2 | RuleSource::Seed => AuditLevel::Gray,
        };

        if let Some(existing) = existing {
            if level == AuditLevel::Gray && existing.audit_level.is_trusted() {
                tracing::debug!(
                    keyword = %fields.keyword,
                    existing = existing.rule_id,
                    "trusted rule already covers keyword; grey newcomer discarded"
                );
                return Ok(existing.rule_id);
            }
            self.store.expire_rule(existing.rule_id)?;
        }

        let rule_id = self.store.insert_rule(
            &fields.keyword,
            fields.is_regex,
            &fields.conditions,
            &fields.category,
            fields.priority,
            level,
            source,
        )?;
        tracing::info!(
            rule_id,
            keyword = %fields.keyword,
            level = %level,
            "rule learned"
        );

        if level.is_trusted() {
            self.sync_to_file()?;
        }
        Ok(rule_id)
    }

    /// Remove grey rules that conflict with a trusted rule on the same
    /// keyword. Trusted rules are never removed. Returns how many grey
    /// rules were dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule query or delete fails.
    pub fn distill(&self) -> Result<u32, KnowledgeError> {
        let rules = self.store.active_rules()?;
        let mut removed = 0;
        for rule in &rules {
            if rule.audit_level != AuditLevel::Gray {
                continue;
            }
            let conflicting = rules.iter().any(|other| {
                other.rule_id != rule.rule_id
                    && other.audit_level.is_trusted()
                    && other.keyword_pattern == rule.keyword_pattern
                    && other.proposed_category != rule.proposed_category
            });
            if conflicting {
                self.store.delete_rule(rule.rule_id)?;
                removed += 1;
                tracing::info!(
                    rule_id = rule.rule_id,
                    keyword = %rule.keyword_pattern,
                    "conflicting grey rule removed by distillation"
                );
            }
        }
        Ok(removed)
    }

    /// Drop `GRAY` rules with zero hits older than `days_old` days.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn cleanup_stale_rules(&self, days_old: i64) -> Result<u32, KnowledgeError> {
        let cutoff = crate::model::now_ms() - days_old * 86_400_000;
        Ok(self.store.delete_stale_gray_rules(cutoff)?)
    }

    /// All active rules, priority-descending, for the classifier snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn active_rules(&self) -> Result<Vec<Rule>, KnowledgeError> {
        Ok(self.store.active_rules()?)
    }

    /// Mirror the trusted rule set to the local rules file.
    ///
    /// The previous file is backed up first; after writing, the file is read
    /// back and compared. A verification failure restores the backup and
    /// surfaces an error.
    ///
    /// # Errors
    ///
    /// Returns [`KnowledgeError::FileSync`] on any I/O or verification
    /// failure.
    pub fn sync_to_file(&self) -> Result<(), KnowledgeError> {
        let trusted: Vec<FileRule> = self
            .store
            .active_rules()?
            .into_iter()
            .filter(|rule| rule.audit_level.is_trusted() && !rule.is_regex)
            .map(|rule| FileRule {
                keyword: rule.keyword_pattern,
                category: rule.proposed_category,
                priority: rule.priority,
            })
            .collect();

        if let Some(parent) = self.rules_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| KnowledgeError::FileSync(e.to_string()))?;
            }
        }

        let backup = self.rules_path.with_extension("bak");
        let had_previous = self.rules_path.exists();
        if had_previous {
            std::fs::copy(&self.rules_path, &backup)
                .map_err(|e| KnowledgeError::FileSync(format!("backup failed: {e}")))?;
        }

        let serialized = serde_json::to_string_pretty(&trusted)
            .map_err(|e| KnowledgeError::FileSync(e.to_string()))?;
        let write_and_verify = || -> Result<(), KnowledgeError> {
            std::fs::write(&self.rules_path, &serialized)
                .map_err(|e| KnowledgeError::FileSync(format!("write failed: {e}")))?;
            let read_back = std::fs::read_to_string(&self.rules_path)
                .map_err(|e| KnowledgeError::FileSync(format!("read-back failed: {e}")))?;
            let parsed: Vec<FileRule> = serde_json::from_str(&read_back)
                .map_err(|e| KnowledgeError::FileSync(format!("read-back parse failed: {e}")))?;
            if parsed != trusted {
                return Err(KnowledgeError::FileSync(
                    "read-back verification mismatch".to_string(),
                ));
            }
            Ok(())
        };

        let result = write_and_verify();
        if result.is_err() && had_previous {
            let _ = std::fs::copy(&backup, &self.rules_path);
        }
        if had_previous {
            let _ = std::fs::remove_file(&backup);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::StoreConfig;

    fn bridge(dir: &TempDir) -> KnowledgeBridge {
        let store = Store::open(dir.path().join("ledger.db"), &StoreConfig::default()).unwrap();
        KnowledgeBridge::new(store, dir.path().join("rules.json"))
    }

    fn fields(keyword: &str, category: &str) -> LearnFields {
        LearnFields {
            keyword: keyword.to_string(),
            category: category.to_string(),
            is_regex: false,
            conditions: RuleConditions::default(),
            priority: 10,
        }
    }

    #[test]
    fn test_three_clean_approvals_promote() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        let rule_id = bridge.learn(&fields("Starbucks", "6602-03"), RuleSource::L2).unwrap();

        assert_eq!(bridge.record_hit(rule_id).unwrap(), rule_id);
        assert_eq!(bridge.record_hit(rule_id).unwrap(), rule_id);
        let promoted = bridge.record_hit(rule_id).unwrap();
        assert_ne!(promoted, rule_id);

        let active = bridge.store.active_rule_for_keyword("Starbucks").unwrap().unwrap();
        assert_eq!(active.rule_id, promoted);
        assert_eq!(active.audit_level, AuditLevel::Stable);
        assert!(bridge.store.rule(rule_id).unwrap().valid_until.is_some());
    }

    #[test]
    fn test_rejection_blocks_promotion() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        let rule_id = bridge.learn(&fields("Didi", "6601-02"), RuleSource::L2).unwrap();

        bridge.record_hit(rule_id).unwrap();
        bridge.record_reject(rule_id).unwrap();
        // Streak restarts, and a past rejection blocks auto-promotion.
        bridge.record_hit(rule_id).unwrap();
        bridge.record_hit(rule_id).unwrap();
        assert_eq!(bridge.record_hit(rule_id).unwrap(), rule_id);

        let rule = bridge.store.rule(rule_id).unwrap();
        assert_eq!(rule.audit_level, AuditLevel::Gray);
    }

    #[test]
    fn test_two_rejections_demote_to_failed() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        let rule_id = bridge.learn(&fields("Scam Co", "6699-01"), RuleSource::L2).unwrap();

        bridge.record_reject(rule_id).unwrap();
        let demoted = bridge.record_reject(rule_id).unwrap();
        assert_ne!(demoted, rule_id);

        let active = bridge.store.active_rule_for_keyword("Scam Co").unwrap().unwrap();
        assert_eq!(active.audit_level, AuditLevel::Failed);
    }

    #[test]
    fn test_manual_learn_enters_stable() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        let rule_id = bridge
            .learn(&fields("Consulting Partner", "6603-01"), RuleSource::Manual)
            .unwrap();

        let rule = bridge.store.rule(rule_id).unwrap();
        assert_eq!(rule.audit_level, AuditLevel::Stable);
        assert!(dir.path().join("rules.json").exists());
    }

    #[test]
    fn test_stable_protected_from_grey_newcomer() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        let stable = bridge
            .learn(&fields("Starbucks", "6602-03"), RuleSource::Manual)
            .unwrap();

        // L2 tries to relearn the same keyword with a different category.
        let returned = bridge.learn(&fields("Starbucks", "6601-01"), RuleSource::L2).unwrap();
        assert_eq!(returned, stable);

        let active = bridge.store.active_rule_for_keyword("Starbucks").unwrap().unwrap();
        assert_eq!(active.proposed_category, "6602-03");
    }

    #[test]
    fn test_distillation_removes_conflicting_grey() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);

        // Grey first, then a manual correction for the same keyword family
        // inserted under a different keyword spelling.
        let grey = bridge.learn(&fields("AWS", "6601-01"), RuleSource::L2).unwrap();
        bridge.store.insert_rule(
            "AWS",
            false,
            &RuleConditions::default(),
            "6604-02",
            10,
            AuditLevel::Stable,
            RuleSource::Manual,
        )
        .unwrap();

        let removed = bridge.distill().unwrap();
        assert_eq!(removed, 1);
        assert!(bridge.store.rule(grey).is_err());

        let active = bridge.store.active_rule_for_keyword("AWS").unwrap().unwrap();
        assert_eq!(active.audit_level, AuditLevel::Stable);
    }

    #[test]
    fn test_invalid_category_rejected_before_write() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        let err = bridge
            .learn(&fields("Vendor", "notacode"), RuleSource::Manual)
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::InvalidCategory(_)));
        assert!(bridge.store.active_rule_for_keyword("Vendor").unwrap().is_none());
    }

    #[test]
    fn test_sync_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        bridge.learn(&fields("A", "1001"), RuleSource::Manual).unwrap();
        bridge.learn(&fields("B", "6601-01"), RuleSource::Manual).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("rules.json")).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_cleanup_stale_rules() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);
        bridge.learn(&fields("Never Hit", "6601-01"), RuleSource::L2).unwrap();

        // Nothing is stale yet.
        assert_eq!(bridge.cleanup_stale_rules(30).unwrap(), 0);
        // With a cutoff in the future everything unhit is stale.
        assert_eq!(bridge.cleanup_stale_rules(-1).unwrap(), 1);
    }
}
