//! Rule table operations. Lifecycle decisions live in
//! [`crate::knowledge`]; this module only moves rows.

use rusqlite::{OptionalExtension, Row, params};

use super::{Store, StoreError};
use crate::model::{AuditLevel, Rule, RuleConditions, RuleSource, now_ms};

fn map_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
    let conditions: String = row.get("conditions")?;
    let audit_level: String = row.get("audit_level")?;
    let source: String = row.get("source")?;
    Ok(Rule {
        rule_id: row.get("rule_id")?,
        keyword_pattern: row.get("keyword_pattern")?,
        is_regex: row.get("is_regex")?,
        conditions: serde_json::from_str(&conditions).unwrap_or_default(),
        proposed_category: row.get("proposed_category")?,
        priority: row.get("priority")?,
        audit_level: AuditLevel::parse(&audit_level).unwrap_or(AuditLevel::Gray),
        hit_count: row.get("hit_count")?,
        reject_count: row.get("reject_count")?,
        consecutive_success: row.get("consecutive_success")?,
        version: row.get("version")?,
        valid_until: row.get("valid_until")?,
        source: RuleSource::parse(&source).unwrap_or(RuleSource::Seed),
        tenant_id: row.get("tenant_id")?,
        inserted_at: row.get("inserted_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const RULE_COLUMNS: &str = "rule_id, keyword_pattern, is_regex, conditions, proposed_category, \
     priority, audit_level, hit_count, reject_count, consecutive_success, version, \
     valid_until, source, tenant_id, inserted_at, updated_at";

impl Store {
    /// Insert a new rule row at version 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_rule(
        &self,
        keyword_pattern: &str,
        is_regex: bool,
        conditions: &RuleConditions,
        proposed_category: &str,
        priority: i64,
        audit_level: AuditLevel,
        source: RuleSource,
    ) -> Result<i64, StoreError> {
        let conditions = serde_json::to_string(conditions).map_err(|e| StoreError::Corrupt {
            column: "conditions",
            message: e.to_string(),
        })?;
        self.with_tx(|tx| {
            let now = now_ms();
            tx.execute(
                "INSERT INTO rules
                   (keyword_pattern, is_regex, conditions, proposed_category, priority,
                    audit_level, source, inserted_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    keyword_pattern,
                    is_regex,
                    conditions,
                    proposed_category,
                    priority,
                    audit_level.as_str(),
                    source.as_str(),
                    now,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Fetch a rule by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such rule exists.
    pub fn rule(&self, rule_id: i64) -> Result<Rule, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE rule_id = ?1"),
                params![rule_id],
                map_rule,
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "rule",
                key: rule_id.to_string(),
            })
        })
    }

    /// The active (non-superseded) rule for a keyword, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn active_rule_for_keyword(&self, keyword: &str) -> Result<Option<Rule>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {RULE_COLUMNS} FROM rules
                         WHERE keyword_pattern = ?1 AND valid_until IS NULL
                         ORDER BY version DESC LIMIT 1"
                    ),
                    params![keyword],
                    map_rule,
                )
                .optional()?)
        })
    }

    /// All active rules, ordered by priority descending.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn active_rules(&self) -> Result<Vec<Rule>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM rules WHERE valid_until IS NULL
                 ORDER BY priority DESC, rule_id ASC"
            ))?;
            let rows = stmt.query_map([], map_rule)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Update feedback counters on a rule.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such rule exists.
    pub fn update_rule_feedback(
        &self,
        rule_id: i64,
        hit_count: i64,
        reject_count: i64,
        consecutive_success: i64,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE rules
                 SET hit_count = ?1, reject_count = ?2, consecutive_success = ?3,
                     updated_at = ?4
                 WHERE rule_id = ?5",
                params![hit_count, reject_count, consecutive_success, now_ms(), rule_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "rule",
                    key: rule_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Supersede a rule with a new version at a different audit level.
    ///
    /// The old row gets `valid_until = now` so historical entries stay
    /// attributable; the new row carries the bumped version and reset
    /// feedback counters. Returns the new rule id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such rule exists.
    pub fn supersede_rule(
        &self,
        rule_id: i64,
        new_level: AuditLevel,
    ) -> Result<i64, StoreError> {
        self.with_tx(|tx| {
            let now = now_ms();
            let old = tx
                .query_row(
                    &format!("SELECT {RULE_COLUMNS} FROM rules WHERE rule_id = ?1"),
                    params![rule_id],
                    map_rule,
                )
                .optional()?
                .ok_or(StoreError::NotFound {
                    entity: "rule",
                    key: rule_id.to_string(),
                })?;

            tx.execute(
                "UPDATE rules SET valid_until = ?1, updated_at = ?1 WHERE rule_id = ?2",
                params![now, rule_id],
            )?;

            let conditions =
                serde_json::to_string(&old.conditions).map_err(|e| StoreError::Corrupt {
                    column: "conditions",
                    message: e.to_string(),
                })?;
            tx.execute(
                "INSERT INTO rules
                   (keyword_pattern, is_regex, conditions, proposed_category, priority,
                    audit_level, hit_count, reject_count, consecutive_success, version,
                    source, tenant_id, inserted_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11, ?12, ?12)",
                params![
                    old.keyword_pattern,
                    old.is_regex,
                    conditions,
                    old.proposed_category,
                    old.priority,
                    new_level.as_str(),
                    old.hit_count,
                    old.reject_count,
                    old.version + 1,
                    old.source.as_str(),
                    old.tenant_id,
                    now,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Expire a rule without a successor. Used when a user correction
    /// replaces a rule wholesale.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such rule exists.
    pub fn expire_rule(&self, rule_id: i64) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE rules SET valid_until = ?1, updated_at = ?1 WHERE rule_id = ?2",
                params![now_ms(), rule_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "rule",
                    key: rule_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Delete a rule row outright. Only the knowledge bridge calls this, and
    /// never for a `STABLE` or `MANUAL` rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_rule(&self, rule_id: i64) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM rules WHERE rule_id = ?1", params![rule_id])?;
            Ok(())
        })
    }

    /// Delete GRAY rules with no hits older than `cutoff_ms`. Returns the
    /// number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_stale_gray_rules(&self, cutoff_ms: i64) -> Result<u32, StoreError> {
        self.with_tx(|tx| {
            let removed = tx.execute(
                "DELETE FROM rules
                 WHERE audit_level = 'GRAY' AND hit_count = 0
                   AND valid_until IS NULL AND inserted_at < ?1",
                params![cutoff_ms],
            )?;
            Ok(u32::try_from(removed).unwrap_or(u32::MAX))
        })
    }
}
