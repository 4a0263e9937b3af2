//! Classification: documents in, proposed entries out.
//!
//! Routing is two-tiered. L1 is the rule engine fed by the knowledge
//! bridge; L2 is the external reason-act tier behind the egress proxy,
//! invoked when no rule matches or when a vendor has been force-upgraded
//! after repeated low-confidence L1 outcomes. A circuit breaker and the
//! token budget can degrade the router to L1-only mode, in which unmatched
//! documents fall back to a low-confidence proposal that downstream audit
//! sends to review.

mod breaker;
mod cache;
mod l2;
mod router;

pub use breaker::CircuitBreaker;
pub use cache::{ResponseCache, cache_key};
pub use l2::{L2Decision, L2Error, ToolConnector, run_session};
pub use router::{CompiledRule, MatchPath, RuleSet};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::AccountingConfig;
use crate::egress::EgressProxy;
use crate::model::{AuditLevel, InferenceLog, InferenceStep, Rule};
use crate::trace::TraceContext;

/// Account code proposed when the router is degraded and nothing matched.
/// Audit always routes it to review.
pub const FALLBACK_CATEGORY: &str = "6999";

/// A parsed document ready for classification.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    /// Originating trace.
    pub trace: TraceContext,
    /// Extracted text (OCR output or statement line).
    pub text: String,
    /// Vendor hint, when the parser extracted one.
    pub vendor: String,
    /// Signed amount.
    pub amount: Decimal,
    /// Business event time.
    pub occurred_at: i64,
    /// Multimodal group, if any.
    pub group_id: Option<String>,
}

/// A proposed classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Proposed account code.
    pub category: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Rule that matched, if routed through L1.
    pub matched_rule: Option<i64>,
    /// Ordered reasoning record, persisted with the entry.
    pub inference_log: InferenceLog,
    /// Mandatory extra audit when a grey rule matched or confidence is low.
    pub requires_shadow_audit: bool,
}

#[derive(Debug, Default)]
struct UpgradeState {
    low_confidence_streak: u32,
    last_seen_ms: i64,
}

/// The rule-routed classifier with its L2 escape hatch.
pub struct AccountingAgent {
    config: AccountingConfig,
    rules: RwLock<Arc<RuleSet>>,
    cache: Mutex<ResponseCache>,
    breaker: Mutex<CircuitBreaker>,
    upgrades: Mutex<HashMap<String, UpgradeState>>,
    l2: Option<(Arc<EgressProxy>, Arc<dyn ToolConnector>)>,
}

impl std::fmt::Debug for AccountingAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountingAgent")
            .field("l2_enabled", &self.l2.is_some())
            .finish_non_exhaustive()
    }
}

impl AccountingAgent {
    /// Create an agent. Passing `None` for the L2 pair pins the router to
    /// L1-only mode regardless of configuration.
    #[must_use]
    pub fn new(
        config: AccountingConfig,
        l2: Option<(Arc<EgressProxy>, Arc<dyn ToolConnector>)>,
    ) -> Self {
        let cache_ttl_ms = i64::try_from(config.cache_ttl_s).unwrap_or(3_600) * 1_000;
        let window_ms = i64::try_from(config.circuit_window_s).unwrap_or(300) * 1_000;
        let cooloff_ms = i64::try_from(config.circuit_cooloff_s).unwrap_or(600) * 1_000;
        Self {
            cache: Mutex::new(ResponseCache::new(config.cache_capacity, cache_ttl_ms)),
            breaker: Mutex::new(CircuitBreaker::new(
                window_ms,
                config.circuit_threshold,
                cooloff_ms,
            )),
            rules: RwLock::new(RuleSet::build(Vec::new())),
            upgrades: Mutex::new(HashMap::new()),
            l2,
            config,
        }
    }

    /// Swap in a freshly built rule snapshot. Readers never block on the
    /// rebuild; they keep the previous snapshot until the swap.
    pub fn refresh_rules(&self, rules: Vec<Rule>) {
        let snapshot = RuleSet::build(rules);
        tracing::debug!(rules = snapshot.len(), "rule snapshot refreshed");
        *self.rules.write().expect("rules lock") = snapshot;
    }

    /// Classify one document.
    ///
    /// Never fails: when both tiers are unavailable the result is a
    /// low-confidence fallback proposal flagged for shadow audit.
    #[must_use]
    pub fn classify(&self, doc: &DocumentInput, now_ms: i64) -> Proposal {
        let mut steps = vec![InferenceStep {
            step: 1,
            action: "input_analysis".to_string(),
            result: format!("vendor={} amount={}", doc.vendor, doc.amount),
        }];

        let forced_upgrade = self.upgrade_forced(&doc.vendor, now_ms);
        steps.push(InferenceStep {
            step: 2,
            action: "routing".to_string(),
            result: if forced_upgrade {
                "vendor force-upgraded to L2".to_string()
            } else {
                "L1 first".to_string()
            },
        });

        if !forced_upgrade {
            let snapshot = Arc::clone(&self.rules.read().expect("rules lock"));
            if let Some((compiled, path)) = snapshot.find(&doc.text, doc.amount, &doc.vendor) {
                return self.l1_proposal(doc, &compiled.rule, path, steps, now_ms);
            }
            steps.push(InferenceStep {
                step: 3,
                action: "rule_match".to_string(),
                result: "no rule matched".to_string(),
            });
        }

        match self.try_l2(doc, now_ms) {
            Some(decision) => {
                let mut log_steps = steps;
                let offset = u32::try_from(log_steps.len()).unwrap_or(0);
                log_steps.extend(decision.steps.iter().map(|s| InferenceStep {
                    step: s.step + offset,
                    action: s.action.clone(),
                    result: s.result.clone(),
                }));
                let requires_shadow = decision.confidence < self.config.shadow_threshold;
                Proposal {
                    category: decision.category,
                    confidence: decision.confidence,
                    matched_rule: None,
                    inference_log: InferenceLog {
                        engine: "L2".to_string(),
                        rule_id: None,
                        confidence: decision.confidence,
                        steps: log_steps,
                    },
                    requires_shadow_audit: requires_shadow,
                }
            }
            None => {
                steps.push(InferenceStep {
                    step: u32::try_from(steps.len()).unwrap_or(0) + 1,
                    action: "degraded".to_string(),
                    result: "L2 unavailable; falling back to review".to_string(),
                });
                Proposal {
                    category: FALLBACK_CATEGORY.to_string(),
                    confidence: 0.3,
                    matched_rule: None,
                    inference_log: InferenceLog {
                        engine: "L1-degraded".to_string(),
                        rule_id: None,
                        confidence: 0.3,
                        steps,
                    },
                    requires_shadow_audit: true,
                }
            }
        }
    }

    fn l1_proposal(
        &self,
        doc: &DocumentInput,
        rule: &Rule,
        path: MatchPath,
        mut steps: Vec<InferenceStep>,
        now_ms: i64,
    ) -> Proposal {
        let is_gray = rule.audit_level == AuditLevel::Gray;
        let confidence = if rule.audit_level.is_trusted() {
            self.config.trusted_confidence
        } else {
            self.config.gray_confidence
        };

        steps.push(InferenceStep {
            step: u32::try_from(steps.len()).unwrap_or(0) + 1,
            action: "rule_match".to_string(),
            result: format!(
                "rule {} ({}) via {}",
                rule.rule_id,
                rule.audit_level,
                match path {
                    MatchPath::Fast => "fast path",
                    MatchPath::Full => "full scan",
                }
            ),
        });
        steps.push(InferenceStep {
            step: u32::try_from(steps.len()).unwrap_or(0) + 1,
            action: "confidence_scoring".to_string(),
            result: format!("{confidence:.2}"),
        });

        let requires_shadow = is_gray || confidence < self.config.shadow_threshold;
        self.record_l1_outcome(&doc.vendor, requires_shadow, now_ms);

        Proposal {
            category: rule.proposed_category.clone(),
            confidence,
            matched_rule: Some(rule.rule_id),
            inference_log: InferenceLog {
                engine: "L1".to_string(),
                rule_id: Some(rule.rule_id),
                confidence,
                steps,
            },
            requires_shadow_audit: requires_shadow,
        }
    }

    /// Run L2 if it is enabled, wired, not broken, and within budget.
    fn try_l2(&self, doc: &DocumentInput, now_ms: i64) -> Option<L2Decision> {
        if !self.config.l2_enabled {
            return None;
        }
        let (proxy, tools) = self.l2.as_ref()?;
        if self.breaker.lock().expect("breaker lock").is_open(now_ms) {
            tracing::debug!(trace_id = %doc.trace.trace_id, "L2 circuit open; degraded mode");
            return None;
        }
        if proxy.budget().check(now_ms).is_err() {
            tracing::warn!(trace_id = %doc.trace.trace_id, "token budget spent; degraded mode");
            return None;
        }

        let amount = doc.amount.to_string();
        let prompt = l2::render_prompt(&doc.text, &amount, &[]);
        let key = cache_key(&self.config.l2_model, &prompt);
        if let Some(cached) = self.cache.lock().expect("cache lock").get(&key, now_ms) {
            tracing::debug!(trace_id = %doc.trace.trace_id, "L2 response cache hit");
            return Some(L2Decision {
                category: cached.category,
                confidence: cached.confidence,
                steps: cached.inference_log.steps,
            });
        }

        let result = run_session(
            proxy,
            tools.as_ref(),
            &self.config.l2_model,
            &self.config.l2_destination,
            &doc.trace,
            &doc.text,
            &amount,
            self.config.l2_step_cap,
        );

        match result {
            Ok(decision) => {
                self.breaker.lock().expect("breaker lock").record_success();
                self.cache.lock().expect("cache lock").put(
                    key,
                    Proposal {
                        category: decision.category.clone(),
                        confidence: decision.confidence,
                        matched_rule: None,
                        inference_log: InferenceLog {
                            engine: "L2".to_string(),
                            rule_id: None,
                            confidence: decision.confidence,
                            steps: decision.steps.clone(),
                        },
                        requires_shadow_audit: decision.confidence
                            < self.config.shadow_threshold,
                    },
                    now_ms,
                );
                Some(decision)
            }
            Err(e) => {
                tracing::warn!(trace_id = %doc.trace.trace_id, error = %e, "L2 session failed");
                self.breaker
                    .lock()
                    .expect("breaker lock")
                    .record_failure(now_ms);
                None
            }
        }
    }

    fn upgrade_forced(&self, vendor: &str, now_ms: i64) -> bool {
        if self.l2.is_none() || !self.config.l2_enabled {
            return false;
        }
        let cooldown_ms = i64::try_from(self.config.upgrade_cooldown_s).unwrap_or(3_600) * 1_000;
        let upgrades = self.upgrades.lock().expect("upgrade lock");
        upgrades.get(vendor).is_some_and(|state| {
            state.low_confidence_streak >= self.config.upgrade_after
                && now_ms - state.last_seen_ms <= cooldown_ms
        })
    }

    fn record_l1_outcome(&self, vendor: &str, low_confidence: bool, now_ms: i64) {
        let mut upgrades = self.upgrades.lock().expect("upgrade lock");
        let state = upgrades.entry(vendor.to_string()).or_default();
        if low_confidence {
            state.low_confidence_streak += 1;
        } else {
            state.low_confidence_streak = 0;
        }
        state.last_seen_ms = now_ms;
    }

    /// `(hits, misses)` of the L2 response cache.
    #[must_use]
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.lock().expect("cache lock").stats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::config::{EgressConfig, PrivacyConfig};
    use crate::egress::{
        EgressError, InferenceProvider, InferenceRequest, InferenceResponse, TokenBudget,
    };
    use crate::model::{RuleConditions, RuleSource};
    use crate::privacy::PrivacyGuard;

    struct ScriptedProvider {
        script: StdMutex<Vec<Result<String, ()>>>,
        calls: StdMutex<u32>,
    }

    impl InferenceProvider for ScriptedProvider {
        fn complete(&self, _request: &InferenceRequest) -> Result<InferenceResponse, EgressError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(EgressError::Provider("script exhausted".to_string()));
            }
            match script.remove(0) {
                Ok(content) => Ok(InferenceResponse {
                    content,
                    input_tokens: 10,
                    output_tokens: 10,
                }),
                Err(()) => Err(EgressError::Provider("injected failure".to_string())),
            }
        }
    }

    struct NoTools;

    impl ToolConnector for NoTools {
        fn web_lookup(&self, _query: &str) -> Result<String, EgressError> {
            Ok(String::new())
        }
        fn browser_fetch(&self, _url: &str) -> Result<String, EgressError> {
            Ok(String::new())
        }
        fn ask_user(&self, _question: &str) -> Result<String, EgressError> {
            Ok(String::new())
        }
    }

    fn rule(id: i64, keyword: &str, category: &str, level: AuditLevel) -> Rule {
        Rule {
            rule_id: id,
            keyword_pattern: keyword.to_string(),
            is_regex: false,
            conditions: RuleConditions::default(),
            proposed_category: category.to_string(),
            priority: 10,
            audit_level: level,
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

    fn doc(text: &str, vendor: &str, amount: rust_decimal::Decimal) -> DocumentInput {
        DocumentInput {
            trace: TraceContext::new("accountant"),
            text: text.to_string(),
            vendor: vendor.to_string(),
            amount,
            occurred_at: 0,
            group_id: None,
        }
    }

    fn agent_with_script(script: Vec<Result<String, ()>>) -> (AccountingAgent, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider {
            script: StdMutex::new(script),
            calls: StdMutex::new(0),
        });
        let egress = EgressConfig {
            allowlist: vec!["inference.internal".to_string()],
            ..EgressConfig::default()
        };
        let proxy = Arc::new(EgressProxy::new(
            &egress,
            PrivacyGuard::new(&PrivacyConfig::default()),
            Arc::clone(&provider) as Arc<dyn InferenceProvider>,
            Arc::new(TokenBudget::new(1_000_000, 1_000_000)),
        ));
        let config = AccountingConfig {
            circuit_threshold: 2,
            ..AccountingConfig::default()
        };
        let agent = AccountingAgent::new(config, Some((proxy, Arc::new(NoTools))));
        (agent, provider)
    }

    #[test]
    fn test_stable_rule_high_confidence() {
        let (agent, _) = agent_with_script(Vec::new());
        agent.refresh_rules(vec![rule(1, "Starbucks", "6602-03", AuditLevel::Stable)]);

        let proposal = agent.classify(&doc("Starbucks", "Starbucks", dec!(500)), 0);
        assert_eq!(proposal.category, "6602-03");
        assert!(proposal.confidence >= 0.9);
        assert_eq!(proposal.matched_rule, Some(1));
        assert!(!proposal.requires_shadow_audit);
        assert_eq!(proposal.inference_log.engine, "L1");
    }

    #[test]
    fn test_gray_rule_flags_shadow_audit() {
        let (agent, _) = agent_with_script(Vec::new());
        agent.refresh_rules(vec![rule(1, "Didi", "6601-02", AuditLevel::Gray)]);

        let proposal = agent.classify(&doc("Didi trip", "Didi", dec!(45)), 0);
        assert_eq!(proposal.category, "6601-02");
        assert!(proposal.requires_shadow_audit);
    }

    #[test]
    fn test_l2_on_rule_miss() {
        let (agent, provider) = agent_with_script(vec![Ok(
            r#"{"action": "decide", "category": "6604-01", "confidence": 0.72, "reason": "tech services"}"#
                .to_string(),
        )]);
        agent.refresh_rules(Vec::new());

        let proposal = agent.classify(&doc("Unknown Vendor invoice", "Unknown Vendor", dec!(120_000)), 0);
        assert_eq!(proposal.category, "6604-01");
        assert_eq!(proposal.inference_log.engine, "L2");
        assert!(proposal.requires_shadow_audit);
        assert_eq!(*provider.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_cache_suppresses_duplicate_l2_calls() {
        let (agent, provider) = agent_with_script(vec![Ok(
            r#"{"action": "decide", "category": "6604-01", "confidence": 0.8}"#.to_string(),
        )]);
        agent.refresh_rules(Vec::new());

        let document = doc("Same invoice text", "V", dec!(10));
        let first = agent.classify(&document, 0);
        let second = agent.classify(&document, 1);
        assert_eq!(first.category, second.category);
        assert_eq!(*provider.calls.lock().unwrap(), 1);
        assert_eq!(agent.cache_stats().0, 1);
    }

    #[test]
    fn test_breaker_degrades_to_review_fallback() {
        let (agent, provider) = agent_with_script(vec![Err(()), Err(())]);
        agent.refresh_rules(Vec::new());

        // Two failures trip the breaker (threshold 2).
        let first = agent.classify(&doc("doc one", "V1", dec!(1)), 0);
        let second = agent.classify(&doc("doc two", "V2", dec!(1)), 10);
        assert_eq!(first.category, FALLBACK_CATEGORY);
        assert!(second.requires_shadow_audit);

        // Third call: breaker open, provider never reached.
        let calls_before = *provider.calls.lock().unwrap();
        let third = agent.classify(&doc("doc three", "V3", dec!(1)), 20);
        assert_eq!(third.category, FALLBACK_CATEGORY);
        assert_eq!(third.inference_log.engine, "L1-degraded");
        assert_eq!(*provider.calls.lock().unwrap(), calls_before);
    }

    #[test]
    fn test_vendor_upgrade_after_low_confidence_streak() {
        let decide = r#"{"action": "decide", "category": "6604-02", "confidence": 0.85}"#;
        let (agent, provider) = agent_with_script(vec![Ok(decide.to_string())]);
        agent.refresh_rules(vec![rule(1, "Vague Vendor", "6601-01", AuditLevel::Gray)]);

        // Three grey (low confidence) L1 outcomes build the streak.
        for round in 0..3 {
            let proposal = agent.classify(&doc("Vague Vendor bill", "Vague Vendor", dec!(10)), round);
            assert_eq!(proposal.inference_log.engine, "L1");
        }
        assert_eq!(*provider.calls.lock().unwrap(), 0);

        // Fourth document from the same vendor skips L1 entirely.
        let proposal = agent.classify(&doc("Vague Vendor bill 4", "Vague Vendor", dec!(10)), 100);
        assert_eq!(proposal.inference_log.engine, "L2");
        assert_eq!(proposal.category, "6604-02");
        assert_eq!(*provider.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_l2_disabled_by_config() {
        let provider = Arc::new(ScriptedProvider {
            script: StdMutex::new(Vec::new()),
            calls: StdMutex::new(0),
        });
        let egress = EgressConfig {
            allowlist: vec!["inference.internal".to_string()],
            ..EgressConfig::default()
        };
        let proxy = Arc::new(EgressProxy::new(
            &egress,
            PrivacyGuard::new(&PrivacyConfig::default()),
            Arc::clone(&provider) as Arc<dyn InferenceProvider>,
            Arc::new(TokenBudget::new(1_000_000, 1_000_000)),
        ));
        let config = AccountingConfig {
            l2_enabled: false,
            ..AccountingConfig::default()
        };
        let agent = AccountingAgent::new(config, Some((proxy, Arc::new(NoTools))));
        agent.refresh_rules(Vec::new());

        let proposal = agent.classify(&doc("anything", "V", dec!(1)), 0);
        assert_eq!(proposal.category, FALLBACK_CATEGORY);
        assert_eq!(*provider.calls.lock().unwrap(), 0);
    }
}
