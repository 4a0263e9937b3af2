//! Configuration module.
//!
//! [`LedgerConfig`] is loaded from a TOML file and then overridden by
//! environment variables prefixed `LEDGER_`, mapped onto dotted keys
//! (`LEDGER_STORE_BUSY_TIMEOUT_MS` → `store.busy_timeout_ms`). Workers hold a
//! shared snapshot and observe a reload at their next idle point.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Filesystem locations.
    pub paths: PathsConfig,
    /// Embedded store tuning.
    pub store: StoreConfig,
    /// Daemon supervision timings.
    pub daemon: DaemonConfig,
    /// Collector pool and parse limits.
    pub collector: CollectorConfig,
    /// Audit policy.
    pub audit: AuditConfig,
    /// Classifier and L2 budgets.
    pub accounting: AccountingConfig,
    /// Reconciliation thresholds.
    #[serde(rename = "match")]
    pub matching: MatchConfig,
    /// Interaction card policy.
    pub interaction: InteractionConfig,
    /// Egress proxy policy.
    pub egress: EgressConfig,
    /// Privacy redaction keywords.
    pub privacy: PrivacyConfig,
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Drop folder watched by the collector.
    pub input_dir: PathBuf,
    /// Store file; WAL lives alongside it.
    pub store_file: PathBuf,
    /// Sibling directory holding `snapshot-<id>-<ts>` copies.
    pub snapshot_dir: PathBuf,
    /// Local rules file kept in sync by the knowledge bridge.
    pub rules_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data/inbox"),
            store_file: PathBuf::from("data/ledger.db"),
            snapshot_dir: PathBuf::from("data/snapshots"),
            rules_file: PathBuf::from("data/rules.json"),
        }
    }
}

/// Embedded store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite busy timeout.
    pub busy_timeout_ms: u64,
    /// `PRAGMA synchronous` mode.
    pub sync_mode: SyncMode,
    /// Page cache size.
    pub cache_mb: u64,
    /// Writer retries on a busy store before giving up.
    pub retry_count: u32,
    /// Base delay for the busy-retry backoff.
    pub retry_base_ms: u64,
    /// Advisory entry locks older than this are claimable.
    pub lock_timeout_s: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            sync_mode: SyncMode::Normal,
            cache_mb: 16,
            retry_count: 5,
            retry_base_ms: 100,
            lock_timeout_s: 300,
        }
    }
}

/// `PRAGMA synchronous` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fsync at critical moments only.
    Normal,
    /// Fsync on every commit.
    Full,
    /// No fsync; test use only.
    Off,
}

impl SyncMode {
    /// The PRAGMA value.
    #[must_use]
    pub const fn as_pragma(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
            Self::Off => "OFF",
        }
    }
}

/// Daemon supervision timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Grace period before force-terminating workers on shutdown.
    pub grace_shutdown_s: u64,
    /// Heartbeat staleness threshold.
    pub health_timeout_s: u64,
    /// Logical probe response deadline.
    pub probe_timeout_s: u64,
    /// Boot deadline for the initial ALIVE heartbeat of each worker.
    pub boot_timeout_s: u64,
    /// Health check cadence.
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
    /// Store checkpoint cadence.
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
    /// Rows re-verified per sliding-window chain check.
    pub verify_window: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            grace_shutdown_s: 5,
            health_timeout_s: 60,
            probe_timeout_s: 5,
            boot_timeout_s: 30,
            health_interval: Duration::from_secs(10),
            checkpoint_interval: Duration::from_secs(60),
            verify_window: 256,
        }
    }
}

/// Collector pool and parse limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Parser worker pool size.
    pub workers: u32,
    /// Wall-clock budget per file.
    pub per_file_timeout_s: u64,
    /// Multimodal grouping window.
    pub group_window_s: u64,
    /// Bounded parse queue depth.
    pub queue_depth: u32,
    /// Directory re-scan cadence.
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            per_file_timeout_s: 30,
            group_window_s: 60,
            queue_depth: 64,
            scan_interval: Duration::from_secs(60),
        }
    }
}

/// Voting strategy for the audit consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStrategy {
    /// All three judges must pass.
    Strict,
    /// Two of three suffice.
    Balanced,
    /// One pass suffices; rejections still veto via CRITICAL.
    Growth,
}

/// Audit policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Voting strategy.
    pub strategy: AuditStrategy,
    /// First escalation tier (stricter scrutiny above).
    pub amount_tier1: rust_decimal::Decimal,
    /// Red-line keywords; any hit is a CRITICAL veto.
    pub red_lines: Vec<String>,
    /// Proposals below this confidence go to review.
    pub review_band: f64,
    /// Category-distribution deviation adding risk points.
    pub history_deviation: f64,
    /// Price deviation ratio vs the decayed mean adding risk points.
    pub price_deviation: f64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            strategy: AuditStrategy::Balanced,
            amount_tier1: rust_decimal::Decimal::new(50_000, 0),
            red_lines: vec!["奢侈品".to_string(), "礼品卡".to_string()],
            review_band: 0.80,
            history_deviation: 0.6,
            price_deviation: 3.0,
        }
    }
}

/// Classifier and L2 budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Whether the L2 tier may be invoked at all.
    pub l2_enabled: bool,
    /// Model requested from the inference provider.
    pub l2_model: String,
    /// Destination host for L2 calls; must be on the egress allow list.
    pub l2_destination: String,
    /// Reason-act loop step cap.
    pub l2_step_cap: u32,
    /// Aggregate L2 wall-clock budget per document.
    pub l2_timeout_s: u64,
    /// Daily token budget.
    pub token_budget_daily: u64,
    /// Monthly token budget.
    pub token_budget_monthly: u64,
    /// Response cache TTL.
    pub cache_ttl_s: u64,
    /// Response cache capacity.
    pub cache_capacity: usize,
    /// Circuit breaker failure window.
    pub circuit_window_s: u64,
    /// Failures within the window that trip the breaker.
    pub circuit_threshold: u32,
    /// Cool-off before the breaker closes again.
    pub circuit_cooloff_s: u64,
    /// Confidence assigned to trusted-rule matches.
    pub trusted_confidence: f64,
    /// Confidence assigned to grey-rule matches.
    pub gray_confidence: f64,
    /// Proposals below this confidence are flagged for shadow audit.
    pub shadow_threshold: f64,
    /// Consecutive low-confidence L1 outcomes forcing a vendor upgrade.
    pub upgrade_after: u32,
    /// Vendor upgrade cooldown.
    pub upgrade_cooldown_s: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            l2_enabled: true,
            l2_model: "ledger-reasoner-1".to_string(),
            l2_destination: "inference.internal".to_string(),
            l2_step_cap: 5,
            l2_timeout_s: 60,
            token_budget_daily: 200_000,
            token_budget_monthly: 4_000_000,
            cache_ttl_s: 3_600,
            cache_capacity: 512,
            circuit_window_s: 300,
            circuit_threshold: 5,
            circuit_cooloff_s: 600,
            trusted_confidence: 0.95,
            gray_confidence: 0.70,
            shadow_threshold: 0.90,
            upgrade_after: 3,
            upgrade_cooldown_s: 3_600,
        }
    }
}

/// Reconciliation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Absolute amount tolerance for candidate selection.
    pub tolerance: rust_decimal::Decimal,
    /// Temporal candidate window.
    pub window_days: i64,
    /// Combined score at or above which a pair is MATCHED.
    pub auto_threshold: f64,
    /// Lower edge of the batch-suggestion band.
    pub suggest_threshold: f64,
    /// Post matched entries without user confirmation.
    pub auto_post: bool,
    /// Batch page size for the reconciliation loop.
    pub page_size: u32,
    /// Unmatched flows older than this trigger an evidence request.
    pub evidence_after_h: i64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            tolerance: rust_decimal::Decimal::new(1, 2),
            window_days: 7,
            auto_threshold: 0.90,
            suggest_threshold: 0.60,
            auto_post: false,
            page_size: 100,
            evidence_after_h: 48,
        }
    }
}

/// Interaction card policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionConfig {
    /// Card validity.
    pub card_ttl_s: u64,
    /// Accepted callback timestamp skew.
    pub replay_window_s: u64,
    /// Shared secret for card tokens and the webhook signature.
    pub callback_secret: String,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            card_ttl_s: 86_400,
            replay_window_s: 60,
            callback_secret: String::new(),
        }
    }
}

/// Egress proxy policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Destinations requests may be sent to.
    pub allowlist: Vec<String>,
    /// Dispatch retries before an event is FAILED.
    pub max_retries: u32,
    /// Base delay for the dispatch backoff.
    pub backoff_base_ms: u64,
    /// Network deadline per request.
    pub request_timeout_s: u64,
    /// Undelivered events at or above this raise a self-monitoring alert.
    pub backlog_alert: u32,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            max_retries: 5,
            backoff_base_ms: 500,
            request_timeout_s: 30,
            backlog_alert: 100,
        }
    }
}

/// Privacy redaction keywords.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Substrings redacted wherever they appear.
    pub keywords: Vec<String>,
    /// Keywords whose presence masks the whole payload.
    pub escalation_keywords: Vec<String>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            keywords: vec!["薪资".to_string(), "法人借款".to_string()],
            escalation_keywords: vec!["融资".to_string(), "收购".to_string()],
        }
    }
}

impl LedgerConfig {
    /// Load from a TOML file, then apply `LEDGER_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: Box::new(source),
        })?;
        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }

    /// Apply `LEDGER_`-prefixed overrides from an arbitrary variable set.
    ///
    /// Variables map onto dotted keys by lowercasing and splitting on the
    /// first underscore: `LEDGER_STORE_BUSY_TIMEOUT_MS` →
    /// `store.busy_timeout_ms`. Unknown or unparsable values are logged and
    /// skipped; an override never aborts startup.
    pub fn apply_env_overrides(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix("LEDGER_") else {
                continue;
            };
            if !self.apply_override(&rest.to_ascii_lowercase(), &value) {
                tracing::warn!(key = %key, "ignoring unknown configuration override");
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn apply_override(&mut self, key: &str, value: &str) -> bool {
        fn set<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
            match value.parse::<T>() {
                Ok(parsed) => {
                    *slot = parsed;
                    true
                }
                Err(_) => false,
            }
        }

        match key {
            "store_busy_timeout_ms" => set(&mut self.store.busy_timeout_ms, value),
            "store_cache_mb" => set(&mut self.store.cache_mb, value),
            "store_retry_count" => set(&mut self.store.retry_count, value),
            "store_retry_base_ms" => set(&mut self.store.retry_base_ms, value),
            "store_lock_timeout_s" => set(&mut self.store.lock_timeout_s, value),
            "store_sync_mode" => match value.to_ascii_lowercase().as_str() {
                "normal" => {
                    self.store.sync_mode = SyncMode::Normal;
                    true
                }
                "full" => {
                    self.store.sync_mode = SyncMode::Full;
                    true
                }
                "off" => {
                    self.store.sync_mode = SyncMode::Off;
                    true
                }
                _ => false,
            },
            "daemon_grace_shutdown_s" => set(&mut self.daemon.grace_shutdown_s, value),
            "daemon_health_timeout_s" => set(&mut self.daemon.health_timeout_s, value),
            "daemon_probe_timeout_s" => set(&mut self.daemon.probe_timeout_s, value),
            "daemon_boot_timeout_s" => set(&mut self.daemon.boot_timeout_s, value),
            "collector_workers" => set(&mut self.collector.workers, value),
            "collector_per_file_timeout_s" => set(&mut self.collector.per_file_timeout_s, value),
            "collector_group_window_s" => set(&mut self.collector.group_window_s, value),
            "audit_strategy" => match value.to_ascii_uppercase().as_str() {
                "STRICT" => {
                    self.audit.strategy = AuditStrategy::Strict;
                    true
                }
                "BALANCED" => {
                    self.audit.strategy = AuditStrategy::Balanced;
                    true
                }
                "GROWTH" => {
                    self.audit.strategy = AuditStrategy::Growth;
                    true
                }
                _ => false,
            },
            "audit_amount_tier1" => set(&mut self.audit.amount_tier1, value),
            "accounting_l2_enabled" => set(&mut self.accounting.l2_enabled, value),
            "accounting_l2_step_cap" => set(&mut self.accounting.l2_step_cap, value),
            "accounting_l2_timeout_s" => set(&mut self.accounting.l2_timeout_s, value),
            "accounting_token_budget_daily" => set(&mut self.accounting.token_budget_daily, value),
            "accounting_token_budget_monthly" => {
                set(&mut self.accounting.token_budget_monthly, value)
            }
            "accounting_cache_ttl_s" => set(&mut self.accounting.cache_ttl_s, value),
            "accounting_circuit_window_s" => set(&mut self.accounting.circuit_window_s, value),
            "match_tolerance" => set(&mut self.matching.tolerance, value),
            "match_window_days" => set(&mut self.matching.window_days, value),
            "match_auto_threshold" => set(&mut self.matching.auto_threshold, value),
            "match_auto_post" => set(&mut self.matching.auto_post, value),
            "interaction_card_ttl_s" => set(&mut self.interaction.card_ttl_s, value),
            "interaction_replay_window_s" => set(&mut self.interaction.replay_window_s, value),
            "interaction_callback_secret" => {
                self.interaction.callback_secret = value.to_string();
                true
            }
            "egress_allowlist" => {
                self.egress.allowlist =
                    value.split(',').map(|s| s.trim().to_string()).collect();
                true
            }
            "egress_max_retries" => set(&mut self.egress.max_retries, value),
            "egress_backoff_base_ms" => set(&mut self.egress.backoff_base_ms, value),
            "paths_input_dir" => {
                self.paths.input_dir = PathBuf::from(value);
                true
            }
            "paths_store_file" => {
                self.paths.store_file = PathBuf::from(value);
                true
            }
            "paths_snapshot_dir" => {
                self.paths.snapshot_dir = PathBuf::from(value);
                true
            }
            "paths_rules_file" => {
                self.paths.rules_file = PathBuf::from(value);
                true
            }
            _ => false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration at {path:?}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file could not be parsed.
    #[error("failed to parse configuration at {path:?}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: Box<toml::de::Error>,
    },
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
