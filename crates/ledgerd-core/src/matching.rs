//! Match engine: reconciles pending bank/payment flows against ledger
//! entries.
//!
//! Candidate selection pairs amounts within tolerance inside a temporal
//! window, with an in-memory amount prefilter to suppress cross-joins on
//! large ledgers. Scoring combines amount equality, fuzzy counterparty
//! similarity, temporal proximity, and a multimodal group bonus. The engine
//! never posts on its own unless `match.auto_post` is set; matched pairs
//! wait for user confirmation.

use std::collections::HashSet;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::config::MatchConfig;
use crate::model::{LedgerEntry, PendingEntry, PendingStatus};
use crate::store::{Store, StoreError};

/// Scoring weights. Name similarity saturates at the strong-match
/// threshold so a confident fuzzy hit is not penalized for imperfect
/// string distance.
const WEIGHT_AMOUNT: f64 = 0.60;
const WEIGHT_NAME: f64 = 0.30;
const WEIGHT_TIME: f64 = 0.10;
const GROUP_BONUS: f64 = 0.05;

/// Counterparty similarity at or above this counts as a full name match.
const STRONG_SIMILARITY: f64 = 0.80;

/// One scored candidate pair.
#[derive(Debug, Clone)]
pub struct ScoredPair {
    /// The pending entry.
    pub pending_id: i64,
    /// The ledger entry.
    pub entry_id: i64,
    /// Combined score in `[0, 1]`.
    pub score: f64,
}

/// Result of one reconciliation batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Pairs marked `MATCHED`, awaiting confirmation (or auto-posted).
    pub matched: Vec<ScoredPair>,
    /// Intermediate-band pairs to surface on a batch card.
    pub suggestions: Vec<ScoredPair>,
    /// Pending entries scanned.
    pub scanned: u32,
}

/// Normalized token-level similarity of two names, in `[0, 1]`.
///
/// Lowercases, splits on whitespace and punctuation, rejoins, and measures
/// a longest-common-subsequence ratio (`2 * lcs / (len_a + len_b)`), which
/// tracks the classic sequence-matcher ratio closely for vendor strings.
#[must_use]
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let lcs = lcs_len(&a_chars, &b_chars);
    #[allow(clippy::cast_precision_loss)]
    {
        2.0 * lcs as f64 / (a_chars.len() + b_chars.len()) as f64
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut previous = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            current[j + 1] = if ca == cb {
                previous[j] + 1
            } else {
                previous[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Combined score of one candidate pair.
#[must_use]
pub fn score_pair(
    pending: &PendingEntry,
    entry: &LedgerEntry,
    config: &MatchConfig,
) -> f64 {
    let amount_ok = (pending.amount.abs() - entry.amount.abs()).abs() <= config.tolerance;
    if !amount_ok {
        return 0.0;
    }

    let similarity = name_similarity(&pending.counterparty, &entry.vendor);
    let name_score = (similarity / STRONG_SIMILARITY).min(1.0);

    let window_ms = config.window_days * 86_400_000;
    let distance = (pending.occurred_at - entry.occurred_at).abs();
    if distance > window_ms {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let time_score = 1.0 - (distance as f64) / (2.0 * window_ms as f64);

    let bonus = if entry.group_id.is_some() { GROUP_BONUS } else { 0.0 };

    (WEIGHT_AMOUNT + WEIGHT_NAME * name_score + WEIGHT_TIME * time_score + bonus).min(1.0)
}

/// Coarse in-memory amount prefilter: integer-bucketed amounts of all
/// candidate entries. Rejects most pending rows without a store query.
#[derive(Debug, Default)]
pub struct AmountFilter {
    buckets: HashSet<i64>,
}

impl AmountFilter {
    /// Build from the amounts of candidate entries.
    #[must_use]
    pub fn build<'a>(amounts: impl Iterator<Item = &'a Decimal>) -> Self {
        let mut buckets = HashSet::new();
        for amount in amounts {
            buckets.insert(bucket(*amount));
        }
        Self { buckets }
    }

    /// Whether any candidate could lie within tolerance of `amount`.
    #[must_use]
    pub fn may_match(&self, amount: Decimal) -> bool {
        let b = bucket(amount);
        self.buckets.contains(&b)
            || self.buckets.contains(&(b - 1))
            || self.buckets.contains(&(b + 1))
    }
}

fn bucket(amount: Decimal) -> i64 {
    amount.abs().to_i64().unwrap_or(i64::MAX)
}

/// The reconciliation engine. Pure decisions live in [`score_pair`]; this
/// type drives paging and writes outcomes back through the store.
#[derive(Debug, Clone)]
pub struct MatchEngine {
    store: Store,
    config: MatchConfig,
}

impl MatchEngine {
    /// Create an engine over the store.
    #[must_use]
    pub const fn new(store: Store, config: MatchConfig) -> Self {
        Self { store, config }
    }

    /// Reconcile one page of unreconciled pending entries.
    ///
    /// Pairs at or above `auto_threshold` are marked `MATCHED` (and their
    /// entries posted outright when `auto_post` is set); the intermediate
    /// band is returned as suggestions for a batch card.
    ///
    /// # Errors
    ///
    /// Returns an error on a store failure.
    pub fn run_batch(&self, offset: u32) -> Result<BatchReport, StoreError> {
        let pending = self.store.pending_entries_page(
            PendingStatus::Unreconciled,
            self.config.page_size,
            offset,
        )?;
        let mut report = BatchReport {
            scanned: u32::try_from(pending.len()).unwrap_or(u32::MAX),
            ..BatchReport::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let window_ms = self.config.window_days * 86_400_000;
        let from = pending.iter().map(|p| p.occurred_at).min().unwrap_or(0) - window_ms;
        let to = pending.iter().map(|p| p.occurred_at).max().unwrap_or(0) + window_ms;

        // One window-wide candidate load per page, prefiltered in memory.
        let candidates = self.store.posted_candidates(
            Decimal::ZERO,
            Decimal::MAX,
            from,
            to,
        )?;
        let filter = AmountFilter::build(candidates.iter().map(|entry| &entry.amount));

        for shadow in &pending {
            if !filter.may_match(shadow.amount) {
                continue;
            }

            let mut best: Option<ScoredPair> = None;
            for entry in &candidates {
                let score = score_pair(shadow, entry, &self.config);
                if score <= 0.0 {
                    continue;
                }
                if best.as_ref().map_or(true, |b| score > b.score) {
                    best = Some(ScoredPair {
                        pending_id: shadow.id,
                        entry_id: entry.id,
                        score,
                    });
                }
            }

            let Some(pair) = best else { continue };
            if pair.score >= self.config.auto_threshold {
                self.store.set_pending_status(
                    shadow.id,
                    PendingStatus::Matched,
                    Some(pair.entry_id),
                )?;
                if self.config.auto_post {
                    self.store.batch_confirm(&[shadow.id])?;
                }
                tracing::info!(
                    pending_id = shadow.id,
                    entry_id = pair.entry_id,
                    score = pair.score,
                    "pair matched"
                );
                report.matched.push(pair);
            } else if pair.score >= self.config.suggest_threshold {
                report.suggestions.push(pair);
            }
        }

        Ok(report)
    }

    /// Unmatched pending entries older than the evidence window, for the
    /// proactive evidence hunter.
    ///
    /// # Errors
    ///
    /// Returns an error on a store failure.
    pub fn stale_flows(&self, now_ms: i64) -> Result<Vec<PendingEntry>, StoreError> {
        let cutoff = now_ms - self.config.evidence_after_h * 3_600_000;
        self.store.stale_unreconciled(cutoff)
    }
}
