//! Vendor history statistics for the consistency check.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Prior posted entries of a vendor: `(category, amount, occurred_at)`.
#[derive(Debug, Clone, Default)]
pub struct VendorHistory {
    entries: Vec<(String, Decimal, i64)>,
}

impl VendorHistory {
    /// Wrap prior entries.
    #[must_use]
    pub fn new(entries: Vec<(String, Decimal, i64)>) -> Self {
        Self { entries }
    }

    /// Whether there is any history at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most common category and its share of history, if any.
    #[must_use]
    pub fn dominant_category(&self) -> Option<(String, f64)> {
        if self.entries.is_empty() {
            return None;
        }
        let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for (category, _, _) in &self.entries {
            *counts.entry(category.as_str()).or_default() += 1;
        }
        let (category, count) = counts.into_iter().max_by_key(|(_, count)| *count)?;
        #[allow(clippy::cast_precision_loss)]
        let share = count as f64 / self.entries.len() as f64;
        Some((category.to_string(), share))
    }

    /// Share of history booked to `category`, in `[0, 1]`.
    #[must_use]
    pub fn category_share(&self, category: &str) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let hits = self
            .entries
            .iter()
            .filter(|(c, _, _)| c == category)
            .count();
        #[allow(clippy::cast_precision_loss)]
        {
            hits as f64 / self.entries.len() as f64
        }
    }

    /// Time-decay weighted mean of absolute amounts, with weights
    /// `w_i = 1 / (1 + days_since_i)` relative to `now_ms`.
    #[must_use]
    pub fn decayed_mean_amount(&self, now_ms: i64) -> Option<f64> {
        if self.entries.is_empty() {
            return None;
        }
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (_, amount, occurred_at) in &self.entries {
            #[allow(clippy::cast_precision_loss)]
            let days_since = ((now_ms - occurred_at).max(0) as f64) / 86_400_000.0;
            let weight = 1.0 / (1.0 + days_since);
            let value = amount.abs().to_f64().unwrap_or(0.0);
            weighted_sum += value * weight;
            weight_total += weight;
        }
        if weight_total <= 0.0 {
            return None;
        }
        Some(weighted_sum / weight_total)
    }

    /// Ratio of `amount` to the decayed mean, or `None` without history.
    /// A ratio far from 1.0 in either direction is a deviation.
    #[must_use]
    pub fn price_deviation_ratio(&self, amount: Decimal, now_ms: i64) -> Option<f64> {
        let mean = self.decayed_mean_amount(now_ms)?;
        if mean <= f64::EPSILON {
            return None;
        }
        Some(amount.abs().to_f64().unwrap_or(0.0) / mean)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn test_dominant_category() {
        let history = VendorHistory::new(vec![
            ("A".to_string(), dec!(10), 0),
            ("A".to_string(), dec!(10), 0),
            ("B".to_string(), dec!(10), 0),
        ]);
        let (category, share) = history.dominant_category().unwrap();
        assert_eq!(category, "A");
        assert!((share - 2.0 / 3.0).abs() < 1e-9);
        assert!(VendorHistory::default().dominant_category().is_none());
    }

    #[test]
    fn test_recent_entries_weigh_more() {
        let now = 100 * DAY;
        // A recent expensive entry and an old cheap one.
        let history = VendorHistory::new(vec![
            ("A".to_string(), dec!(1000), now),
            ("A".to_string(), dec!(10), now - 99 * DAY),
        ]);
        let mean = history.decayed_mean_amount(now).unwrap();
        // The plain average is 505; the decayed mean leans to the recent 1000.
        assert!(mean > 900.0, "mean was {mean}");
    }

    #[test]
    fn test_price_deviation_ratio() {
        let now = 10 * DAY;
        let history = VendorHistory::new(vec![
            ("A".to_string(), dec!(100), now - DAY),
            ("A".to_string(), dec!(100), now - 2 * DAY),
        ]);
        let ratio = history.price_deviation_ratio(dec!(500), now).unwrap();
        assert!((ratio - 5.0).abs() < 0.1, "ratio was {ratio}");
        assert!(VendorHistory::default()
            .price_deviation_ratio(dec!(1), now)
            .is_none());
    }
}
