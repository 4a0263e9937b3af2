//! Amount normalization.
//!
//! Statement exports decorate amounts with currency glyphs, thousands
//! separators and stray whitespace. Everything becomes a fixed-point
//! [`Decimal`] before it touches the store.

use std::str::FromStr;

use rust_decimal::Decimal;

/// Characters stripped before parsing.
const DECORATIONS: &[char] = &['¥', '￥', '$', '€', ',', '＋', ' ', '\u{a0}', '元'];

/// Parse a decorated amount string into a `Decimal`.
///
/// Returns `None` for empty or non-numeric input; a zero amount parses as
/// zero (callers decide whether to skip it).
#[must_use]
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !DECORATIONS.contains(c))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

/// Parse a statement timestamp into epoch milliseconds, treating naive
/// times as UTC. Accepts `YYYY-MM-DD HH:MM:SS`, `YYYY/MM/DD HH:MM:SS` and
/// bare dates.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    for format in [
        "%Y-%m-%d %H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, format) {
            return Some(
                date.and_hms_opt(0, 0, 0)?
                    .and_utc()
                    .timestamp_millis(),
            );
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_strips_currency_glyphs() {
        assert_eq!(parse_amount("¥4,980.00"), Some(dec!(4980.00)));
        assert_eq!(parse_amount("￥500"), Some(dec!(500)));
        assert_eq!(parse_amount(" -1,234.56 元"), Some(dec!(-1234.56)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount("¥"), None);
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(
            parse_timestamp("2026-01-02 00:00:00"),
            parse_timestamp("2026-01-02")
        );
        assert!(parse_timestamp("2026/01/02 08:30:00").is_some());
        assert!(parse_timestamp("soon").is_none());
    }
}
