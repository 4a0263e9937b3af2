//! Privacy guard module.
//!
//! Redacts sensitive substrings before a payload leaves the process. The
//! guard is an explicitly constructed service; the egress proxy applies it to
//! every outgoing message regardless of upstream sanitization, and the
//! interaction hub applies it to card payloads.
//!
//! Redactions are reported by category only. Raw values never appear in logs.

use std::collections::BTreeMap;

use regex::Regex;

use crate::config::PrivacyConfig;

/// Categories of redacted content, used for counting and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RedactionCategory {
    /// Mobile phone numbers.
    Phone,
    /// National id numbers.
    NationalId,
    /// Bank card numbers.
    BankCard,
    /// Configured sensitive keywords.
    Keyword,
    /// Whole-payload escalation.
    Escalated,
}

impl RedactionCategory {
    /// Stable label for log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::NationalId => "national_id",
            Self::BankCard => "bank_card",
            Self::Keyword => "keyword",
            Self::Escalated => "escalated",
        }
    }
}

/// Outcome of a sanitization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    /// The redacted text.
    pub text: String,
    /// Number of redactions per category.
    pub counts: BTreeMap<RedactionCategory, usize>,
}

impl Sanitized {
    /// Whether anything was redacted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.counts.is_empty()
    }

    /// Total redactions across categories.
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Sensitive-substring redactor.
///
/// Pattern classes: CN mobile numbers, national id numbers, bank card
/// numbers, and a configured keyword list. Payloads containing an
/// escalation keyword are masked wholesale instead of per-pattern.
#[derive(Debug)]
pub struct PrivacyGuard {
    phone: Regex,
    national_id: Regex,
    bank_card: Regex,
    keywords: Vec<String>,
    escalation_keywords: Vec<String>,
}

/// Placeholder substituted for a phone number.
pub const PHONE_MASK: &str = "[PHONE]";
/// Placeholder substituted for a national id.
pub const ID_MASK: &str = "[ID]";
/// Placeholder substituted for a bank card number.
pub const BANK_MASK: &str = "[BANK]";
/// Placeholder substituted for a keyword hit.
pub const KEYWORD_MASK: &str = "[REDACTED]";
/// Replacement for a wholesale-masked payload.
pub const ESCALATED_MASK: &str = "[SENSITIVE_CONTEXT_MASKED]";

/// The regex crate has no lookaround, so each pattern captures its own
/// one-character boundaries and the replacement restores them.
fn bounded(body: &str, post: &str) -> String {
    format!("(?P<pre>^|[^0-9])(?P<hit>{body})(?P<post>$|{post})")
}

impl PrivacyGuard {
    /// Build a guard from configuration.
    ///
    /// The built-in patterns are compiled here once; keyword lists are
    /// matched literally.
    #[must_use]
    pub fn new(config: &PrivacyConfig) -> Self {
        Self {
            phone: Regex::new(&bounded(r"1[3-9]\d{9}", "[^0-9]")).expect("static pattern"),
            national_id: Regex::new(&bounded(r"\d{17}[0-9Xx]|\d{15}", "[^0-9Xx]"))
                .expect("static pattern"),
            bank_card: Regex::new(&bounded(r"\d{16,19}", "[^0-9]")).expect("static pattern"),
            keywords: config.keywords.clone(),
            escalation_keywords: config.escalation_keywords.clone(),
        }
    }

    /// Redact `text`, returning the sanitized copy and per-category counts.
    ///
    /// Idempotent: running the output through the guard again yields the
    /// same text with zero new redactions.
    #[must_use]
    pub fn sanitize(&self, text: &str) -> Sanitized {
        let mut counts = BTreeMap::new();

        if let Some(keyword) = self
            .escalation_keywords
            .iter()
            .find(|k| !k.is_empty() && text.contains(k.as_str()))
        {
            tracing::debug!(
                keyword_len = keyword.len(),
                "payload escalated to wholesale mask"
            );
            counts.insert(RedactionCategory::Escalated, 1);
            return Sanitized {
                text: ESCALATED_MASK.to_string(),
                counts,
            };
        }

        let mut out = text.to_string();

        // National ids run before bank cards so an X-terminated id is not
        // half-eaten by the card pattern; phones are shortest and run last.
        for (regex, mask, category) in [
            (&self.national_id, ID_MASK, RedactionCategory::NationalId),
            (&self.bank_card, BANK_MASK, RedactionCategory::BankCard),
            (&self.phone, PHONE_MASK, RedactionCategory::Phone),
        ] {
            let (replaced, hits) = replace_stable(regex, &out, mask);
            if hits > 0 {
                out = replaced;
                counts.insert(category, hits);
            }
        }

        let mut keyword_hits = 0;
        for keyword in &self.keywords {
            if keyword.is_empty() {
                continue;
            }
            let hits = out.matches(keyword.as_str()).count();
            if hits > 0 {
                out = out.replace(keyword.as_str(), KEYWORD_MASK);
                keyword_hits += hits;
            }
        }
        if keyword_hits > 0 {
            counts.insert(RedactionCategory::Keyword, keyword_hits);
        }

        Sanitized { text: out, counts }
    }
}

/// Replace until no match remains. A single `replace_all` pass can miss a
/// hit whose leading boundary character was consumed as the trailing
/// boundary of the previous hit (e.g. two numbers joined by a comma).
fn replace_stable(regex: &Regex, text: &str, mask: &str) -> (String, usize) {
    let replacement = format!("${{pre}}{mask}${{post}}");
    let mut out = text.to_string();
    let mut hits = 0;

    loop {
        let round = regex.find_iter(&out).count();
        if round == 0 {
            return (out, hits);
        }
        hits += round;
        out = regex.replace_all(&out, replacement.as_str()).into_owned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> PrivacyGuard {
        PrivacyGuard::new(&PrivacyConfig::default())
    }

    #[test]
    fn test_phone_redaction() {
        let result = guard().sanitize("联系电话13812345678请回电");
        assert!(!result.text.contains("13812345678"));
        assert!(result.text.contains(PHONE_MASK));
        assert_eq!(result.counts[&RedactionCategory::Phone], 1);
    }

    #[test]
    fn test_adjacent_phones_both_redacted() {
        let result = guard().sanitize("13812345678,13900001111");
        assert!(!result.text.contains('3'));
        assert_eq!(result.counts[&RedactionCategory::Phone], 2);
    }

    #[test]
    fn test_national_id_redaction() {
        let result = guard().sanitize("身份证 11010119900101123X 备案");
        assert!(!result.text.contains("11010119900101123X"));
        assert!(result.text.contains(ID_MASK));
        assert_eq!(result.counts[&RedactionCategory::NationalId], 1);
    }

    #[test]
    fn test_bank_card_redaction() {
        let result = guard().sanitize("card 6222020200112233445 end");
        assert!(!result.text.contains("6222020200112233445"));
        assert!(result.text.contains(BANK_MASK));
        assert_eq!(result.counts[&RedactionCategory::BankCard], 1);
    }

    #[test]
    fn test_keyword_redaction() {
        let result = guard().sanitize("本月薪资发放明细");
        assert!(!result.text.contains("薪资"));
        assert!(result.text.contains(KEYWORD_MASK));
        assert_eq!(result.counts[&RedactionCategory::Keyword], 1);
    }

    #[test]
    fn test_escalation_masks_whole_payload() {
        let result = guard().sanitize("关于收购案的备忘录，电话13812345678");
        assert_eq!(result.text, ESCALATED_MASK);
        assert_eq!(result.counts[&RedactionCategory::Escalated], 1);
    }

    #[test]
    fn test_idempotent() {
        let g = guard();
        let first = g.sanitize("手机13812345678，薪资专用卡6222020200112233");
        let second = g.sanitize(&first.text);
        assert_eq!(first.text, second.text);
        assert!(second.is_clean());
    }

    #[test]
    fn test_clean_text_untouched() {
        let result = guard().sanitize("Starbucks coffee 500.00");
        assert_eq!(result.text, "Starbucks coffee 500.00");
        assert!(result.is_clean());
        assert_eq!(result.total(), 0);
    }
}
