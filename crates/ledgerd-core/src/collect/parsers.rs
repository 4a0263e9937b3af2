//! Statement parsers.
//!
//! Parsers are a strategy set keyed by name in a registry; the right one is
//! selected by header sniff. New bank formats plug in by registering
//! another implementation; the core needs no change.

use csv::StringRecord;
use rust_decimal::Decimal;

use super::normalize::{parse_amount, parse_timestamp};
use crate::model::FlowSource;

/// One parsed statement line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFlow {
    /// Origin channel.
    pub source: FlowSource,
    /// Counterparty as reported.
    pub counterparty: String,
    /// Signed amount (expenses negative).
    pub amount: Decimal,
    /// When the flow occurred.
    pub occurred_at: i64,
    /// Free-form description.
    pub description: String,
}

/// A header-sniffing statement parser.
pub trait StatementParser: Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// Whether this parser recognises the header row.
    fn matches(&self, headers: &[String]) -> bool;

    /// Parse one record; `None` skips the row (soft failure).
    fn parse_row(&self, headers: &[String], record: &StringRecord) -> Option<ParsedFlow>;
}

fn column<'r>(headers: &[String], record: &'r StringRecord, name: &str) -> Option<&'r str> {
    let index = headers.iter().position(|h| h.trim() == name)?;
    record.get(index).map(str::trim)
}

fn first_timestamp(headers: &[String], record: &StringRecord, names: &[&str]) -> Option<i64> {
    names
        .iter()
        .find_map(|name| column(headers, record, name).and_then(parse_timestamp))
}

/// Expenses come out negative, income positive, per the direction column.
fn signed(amount: Decimal, direction: Option<&str>) -> Decimal {
    match direction {
        Some("支出") => -amount.abs(),
        Some("收入") => amount.abs(),
        _ => amount,
    }
}

/// Alipay export, recognised by its `业务流水号` column.
#[derive(Debug, Default)]
pub struct AlipayParser;

impl StatementParser for AlipayParser {
    fn name(&self) -> &'static str {
        "alipay"
    }

    fn matches(&self, headers: &[String]) -> bool {
        headers.iter().any(|h| h.trim() == "业务流水号")
            && headers.iter().any(|h| h.trim() == "对方名称")
    }

    fn parse_row(&self, headers: &[String], record: &StringRecord) -> Option<ParsedFlow> {
        let amount = parse_amount(column(headers, record, "金额")?)?;
        if amount.is_zero() {
            return None;
        }
        let counterparty = column(headers, record, "对方名称")?.to_string();
        let occurred_at =
            first_timestamp(headers, record, &["交易创建时间", "交易时间", "日期"])?;
        Some(ParsedFlow {
            source: FlowSource::Alipay,
            amount: signed(amount, column(headers, record, "收/支")),
            description: column(headers, record, "商品名称")
                .unwrap_or_default()
                .to_string(),
            counterparty,
            occurred_at,
        })
    }
}

/// WeChat Pay export, recognised by its `交易单号` column.
#[derive(Debug, Default)]
pub struct WechatParser;

impl StatementParser for WechatParser {
    fn name(&self) -> &'static str {
        "wechat"
    }

    fn matches(&self, headers: &[String]) -> bool {
        headers.iter().any(|h| h.trim() == "交易单号")
            && headers.iter().any(|h| h.trim() == "交易对方")
    }

    fn parse_row(&self, headers: &[String], record: &StringRecord) -> Option<ParsedFlow> {
        let amount = parse_amount(column(headers, record, "金额(元)")?)?;
        if amount.is_zero() {
            return None;
        }
        let counterparty = column(headers, record, "交易对方")?.to_string();
        let occurred_at = first_timestamp(headers, record, &["交易时间", "日期"])?;
        Some(ParsedFlow {
            source: FlowSource::Wechat,
            amount: signed(amount, column(headers, record, "收/支")),
            description: column(headers, record, "商品")
                .unwrap_or_default()
                .to_string(),
            counterparty,
            occurred_at,
        })
    }
}

/// Generic bank CSV: any file carrying a counterparty and an amount
/// column, Chinese or English. Registered last so the specific formats win.
#[derive(Debug, Default)]
pub struct GenericBankParser;

const VENDOR_COLUMNS: &[&str] = &["对方户名", "counterparty", "Counterparty", "vendor"];
const AMOUNT_COLUMNS: &[&str] = &["金额", "amount", "Amount"];
const DATE_COLUMNS: &[&str] = &["交易日期", "交易时间", "日期", "date", "Date"];

impl StatementParser for GenericBankParser {
    fn name(&self) -> &'static str {
        "bank-generic"
    }

    fn matches(&self, headers: &[String]) -> bool {
        let has_vendor = headers
            .iter()
            .any(|h| VENDOR_COLUMNS.contains(&h.trim()));
        let has_amount = headers
            .iter()
            .any(|h| AMOUNT_COLUMNS.contains(&h.trim()));
        has_vendor && has_amount
    }

    fn parse_row(&self, headers: &[String], record: &StringRecord) -> Option<ParsedFlow> {
        let amount = AMOUNT_COLUMNS
            .iter()
            .find_map(|name| column(headers, record, name))
            .and_then(parse_amount)?;
        if amount.is_zero() {
            return None;
        }
        let counterparty = VENDOR_COLUMNS
            .iter()
            .find_map(|name| column(headers, record, name))?
            .to_string();
        let occurred_at = first_timestamp(headers, record, DATE_COLUMNS)?;
        Some(ParsedFlow {
            source: FlowSource::Bank,
            amount,
            counterparty,
            occurred_at,
            description: String::new(),
        })
    }
}

/// Registry of statement parsers, sniffed in registration order.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn StatementParser>>,
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.parsers.iter().map(|p| p.name()).collect();
        f.debug_struct("ParserRegistry").field("parsers", &names).finish()
    }
}

impl ParserRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// The built-in parser set: Alipay, WeChat Pay, generic bank.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(AlipayParser));
        registry.register(Box::new(WechatParser));
        registry.register(Box::new(GenericBankParser));
        registry
    }

    /// Add a parser. Later registrations are sniffed after earlier ones.
    pub fn register(&mut self, parser: Box<dyn StatementParser>) {
        tracing::debug!(parser = parser.name(), "statement parser registered");
        self.parsers.push(parser);
    }

    /// Select a parser for the header row, if any recognises it.
    #[must_use]
    pub fn sniff(&self, headers: &[String]) -> Option<&dyn StatementParser> {
        self.parsers
            .iter()
            .find(|parser| parser.matches(headers))
            .map(AsRef::as_ref)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Streaming parse of decoded statement text.
///
/// Rows are handed to `sink` one at a time so arbitrarily large exports
/// never sit in memory; rows the parser cannot make sense of are counted
/// and skipped rather than failing the file.
///
/// # Errors
///
/// Returns `None` when no registered parser recognises the header row;
/// otherwise the parser name and the number of skipped rows.
pub fn parse_statement(
    registry: &ParserRegistry,
    text: &str,
    mut sink: impl FnMut(ParsedFlow),
) -> Option<(&'static str, u32)> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .ok()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let parser = registry.sniff(&headers)?;
    let mut skipped = 0u32;
    for record in reader.records() {
        let Ok(record) = record else {
            skipped += 1;
            continue;
        };
        match parser.parse_row(&headers, &record) {
            Some(flow) => sink(flow),
            None => skipped += 1,
        }
    }
    Some((parser.name(), skipped))
}
