//! Statement encoding detection.
//!
//! Bank and payment exports in the wild arrive as UTF-8 (with or without a
//! BOM), GBK/GB18030, or occasionally Latin-1. Detection is by trial in
//! that order; GB18030 is a superset of GBK so one decoder covers both.

/// Detected source encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedEncoding {
    /// UTF-8 with a byte-order mark.
    Utf8Bom,
    /// Plain UTF-8.
    Utf8,
    /// GBK / GB18030.
    Gb18030,
    /// Latin-1 fallback.
    Latin1,
}

impl DetectedEncoding {
    /// Stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Utf8Bom => "utf-8-bom",
            Self::Utf8 => "utf-8",
            Self::Gb18030 => "gb18030",
            Self::Latin1 => "latin-1",
        }
    }
}

/// Decode raw statement bytes to text.
///
/// Never fails: Latin-1 maps every byte, so the worst case is mojibake that
/// the header sniff will reject downstream.
#[must_use]
pub fn decode(bytes: &[u8]) -> (String, DetectedEncoding) {
    if let Some(stripped) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        let text = String::from_utf8_lossy(stripped).into_owned();
        return (text, DetectedEncoding::Utf8Bom);
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return (text.to_string(), DetectedEncoding::Utf8);
    }

    let (decoded, _, had_errors) = encoding_rs::GB18030.decode(bytes);
    if !had_errors {
        return (decoded.into_owned(), DetectedEncoding::Gb18030);
    }

    let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
    (decoded.into_owned(), DetectedEncoding::Latin1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_with_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice("交易时间,金额".as_bytes());
        let (text, encoding) = decode(&bytes);
        assert_eq!(encoding, DetectedEncoding::Utf8Bom);
        assert!(text.starts_with("交易时间"));
    }

    #[test]
    fn test_plain_utf8() {
        let (text, encoding) = decode("对方名称,金额".as_bytes());
        assert_eq!(encoding, DetectedEncoding::Utf8);
        assert_eq!(text, "对方名称,金额");
    }

    #[test]
    fn test_gbk_round_trip() {
        let (encoded, _, _) = encoding_rs::GB18030.encode("业务流水号,对方名称");
        let (text, encoding) = decode(&encoded);
        assert_eq!(encoding, DetectedEncoding::Gb18030);
        assert_eq!(text, "业务流水号,对方名称");
    }

    #[test]
    fn test_latin1_fallback() {
        // 0xFF 0xFE is invalid UTF-8 and an invalid GB18030 lead sequence.
        let bytes = [0x43, 0x61, 0x66, 0xE9, 0xFF, 0xFE];
        let (_, encoding) = decode(&bytes);
        assert_eq!(encoding, DetectedEncoding::Latin1);
    }
}
