//! Format detection
//!
//! Assigns exactly one [`FormatTag`] per file from a bounded prefix of its content:
//!
//! 1. **Extension** - unambiguous extensions decide on their own; `.log`, `.txt`,
//!    `.csv` and `.xml` are only a fallback if content says otherwise.
//! 2. **Magic bytes** - `LOGG` (BLF), `<?xml`, ASC `date` header.
//! 3. **Content heuristics** - line-shape patterns over the text prefix.
//! 4. **Trial parse** - the first candidate parser that reads the prefix cleanly.
//!
//! The result depends only on the name and the prefix bytes, so detection is
//! deterministic.

use crate::formats::{Record, RecordReader};
use crate::input::RawFile;
use crate::types::{FormatTag, Result};
use regex::Regex;
use std::io::Cursor;
use std::sync::LazyLock;

/// Records a trial parse may look at
const TRIAL_RECORDS: usize = 50;

static CANDUMP_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\(\d+\.\d+\)\s+\S+\s+[0-9A-Fa-f]{1,8}#").unwrap());
static ASC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\d+\.\d+\s+(?:\d+\s+[0-9A-Fa-f]+x?\s+(?:Rx|Tx)\s+[dr]\b|CANFD\s+\d+\s+(?:Rx|Tx)|\d+\s+ErrorFrame)")
        .unwrap()
});
static ASC_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:base\s+(?:hex|dec)\s+timestamps|Begin\s+Triggerblock)").unwrap());
static TRC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^;\$FILEVERSION=|^\s*\d+\)\s+\d+(?:\.\d+)?\s+(?:(?:Rx|Tx)\s+)?[0-9A-Fa-f]{4,8}\s+\d+\s").unwrap()
});
static DBC_CONTENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:BO_\s+\d+\s+\w+\s*:|BU_\s*:|NS_\s*:)").unwrap());
static LIN_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^LIN\s+\d+(?:\.\d+)?\s+\S+\s+[0-9A-Fa-f]*").unwrap());
static UDS_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^UDS\s+\d+(?:\.\d+)?\s+\S+\s+->\s+\S+").unwrap());
static J1939_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)\b[0-9A-Fa-f]{8}#[0-9A-Fa-f]*").unwrap());

/// Candidates tried in order when nothing else decided
const TRIAL_ORDER: [FormatTag; 6] = [
    FormatTag::CanLog,
    FormatTag::CanAsc,
    FormatTag::CanTrc,
    FormatTag::Lin,
    FormatTag::Uds,
    FormatTag::Csv,
];

/// Format detector bounded to a fixed prefix size
#[derive(Debug, Clone)]
pub struct FormatDetector {
    prefix_limit: usize,
}

impl FormatDetector {
    pub fn new(prefix_limit: usize) -> Self {
        Self { prefix_limit }
    }

    /// Detect the format of `file`, reading at most the configured prefix
    pub fn detect(&self, file: &RawFile) -> Result<FormatTag> {
        let prefix = file.read_prefix(self.prefix_limit)?;
        let tag = detect_bytes(file.extension(), &prefix);
        log::info!("Detected {} as {}", file.name(), tag);
        Ok(tag)
    }
}

/// Detect a format from an optional extension (`.asc`) and a content prefix
pub fn detect_bytes(extension: Option<&str>, prefix: &[u8]) -> FormatTag {
    if prefix.is_empty() {
        return FormatTag::Unknown;
    }

    let by_extension = extension.map(from_extension).unwrap_or(FormatTag::Unknown);
    if !matches!(by_extension, FormatTag::Unknown | FormatTag::CanLog | FormatTag::Csv | FormatTag::Xml) {
        return by_extension;
    }

    if let Some(tag) = from_magic(prefix) {
        return tag;
    }

    let text = String::from_utf8_lossy(prefix);
    if let Some(tag) = from_content(&text) {
        return tag;
    }

    if by_extension != FormatTag::Unknown {
        return by_extension;
    }

    TRIAL_ORDER
        .into_iter()
        .find(|tag| trial_parse(*tag, prefix))
        .unwrap_or(FormatTag::Unknown)
}

fn from_extension(extension: &str) -> FormatTag {
    match extension {
        ".asc" => FormatTag::CanAsc,
        ".blf" => FormatTag::CanBlf,
        ".trc" => FormatTag::CanTrc,
        ".dbc" => FormatTag::Dbc,
        ".lin" | ".ldf" => FormatTag::Lin,
        ".uds" => FormatTag::Uds,
        ".log" | ".txt" => FormatTag::CanLog,
        ".csv" => FormatTag::Csv,
        ".xml" => FormatTag::Xml,
        _ => FormatTag::Unknown,
    }
}

fn from_magic(prefix: &[u8]) -> Option<FormatTag> {
    if prefix.starts_with(b"LOGG") {
        return Some(FormatTag::CanBlf);
    }
    let start = prefix.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(prefix);
    let start = &start[start.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(start.len())..];
    if start.starts_with(b"<?xml") {
        return Some(FormatTag::Xml);
    }
    if start.starts_with(b"date ") {
        return Some(FormatTag::CanAsc);
    }
    None
}

fn from_content(text: &str) -> Option<FormatTag> {
    if CANDUMP_LINE.is_match(text) {
        return Some(FormatTag::CanLog);
    }
    if ASC_HEADER.is_match(text) || ASC_LINE.is_match(text) {
        return Some(FormatTag::CanAsc);
    }
    if TRC_LINE.is_match(text) {
        return Some(FormatTag::CanTrc);
    }
    if DBC_CONTENT.is_match(text) {
        return Some(FormatTag::Dbc);
    }
    if LIN_LINE.is_match(text) {
        return Some(FormatTag::Lin);
    }
    if UDS_LINE.is_match(text) {
        return Some(FormatTag::Uds);
    }
    if J1939_LINE.is_match(text) {
        return Some(FormatTag::CanLog);
    }
    None
}

/// True if the parser for `tag` reads the prefix as mostly well-formed frames
fn trial_parse(tag: FormatTag, prefix: &[u8]) -> bool {
    let mut reader = match RecordReader::new(tag, Cursor::new(prefix)) {
        Ok(reader) => reader,
        Err(_) => return false,
    };
    let mut frames = 0usize;
    let mut bad = 0usize;
    for _ in 0..TRIAL_RECORDS {
        match reader.next_record() {
            Ok(Some(Record::Message(m))) if m.text_line().is_none() => frames += 1,
            Ok(Some(Record::Message(_))) => {}
            Ok(Some(Record::Malformed { .. })) => bad += 1,
            Ok(None) => break,
            Err(_) => return false,
        }
    }
    // the prefix may cut the final record short
    frames > 0 && bad <= frames / 4 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_decides_unambiguous_formats() {
        assert_eq!(detect_bytes(Some(".blf"), b"anything"), FormatTag::CanBlf);
        assert_eq!(detect_bytes(Some(".trc"), b"anything"), FormatTag::CanTrc);
        assert_eq!(detect_bytes(Some(".dbc"), b"VERSION \"\""), FormatTag::Dbc);
        assert_eq!(detect_bytes(Some(".lin"), b"anything"), FormatTag::Lin);
        assert_eq!(detect_bytes(Some(".uds"), b"anything"), FormatTag::Uds);
    }

    #[test]
    fn test_magic_bytes() {
        assert_eq!(detect_bytes(None, b"LOGG\x90\x00\x00\x00"), FormatTag::CanBlf);
        assert_eq!(detect_bytes(Some(".txt"), b"<?xml version=\"1.0\"?><Log/>"), FormatTag::Xml);
        assert_eq!(detect_bytes(None, b"date Mon Jan 1 10:00:00 2024\n"), FormatTag::CanAsc);
    }

    #[test]
    fn test_ambiguous_extension_verified_by_content() {
        let asc = b"   0.010000 1  123             Rx   d 2 01 02\n";
        assert_eq!(detect_bytes(Some(".log"), asc), FormatTag::CanAsc);

        let candump = b"(1436509052.249713) vcan0 044#2A366C2BBA\n";
        assert_eq!(detect_bytes(Some(".txt"), candump), FormatTag::CanLog);

        assert_eq!(detect_bytes(Some(".log"), b"ECU boot complete\n"), FormatTag::CanLog);
        assert_eq!(detect_bytes(Some(".csv"), b"time,id,data\n0.1,123,01\n"), FormatTag::Csv);
    }

    #[test]
    fn test_content_heuristics() {
        assert_eq!(detect_bytes(None, b";$FILEVERSION=2.1\n"), FormatTag::CanTrc);
        assert_eq!(detect_bytes(None, b"VERSION \"\"\n\nBO_ 291 EngineData: 8 ECU1\n"), FormatTag::Dbc);
        assert_eq!(detect_bytes(None, b"LIN 0.010 33 4A5593E5 E6\n"), FormatTag::Lin);
        assert_eq!(detect_bytes(None, b"UDS 1.000 Tester -> 7E0 1003\n"), FormatTag::Uds);
    }

    #[test]
    fn test_trial_parse_fallback() {
        assert_eq!(detect_bytes(None, b"0.100,123,2,01,02\n0.200,124,1,FF\n"), FormatTag::Csv);
    }

    #[test]
    fn test_unknown() {
        assert_eq!(detect_bytes(None, b""), FormatTag::Unknown);
        assert_eq!(detect_bytes(None, b"\x00\x01\x02\x03binary blob"), FormatTag::Unknown);
        assert_eq!(detect_bytes(Some(".bin"), b"hello world\n"), FormatTag::Unknown);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let inputs: [(&str, &[u8]); 3] = [
            (".log", b"(0.1) can0 123#00\n"),
            (".dat", b"LIN 0.010 33 01\n"),
            (".csv", b"a,b\n"),
        ];
        for (ext, bytes) in inputs {
            let first = detect_bytes(Some(ext), bytes);
            for _ in 0..5 {
                assert_eq!(detect_bytes(Some(ext), bytes), first);
            }
        }
    }

    #[test]
    fn test_detect_reads_bounded_prefix() {
        let mut content = b"(0.1) can0 123#00\n".to_vec();
        content.extend(std::iter::repeat(b'x').take(1_000_000));
        let file = RawFile::from_bytes("big.bin", content);
        assert_eq!(FormatDetector::new(64).detect(&file).unwrap(), FormatTag::CanLog);
    }
}
