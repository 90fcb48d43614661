//! Shared helpers for the line-oriented formats

use crate::formats::Record;
use crate::types::Location;
use std::io::{BufRead, BufReader, Read};

/// Line reader that tracks 1-based line numbers and tolerates non-UTF-8 bytes
///
/// Vendor tools frequently write Latin-1; invalid sequences are replaced rather
/// than failing the whole file.
pub(crate) struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    line_no: u64,
}

impl<R: Read> LineReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(256),
            line_no: 0,
        }
    }

    /// Next line without its terminator, or `None` at end of input
    pub(crate) fn next_line(&mut self) -> std::io::Result<Option<(u64, String)>> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }
        Ok(Some((self.line_no, String::from_utf8_lossy(&self.buf).into_owned())))
    }
}

pub(crate) fn malformed(line_no: u64, reason: impl Into<String>) -> Record {
    Record::Malformed {
        at: Location::Line(line_no),
        reason: reason.into(),
    }
}

/// Parse a finite decimal timestamp
pub(crate) fn parse_timestamp(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().filter(|t| t.is_finite())
}

/// Parse an identifier in the given radix.
///
/// Accepts an optional `0x` prefix and a trailing `x`/`X` extended-ID marker.
/// Returns the ID and whether the marker was present.
pub(crate) fn parse_id(token: &str, radix: u32) -> Option<(u32, bool)> {
    let (body, marked) = match token.strip_suffix(['x', 'X']) {
        Some(body) if !body.is_empty() => (body, true),
        _ => (token, false),
    };
    let body = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
        .unwrap_or(body);
    if body.is_empty() {
        return None;
    }
    let id = u32::from_str_radix(body, radix).ok()?;
    if id > 0x1FFF_FFFF {
        return None;
    }
    Some((id, marked))
}

/// Parse one `XX` hex byte token
pub(crate) fn parse_hex_byte(token: &str) -> Option<u8> {
    if token.is_empty() || token.len() > 2 {
        return None;
    }
    u8::from_str_radix(token, 16).ok()
}

/// Parse a run of whitespace-separated hex byte tokens
pub(crate) fn parse_hex_tokens<'a>(tokens: impl IntoIterator<Item = &'a str>) -> Option<Vec<u8>> {
    tokens.into_iter().map(parse_hex_byte).collect()
}

/// Parse contiguous hex digits (`2A366C`), optionally separated by `.` or spaces
pub(crate) fn parse_hex_string(s: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = s
        .bytes()
        .filter(|b| !matches!(b, b'.' | b' ' | b','))
        .collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

/// CAN-FD DLC code to payload length
pub(crate) fn fd_dlc_to_len(dlc: u8) -> usize {
    match dlc {
        0..=8 => dlc as usize,
        9 => 12,
        10 => 16,
        11 => 20,
        12 => 24,
        13 => 32,
        14 => 48,
        _ => 64,
    }
}

/// Channel number from an interface name such as `can0` or `vcan12`
pub(crate) fn channel_from_iface(iface: &str) -> u8 {
    let digits: String = iface
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_line_reader_numbers_and_terminators() {
        let mut reader = LineReader::new(Cursor::new(b"first\r\nsecond\n\nlast".to_vec()));
        assert_eq!(reader.next_line().unwrap(), Some((1, "first".to_string())));
        assert_eq!(reader.next_line().unwrap(), Some((2, "second".to_string())));
        assert_eq!(reader.next_line().unwrap(), Some((3, String::new())));
        assert_eq!(reader.next_line().unwrap(), Some((4, "last".to_string())));
        assert_eq!(reader.next_line().unwrap(), None);
    }

    #[test]
    fn test_line_reader_latin1() {
        let mut reader = LineReader::new(Cursor::new(vec![b'a', 0xB0, b'C', b'\n']));
        let (_, line) = reader.next_line().unwrap().unwrap();
        assert!(line.starts_with('a'));
        assert!(line.ends_with('C'));
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("123", 16), Some((0x123, false)));
        assert_eq!(parse_id("18FECA00x", 16), Some((0x18FECA00, true)));
        assert_eq!(parse_id("0x7E8", 16), Some((0x7E8, false)));
        assert_eq!(parse_id("291", 10), Some((291, false)));
        assert_eq!(parse_id("x", 16), None);
        assert_eq!(parse_id("GG", 16), None);
        assert_eq!(parse_id("FFFFFFFF", 16), None);
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_string("2A366C"), Some(vec![0x2A, 0x36, 0x6C]));
        assert_eq!(parse_hex_string("2A.36"), Some(vec![0x2A, 0x36]));
        assert_eq!(parse_hex_string(""), Some(vec![]));
        assert_eq!(parse_hex_string("2A3"), None);
        assert_eq!(parse_hex_tokens(["01", "ff", "A"]), Some(vec![0x01, 0xFF, 0x0A]));
        assert_eq!(parse_hex_tokens(["01", "zz"]), None);
    }

    #[test]
    fn test_fd_dlc_and_iface() {
        assert_eq!(fd_dlc_to_len(8), 8);
        assert_eq!(fd_dlc_to_len(9), 12);
        assert_eq!(fd_dlc_to_len(15), 64);
        assert_eq!(channel_from_iface("can0"), 0);
        assert_eq!(channel_from_iface("vcan12"), 12);
        assert_eq!(channel_from_iface("eth"), 0);
    }
}
