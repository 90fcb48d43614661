//! SocketCAN `candump -l` log parser (CAN_LOG)
//!
//! Frame lines look like `(1436509052.249713) vcan0 044#2A366C2BBA`:
//! - `id#data` classic frame, `id##Fdata` CAN-FD frame with flag nibble `F`
//! - `id#R` / `id#R5` remote frame
//! - 8 hex digit IDs are extended; bit 29 (0x20000000) marks an error frame
//!
//! Wall-clock (Unix epoch) timestamps are rebased so the first line of the log is
//! at 0. Relative timestamps, such as uptime stamps in console logs, are kept.
//!
//! Lines without frame syntax (console output interleaved with the trace) are
//! carried as text annotations so keyword rules can see them. A leading
//! `(12.34)`, `[12.34]` or `12.34` timestamp is honoured; otherwise the previous
//! timestamp is reused.

use crate::formats::text::{channel_from_iface, malformed, parse_hex_string, parse_timestamp, LineReader};
use crate::formats::Record;
use crate::types::{Direction, FormatTag, Message, Result};
use std::io::Read;

const CAN_ERR_FLAG: u32 = 0x2000_0000;
const CAN_ERR_BUSOFF: u32 = 0x0000_0040;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
/// Timestamps from 1973 on are taken as wall-clock time
const EPOCH_THRESHOLD: f64 = 1.0e8;

pub struct CanLogReader<R> {
    lines: LineReader<R>,
    origin: Option<f64>,
    last_timestamp: f64,
}

impl<R: Read> CanLogReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: LineReader::new(reader),
            origin: None,
            last_timestamp: 0.0,
        }
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        while let Some((line_no, line)) = self.lines.next_line()? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let result = if line.starts_with('(') && is_frame_line(line) {
                self.parse_frame_line(line)
            } else {
                Ok(self.parse_text_line(line))
            };
            return Ok(Some(match result {
                Ok(message) => Record::Message(message),
                Err(reason) => malformed(line_no, reason),
            }));
        }
        Ok(None)
    }

    fn rebase(&mut self, raw: f64) -> f64 {
        let origin = *self
            .origin
            .get_or_insert(if raw >= EPOCH_THRESHOLD { raw } else { 0.0 });
        let ts = raw - origin;
        self.last_timestamp = ts;
        ts
    }

    fn parse_frame_line(&mut self, line: &str) -> std::result::Result<Message, String> {
        let close = line.find(')').ok_or("unterminated timestamp")?;
        let raw = parse_timestamp(&line[1..close]).ok_or_else(|| format!("invalid timestamp '{}'", &line[1..close]))?;

        let mut tokens = line[close + 1..].split_whitespace();
        let iface = tokens.next().ok_or("missing interface")?;
        let frame = tokens.next().ok_or("missing frame")?;
        let direction = match tokens.next() {
            Some(flag) => Direction::parse(flag).ok_or_else(|| format!("invalid direction '{}'", flag))?,
            None => Direction::Rx,
        };

        let mut message = parse_frame(frame)?;
        message.timestamp = self.rebase(raw);
        message.channel = channel_from_iface(iface);
        message.direction = direction;
        Ok(message)
    }

    fn parse_text_line(&mut self, line: &str) -> Message {
        let (raw, text) = split_leading_timestamp(line);
        let timestamp = match raw {
            Some(raw) => self.rebase(raw),
            None => self.last_timestamp,
        };
        Message::text(timestamp, text, FormatTag::CanLog)
    }
}

/// A `(ts) iface id#data` line, as opposed to `(ts) free text`
///
/// Decided on the token where the frame belongs, so broken frame lines still
/// count as malformed.
fn is_frame_line(line: &str) -> bool {
    let frame = match line.find(')') {
        Some(close) => line[close + 1..].split_whitespace().nth(1),
        None => line.split_whitespace().nth(2),
    };
    frame.map_or(false, |token| token.contains('#'))
}

/// Parse the `id#data` part of a candump line
fn parse_frame(frame: &str) -> std::result::Result<Message, String> {
    let (id_str, rest) = frame.split_once('#').ok_or("missing '#' separator")?;
    if id_str.is_empty() || id_str.len() > 8 {
        return Err(format!("invalid identifier '{}'", id_str));
    }
    let raw_id = u32::from_str_radix(id_str, 16).map_err(|_| format!("invalid identifier '{}'", id_str))?;
    let extended = id_str.len() == 8 || (raw_id & CAN_EFF_MASK) > 0x7FF;

    if raw_id & CAN_ERR_FLAG != 0 {
        let class = raw_id & CAN_EFF_MASK & !CAN_ERR_FLAG;
        let data = parse_hex_string(rest).ok_or("invalid error frame data")?;
        let mut message = Message::new(0.0, 0, 0, data, FormatTag::CanLog);
        message.is_error_frame = true;
        message.is_bus_off = class & CAN_ERR_BUSOFF != 0;
        message.set_meta("error_class", format!("0x{:08X}", class));
        return Ok(message);
    }

    let id = raw_id & CAN_EFF_MASK;
    let mut message = if let Some(fd) = rest.strip_prefix('#') {
        let mut chars = fd.chars();
        let flags = chars
            .next()
            .and_then(|c| c.to_digit(16))
            .ok_or("missing CAN-FD flags")?;
        let data = parse_hex_string(chars.as_str()).ok_or("invalid CAN-FD data")?;
        if data.len() > 64 {
            return Err(format!("CAN-FD payload of {} bytes", data.len()));
        }
        let mut message = Message::new(0.0, 0, id, data, FormatTag::CanLog);
        message.is_fd = true;
        if flags & 0x1 != 0 {
            message.set_meta("brs", "1");
        }
        if flags & 0x2 != 0 {
            message.set_meta("esi", "1");
        }
        message
    } else if let Some(len) = rest.strip_prefix('R') {
        let mut message = Message::new(0.0, 0, id, Vec::new(), FormatTag::CanLog);
        message.is_remote_frame = true;
        if !len.is_empty() {
            message.set_meta("remote_dlc", len);
        }
        message
    } else {
        let data = parse_hex_string(rest).ok_or("invalid data")?;
        if data.len() > 8 {
            return Err(format!("classic CAN payload of {} bytes", data.len()));
        }
        Message::new(0.0, 0, id, data, FormatTag::CanLog)
    };
    message.is_extended = extended;
    Ok(message)
}

fn split_leading_timestamp(line: &str) -> (Option<f64>, &str) {
    let (token, rest) = match line.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest.trim_start()),
        None => return (None, line),
    };
    let inner = token.trim_start_matches(['[', '(']).trim_end_matches([']', ')']);
    match parse_timestamp(inner) {
        Some(ts) if inner.contains('.') => (Some(ts), rest),
        _ => (None, line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(content: &str) -> Vec<Record> {
        let mut reader = CanLogReader::new(Cursor::new(content.as_bytes().to_vec()));
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            records.push(record);
        }
        records
    }

    fn message(record: &Record) -> &Message {
        match record {
            Record::Message(m) => m,
            Record::Malformed { reason, .. } => panic!("unexpected malformed record: {}", reason),
        }
    }

    #[test]
    fn test_parse_frames() {
        let records = read_all(
            "(1436509052.249713) vcan0 044#2A366C2BBA\n\
             (1436509052.449847) vcan1 18FECA00#0001020304050607\n\
             (1436509052.650004) can0 123##1DEADBEEF\n\
             (1436509052.700000) can0 7DF#R\n",
        );
        assert_eq!(records.len(), 4);

        let first = message(&records[0]);
        assert_eq!(first.id, 0x044);
        assert_eq!(first.timestamp, 0.0);
        assert_eq!(first.data, vec![0x2A, 0x36, 0x6C, 0x2B, 0xBA]);
        assert_eq!(first.channel, 0);
        assert!(first.raw_metadata.is_none());

        let second = message(&records[1]);
        assert!(second.is_extended);
        assert_eq!(second.channel, 1);
        assert!((second.timestamp - 0.200134).abs() < 1e-6);

        let fd = message(&records[2]);
        assert!(fd.is_fd);
        assert_eq!(fd.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(fd.meta("brs"), Some("1"));

        assert!(message(&records[3]).is_remote_frame);
    }

    #[test]
    fn test_error_frames() {
        let records = read_all(
            "(0.100000) can0 20000004#0004000000000000\n\
             (0.200000) can0 20000040#0000000000000000\n",
        );
        let controller = message(&records[0]);
        assert!(controller.is_error_frame);
        assert!(!controller.is_bus_off);

        let bus_off = message(&records[1]);
        assert!(bus_off.is_error_frame);
        assert!(bus_off.is_bus_off);
        assert_eq!(bus_off.meta("error_class"), Some("0x00000040"));
    }

    #[test]
    fn test_text_lines_become_annotations() {
        let records = read_all(
            "(10.000000) can0 100#01\n\
             [10.5] ECU reset detected\n\
             watchdog fault\n\
             (10.750000) ECU RESET detected\n",
        );
        assert_eq!(records.len(), 4);
        let reset = message(&records[1]);
        assert_eq!(reset.text_line(), Some("ECU reset detected"));
        assert!((reset.timestamp - 10.5).abs() < 1e-9);

        let fault = message(&records[2]);
        assert_eq!(fault.text_line(), Some("watchdog fault"));
        assert!((fault.timestamp - 10.5).abs() < 1e-9);

        let console = message(&records[3]);
        assert_eq!(console.text_line(), Some("ECU RESET detected"));
        assert!((console.timestamp - 10.75).abs() < 1e-9);
    }

    #[test]
    fn test_epoch_timestamps_are_rebased() {
        let records = read_all(
            "(1700000000.000000) can0 100#01\n\
             (1700000000.250000) system watchdog reset\n",
        );
        assert_eq!(message(&records[0]).timestamp, 0.0);
        let text = message(&records[1]);
        assert_eq!(text.text_line(), Some("system watchdog reset"));
        assert!((text.timestamp - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_broken_frame_lines_are_malformed() {
        let records = read_all(
            "(0.1) can0 123#0102030405060708090A\n\
             (0.2) can0 XYZ#01\n\
             (0.3 can0 123#01\n",
        );
        assert!(records.iter().all(|r| matches!(r, Record::Malformed { .. })));
    }
}
