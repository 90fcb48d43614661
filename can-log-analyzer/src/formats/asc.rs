//! Vector ASC (ASCII trace) parser
//!
//! ## Recognized lines
//! - Header: `date ...`, `base hex|dec timestamps absolute|relative`,
//!   `internal events logged`, `Begin/End TriggerBlock`, `Start of measurement`
//! - Classic frame: `<ts> <ch> <id>[x] Rx|Tx d <dlc> <data...>`
//! - Remote frame: `<ts> <ch> <id>[x] Rx|Tx r [<dlc>]`
//! - Error frame: `<ts> <ch> ErrorFrame`
//! - CAN-FD frame: `<ts> CANFD <ch> Rx|Tx <id>[x] [<name>] <brs> <esi> <dlc> <len> <data...>`
//! - Status: `<ts> CAN <ch> Status:chip status busoff`
//!
//! Comments (`//`) and blank lines are skipped. Any other line is malformed.

use crate::formats::text::{fd_dlc_to_len, malformed, parse_hex_tokens, parse_id, parse_timestamp, LineReader};
use crate::formats::Record;
use crate::types::{Direction, FormatTag, Message, Result};
use std::io::Read;

/// Event lines the trace may contain that carry no frame
const NON_FRAME_EVENTS: &[&str] = &["Statistic:", "SV:", "Log", "Start", "Stop", "Trigger", "J1939TP", "Chip"];

pub struct AscReader<R> {
    lines: LineReader<R>,
    radix: u32,
    relative: bool,
    clock: f64,
}

impl<R: Read> AscReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: LineReader::new(reader),
            radix: 16,
            relative: false,
            clock: 0.0,
        }
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        while let Some((line_no, line)) = self.lines.next_line()? {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") || self.consume_header(line) {
                continue;
            }
            match self.parse_line(line) {
                Ok(Some(message)) => return Ok(Some(Record::Message(message))),
                Ok(None) => continue,
                Err(reason) => return Ok(Some(malformed(line_no, reason))),
            }
        }
        Ok(None)
    }

    /// Returns true if the line is a header line (and applies its settings)
    fn consume_header(&mut self, line: &str) -> bool {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("base ") {
            let tokens: Vec<&str> = lower.split_whitespace().collect();
            self.radix = if tokens.get(1) == Some(&"dec") { 10 } else { 16 };
            self.relative = tokens.get(3) == Some(&"relative");
            return true;
        }
        ["date ", "internal events", "no internal events", "begin triggerblock", "end triggerblock", "start of measurement"]
            .iter()
            .any(|prefix| lower.starts_with(prefix))
    }

    fn timestamp(&mut self, token: &str) -> std::result::Result<f64, String> {
        let ts = parse_timestamp(token).ok_or_else(|| format!("invalid timestamp '{}'", token))?;
        if self.relative {
            self.clock += ts;
            Ok(self.clock)
        } else {
            Ok(ts)
        }
    }

    fn parse_line(&mut self, line: &str) -> std::result::Result<Option<Message>, String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            return Err("truncated line".to_string());
        }
        let timestamp = self.timestamp(tokens[0])?;

        match tokens[1] {
            "CANFD" => self.parse_canfd(timestamp, &tokens[2..]).map(Some),
            "CAN" => Ok(parse_status(timestamp, &tokens[2..])),
            channel if channel.bytes().all(|b| b.is_ascii_digit()) => {
                let channel: u8 = channel.parse().map_err(|_| format!("invalid channel '{}'", channel))?;
                self.parse_classic(timestamp, channel, &tokens[2..]).map(Some)
            }
            event if NON_FRAME_EVENTS.iter().any(|e| event.starts_with(e)) => Ok(None),
            other => Err(format!("unrecognized event '{}'", other)),
        }
    }

    fn parse_classic(&self, timestamp: f64, channel: u8, tokens: &[&str]) -> std::result::Result<Message, String> {
        let first = tokens.first().ok_or("missing identifier")?;
        if first.eq_ignore_ascii_case("ErrorFrame") {
            return Ok(error_frame(timestamp, channel));
        }
        if tokens.len() < 3 {
            return Err("truncated frame".to_string());
        }

        let (id, marked) = parse_id(first, self.radix).ok_or_else(|| format!("invalid identifier '{}'", first))?;
        let direction = Direction::parse(tokens[1]).ok_or_else(|| format!("invalid direction '{}'", tokens[1]))?;

        let mut message = match tokens[2] {
            "d" => {
                let dlc_token = tokens.get(3).ok_or("missing DLC")?;
                let dlc = u8::from_str_radix(dlc_token, 16).map_err(|_| format!("invalid DLC '{}'", dlc_token))?;
                let len = usize::from(dlc.min(8));
                if tokens.len() < 4 + len {
                    return Err(format!("expected {} data bytes", len));
                }
                let data = parse_hex_tokens(tokens[4..4 + len].iter().copied()).ok_or("invalid data byte")?;
                Message::new(timestamp, channel, id, data, FormatTag::CanAsc)
            }
            "r" => {
                let mut message = Message::new(timestamp, channel, id, Vec::new(), FormatTag::CanAsc);
                message.is_remote_frame = true;
                message
            }
            other => return Err(format!("invalid frame type '{}'", other)),
        };
        message.is_extended = marked || id > 0x7FF;
        message.direction = direction;
        Ok(message)
    }

    fn parse_canfd(&self, timestamp: f64, tokens: &[&str]) -> std::result::Result<Message, String> {
        if tokens.len() < 3 {
            return Err("truncated CANFD frame".to_string());
        }
        let channel: u8 = tokens[0].parse().map_err(|_| format!("invalid channel '{}'", tokens[0]))?;
        let direction = Direction::parse(tokens[1]).ok_or_else(|| format!("invalid direction '{}'", tokens[1]))?;
        if tokens[2].eq_ignore_ascii_case("ErrorFrame") {
            let mut message = error_frame(timestamp, channel);
            message.is_fd = true;
            message.direction = direction;
            return Ok(message);
        }
        let (id, marked) = parse_id(tokens[2], self.radix).ok_or_else(|| format!("invalid identifier '{}'", tokens[2]))?;

        // optional symbolic name between the ID and the BRS flag
        let mut i = 3;
        if tokens.get(i).map_or(false, |t| *t != "0" && *t != "1") {
            i += 1;
        }
        if tokens.len() < i + 4 {
            return Err("truncated CANFD frame".to_string());
        }
        let brs = tokens[i] == "1";
        let esi = tokens[i + 1] == "1";
        let dlc = u8::from_str_radix(tokens[i + 2], 16).map_err(|_| format!("invalid DLC '{}'", tokens[i + 2]))?;
        let len: usize = tokens[i + 3].parse().map_err(|_| format!("invalid data length '{}'", tokens[i + 3]))?;
        if len != fd_dlc_to_len(dlc) {
            return Err(format!("data length {} does not match DLC {}", len, dlc));
        }
        let start = i + 4;
        if tokens.len() < start + len {
            return Err(format!("expected {} data bytes", len));
        }
        let data = parse_hex_tokens(tokens[start..start + len].iter().copied()).ok_or("invalid data byte")?;

        let mut message = Message::new(timestamp, channel, id, data, FormatTag::CanAsc);
        message.is_extended = marked || id > 0x7FF;
        message.is_fd = true;
        message.direction = direction;
        if brs {
            message.set_meta("brs", "1");
        }
        if esi {
            message.set_meta("esi", "1");
        }
        Ok(message)
    }
}

fn error_frame(timestamp: f64, channel: u8) -> Message {
    let mut message = Message::new(timestamp, channel, 0, Vec::new(), FormatTag::CanAsc);
    message.is_error_frame = true;
    message
}

/// Controller status lines; only bus-off produces a message
fn parse_status(timestamp: f64, tokens: &[&str]) -> Option<Message> {
    let channel: u8 = tokens.first()?.parse().ok()?;
    let status = tokens[1..].join(" ").to_ascii_lowercase();
    if status.contains("busoff") || status.contains("bus off") {
        let mut message = Message::new(timestamp, channel, 0, Vec::new(), FormatTag::CanAsc);
        message.is_bus_off = true;
        message.set_meta("status", status);
        Some(message)
    } else {
        None
    }
}
