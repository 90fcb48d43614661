//! LIN log parser and frame checksum helpers
//!
//! Line grammar: `LIN <ts> <id> <hexdata> [<checksum>]`
//!
//! The frame ID may be decimal or `0x`-prefixed hex and must fit in 6 bits.
//! When a checksum is present it is checked against both the classic and the
//! enhanced (LIN 2.x) algorithm; the result is stored in
//! [`Message::checksum_valid`]. A bad checksum does not make the record malformed.

use crate::formats::text::{malformed, parse_hex_byte, parse_hex_string, parse_timestamp, LineReader};
use crate::formats::Record;
use crate::types::{FormatTag, Message, Result};
use std::io::Read;

/// Diagnostic frame IDs always use the classic checksum
const MASTER_REQUEST: u8 = 0x3C;
const SLAVE_RESPONSE: u8 = 0x3D;

/// Protected identifier: 6-bit frame ID plus two parity bits
pub fn protected_id(id: u8) -> u8 {
    let id = id & 0x3F;
    let bit = |n: u8| (id >> n) & 1;
    let p0 = bit(0) ^ bit(1) ^ bit(2) ^ bit(4);
    let p1 = !(bit(1) ^ bit(3) ^ bit(4) ^ bit(5)) & 1;
    id | (p0 << 6) | (p1 << 7)
}

fn inverted_carry_sum(seed: u8, data: &[u8]) -> u8 {
    let mut sum = u16::from(seed);
    for byte in data {
        sum += u16::from(*byte);
        if sum > 0xFF {
            sum -= 0xFF;
        }
    }
    !(sum as u8)
}

/// LIN 1.x checksum over the data bytes only
pub fn classic_checksum(data: &[u8]) -> u8 {
    inverted_carry_sum(0, data)
}

/// LIN 2.x checksum over the protected ID and the data bytes
pub fn enhanced_checksum(id: u8, data: &[u8]) -> u8 {
    inverted_carry_sum(protected_id(id), data)
}

/// True if `checksum` is valid for the frame under either checksum model
pub fn checksum_matches(id: u8, data: &[u8], checksum: u8) -> bool {
    if id == MASTER_REQUEST || id == SLAVE_RESPONSE {
        return classic_checksum(data) == checksum;
    }
    classic_checksum(data) == checksum || enhanced_checksum(id, data) == checksum
}

fn parse_frame_id(token: &str) -> Option<u8> {
    let value = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => token.parse::<u32>().ok()?,
    };
    u8::try_from(value).ok().filter(|id| *id <= 0x3F)
}

pub struct LinReader<R> {
    lines: LineReader<R>,
}

impl<R: Read> LinReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: LineReader::new(reader),
        }
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        while let Some((line_no, line)) = self.lines.next_line()? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            return Ok(Some(match parse_line(line) {
                Ok(message) => Record::Message(message),
                Err(reason) => malformed(line_no, reason),
            }));
        }
        Ok(None)
    }
}

fn parse_line(line: &str) -> std::result::Result<Message, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() != Some(&"LIN") {
        return Err("line does not start with LIN".to_string());
    }
    if tokens.len() < 4 || tokens.len() > 5 {
        return Err(format!("expected 4 or 5 fields, found {}", tokens.len()));
    }
    let timestamp = parse_timestamp(tokens[1]).ok_or_else(|| format!("invalid timestamp '{}'", tokens[1]))?;
    let id = parse_frame_id(tokens[2]).ok_or_else(|| format!("invalid LIN frame ID '{}'", tokens[2]))?;
    let data = parse_hex_string(tokens[3]).ok_or_else(|| format!("invalid data '{}'", tokens[3]))?;
    if data.len() > 8 {
        return Err(format!("LIN payload of {} bytes", data.len()));
    }

    let mut message = Message::new(timestamp, 0, u32::from(id), data, FormatTag::Lin);
    if let Some(token) = tokens.get(4) {
        let token = token
            .strip_prefix("cs=")
            .or_else(|| token.strip_prefix("0x"))
            .unwrap_or(token);
        let checksum = parse_hex_byte(token).ok_or_else(|| format!("invalid checksum '{}'", token))?;
        message.checksum_valid = Some(checksum_matches(id, &message.data, checksum));
    }
    message.set_meta("pid", format!("0x{:02X}", protected_id(id)));
    Ok(message)
}
