//! UDS (ISO 14229) diagnostic log parser and protocol helpers
//!
//! Line grammar: `UDS <ts> <source> -> <target> <hexdata>`
//!
//! The payload starts with the service ID. Source and target addresses are kept
//! in the message metadata; the target is also used as the message ID when it
//! parses as hex. Negative responses (`7F <sid> <nrc>`) are recognized by
//! [`negative_response`] and later reported by the error detector.

use crate::formats::text::{malformed, parse_hex_string, parse_timestamp, LineReader};
use crate::formats::Record;
use crate::types::{Direction, FormatTag, Message, Result};
use std::io::Read;

/// Negative response service identifier
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// A decoded negative response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegativeResponse {
    /// Service that was rejected
    pub service: u8,
    /// Negative response code
    pub nrc: u8,
}

/// Recognize a `7F <sid> <nrc>` payload
pub fn negative_response(payload: &[u8]) -> Option<NegativeResponse> {
    match payload {
        [NEGATIVE_RESPONSE_SID, service, nrc, ..] => Some(NegativeResponse {
            service: *service,
            nrc: *nrc,
        }),
        _ => None,
    }
}

/// ISO-TP single frame payload (`0L <L bytes>`), if `data` is one
pub fn isotp_single_frame(data: &[u8]) -> Option<&[u8]> {
    let pci = *data.first()?;
    if pci >> 4 != 0 {
        return None;
    }
    let len = (pci & 0x0F) as usize;
    if len == 0 || data.len() < 1 + len {
        return None;
    }
    Some(&data[1..1 + len])
}

/// Services whose second byte is a sub-function
fn has_sub_function(sid: u8) -> bool {
    matches!(sid, 0x10 | 0x11 | 0x19 | 0x27 | 0x28 | 0x31 | 0x3E | 0x85 | 0x87)
}

pub fn service_name(sid: u8) -> &'static str {
    match sid & !0x40 {
        0x10 => "DiagnosticSessionControl",
        0x11 => "ECUReset",
        0x14 => "ClearDiagnosticInformation",
        0x19 => "ReadDTCInformation",
        0x22 => "ReadDataByIdentifier",
        0x23 => "ReadMemoryByAddress",
        0x27 => "SecurityAccess",
        0x28 => "CommunicationControl",
        0x2E => "WriteDataByIdentifier",
        0x2F => "InputOutputControlByIdentifier",
        0x31 => "RoutineControl",
        0x34 => "RequestDownload",
        0x35 => "RequestUpload",
        0x36 => "TransferData",
        0x37 => "RequestTransferExit",
        0x3D => "WriteMemoryByAddress",
        0x3E => "TesterPresent",
        0x85 => "ControlDTCSetting",
        0x87 => "LinkControl",
        _ if sid == NEGATIVE_RESPONSE_SID => "NegativeResponse",
        _ => "Unknown",
    }
}

pub fn nrc_name(nrc: u8) -> &'static str {
    match nrc {
        0x10 => "generalReject",
        0x11 => "serviceNotSupported",
        0x12 => "subFunctionNotSupported",
        0x13 => "incorrectMessageLengthOrInvalidFormat",
        0x14 => "responseTooLong",
        0x21 => "busyRepeatRequest",
        0x22 => "conditionsNotCorrect",
        0x24 => "requestSequenceError",
        0x25 => "noResponseFromSubnetComponent",
        0x26 => "failurePreventsExecutionOfRequestedAction",
        0x31 => "requestOutOfRange",
        0x33 => "securityAccessDenied",
        0x35 => "invalidKey",
        0x36 => "exceedNumberOfAttempts",
        0x37 => "requiredTimeDelayNotExpired",
        0x70 => "uploadDownloadNotAccepted",
        0x71 => "transferDataSuspended",
        0x72 => "generalProgrammingFailure",
        0x73 => "wrongBlockSequenceCounter",
        0x78 => "requestCorrectlyReceivedResponsePending",
        0x7E => "subFunctionNotSupportedInActiveSession",
        0x7F => "serviceNotSupportedInActiveSession",
        _ => "unknown",
    }
}

/// NRCs in the general-reject class; reported as Critical
pub fn is_general_reject(nrc: u8) -> bool {
    matches!(nrc, 0x10 | 0x72)
}

/// Format a 2-byte DTC number as `P0123`, `C0456`, `B1234`, or `U0100`
pub fn format_dtc(high: u8, low: u8) -> String {
    let system = match high >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    format!("{}{}{:X}{:02X}", system, (high >> 4) & 0x3, high & 0x0F, low)
}

/// DTCs reported by a positive `ReadDTCInformation` response
///
/// Records are 3-byte DTC plus status mask after the sub-function and
/// availability mask (`59 02 <mask> [<dtc hi> <dtc mid> <dtc lo> <status>]...`).
pub fn read_dtc_records(payload: &[u8]) -> Vec<String> {
    if payload.len() < 3 || payload[0] != 0x59 || !matches!(payload[1], 0x02 | 0x0A | 0x0F) {
        return Vec::new();
    }
    payload[3..]
        .chunks_exact(4)
        .map(|record| format_dtc(record[0], record[1]))
        .collect()
}

pub struct UdsReader<R> {
    lines: LineReader<R>,
}

impl<R: Read> UdsReader<R> {
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
    if tokens.first() != Some(&"UDS") {
        return Err("line does not start with UDS".to_string());
    }
    if tokens.len() < 6 || tokens[3] != "->" {
        return Err("expected 'UDS <ts> <source> -> <target> <data>'".to_string());
    }
    let timestamp = parse_timestamp(tokens[1]).ok_or_else(|| format!("invalid timestamp '{}'", tokens[1]))?;
    let source = tokens[2];
    let target = tokens[4];
    let payload = parse_hex_string(&tokens[5..].concat()).ok_or("invalid payload")?;
    let sid = *payload.first().ok_or("empty payload")?;

    let id = u32::from_str_radix(target.trim_start_matches("0x"), 16).unwrap_or(0) & 0x1FFF_FFFF;
    let mut message = Message::new(timestamp, 0, id, payload, FormatTag::Uds);
    message.set_meta("source", source);
    message.set_meta("target", target);
    message.set_meta("service", service_name(sid));

    if let Some(negative) = negative_response(&message.data) {
        message.direction = Direction::Rx;
        message.set_meta("nrc", format!("0x{:02X}", negative.nrc));
    } else if sid >= 0x40 && sid != NEGATIVE_RESPONSE_SID && sid & 0x40 != 0 {
        message.direction = Direction::Rx;
    } else {
        message.direction = Direction::Tx;
    }
    if has_sub_function(sid & !0x40) {
        if let Some(sub) = message.data.get(1) {
            let sub = format!("0x{:02X}", sub & 0x7F);
            message.set_meta("sub_function", sub);
        }
    }
    let dtcs = read_dtc_records(&message.data);
    if !dtcs.is_empty() {
        message.set_meta("dtcs", dtcs.join(","));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_negative_response() {
        assert_eq!(
            negative_response(&[0x7F, 0x22, 0x31]),
            Some(NegativeResponse { service: 0x22, nrc: 0x31 })
        );
        assert_eq!(negative_response(&[0x62, 0xF1, 0x90]), None);
        assert_eq!(negative_response(&[0x7F, 0x22]), None);
        assert!(is_general_reject(0x10));
        assert!(!is_general_reject(0x78));
        assert_eq!(nrc_name(0x78), "requestCorrectlyReceivedResponsePending");
    }

    #[test]
    fn test_isotp_single_frame() {
        assert_eq!(isotp_single_frame(&[0x03, 0x7F, 0x22, 0x31, 0xAA]), Some(&[0x7F, 0x22, 0x31][..]));
        assert_eq!(isotp_single_frame(&[0x10, 0x14, 0x62]), None);
        assert_eq!(isotp_single_frame(&[0x05, 0x01]), None);
    }

    #[test]
    fn test_format_dtc() {
        assert_eq!(format_dtc(0x01, 0x23), "P0123");
        assert_eq!(format_dtc(0xC1, 0x00), "U0100");
        assert_eq!(
            read_dtc_records(&[0x59, 0x02, 0xFF, 0x01, 0x23, 0x00, 0x08, 0xC1, 0x00, 0x00, 0x09]),
            vec!["P0123".to_string(), "U0100".to_string()]
        );
    }

    #[test]
    fn test_parse_lines() {
        let content = "UDS 1.000 Tester -> 7E0 1003\n\
                       UDS 1.010 7E8 -> Tester 7F1031\n\
                       UDS 1.020 Tester -> 7E0 22 F1 90\n\
                       UDS 1.030 Tester 7E0 22F190\n";
        let mut reader = UdsReader::new(Cursor::new(content.as_bytes().to_vec()));
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            records.push(record);
        }
        assert_eq!(records.len(), 4);

        let Record::Message(request) = &records[0] else { panic!("expected message") };
        assert_eq!(request.id, 0x7E0);
        assert_eq!(request.meta("source"), Some("Tester"));
        assert_eq!(request.meta("sub_function"), Some("0x03"));
        assert_eq!(request.direction, Direction::Tx);

        let Record::Message(reject) = &records[1] else { panic!("expected message") };
        assert_eq!(reject.meta("nrc"), Some("0x31"));
        assert_eq!(reject.data, vec![0x7F, 0x10, 0x31]);

        let Record::Message(spaced) = &records[2] else { panic!("expected message") };
        assert_eq!(spaced.data, vec![0x22, 0xF1, 0x90]);

        assert!(matches!(records[3], Record::Malformed { .. }));
    }
}
