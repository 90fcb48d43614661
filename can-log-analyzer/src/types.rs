//! Core types for the CAN log analyzer library
//!
//! This module defines the normalized data model that flows through the pipeline:
//! messages produced by the format parsers, decoded signals, and the error events
//! raised by the detector. Everything here is plain data and serializable so that
//! callers can hand a finished session to whatever storage they use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Seconds since the start of the log
pub type Timestamp = f64;

/// Identifier of an input file within one analysis request
pub type FileId = u32;

/// Result type for analyzer operations
pub type Result<T> = std::result::Result<T, AnalyzerError>;

/// Errors that can occur while detecting, parsing, or analyzing a file
///
/// Failures are scoped to a single file. Per-record problems never surface here;
/// they are counted in [`ParseStats`](crate::formats::ParseStats) instead.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("Unsupported format for '{file}': {reason}")]
    UnsupportedFormat { file: String, reason: String },

    #[error("Framing failure in '{file}' at {offset}: {reason}")]
    FramingFailure {
        file: String,
        offset: Location,
        reason: String,
    },

    #[error("Failed to parse DBC: {0}")]
    DbcParse(String),

    #[error("Analysis of '{file}' was cancelled")]
    Cancelled { file: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalyzerError {
    /// Framing failure whose file name is filled in by the caller
    pub(crate) fn framing(offset: Location, reason: impl Into<String>) -> Self {
        AnalyzerError::FramingFailure {
            file: String::new(),
            offset,
            reason: reason.into(),
        }
    }

    /// Attach a file name to file-scoped variants that do not carry one yet
    pub(crate) fn with_file(self, name: &str) -> Self {
        match self {
            AnalyzerError::FramingFailure { file, offset, reason } if file.is_empty() => {
                AnalyzerError::FramingFailure {
                    file: name.to_string(),
                    offset,
                    reason,
                }
            }
            AnalyzerError::UnsupportedFormat { file, reason } if file.is_empty() => {
                AnalyzerError::UnsupportedFormat {
                    file: name.to_string(),
                    reason,
                }
            }
            other => other,
        }
    }
}

/// Position inside a file where a failure was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// Byte offset (binary formats)
    Byte(u64),
    /// 1-based line number (text formats)
    Line(u64),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Byte(offset) => write!(f, "byte offset {}", offset),
            Location::Line(line) => write!(f, "line {}", line),
        }
    }
}

/// Container/protocol type of an input file
///
/// Exactly one tag is assigned per file. `Unknown` halts the pipeline for that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormatTag {
    CanAsc,
    CanBlf,
    CanTrc,
    CanLog,
    Lin,
    Uds,
    Dbc,
    Csv,
    Xml,
    Unknown,
}

impl FormatTag {
    /// Stable consumer-facing name
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatTag::CanAsc => "CAN_ASC",
            FormatTag::CanBlf => "CAN_BLF",
            FormatTag::CanTrc => "CAN_TRC",
            FormatTag::CanLog => "CAN_LOG",
            FormatTag::Lin => "LIN",
            FormatTag::Uds => "UDS",
            FormatTag::Dbc => "DBC",
            FormatTag::Csv => "CSV",
            FormatTag::Xml => "XML",
            FormatTag::Unknown => "UNKNOWN",
        }
    }

    /// True for formats that produce a message stream (everything but DBC and UNKNOWN)
    pub fn is_log(&self) -> bool {
        !matches!(self, FormatTag::Dbc | FormatTag::Unknown)
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame direction as recorded by the logging tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Rx,
    Tx,
}

impl Direction {
    /// Parse the usual `Rx`/`Tx` spellings, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rx" | "r" => Some(Direction::Rx),
            "tx" | "t" => Some(Direction::Tx),
            _ => None,
        }
    }
}

/// Reference to a message by file and position in that file's sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageRef {
    pub file_id: FileId,
    pub seq: u64,
}

/// Normalized message - the unit flowing through the pipeline
///
/// Produced by every format parser regardless of the wire format it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// File this message was read from
    pub file_id: FileId,
    /// Position within the file's message sequence (0-based)
    pub seq: u64,
    /// Seconds since log start
    pub timestamp: Timestamp,
    /// Bus channel number
    pub channel: u8,
    /// Arbitration ID (11- or 29-bit for CAN, 6-bit for LIN)
    pub id: u32,
    /// Payload bytes (0-8 for classic CAN, up to 64 for CAN-FD)
    pub data: Vec<u8>,
    pub direction: Direction,
    /// Format the message was parsed from
    pub protocol: FormatTag,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// True if this is a CAN-FD frame
    pub is_fd: bool,
    /// True if the logger recorded an error frame
    pub is_error_frame: bool,
    /// True if this is a remote frame
    pub is_remote_frame: bool,
    /// True if the logger recorded a controller bus-off status
    pub is_bus_off: bool,
    /// LIN checksum validity (None for protocols without a frame checksum)
    pub checksum_valid: Option<bool>,
    /// Format-specific extras (text annotation, UDS addressing, ...)
    pub raw_metadata: Option<BTreeMap<String, String>>,
}

impl Message {
    /// Create a message with default flags; `file_id`/`seq` are assigned by the chunker
    pub fn new(timestamp: Timestamp, channel: u8, id: u32, data: Vec<u8>, protocol: FormatTag) -> Self {
        Self {
            file_id: 0,
            seq: 0,
            timestamp,
            channel,
            id,
            data,
            direction: Direction::Rx,
            protocol,
            is_extended: id > 0x7FF,
            is_fd: false,
            is_error_frame: false,
            is_remote_frame: false,
            is_bus_off: false,
            checksum_valid: None,
            raw_metadata: None,
        }
    }

    /// Free-text log line carried as a message (console logs without framing)
    pub fn text(timestamp: Timestamp, text: impl Into<String>, protocol: FormatTag) -> Self {
        let mut message = Self::new(timestamp, 0, 0, Vec::new(), protocol);
        message.set_meta("text", text);
        message
    }

    /// Get the data length code - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    pub fn reference(&self) -> MessageRef {
        MessageRef {
            file_id: self.file_id,
            seq: self.seq,
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.raw_metadata.as_ref()?.get(key).map(String::as_str)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.raw_metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.into());
    }

    /// Text annotation, if this message came from a free-text log line
    pub fn text_line(&self) -> Option<&str> {
        self.meta("text")
    }
}

/// A decoded signal value derived from a message and the active DBC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedSignal {
    /// Timestamp of the source message
    pub message_timestamp: Timestamp,
    /// Signal name from the DBC
    pub signal_name: String,
    /// Value after `raw * scale + offset`
    pub physical_value: f64,
    /// Raw value before scaling (sign-extended when the signal is signed)
    pub raw_value: i64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// True if the physical value lies outside the declared `[min, max]`
    pub out_of_range: bool,
}

/// Severity of a detected error
///
/// Ordered so that `Critical` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        };
        f.write_str(s)
    }
}

/// Error taxonomy - a closed, versioned set of stable strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    BusOff,
    ErrorFrame,
    DlcMismatch,
    Timeout,
    J1939Dtc,
    UdsNegativeResponse,
    TextPatternMatch,
}

impl ErrorType {
    pub const ALL: [ErrorType; 7] = [
        ErrorType::BusOff,
        ErrorType::ErrorFrame,
        ErrorType::DlcMismatch,
        ErrorType::Timeout,
        ErrorType::J1939Dtc,
        ErrorType::UdsNegativeResponse,
        ErrorType::TextPatternMatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::BusOff => "BUS_OFF",
            ErrorType::ErrorFrame => "ERROR_FRAME",
            ErrorType::DlcMismatch => "DLC_MISMATCH",
            ErrorType::Timeout => "TIMEOUT",
            ErrorType::J1939Dtc => "J1939_DTC",
            ErrorType::UdsNegativeResponse => "UDS_NEGATIVE_RESPONSE",
            ErrorType::TextPatternMatch => "TEXT_PATTERN_MATCH",
        }
    }

    /// Remediation hint shown next to events of this type
    pub fn fix_suggestion(&self) -> &'static str {
        match self {
            ErrorType::BusOff => {
                "Check bus termination (120 Ohm) and cabling for shorts. Review bus load and bit timing."
            }
            ErrorType::ErrorFrame => {
                "Check the physical layer (cables, connectors), bit timing configuration and EMI sources."
            }
            ErrorType::DlcMismatch => {
                "Compare the sender ECU configuration against the message definition in the DBC."
            }
            ErrorType::Timeout => {
                "Verify the transmitting ECU is powered and connected; check cycle time configuration and bus load."
            }
            ErrorType::J1939Dtc => {
                "Consult J1939-73 for the SPN/FMI, inspect the related sensor or actuator, then clear the DTC."
            }
            ErrorType::UdsNegativeResponse => {
                "Check diagnostic session state, security access and the request parameters."
            }
            ErrorType::TextPatternMatch => "Review the surrounding log context.",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected fault condition
///
/// Immutable once created. Correlator clusters refer to events by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Unique within one analysis session
    pub id: u64,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub timestamp: Timestamp,
    /// Originating message (for TIMEOUT: the last message seen before the gap)
    pub source_message_ref: Option<MessageRef>,
    /// Bus ID of the originating message, if any
    pub bus_id: Option<u32>,
    pub channel: u8,
    /// Short machine-friendly code (e.g. `SPN110_FMI3`, `UDS_NRC_31`)
    pub code: String,
    pub description: String,
}
