//! Signal Decoding Engine
//!
//! Extracts signal values from raw CAN frames based on signal definitions
//! from the active signal database. Handles bit extraction, both DBC byte
//! orders, multiplexing, and physical value conversion.
//!
//! Out-of-range values are not an error: they are decoded normally and flagged
//! with [`DecodedSignal::out_of_range`].

use crate::input::RawFile;
use crate::signals::database::{ByteOrder, DatabaseStats, MessageDefinition, SignalDatabase, SignalDefinition, ValueType};
use crate::signals::dbc;
use crate::types::{DecodedSignal, Message, Result};

/// Signal decoder holding the session's single active DBC
#[derive(Debug, Default)]
pub struct SignalDecoder {
    database: Option<SignalDatabase>,
}

impl SignalDecoder {
    /// Create a decoder with no database loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder around an already loaded database
    pub fn with_database(database: SignalDatabase) -> Self {
        Self {
            database: Some(database),
        }
    }

    /// Load a DBC file, discarding any previously active mappings
    pub fn load_dbc(&mut self, file: &RawFile) -> Result<DatabaseStats> {
        let database = dbc::load_dbc(file)?;
        let stats = database.stats();
        if let Some(previous) = self.database.replace(database) {
            log::info!("Replaced active DBC {} with {}", previous.source(), file.name());
        }
        Ok(stats)
    }

    /// The active database, if one is loaded
    pub fn database(&self) -> Option<&SignalDatabase> {
        self.database.as_ref()
    }

    /// Decode all signals of `message` the active database defines
    ///
    /// Returns an empty list when no database is loaded or the ID is unknown.
    pub fn decode(&self, message: &Message) -> Vec<DecodedSignal> {
        match &self.database {
            Some(db) => decode(message, db),
            None => Vec::new(),
        }
    }
}

/// Decode `message` against `db`
pub fn decode(message: &Message, db: &SignalDatabase) -> Vec<DecodedSignal> {
    if message.is_error_frame || message.is_remote_frame || message.text_line().is_some() {
        return Vec::new();
    }
    match db.get_message(message.id) {
        Some(definition) => decode_message(message, definition),
        None => Vec::new(),
    }
}

/// Decode `message` with an explicit message definition
pub fn decode_message(message: &Message, definition: &MessageDefinition) -> Vec<DecodedSignal> {
    let mut multiplexer_value: Option<u64> = None;

    // For multiplexed messages, first extract the multiplexer signal value
    if definition.is_multiplexed {
        if let Some(mux_signal_name) = &definition.multiplexer_signal {
            multiplexer_value = definition
                .signals
                .iter()
                .find(|s| s.name == *mux_signal_name)
                .and_then(|mux_signal| extract_signal_value(&message.data, mux_signal))
                .map(|value| value as u64);
        }
    }

    definition
        .signals
        .iter()
        .filter(|signal| match &signal.multiplexer_info {
            // Multiplexed signals only decode when their switch value is present
            Some(mux_info) => multiplexer_value.map_or(false, |v| mux_info.multiplexer_values.contains(&v)),
            None => true,
        })
        .filter_map(|signal| decode_signal(message, signal))
        .collect()
}

/// Decode a single signal from a message
fn decode_signal(message: &Message, signal: &SignalDefinition) -> Option<DecodedSignal> {
    let raw_value = extract_signal_value(&message.data, signal)?;
    let physical_value = match signal.value_type {
        ValueType::Signed => raw_value as f64,
        // Full 64-bit unsigned values don't fit i64
        ValueType::Unsigned => raw_value as u64 as f64,
    } * signal.factor
        + signal.offset;

    let out_of_range = signal.has_range() && (physical_value < signal.min || physical_value > signal.max);
    if out_of_range {
        log::trace!(
            "Signal '{}' = {} outside [{}, {}] at {:.6}",
            signal.name,
            physical_value,
            signal.min,
            signal.max,
            message.timestamp
        );
    }

    Some(DecodedSignal {
        message_timestamp: message.timestamp,
        signal_name: signal.name.clone(),
        physical_value,
        raw_value,
        unit: signal.unit.clone(),
        out_of_range,
    })
}

/// Extract the raw signal value from frame data
///
/// Returns `None` if the signal does not fit inside the payload.
fn extract_signal_value(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
    let start_bit = signal.start_bit as usize;
    let length = signal.length as usize;
    if length == 0 || length > 64 {
        return None;
    }

    let raw_value = match signal.byte_order {
        ByteOrder::LittleEndian => extract_little_endian(data, start_bit, length),
        ByteOrder::BigEndian => extract_big_endian(data, start_bit, length),
    };
    let Some(raw_value) = raw_value else {
        log::debug!(
            "Signal '{}' ({}|{}) does not fit in {} data bytes",
            signal.name,
            start_bit,
            length,
            data.len()
        );
        return None;
    };

    Some(match signal.value_type {
        ValueType::Unsigned => raw_value as i64,
        ValueType::Signed => sign_extend(raw_value, length),
    })
}

/// Extract a signal with little-endian (Intel) byte order
///
/// The start bit is the LSB; bit `n` lives in byte `n / 8` at position `n % 8`.
fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
    if start_bit + length > data.len() * 8 {
        return None;
    }

    let mut result: u64 = 0;
    for i in 0..length {
        let bit_pos = start_bit + i;
        let bit_value = (data[bit_pos / 8] >> (bit_pos % 8)) & 0x01;
        result |= (bit_value as u64) << i;
    }
    Some(result)
}

/// Extract a signal with big-endian (Motorola) byte order
///
/// DBC numbers Motorola bits like Intel ones (bit 0 = LSB of byte 0) but the
/// start bit names the signal's MSB. Walking towards the LSB moves down within a
/// byte, then on to the most significant bit of the next byte ("sawtooth").
fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut bit_pos = start_bit;

    for i in 0..length {
        let byte_idx = bit_pos / 8;
        let byte = *data.get(byte_idx)?;
        let bit_value = (byte >> (bit_pos % 8)) & 0x01;
        result = (result << 1) | bit_value as u64;

        if i + 1 < length {
            bit_pos = if bit_pos % 8 == 0 { bit_pos + 15 } else { bit_pos - 1 };
        }
    }
    Some(result)
}

/// Sign-extend a value from N bits to 64 bits
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}
