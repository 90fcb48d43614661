//! DBC file parser
//!
//! Parses Vector DBC files and converts them into our internal signal database format.

use crate::input::RawFile;
use crate::signals::database::{
    ByteOrder, MessageDefinition, MultiplexerInfo, SignalDatabase, SignalDefinition, ValueType,
};
use crate::types::{AnalyzerError, Result};
use std::io::Read;

/// Flag bit DBC files set on 29-bit message IDs
const DBC_EXTENDED_FLAG: u32 = 0x8000_0000;

/// Load a DBC file into a fresh signal database
pub fn load_dbc(file: &RawFile) -> Result<SignalDatabase> {
    log::info!("Parsing DBC file: {}", file.name());

    let mut bytes = Vec::with_capacity(file.size() as usize);
    file.open()?.read_to_end(&mut bytes)?;
    let messages = parse_dbc_bytes(&bytes, file.name())?;

    let mut db = SignalDatabase::new(file.name());
    for message in messages {
        db.add_message(message);
    }
    let stats = db.stats();
    log::info!(
        "Loaded {} messages with {} signals from {}",
        stats.num_messages,
        stats.num_signals,
        file.name()
    );
    Ok(db)
}

/// Parse DBC content and return message definitions
pub fn parse_dbc_bytes(bytes: &[u8], source: &str) -> Result<Vec<MessageDefinition>> {
    // Vector tools write Windows-1252; fall back to Latin-1 when not UTF-8
    let content: String = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            log::warn!("DBC file {} is not UTF-8, trying Latin-1 encoding", source);
            bytes.iter().map(|&b| b as char).collect()
        }
    };

    let dbc = can_dbc::DBC::from_slice(content.as_bytes())
        .map_err(|e| AnalyzerError::DbcParse(format!("{}: {:?}", source, e)))?;

    let messages = dbc
        .messages()
        .iter()
        .map(convert_message)
        .collect::<Result<Vec<_>>>()?;

    log::debug!("Parsed {} messages from {}", messages.len(), source);
    Ok(messages)
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(dbc_msg: &can_dbc::Message) -> Result<MessageDefinition> {
    let mut is_multiplexed = false;
    let mut multiplexer_signal_name: Option<String> = None;

    for dbc_sig in dbc_msg.signals() {
        match dbc_sig.multiplexer_indicator() {
            can_dbc::MultiplexIndicator::Multiplexor
            | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(_) => {
                is_multiplexed = true;
                if multiplexer_signal_name.is_none() {
                    multiplexer_signal_name = Some(dbc_sig.name().to_string());
                }
            }
            can_dbc::MultiplexIndicator::MultiplexedSignal(_) => is_multiplexed = true,
            can_dbc::MultiplexIndicator::Plain => {}
        }
    }

    let signals = dbc_msg
        .signals()
        .iter()
        .map(|dbc_sig| convert_signal(dbc_sig, multiplexer_signal_name.as_deref()))
        .collect::<Result<Vec<_>>>()?;

    Ok(MessageDefinition {
        id: dbc_msg.message_id().0 & !DBC_EXTENDED_FLAG,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        is_multiplexed,
        multiplexer_signal: multiplexer_signal_name,
    })
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(dbc_sig: &can_dbc::Signal, multiplexer_signal_name: Option<&str>) -> Result<SignalDefinition> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let multiplexer_info = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value)
        | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(switch_value) => {
            let multiplexer = multiplexer_signal_name.ok_or_else(|| {
                AnalyzerError::DbcParse(format!(
                    "multiplexed signal '{}' but no multiplexer found",
                    dbc_sig.name()
                ))
            })?;
            // a signal can't be switched by itself
            (multiplexer != dbc_sig.name()).then(|| MultiplexerInfo {
                multiplexer_signal: multiplexer.to_string(),
                multiplexer_values: vec![switch_value],
            })
        }
        _ => None,
    };

    if *dbc_sig.signal_size() == 0 || *dbc_sig.signal_size() > 64 {
        return Err(AnalyzerError::DbcParse(format!(
            "signal '{}' has unsupported length {}",
            dbc_sig.name(),
            dbc_sig.signal_size()
        )));
    }

    Ok(SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        multiplexer_info,
    })
}
