//! Signal database
//!
//! Holds the message and signal definitions of one loaded DBC. A session has at
//! most one active database; loading another replaces it wholesale.

use std::collections::HashMap;

/// A complete CAN message definition
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// CAN message ID (29-bit IDs without the DBC extended flag)
    pub id: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
    /// True if this message has multiplexed signals
    pub is_multiplexed: bool,
    /// Multiplexer signal name (if multiplexed)
    pub multiplexer_signal: Option<String>,
}

/// A CAN signal definition
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit in the CAN frame (DBC numbering)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    pub byte_order: ByteOrder,
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Multiplexer info (None if not multiplexed)
    pub multiplexer_info: Option<MultiplexerInfo>,
}

impl SignalDefinition {
    /// True if the DBC declares a physical range (`[0|0]` means none)
    pub fn has_range(&self) -> bool {
        !(self.min == 0.0 && self.max == 0.0)
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Signed,
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

/// Message and signal definitions from one DBC file
#[derive(Debug, Default)]
pub struct SignalDatabase {
    /// Name of the DBC the definitions came from
    source: String,

    /// Message definitions by CAN ID
    messages: HashMap<u32, MessageDefinition>,

    /// Signal name lookup
    /// Key: Signal name, Value: List of (CAN ID, signal index) tuples
    signal_lookup: HashMap<String, Vec<(u32, usize)>>,
}

impl SignalDatabase {
    /// Create an empty database for `source`
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Add a message definition; a later definition for the same ID wins
    pub fn add_message(&mut self, message: MessageDefinition) {
        let can_id = message.id;
        if let Some(previous) = self.messages.remove(&can_id) {
            log::warn!(
                "{}: message 0x{:X} defined twice ({} and {}), keeping the latter",
                self.source,
                can_id,
                previous.name,
                message.name
            );
            for locations in self.signal_lookup.values_mut() {
                locations.retain(|(id, _)| *id != can_id);
            }
        }

        for (sig_idx, signal) in message.signals.iter().enumerate() {
            self.signal_lookup
                .entry(signal.name.clone())
                .or_default()
                .push((can_id, sig_idx));
        }
        self.messages.insert(can_id, message);
    }

    /// Get the message definition for a CAN ID
    pub fn get_message(&self, can_id: u32) -> Option<&MessageDefinition> {
        self.messages.get(&can_id)
    }

    /// Find all messages containing a specific signal name
    pub fn find_signal(&self, signal_name: &str) -> Vec<(u32, &SignalDefinition)> {
        self.signal_lookup
            .get(signal_name)
            .map(|locations| {
                locations
                    .iter()
                    .filter_map(|(can_id, sig_idx)| {
                        self.get_message(*can_id)
                            .and_then(|msg| msg.signals.get(*sig_idx))
                            .map(|sig| (*can_id, sig))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Declared payload size per CAN ID
    pub fn expected_sizes(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.messages.values().map(|m| (m.id, m.size))
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|msg| msg.signals.len()).sum(),
            num_multiplexed: self.messages.values().filter(|msg| msg.is_multiplexed).count(),
        }
    }

    /// Get all CAN IDs in the database, sorted
    pub fn get_all_can_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.messages.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
    /// Messages with multiplexed signals
    pub num_multiplexed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_speed() -> SignalDefinition {
        SignalDefinition {
            name: "EngineSpeed".to_string(),
            start_bit: 0,
            length: 16,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 8000.0,
            unit: Some("rpm".to_string()),
            multiplexer_info: None,
        }
    }

    fn engine_data(size: usize) -> MessageDefinition {
        MessageDefinition {
            id: 0x123,
            name: "EngineData".to_string(),
            size,
            sender: Some("ECU1".to_string()),
            signals: vec![engine_speed()],
            is_multiplexed: false,
            multiplexer_signal: None,
        }
    }

    #[test]
    fn test_empty_database() {
        let db = SignalDatabase::new("empty.dbc");
        let stats = db.stats();
        assert_eq!(stats.num_messages, 0);
        assert_eq!(stats.num_signals, 0);
        assert_eq!(db.source(), "empty.dbc");
    }

    #[test]
    fn test_add_message() {
        let mut db = SignalDatabase::new("test.dbc");
        db.add_message(engine_data(8));

        let stats = db.stats();
        assert_eq!(stats.num_messages, 1);
        assert_eq!(stats.num_signals, 1);

        let msg = db.get_message(0x123).unwrap();
        assert_eq!(msg.name, "EngineData");
        assert_eq!(msg.signals[0].name, "EngineSpeed");

        let found = db.find_signal("EngineSpeed");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, 0x123);
        assert_eq!(db.expected_sizes().collect::<Vec<_>>(), vec![(0x123, 8)]);
    }

    #[test]
    fn test_redefinition_replaces() {
        let mut db = SignalDatabase::new("test.dbc");
        db.add_message(engine_data(8));
        db.add_message(engine_data(4));
        assert_eq!(db.stats().num_messages, 1);
        assert_eq!(db.get_message(0x123).unwrap().size, 4);
        assert_eq!(db.find_signal("EngineSpeed").len(), 1);
    }

    #[test]
    fn test_range() {
        let mut signal = engine_speed();
        assert!(signal.has_range());
        signal.max = 0.0;
        assert!(!signal.has_range());
    }
}
