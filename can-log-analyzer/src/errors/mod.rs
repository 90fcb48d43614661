//! Rule-based error detection
//!
//! [`ErrorDetector`] makes a single forward pass over a file's message stream.
//! Each rule is independent and keeps at most per-ID state:
//!
//! | Rule | Trigger | Severity |
//! |------|---------|----------|
//! | `BUS_OFF` | parser bus-off marker or the configured status message | Critical |
//! | `ERROR_FRAME` | error frame recorded by the logger | High |
//! | `DLC_MISMATCH` | payload length differs from the DBC/configured length | Medium |
//! | `TIMEOUT` | an ID stays silent for `timeout_factor` of its observed period | Medium |
//! | `J1939_DTC` | DM1 (lamp-derived) / DM2 trouble codes | lamp / Medium |
//! | `UDS_NEGATIVE_RESPONSE` | `7F <sid> <nrc>` | Critical for general rejects, else Medium |
//! | `TEXT_PATTERN_MATCH` | keyword regex on free-text lines | Low |
//!
//! Events of one rule come out in timestamp order. Timeouts are emitted as soon
//! as a later message shows the deadline has passed.

pub mod j1939;

use crate::config::ErrorConfig;
use crate::formats::uds;
use crate::signals::SignalDatabase;
use crate::types::{
    AnalyzerError, ErrorEvent, ErrorType, FormatTag, Message, MessageRef, Result, Severity, Timestamp,
};
use regex::Regex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::LazyLock;

use self::j1939::J1939Id;

/// DTC code embedded in a text line (`P0301`, `U0100`, ...)
static TEXT_DTC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[PCBU][0-9A-F]{4}\b").unwrap());

/// Timing state of one (channel, ID) stream
#[derive(Debug, Clone)]
struct PeriodTracker {
    first: Timestamp,
    last: Timestamp,
    count: u64,
    last_ref: MessageRef,
    /// Bumped whenever a new deadline is armed; stale heap entries are ignored
    generation: u64,
    deadline: Option<Timestamp>,
    /// Span over frame count, the basis of the deadline
    period: f64,
    /// Mean gap between consecutive frames, for reporting
    interval: f64,
}

type StreamKey = (u8, u32);

fn nanos(t: Timestamp) -> i64 {
    (t * 1e9).round() as i64
}

/// Single-pass error detector for one message stream
pub struct ErrorDetector {
    timeout_factor: f64,
    min_period_samples: u32,
    bus_off_status: Option<crate::config::BusOffStatus>,
    expected_dlc: HashMap<u32, usize>,
    text_patterns: Vec<Regex>,
    uds_response_ids: Option<HashSet<u32>>,
    periods: HashMap<StreamKey, PeriodTracker>,
    deadlines: BinaryHeap<Reverse<(i64, u8, u32, u64)>>,
    next_id: u64,
}

impl ErrorDetector {
    /// Build a detector from rule settings and the active DBC, if any
    ///
    /// Configured `expected_dlc` entries override the DBC's message sizes.
    pub fn new(config: &ErrorConfig, database: Option<&SignalDatabase>) -> Result<Self> {
        let mut expected_dlc: HashMap<u32, usize> = database
            .map(|db| db.expected_sizes().collect())
            .unwrap_or_default();
        expected_dlc.extend(config.expected_dlc.iter().map(|(id, len)| (*id, *len)));

        let text_patterns = config
            .text_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| AnalyzerError::InvalidConfig(format!("text pattern '{}': {}", p, e))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            timeout_factor: config.timeout_factor,
            min_period_samples: config.min_period_samples.max(1),
            bus_off_status: config.bus_off_status.clone(),
            expected_dlc,
            text_patterns,
            uds_response_ids: config.uds_response_ids.as_ref().map(|ids| ids.iter().copied().collect()),
            periods: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_id: 0,
        })
    }

    /// Run every rule over one message, appending any events to `out`
    pub fn process(&mut self, message: &Message, out: &mut Vec<ErrorEvent>) {
        self.expire_deadlines(message.timestamp, out);

        if let Some(text) = message.text_line() {
            self.check_text(message, text, out);
            return;
        }

        if self.is_bus_off(message) {
            let description = match message.meta("error_class") {
                Some(class) => format!("Controller bus-off on channel {} (error class {})", message.channel, class),
                None => format!("Controller bus-off on channel {}", message.channel),
            };
            self.emit(out, message, ErrorType::BusOff, Severity::Critical, "E_BUS_OFF", description);
        } else if message.is_error_frame {
            let description = match message.meta("error_class") {
                Some(class) => format!("CAN error frame on channel {} (error class {})", message.channel, class),
                None => format!("CAN error frame on channel {}", message.channel),
            };
            self.emit(out, message, ErrorType::ErrorFrame, Severity::High, "E_CAN_ERROR_FRAME", description);
        }
        if message.is_error_frame || message.is_bus_off {
            return;
        }

        self.check_dlc(message, out);
        self.track_period(message);
        self.check_j1939(message, out);
        self.check_uds(message, out);
    }

    /// Lazily detect errors over a message iterator
    pub fn detect<I>(self, messages: I) -> Detect<I>
    where
        I: Iterator<Item = Message>,
    {
        Detect {
            detector: self,
            messages,
            pending: VecDeque::new(),
            buf: Vec::new(),
        }
    }

    fn emit(
        &mut self,
        out: &mut Vec<ErrorEvent>,
        message: &Message,
        error_type: ErrorType,
        severity: Severity,
        code: impl Into<String>,
        description: String,
    ) {
        let event = ErrorEvent {
            id: self.next_id,
            error_type,
            severity,
            timestamp: message.timestamp,
            source_message_ref: Some(message.reference()),
            bus_id: (message.text_line().is_none() && !message.is_error_frame && !message.is_bus_off).then_some(message.id),
            channel: message.channel,
            code: code.into(),
            description,
        };
        log::trace!("{} {} at {:.6}: {}", event.severity, event.error_type, event.timestamp, event.description);
        self.next_id += 1;
        out.push(event);
    }

    fn is_bus_off(&self, message: &Message) -> bool {
        if message.is_bus_off {
            return true;
        }
        match &self.bus_off_status {
            Some(status) => {
                message.id == status.id
                    && message
                        .data
                        .get(status.byte_index)
                        .map_or(false, |b| b & status.mask == status.mask)
            }
            None => false,
        }
    }

    fn check_dlc(&mut self, message: &Message, out: &mut Vec<ErrorEvent>) {
        if message.is_remote_frame || matches!(message.protocol, FormatTag::Lin | FormatTag::Uds) {
            return;
        }
        let Some(&expected) = self.expected_dlc.get(&message.id) else {
            return;
        };
        if message.dlc() != expected {
            let description = format!(
                "DLC mismatch for 0x{:X}: expected {} bytes, got {}",
                message.id,
                expected,
                message.dlc()
            );
            self.emit(out, message, ErrorType::DlcMismatch, Severity::Medium, "E_DLC_MISMATCH", description);
        }
    }

    /// Update the period estimate for the message's stream and arm its deadline
    fn track_period(&mut self, message: &Message) {
        if matches!(message.protocol, FormatTag::Uds) {
            return;
        }
        let key = (message.channel, message.id);
        let t = message.timestamp;
        let tracker = self.periods.entry(key).or_insert_with(|| PeriodTracker {
            first: t,
            last: t,
            count: 0,
            last_ref: message.reference(),
            generation: 0,
            deadline: None,
            period: 0.0,
            interval: 0.0,
        });
        if t < tracker.last {
            return;
        }
        tracker.count += 1;
        tracker.last = t;
        tracker.last_ref = message.reference();

        if tracker.count > self.min_period_samples as u64 && t > tracker.first {
            // Mean spacing over the observed span, counting the wait for the next frame
            tracker.period = (t - tracker.first) / tracker.count as f64;
            tracker.interval = (t - tracker.first) / (tracker.count - 1).max(1) as f64;
            let deadline = t + self.timeout_factor * tracker.period;
            tracker.generation += 1;
            tracker.deadline = Some(deadline);
            self.deadlines
                .push(Reverse((nanos(deadline), key.0, key.1, tracker.generation)));
        } else {
            tracker.deadline = None;
        }
    }

    /// Emit timeouts for every deadline strictly before `now`, earliest first
    fn expire_deadlines(&mut self, now: Timestamp, out: &mut Vec<ErrorEvent>) {
        let now_ns = nanos(now);
        while let Some(Reverse((deadline_ns, channel, id, generation))) = self.deadlines.peek().copied() {
            if deadline_ns >= now_ns {
                break;
            }
            self.deadlines.pop();

            let Some(tracker) = self.periods.get_mut(&(channel, id)) else {
                continue;
            };
            if tracker.generation != generation {
                continue;
            }
            let Some(deadline) = tracker.deadline.take() else {
                continue;
            };
            let last = tracker.last;
            let interval = tracker.interval;
            let source = tracker.last_ref;
            // Period estimation restarts with the next frame of this stream
            tracker.count = 0;
            tracker.first = now;

            let event = ErrorEvent {
                id: self.next_id,
                error_type: ErrorType::Timeout,
                severity: Severity::Medium,
                timestamp: deadline,
                source_message_ref: Some(source),
                bus_id: Some(id),
                channel,
                code: "E_MSG_TIMEOUT".to_string(),
                description: format!(
                    "Timeout for 0x{:X}: no frame for {:.1} ms after {:.6} (mean interval {:.1} ms)",
                    id,
                    (deadline - last) * 1000.0,
                    last,
                    interval * 1000.0
                ),
            };
            self.next_id += 1;
            out.push(event);
        }
    }

    fn check_j1939(&mut self, message: &Message, out: &mut Vec<ErrorEvent>) {
        if !message.is_extended || message.protocol == FormatTag::Lin {
            return;
        }
        let j1939 = J1939Id::from_can_id(message.id);
        let severity = match j1939.pgn {
            j1939::PGN_DM1 => match message.data.first() {
                Some(&lamps) => j1939::lamp_severity(lamps),
                None => return,
            },
            j1939::PGN_DM2 => Severity::Medium,
            _ => return,
        };
        let list = if j1939.pgn == j1939::PGN_DM1 { "DM1" } else { "DM2" };

        for dtc in j1939::parse_dtcs(&message.data) {
            let name = j1939::spn_name(dtc.spn)
                .map(str::to_string)
                .unwrap_or_else(|| format!("SPN {}", dtc.spn));
            let description = format!(
                "J1939 {} from SA 0x{:02X}: {} - FMI {} ({}), occurrences {}",
                list,
                j1939.source_address,
                name,
                dtc.fmi,
                j1939::fmi_description(dtc.fmi),
                dtc.occurrence_count
            );
            let code = format!("SPN{}_FMI{}", dtc.spn, dtc.fmi);
            self.emit(out, message, ErrorType::J1939Dtc, severity, code, description);
        }
    }

    fn is_uds_response_id(&self, id: u32, extended: bool) -> bool {
        match &self.uds_response_ids {
            Some(ids) => ids.contains(&id),
            None if extended => id & 0x1FFF_0000 == 0x18DA_0000,
            None => (0x7E8..=0x7EF).contains(&id),
        }
    }

    fn check_uds(&mut self, message: &Message, out: &mut Vec<ErrorEvent>) {
        let payload = match message.protocol {
            FormatTag::Uds => Some(&message.data[..]),
            FormatTag::Lin => None,
            _ if self.is_uds_response_id(message.id, message.is_extended) => uds::isotp_single_frame(&message.data),
            _ => None,
        };
        let Some(negative) = payload.and_then(uds::negative_response) else {
            return;
        };

        let severity = if uds::is_general_reject(negative.nrc) {
            Severity::Critical
        } else {
            Severity::Medium
        };
        let description = format!(
            "UDS negative response to {} (0x{:02X}): {} (0x{:02X})",
            uds::service_name(negative.service),
            negative.service,
            uds::nrc_name(negative.nrc),
            negative.nrc
        );
        let code = format!("UDS_NRC_{:02X}", negative.nrc);
        self.emit(out, message, ErrorType::UdsNegativeResponse, severity, code, description);
    }

    fn check_text(&mut self, message: &Message, text: &str, out: &mut Vec<ErrorEvent>) {
        // First matching rule only
        let Some(found) = self.text_patterns.iter().find_map(|p| p.find(text)) else {
            return;
        };
        let code = match TEXT_DTC.find(text) {
            Some(dtc) => dtc.as_str().to_string(),
            None => format!("E_{}", found.as_str().to_ascii_uppercase().replace(' ', "_")),
        };
        let description: String = text.trim().chars().take(200).collect();
        self.emit(out, message, ErrorType::TextPatternMatch, Severity::Low, code, description);
    }
}

/// Lazy error event sequence over a message iterator
pub struct Detect<I> {
    detector: ErrorDetector,
    messages: I,
    pending: VecDeque<ErrorEvent>,
    buf: Vec<ErrorEvent>,
}

impl<I: Iterator<Item = Message>> Iterator for Detect<I> {
    type Item = ErrorEvent;

    fn next(&mut self) -> Option<ErrorEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let message = self.messages.next()?;
            self.detector.process(&message, &mut self.buf);
            self.pending.extend(self.buf.drain(..));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;

    fn frame(t: f64, id: u32, data: Vec<u8>) -> Message {
        Message::new(t, 1, id, data, FormatTag::CanLog)
    }

    fn detector(config: &AnalysisConfig) -> ErrorDetector {
        ErrorDetector::new(&config.errors, None).unwrap()
    }

    fn run(config: &AnalysisConfig, messages: Vec<Message>) -> Vec<ErrorEvent> {
        detector(config).detect(messages.into_iter()).collect()
    }

    #[test]
    fn test_timeout_after_gap() {
        let messages = vec![
            frame(0.0, 0x100, vec![0]),
            frame(0.1, 0x100, vec![0]),
            frame(0.2, 0x100, vec![0]),
            frame(0.6, 0x100, vec![0]),
        ];
        let events = run(&AnalysisConfig::new().with_timeout_factor(3.0), messages);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_type, ErrorType::Timeout);
        assert_eq!(events[0].severity, Severity::Medium);
        assert!((events[0].timestamp - 0.4).abs() < 1e-6, "timestamp {}", events[0].timestamp);
        assert_eq!(events[0].source_message_ref.unwrap().seq, 0);
        assert_eq!(events[0].bus_id, Some(0x100));
        assert!(events[0].description.contains("mean interval 100.0 ms"), "{}", events[0].description);
    }

    #[test]
    fn test_regular_stream_has_no_timeout() {
        let messages: Vec<Message> = (0..50).map(|i| frame(i as f64 * 0.01, 0x200, vec![0; 8])).collect();
        assert!(run(&AnalysisConfig::new(), messages).is_empty());
    }

    #[test]
    fn test_timeout_fires_when_other_traffic_passes_deadline() {
        let mut messages = vec![
            frame(0.0, 0x100, vec![]),
            frame(0.1, 0x100, vec![]),
            frame(0.2, 0x100, vec![]),
        ];
        messages.push(frame(0.35, 0x300, vec![]));
        messages.push(frame(0.45, 0x300, vec![]));
        let events = run(&AnalysisConfig::new(), messages);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bus_id, Some(0x100));
    }

    #[test]
    fn test_bus_off_is_critical_and_not_an_error_frame() {
        let mut msg = frame(1.0, 0, vec![]);
        msg.is_error_frame = true;
        msg.is_bus_off = true;
        let events = run(&AnalysisConfig::new(), vec![msg]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_type, ErrorType::BusOff);
        assert_eq!(events[0].severity, Severity::Critical);
        // controller status, not traffic of ID 0
        assert_eq!(events[0].bus_id, None);
    }

    #[test]
    fn test_configured_bus_off_status_message() {
        let config = AnalysisConfig::new().with_bus_off_status(0x7F0, 1, 0x80);
        let events = run(
            &config,
            vec![frame(1.0, 0x7F0, vec![0x00, 0x00]), frame(2.0, 0x7F0, vec![0x00, 0x81])],
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_type, ErrorType::BusOff);
        assert_eq!(events[0].timestamp, 2.0);
    }

    #[test]
    fn test_error_frame_is_high() {
        let mut msg = frame(1.0, 0, vec![]);
        msg.is_error_frame = true;
        let events = run(&AnalysisConfig::new(), vec![msg]);
        assert_eq!(events[0].error_type, ErrorType::ErrorFrame);
        assert_eq!(events[0].severity, Severity::High);
    }

    #[test]
    fn test_dlc_mismatch() {
        let config = AnalysisConfig::new().with_expected_dlc(0x123, 8);
        let events = run(
            &config,
            vec![frame(0.0, 0x123, vec![0; 8]), frame(0.1, 0x123, vec![0; 4]), frame(0.2, 0x124, vec![0; 2])],
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_type, ErrorType::DlcMismatch);
        assert_eq!(events[0].severity, Severity::Medium);
        assert_eq!(events[0].source_message_ref.unwrap().seq, 0);
    }

    #[test]
    fn test_j1939_dm1_uses_lamp_severity() {
        // red stop lamp, SPN 110 FMI 3
        let dm1 = frame(0.5, 0x18FECA00, vec![0x10, 0xFF, 0x6E, 0x00, 0x03, 0x01, 0xFF, 0xFF]);
        let events = run(&AnalysisConfig::new(), vec![dm1]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_type, ErrorType::J1939Dtc);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].code, "SPN110_FMI3");
        assert!(events[0].description.contains("Engine Coolant Temperature"));

        let dm2 = frame(0.6, 0x18FECB00, vec![0x00, 0xFF, 0x6E, 0x00, 0x03, 0x01, 0xFF, 0xFF]);
        assert_eq!(run(&AnalysisConfig::new(), vec![dm2])[0].severity, Severity::Medium);
    }

    #[test]
    fn test_uds_negative_responses() {
        let mut general = Message::new(1.0, 0, 0x7E8, vec![0x7F, 0x10, 0x10], FormatTag::Uds);
        general.set_meta("source", "ECU");
        let pending = Message::new(1.1, 0, 0x7E8, vec![0x7F, 0x22, 0x78], FormatTag::Uds);
        let events = run(&AnalysisConfig::new(), vec![general, pending]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].code, "UDS_NRC_10");
        assert_eq!(events[1].severity, Severity::Medium);
    }

    #[test]
    fn test_uds_over_isotp_on_can() {
        let events = run(
            &AnalysisConfig::new(),
            vec![
                frame(1.0, 0x7E8, vec![0x03, 0x7F, 0x22, 0x31, 0xAA, 0xAA, 0xAA, 0xAA]),
                // request side is not a response ID
                frame(1.1, 0x7E0, vec![0x03, 0x7F, 0x22, 0x31, 0xAA, 0xAA, 0xAA, 0xAA]),
            ],
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].code, "UDS_NRC_31");
    }

    #[test]
    fn test_text_pattern_match() {
        let events = run(
            &AnalysisConfig::new(),
            vec![
                Message::text(1.0, "ECU reset requested", FormatTag::CanLog),
                Message::text(2.0, "all good", FormatTag::CanLog),
                Message::text(3.0, "Fault P0301 stored", FormatTag::CanLog),
            ],
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].error_type, ErrorType::TextPatternMatch);
        assert_eq!(events[0].severity, Severity::Low);
        assert_eq!(events[0].code, "E_RESET");
        assert_eq!(events[0].bus_id, None);
        assert_eq!(events[1].code, "P0301");
    }

    #[test]
    fn test_event_ids_are_sequential() {
        let mut a = frame(1.0, 0, vec![]);
        a.is_error_frame = true;
        let b = a.clone();
        let events = run(&AnalysisConfig::new(), vec![a, b]);
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![0, 1]);
    }
}
