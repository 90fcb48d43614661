//! Time-ordered index of messages and error events
//!
//! [`Timeline::build`] merges the message stream and the error stream into one
//! globally ordered sequence. Ordering key:
//!
//! 1. timestamp
//! 2. messages before error events (an event never precedes the message it came from)
//! 3. file ID, then position in the file
//!
//! Messages are stored as compact [`TimelineMessage`] entries (no payload or
//! metadata), so a timeline over a long log costs a few dozen bytes per frame.
//! The full message can be re-read from its file through `reference`.
//!
//! A coarse index of fixed-width time buckets is built once. Range queries use it
//! to narrow a binary search to one bucket; zoom queries additionally use prefix
//! sums of error counts so a down-sampled view never rescans the entries.

use crate::config::TimelineConfig;
use crate::types::{ErrorEvent, FormatTag, Message, MessageRef, Severity, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What the timeline keeps of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineMessage {
    pub reference: MessageRef,
    pub timestamp: Timestamp,
    pub channel: u8,
    pub id: u32,
    pub protocol: FormatTag,
    /// Payload length in bytes
    pub dlc: u8,
    pub is_extended: bool,
    pub is_error_frame: bool,
    pub is_bus_off: bool,
    /// Console text of a text annotation
    pub text: Option<Box<str>>,
}

impl From<&Message> for TimelineMessage {
    fn from(message: &Message) -> Self {
        Self {
            reference: message.reference(),
            timestamp: message.timestamp,
            channel: message.channel,
            id: message.id,
            protocol: message.protocol,
            dlc: u8::try_from(message.dlc()).unwrap_or(u8::MAX),
            is_extended: message.is_extended,
            is_error_frame: message.is_error_frame,
            is_bus_off: message.is_bus_off,
            text: message.text_line().map(Box::from),
        }
    }
}

/// One entry of the timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEvent {
    Message(TimelineMessage),
    Error(ErrorEvent),
}

impl TimelineEvent {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            TimelineEvent::Message(m) => m.timestamp,
            TimelineEvent::Error(e) => e.timestamp,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorEvent> {
        match self {
            TimelineEvent::Error(e) => Some(e),
            TimelineEvent::Message(_) => None,
        }
    }

    fn sort_key(&self) -> (u8, u32, u64, u64) {
        match self {
            TimelineEvent::Message(m) => (0, m.reference.file_id, m.reference.seq, 0),
            TimelineEvent::Error(e) => {
                let (file_id, seq) = e.source_message_ref.map_or((u32::MAX, u64::MAX), |r| (r.file_id, r.seq));
                (1, file_id, seq, e.id)
            }
        }
    }

    fn cmp_order(&self, other: &Self) -> Ordering {
        self.timestamp()
            .total_cmp(&other.timestamp())
            .then_with(|| self.sort_key().cmp(&other.sort_key()))
    }
}

/// Down-sampled view of one time slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoomBucket {
    pub start: Timestamp,
    pub end: Timestamp,
    pub message_count: usize,
    pub error_count: usize,
    /// Highest severity among the bucket's errors
    pub max_severity: Option<Severity>,
}

/// Globally ordered, indexed event sequence
#[derive(Debug, Clone)]
pub struct Timeline {
    entries: Vec<TimelineEvent>,
    start: Timestamp,
    buckets: usize,
    bucket_width: f64,
    /// `bucket_offsets[b]` is the index of the first entry in bucket `b` or later
    bucket_offsets: Vec<usize>,
    /// `error_prefix[i]` is the number of errors among `entries[..i]`
    error_prefix: Vec<usize>,
    /// Entry indices of error events
    error_positions: Vec<usize>,
    zoom_buckets: usize,
}

impl Timeline {
    /// Merge messages and error events into one ordered, indexed sequence
    pub fn build(messages: Vec<TimelineMessage>, errors: Vec<ErrorEvent>, config: &TimelineConfig) -> Self {
        let mut entries: Vec<TimelineEvent> = Vec::with_capacity(messages.len() + errors.len());
        entries.extend(messages.into_iter().map(TimelineEvent::Message));
        entries.extend(errors.into_iter().map(TimelineEvent::Error));
        // Sorted per file already in the common case; stable sort keeps that cheap
        entries.sort_by(TimelineEvent::cmp_order);

        let start = entries.first().map_or(0.0, TimelineEvent::timestamp);
        let end = entries.last().map_or(0.0, TimelineEvent::timestamp);
        let buckets = config.coarse_buckets.max(1);
        let span = end - start;
        let bucket_width = if span > 0.0 { span / buckets as f64 } else { 1.0 };

        let mut timeline = Self {
            entries,
            start,
            buckets,
            bucket_width,
            bucket_offsets: Vec::new(),
            error_prefix: Vec::new(),
            error_positions: Vec::new(),
            zoom_buckets: config.zoom_buckets.max(1),
        };
        timeline.build_index();
        log::info!(
            "Timeline built: {} entries, {} errors, {} coarse buckets",
            timeline.entries.len(),
            timeline.error_positions.len(),
            buckets
        );
        timeline
    }

    fn build_index(&mut self) {
        let mut offsets = Vec::with_capacity(self.buckets + 1);
        let mut i = 0;
        for b in 0..self.buckets {
            while i < self.entries.len() && self.bucket_of(self.entries[i].timestamp()) < b {
                i += 1;
            }
            offsets.push(i);
        }
        offsets.push(self.entries.len());
        self.bucket_offsets = offsets;

        let mut prefix = Vec::with_capacity(self.entries.len() + 1);
        prefix.push(0);
        for (idx, entry) in self.entries.iter().enumerate() {
            let is_error = matches!(entry, TimelineEvent::Error(_));
            if is_error {
                self.error_positions.push(idx);
            }
            prefix.push(prefix[idx] + is_error as usize);
        }
        self.error_prefix = prefix;
    }

    /// Coarse bucket of a timestamp, clamped to the index range
    fn bucket_of(&self, t: Timestamp) -> usize {
        let raw = ((t - self.start) / self.bucket_width).floor();
        if raw <= 0.0 {
            0
        } else {
            (raw as usize).min(self.buckets - 1)
        }
    }

    fn bucket_slice(&self, b: usize) -> (usize, usize) {
        (self.bucket_offsets[b], self.bucket_offsets[b + 1])
    }

    /// Index of the first entry with timestamp >= `t`
    fn lower_bound(&self, t: Timestamp) -> usize {
        let (lo, hi) = self.bucket_slice(self.bucket_of(t));
        lo + self.entries[lo..hi].partition_point(|e| e.timestamp() < t)
    }

    /// Index of the first entry with timestamp > `t`
    fn upper_bound(&self, t: Timestamp) -> usize {
        let (lo, hi) = self.bucket_slice(self.bucket_of(t));
        lo + self.entries[lo..hi].partition_point(|e| e.timestamp() <= t)
    }

    fn range(&self, t0: Timestamp, t1: Timestamp) -> (usize, usize) {
        if self.entries.is_empty() || t0.is_nan() || t1.is_nan() || t1 < t0 {
            return (0, 0);
        }
        let lo = self.lower_bound(t0);
        let hi = self.upper_bound(t1);
        (lo, hi.max(lo))
    }

    /// All entries with `t0 <= timestamp <= t1`, in timeline order
    pub fn events_between(&self, t0: Timestamp, t1: Timestamp) -> &[TimelineEvent] {
        let (lo, hi) = self.range(t0, t1);
        &self.entries[lo..hi]
    }

    /// Error events with `t0 <= timestamp <= t1`
    pub fn errors_between(&self, t0: Timestamp, t1: Timestamp) -> impl Iterator<Item = &ErrorEvent> + '_ {
        let (lo, hi) = self.range(t0, t1);
        let first = self.error_positions.partition_point(|&p| p < lo);
        let last = self.error_positions.partition_point(|&p| p < hi);
        self.error_positions[first..last]
            .iter()
            .filter_map(move |&p| self.entries[p].as_error())
    }

    /// Down-sample `[t0, t1]` into `buckets` equal slices (the configured default when `None`)
    pub fn zoom(&self, t0: Timestamp, t1: Timestamp, buckets: Option<usize>) -> Vec<ZoomBucket> {
        let n = buckets.unwrap_or(self.zoom_buckets).max(1);
        if t0.is_nan() || t1.is_nan() || t1 < t0 {
            return Vec::new();
        }
        let width = (t1 - t0) / n as f64;

        let mut bounds = Vec::with_capacity(n + 1);
        bounds.push(self.range(t0, t1).0);
        for i in 1..n {
            let edge = t0 + width * i as f64;
            bounds.push(if self.entries.is_empty() { 0 } else { self.lower_bound(edge) });
        }
        bounds.push(self.range(t0, t1).1);

        (0..n)
            .map(|i| {
                let lo = bounds[i];
                let hi = bounds[i + 1].max(lo);
                let error_count = self.error_prefix[hi] - self.error_prefix[lo];
                let max_severity = if error_count == 0 {
                    None
                } else {
                    let first = self.error_positions.partition_point(|&p| p < lo);
                    self.error_positions[first..first + error_count]
                        .iter()
                        .filter_map(|&p| self.entries[p].as_error())
                        .map(|e| e.severity)
                        .max()
                };
                ZoomBucket {
                    start: t0 + width * i as f64,
                    end: if i + 1 == n { t1 } else { t0 + width * (i + 1) as f64 },
                    message_count: hi - lo - error_count,
                    error_count,
                    max_severity,
                }
            })
            .collect()
    }

    /// Full ordered sequence
    pub fn events(&self) -> &[TimelineEvent] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.error_positions.len()
    }

    /// First and last timestamp
    pub fn time_range(&self) -> Option<(Timestamp, Timestamp)> {
        Some((self.entries.first()?.timestamp(), self.entries.last()?.timestamp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorType;

    fn message(file_id: u32, seq: u64, t: f64) -> TimelineMessage {
        let mut m = Message::new(t, 1, 0x100, vec![], FormatTag::CanLog);
        m.file_id = file_id;
        m.seq = seq;
        TimelineMessage::from(&m)
    }

    fn error(id: u64, t: f64, source: Option<(u32, u64)>, severity: Severity) -> ErrorEvent {
        ErrorEvent {
            id,
            error_type: ErrorType::ErrorFrame,
            severity,
            timestamp: t,
            source_message_ref: source.map(|(file_id, seq)| MessageRef { file_id, seq }),
            bus_id: None,
            channel: 1,
            code: "E".to_string(),
            description: String::new(),
        }
    }

    fn config(coarse_buckets: usize) -> TimelineConfig {
        TimelineConfig {
            coarse_buckets,
            zoom_buckets: 4,
        }
    }

    #[test]
    fn test_message_precedes_derived_error() {
        let timeline = Timeline::build(
            vec![message(0, 0, 1.0), message(0, 1, 2.0)],
            vec![error(0, 1.0, Some((0, 0)), Severity::High)],
            &config(8),
        );
        let kinds: Vec<bool> = timeline.events().iter().map(|e| e.as_error().is_some()).collect();
        assert_eq!(kinds, vec![false, true, false]);
    }

    #[test]
    fn test_compact_entry_keeps_flags_and_text() {
        let mut frame = Message::new(2.0, 3, 0x18FEF100, vec![0; 8], FormatTag::CanBlf);
        frame.is_extended = true;
        frame.seq = 7;
        let entry = TimelineMessage::from(&frame);
        assert_eq!(entry.reference, MessageRef { file_id: 0, seq: 7 });
        assert_eq!((entry.channel, entry.id, entry.dlc), (3, 0x18FEF100, 8));
        assert!(entry.is_extended);
        assert_eq!(entry.text, None);

        let text = TimelineMessage::from(&Message::text(1.0, "ECU RESET", FormatTag::CanLog));
        assert_eq!(text.text.as_deref(), Some("ECU RESET"));
    }

    #[test]
    fn test_merges_unsorted_files() {
        let timeline = Timeline::build(
            vec![message(1, 0, 0.5), message(0, 0, 0.2), message(0, 1, 0.9), message(1, 1, 0.1)],
            vec![],
            &config(3),
        );
        let times: Vec<f64> = timeline.events().iter().map(TimelineEvent::timestamp).collect();
        assert_eq!(times, vec![0.1, 0.2, 0.5, 0.9]);
    }

    #[test]
    fn test_events_between_matches_linear_scan() {
        let messages: Vec<TimelineMessage> = (0..500).map(|i| message(0, i, (i as f64 * 0.37) % 50.0)).collect();
        let errors: Vec<ErrorEvent> = (0..40)
            .map(|i| error(i, i as f64 * 1.1, None, Severity::Medium))
            .collect();
        let timeline = Timeline::build(messages, errors, &config(16));

        for &(t0, t1) in &[(0.0, 50.0), (3.3, 7.77), (-5.0, 0.0), (12.0, 12.0), (49.9, 80.0), (60.0, 70.0)] {
            let expected = timeline
                .events()
                .iter()
                .filter(|e| e.timestamp() >= t0 && e.timestamp() <= t1)
                .count();
            let found = timeline.events_between(t0, t1);
            assert_eq!(found.len(), expected, "range {}..{}", t0, t1);
            assert!(found.iter().all(|e| e.timestamp() >= t0 && e.timestamp() <= t1));
        }
        assert!(timeline.events_between(5.0, 1.0).is_empty());
    }

    #[test]
    fn test_zoom_counts() {
        let messages: Vec<TimelineMessage> = (0..100).map(|i| message(0, i, i as f64 * 0.1)).collect();
        let errors = vec![
            error(0, 0.5, None, Severity::Low),
            error(1, 0.6, None, Severity::Critical),
            error(2, 9.0, None, Severity::Medium),
        ];
        let timeline = Timeline::build(messages, errors, &config(10));

        let view = timeline.zoom(0.0, 10.0, None);
        assert_eq!(view.len(), 4);
        assert_eq!(view.iter().map(|b| b.message_count).sum::<usize>(), 100);
        assert_eq!(view.iter().map(|b| b.error_count).sum::<usize>(), 3);
        assert_eq!(view[0].max_severity, Some(Severity::Critical));
        assert_eq!(view[1].max_severity, None);
        assert_eq!(view[3].max_severity, Some(Severity::Medium));
        assert_eq!(view[3].end, 10.0);
    }

    #[test]
    fn test_errors_between() {
        let timeline = Timeline::build(
            vec![message(0, 0, 1.0)],
            vec![error(0, 1.0, Some((0, 0)), Severity::High), error(1, 3.0, None, Severity::Low)],
            &config(4),
        );
        let ids: Vec<u64> = timeline.errors_between(0.0, 2.0).map(|e| e.id).collect();
        assert_eq!(ids, vec![0]);
        assert_eq!(timeline.error_count(), 2);
    }

    #[test]
    fn test_empty_and_single_instant() {
        let empty = Timeline::build(vec![], vec![], &config(4));
        assert!(empty.events_between(0.0, 1.0).is_empty());
        assert_eq!(empty.zoom(0.0, 1.0, Some(2))[0].message_count, 0);
        assert_eq!(empty.time_range(), None);

        let instant = Timeline::build(vec![message(0, 0, 5.0), message(0, 1, 5.0)], vec![], &config(4));
        assert_eq!(instant.events_between(5.0, 5.0).len(), 2);
    }
}
