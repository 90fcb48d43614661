//! Traffic pattern statistics
//!
//! Single-pass accumulation per message ID: count, first/last timestamp and
//! inter-arrival statistics (Welford's running mean/variance). Memory grows with
//! the number of unique IDs, never with the number of messages.
//!
//! Bus load counts nominal frame bits without bit stuffing:
//! - classic CAN: 47 + 8·n bits (11-bit ID), 67 + 8·n bits (29-bit ID)
//! - CAN-FD: the classic count plus the longer CRC (+4 bits up to 16 bytes, +8 above)
//! - LIN: 34 header bits + 10 bits per data/checksum byte
//!
//! Error frames, text annotations and UDS transcript lines carry no frame bits.
//!
//! Load is computed per channel against the nominal bitrate of one bus; the
//! headline figure is the busiest channel. Channels are keyed by number, so two
//! files logged on the same channel number count as the same bus.

use crate::config::PatternConfig;
use crate::types::{FormatTag, Message, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Frequency classification of one ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrequencyClass {
    /// Coefficient of variation of the inter-arrival time below the threshold
    Normal,
    /// Jittery, bursty, or too few samples to tell
    Irregular,
}

/// Nominal bits a frame occupies on the wire
pub fn frame_bits(message: &Message) -> u64 {
    if message.is_error_frame || message.text_line().is_some() {
        return 0;
    }
    let n = message.dlc() as u64;
    match message.protocol {
        FormatTag::Uds => 0,
        FormatTag::Lin => 34 + 10 * (n + 1),
        _ => {
            let base = if message.is_extended { 67 } else { 47 };
            let fd_crc = match (message.is_fd, n) {
                (false, _) => 0,
                (true, 0..=16) => 4,
                (true, _) => 8,
            };
            base + fd_crc + 8 * n
        }
    }
}

/// Running statistics for one ID
#[derive(Debug, Clone)]
struct IdAccumulator {
    count: u64,
    first: Timestamp,
    last: Timestamp,
    intervals: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    bits: u64,
    dlc_total: u64,
}

impl IdAccumulator {
    fn new(t: Timestamp) -> Self {
        Self {
            count: 0,
            first: t,
            last: t,
            intervals: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: 0.0,
            bits: 0,
            dlc_total: 0,
        }
    }

    fn observe(&mut self, message: &Message, bits: u64) {
        let t = message.timestamp;
        if self.count > 0 {
            let dt = (t - self.last).max(0.0);
            self.intervals += 1;
            let delta = dt - self.mean;
            self.mean += delta / self.intervals as f64;
            self.m2 += delta * (dt - self.mean);
            self.min = self.min.min(dt);
            self.max = self.max.max(dt);
        }
        self.count += 1;
        self.first = self.first.min(t);
        self.last = self.last.max(t);
        self.bits += bits;
        self.dlc_total += message.dlc() as u64;
    }

    /// Combine with statistics gathered over another stream (Chan et al.)
    fn merge(&mut self, other: &IdAccumulator) {
        if other.intervals > 0 {
            let n = self.intervals + other.intervals;
            let delta = other.mean - self.mean;
            self.m2 += other.m2 + delta * delta * (self.intervals as f64 * other.intervals as f64) / n as f64;
            self.mean += delta * other.intervals as f64 / n as f64;
            self.intervals = n;
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.first = self.first.min(other.first);
        self.last = self.last.max(other.last);
        self.bits += other.bits;
        self.dlc_total += other.dlc_total;
    }

    fn std_dev(&self) -> f64 {
        if self.intervals == 0 {
            0.0
        } else {
            (self.m2 / self.intervals as f64).max(0.0).sqrt()
        }
    }
}

/// Statistics for one ID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdStatistics {
    pub id: u32,
    pub count: u64,
    pub first_timestamp: Timestamp,
    pub last_timestamp: Timestamp,
    /// Mean inter-arrival time in seconds (None with fewer than two messages)
    pub mean_interval: Option<f64>,
    pub min_interval: Option<f64>,
    pub max_interval: Option<f64>,
    pub std_dev_interval: Option<f64>,
    pub coefficient_of_variation: Option<f64>,
    /// Messages per second over the ID's own span
    pub frequency_hz: Option<f64>,
    pub average_dlc: f64,
    pub classification: FrequencyClass,
}

/// An ID ranked by message count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominantId {
    pub id: u32,
    pub count: u64,
    /// Fraction of all messages
    pub share: f64,
}

/// Aggregate traffic statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub total_messages: u64,
    pub unique_ids: usize,
    /// First and last message timestamp
    pub time_range: Option<(Timestamp, Timestamp)>,
    /// Observation window in seconds
    pub duration: f64,
    /// Load of the busiest CAN channel, as a percentage of the nominal bitrate
    pub bus_load_percent: f64,
    /// Load of the busiest LIN channel, as a percentage of the nominal LIN bitrate
    pub lin_bus_load_percent: f64,
    /// CAN load per channel
    pub channel_loads: BTreeMap<u8, f64>,
    /// LIN load per channel
    pub lin_channel_loads: BTreeMap<u8, f64>,
    pub messages_per_second: f64,
    pub error_frames: u64,
    pub dominant_ids: Vec<DominantId>,
    pub normal_ids: usize,
    pub irregular_ids: usize,
    /// Per-ID statistics ordered by ID
    pub ids: Vec<IdStatistics>,
}

/// Single-pass traffic statistics accumulator
///
/// One analyzer per file stream; per-file analyzers are merged for the
/// session-wide summary.
#[derive(Debug, Clone)]
pub struct PatternAnalyzer {
    config: PatternConfig,
    per_id: HashMap<u32, IdAccumulator>,
    total: u64,
    error_frames: u64,
    can_bits: BTreeMap<u8, u64>,
    lin_bits: BTreeMap<u8, u64>,
    window: Option<(Timestamp, Timestamp)>,
}

impl PatternAnalyzer {
    pub fn new(config: &PatternConfig) -> Self {
        Self {
            config: config.clone(),
            per_id: HashMap::new(),
            total: 0,
            error_frames: 0,
            can_bits: BTreeMap::new(),
            lin_bits: BTreeMap::new(),
            window: None,
        }
    }

    /// Account for one message
    pub fn observe(&mut self, message: &Message) {
        if message.text_line().is_some() {
            return;
        }
        let t = message.timestamp;
        self.window = Some(match self.window {
            Some((start, end)) => (start.min(t), end.max(t)),
            None => (t, t),
        });
        self.total += 1;
        if message.is_error_frame {
            self.error_frames += 1;
            return;
        }

        let bits = frame_bits(message);
        let per_channel = if message.protocol == FormatTag::Lin {
            &mut self.lin_bits
        } else {
            &mut self.can_bits
        };
        if bits > 0 {
            *per_channel.entry(message.channel).or_insert(0) += bits;
        }
        self.per_id
            .entry(message.id)
            .or_insert_with(|| IdAccumulator::new(t))
            .observe(message, bits);
    }

    /// Fold another analyzer's statistics into this one
    pub fn merge(&mut self, other: &PatternAnalyzer) {
        for (id, acc) in &other.per_id {
            match self.per_id.get_mut(id) {
                Some(mine) => mine.merge(acc),
                None => {
                    self.per_id.insert(*id, acc.clone());
                }
            }
        }
        self.total += other.total;
        self.error_frames += other.error_frames;
        for (channel, bits) in &other.can_bits {
            *self.can_bits.entry(*channel).or_insert(0) += bits;
        }
        for (channel, bits) in &other.lin_bits {
            *self.lin_bits.entry(*channel).or_insert(0) += bits;
        }
        self.window = match (self.window, other.window) {
            (Some((a0, a1)), Some((b0, b1))) => Some((a0.min(b0), a1.max(b1))),
            (a, b) => a.or(b),
        };
    }

    pub fn total_messages(&self) -> u64 {
        self.total
    }

    pub fn unique_ids(&self) -> usize {
        self.per_id.len()
    }

    fn classify(&self, acc: &IdAccumulator) -> (Option<f64>, FrequencyClass) {
        if acc.intervals < 2 || acc.mean <= 0.0 {
            return (None, FrequencyClass::Irregular);
        }
        let cv = acc.std_dev() / acc.mean;
        let class = if cv < self.config.cv_threshold {
            FrequencyClass::Normal
        } else {
            FrequencyClass::Irregular
        };
        (Some(cv), class)
    }

    /// Derive the summary from what has been observed so far
    pub fn summary(&self) -> PatternSummary {
        let duration = self.window.map_or(0.0, |(start, end)| end - start);
        let loads = |per_channel: &BTreeMap<u8, u64>, bitrate: u32| -> BTreeMap<u8, f64> {
            per_channel
                .iter()
                .map(|(channel, bits)| {
                    let load = if duration > 0.0 {
                        *bits as f64 / (duration * bitrate as f64) * 100.0
                    } else {
                        0.0
                    };
                    (*channel, load)
                })
                .collect()
        };
        let busiest = |loads: &BTreeMap<u8, f64>| loads.values().copied().fold(0.0, f64::max);
        let channel_loads = loads(&self.can_bits, self.config.bitrate);
        let lin_channel_loads = loads(&self.lin_bits, self.config.lin_bitrate);

        let mut ids: Vec<IdStatistics> = self
            .per_id
            .iter()
            .map(|(id, acc)| {
                let (cv, classification) = self.classify(acc);
                let has_intervals = acc.intervals > 0;
                let span = acc.last - acc.first;
                IdStatistics {
                    id: *id,
                    count: acc.count,
                    first_timestamp: acc.first,
                    last_timestamp: acc.last,
                    mean_interval: has_intervals.then_some(acc.mean),
                    min_interval: has_intervals.then_some(acc.min),
                    max_interval: has_intervals.then_some(acc.max),
                    std_dev_interval: has_intervals.then(|| acc.std_dev()),
                    coefficient_of_variation: cv,
                    frequency_hz: (span > 0.0).then(|| (acc.count - 1) as f64 / span),
                    average_dlc: acc.dlc_total as f64 / acc.count.max(1) as f64,
                    classification,
                }
            })
            .collect();
        ids.sort_by_key(|s| s.id);

        let mut ranked: Vec<(u32, u64)> = ids.iter().map(|s| (s.id, s.count)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let dominant_ids = ranked
            .into_iter()
            .take(self.config.top_k)
            .map(|(id, count)| DominantId {
                id,
                count,
                share: count as f64 / self.total.max(1) as f64,
            })
            .collect();

        let normal_ids = ids
            .iter()
            .filter(|s| s.classification == FrequencyClass::Normal)
            .count();

        PatternSummary {
            total_messages: self.total,
            unique_ids: ids.len(),
            time_range: self.window,
            duration,
            bus_load_percent: busiest(&channel_loads),
            lin_bus_load_percent: busiest(&lin_channel_loads),
            channel_loads,
            lin_channel_loads,
            messages_per_second: if duration > 0.0 { self.total as f64 / duration } else { 0.0 },
            error_frames: self.error_frames,
            dominant_ids,
            irregular_ids: ids.len() - normal_ids,
            normal_ids,
            ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(t: f64, id: u32, len: usize) -> Message {
        Message::new(t, 1, id, vec![0; len], FormatTag::CanAsc)
    }

    fn analyze(messages: &[Message]) -> PatternSummary {
        let mut analyzer = PatternAnalyzer::new(&PatternConfig::default());
        for m in messages {
            analyzer.observe(m);
        }
        analyzer.summary()
    }

    #[test]
    fn test_frame_bits() {
        assert_eq!(frame_bits(&frame(0.0, 0x123, 8)), 111);
        assert_eq!(frame_bits(&frame(0.0, 0x18FEF100, 8)), 131);
        let mut fd = frame(0.0, 0x123, 64);
        fd.is_fd = true;
        assert_eq!(frame_bits(&fd), 47 + 8 + 512);
        let lin = Message::new(0.0, 0, 0x10, vec![0; 2], FormatTag::Lin);
        assert_eq!(frame_bits(&lin), 64);
        let mut error = frame(0.0, 0, 0);
        error.is_error_frame = true;
        assert_eq!(frame_bits(&error), 0);
    }

    #[test]
    fn test_bus_load() {
        // 1001 frames of 8 bytes over exactly one second at 500 kbit/s
        let messages: Vec<Message> = (0..=1000).map(|i| frame(i as f64 / 1000.0, 0x100, 8)).collect();
        let summary = analyze(&messages);
        let expected = 1001.0 * 111.0 / 500_000.0 * 100.0;
        assert!((summary.bus_load_percent - expected).abs() < 1e-6);
        assert_eq!(summary.duration, 1.0);
    }

    #[test]
    fn test_bus_load_is_per_channel() {
        // two channels each carrying 60% of a 500 kbit/s bus
        let per_second = (0.6 * 500_000.0 / 111.0) as usize;
        let mut messages = Vec::new();
        for i in 0..per_second {
            let t = i as f64 / per_second as f64;
            messages.push(Message::new(t, 1, 0x100, vec![0; 8], FormatTag::CanAsc));
            messages.push(Message::new(t, 2, 0x200, vec![0; 8], FormatTag::CanAsc));
        }
        let summary = analyze(&messages);
        assert_eq!(summary.channel_loads.len(), 2);
        let one = summary.channel_loads[&1];
        assert!((one - summary.channel_loads[&2]).abs() < 1e-9);
        assert!(one > 55.0 && one < 65.0, "load {}", one);
        assert_eq!(summary.bus_load_percent, one);
        assert!(summary.lin_channel_loads.is_empty());
    }

    #[test]
    fn test_periodic_id_is_normal() {
        let messages: Vec<Message> = (0..100).map(|i| frame(i as f64 * 0.01, 0x200, 8)).collect();
        let summary = analyze(&messages);
        let stats = &summary.ids[0];
        assert_eq!(stats.count, 100);
        assert!((stats.mean_interval.unwrap() - 0.01).abs() < 1e-9);
        assert!(stats.coefficient_of_variation.unwrap() < 1e-6);
        assert_eq!(stats.classification, FrequencyClass::Normal);
        assert!((stats.frequency_hz.unwrap() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_bursty_id_is_irregular() {
        let times = [0.0, 0.001, 0.002, 1.0, 1.001, 1.002, 3.0];
        let messages: Vec<Message> = times.iter().map(|&t| frame(t, 0x300, 1)).collect();
        let summary = analyze(&messages);
        assert_eq!(summary.ids[0].classification, FrequencyClass::Irregular);
    }

    #[test]
    fn test_too_few_samples_is_irregular() {
        let summary = analyze(&[frame(0.0, 0x1, 1), frame(0.1, 0x1, 1)]);
        assert_eq!(summary.ids[0].coefficient_of_variation, None);
        assert_eq!(summary.ids[0].classification, FrequencyClass::Irregular);
    }

    #[test]
    fn test_dominant_ids_tie_break() {
        let messages = vec![
            frame(0.0, 0x300, 1),
            frame(0.1, 0x200, 1),
            frame(0.2, 0x300, 1),
            frame(0.3, 0x200, 1),
            frame(0.4, 0x100, 1),
        ];
        let summary = analyze(&messages);
        let ranked: Vec<u32> = summary.dominant_ids.iter().map(|d| d.id).collect();
        assert_eq!(ranked, vec![0x200, 0x300, 0x100]);
        assert_eq!(summary.dominant_ids[0].share, 0.4);
    }

    #[test]
    fn test_merge_matches_single_pass_statistics() {
        let a: Vec<Message> = (0..10).map(|i| frame(i as f64 * 0.1, 0x10, 8)).collect();
        let b: Vec<Message> = (0..10).map(|i| frame(5.0 + i as f64 * 0.3, 0x10, 8)).collect();

        let mut left = PatternAnalyzer::new(&PatternConfig::default());
        a.iter().for_each(|m| left.observe(m));
        let mut right = PatternAnalyzer::new(&PatternConfig::default());
        b.iter().for_each(|m| right.observe(m));
        left.merge(&right);

        let merged = left.summary();
        let stats = &merged.ids[0];
        assert_eq!(stats.count, 20);
        // 9 intervals of 0.1 and 9 of 0.3
        assert!((stats.mean_interval.unwrap() - 0.2).abs() < 1e-9);
        assert!((stats.std_dev_interval.unwrap() - 0.1).abs() < 1e-9);
        assert_eq!(merged.time_range, Some((0.0, 5.0 + 9.0 * 0.3)));
    }

    #[test]
    fn test_text_lines_are_ignored() {
        let summary = analyze(&[Message::text(1.0, "boot", FormatTag::CanLog), frame(2.0, 0x1, 1)]);
        assert_eq!(summary.total_messages, 1);
        assert_eq!(summary.unique_ids, 1);
    }
}
