//! Analysis configuration types
//!
//! Every threshold the analyzers use is a named, serializable setting so that
//! callers (and tests) can probe boundary behaviour without touching code.
//! All fields have defaults; a partially filled TOML/JSON table deserializes fine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration for one analysis run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub errors: ErrorConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub timeline: TimelineConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
}

/// Parsing and detection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Messages per chunk handed downstream
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Bytes of the file the format detector may look at
    #[serde(default = "default_detect_prefix")]
    pub detect_prefix_bytes: usize,

    /// Upper bound on files parsed concurrently
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_detect_prefix() -> usize {
    64 * 1024
}

fn default_max_concurrent_files() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            detect_prefix_bytes: default_detect_prefix(),
            max_concurrent_files: default_max_concurrent_files(),
        }
    }
}

/// A designated status message whose bit pattern signals controller bus-off
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusOffStatus {
    /// Status message ID
    pub id: u32,
    /// Byte holding the status bits
    pub byte_index: usize,
    /// Bus-off is signalled when `data[byte_index] & mask == mask`
    pub mask: u8,
}

/// Error detector rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorConfig {
    /// Timeout fires after `expected_period * timeout_factor` of silence
    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: f64,

    /// Inter-arrival samples needed before an ID's period is trusted
    #[serde(default = "default_min_period_samples")]
    pub min_period_samples: u32,

    /// Optional designated bus-off status message
    #[serde(default)]
    pub bus_off_status: Option<BusOffStatus>,

    /// Expected payload length per ID, merged over the active DBC's message sizes
    #[serde(default)]
    pub expected_dlc: BTreeMap<u32, usize>,

    /// Keyword regexes for free-text log lines
    #[serde(default = "default_text_patterns")]
    pub text_patterns: Vec<String>,

    /// Diagnostic response IDs carrying ISO-TP wrapped UDS on CAN.
    /// When unset, 0x7E8-0x7EF and 29-bit 0x18DAxxxx are used.
    #[serde(default)]
    pub uds_response_ids: Option<Vec<u32>>,
}

fn default_timeout_factor() -> f64 {
    3.0
}

fn default_min_period_samples() -> u32 {
    2
}

fn default_text_patterns() -> Vec<String> {
    vec![
        r"(?i)\berror\b".to_string(),
        r"(?i)\bfault\b".to_string(),
        r"(?i)\breset\b".to_string(),
    ]
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            timeout_factor: default_timeout_factor(),
            min_period_samples: default_min_period_samples(),
            bus_off_status: None,
            expected_dlc: BTreeMap::new(),
            text_patterns: default_text_patterns(),
            uds_response_ids: None,
        }
    }
}

/// Traffic statistics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Nominal CAN bitrate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    /// Nominal LIN bitrate in bit/s
    #[serde(default = "default_lin_bitrate")]
    pub lin_bitrate: u32,

    /// Coefficient of variation at or above which an ID is `Irregular`
    #[serde(default = "default_cv_threshold")]
    pub cv_threshold: f64,

    /// Number of dominant IDs reported
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_bitrate() -> u32 {
    500_000
}

fn default_lin_bitrate() -> u32 {
    19_200
}

fn default_cv_threshold() -> f64 {
    0.5
}

fn default_top_k() -> usize {
    10
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            lin_bitrate: default_lin_bitrate(),
            cv_threshold: default_cv_threshold(),
            top_k: default_top_k(),
        }
    }
}

/// Timeline index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Fixed-width buckets of the coarse index built at construction
    #[serde(default = "default_coarse_buckets")]
    pub coarse_buckets: usize,

    /// Default number of buckets returned by a zoom query
    #[serde(default = "default_zoom_buckets")]
    pub zoom_buckets: usize,
}

fn default_coarse_buckets() -> usize {
    1024
}

fn default_zoom_buckets() -> usize {
    200
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            coarse_buckets: default_coarse_buckets(),
            zoom_buckets: default_zoom_buckets(),
        }
    }
}

/// Incident clustering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Sliding window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: f64,
}

fn default_window_ms() -> f64 {
    500.0
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
        }
    }
}

impl AnalysisConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the parser chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.parser.chunk_size = chunk_size;
        self
    }

    /// Builder method: cap concurrently parsed files
    pub fn with_max_concurrent_files(mut self, n: usize) -> Self {
        self.parser.max_concurrent_files = n;
        self
    }

    /// Builder method: set the timeout multiplier
    pub fn with_timeout_factor(mut self, factor: f64) -> Self {
        self.errors.timeout_factor = factor;
        self
    }

    /// Builder method: designate a bus-off status message
    pub fn with_bus_off_status(mut self, id: u32, byte_index: usize, mask: u8) -> Self {
        self.errors.bus_off_status = Some(BusOffStatus { id, byte_index, mask });
        self
    }

    /// Builder method: add an expected payload length for an ID
    pub fn with_expected_dlc(mut self, id: u32, len: usize) -> Self {
        self.errors.expected_dlc.insert(id, len);
        self
    }

    /// Builder method: set the nominal CAN bitrate
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.patterns.bitrate = bitrate;
        self
    }

    /// Builder method: set the correlation window
    pub fn with_correlation_window_ms(mut self, window_ms: f64) -> Self {
        self.correlation.window_ms = window_ms;
        self
    }

    /// Reject settings no analyzer can work with
    pub fn validate(&self) -> crate::types::Result<()> {
        use crate::types::AnalyzerError::InvalidConfig;

        if self.parser.chunk_size == 0 {
            return Err(InvalidConfig("parser.chunk_size must be > 0".into()));
        }
        if self.parser.max_concurrent_files == 0 {
            return Err(InvalidConfig("parser.max_concurrent_files must be > 0".into()));
        }
        if !(self.errors.timeout_factor > 0.0) {
            return Err(InvalidConfig("errors.timeout_factor must be > 0".into()));
        }
        if self.patterns.bitrate == 0 || self.patterns.lin_bitrate == 0 {
            return Err(InvalidConfig("patterns bitrates must be > 0".into()));
        }
        if self.timeline.coarse_buckets == 0 {
            return Err(InvalidConfig("timeline.coarse_buckets must be > 0".into()));
        }
        if !(self.correlation.window_ms >= 0.0) {
            return Err(InvalidConfig("correlation.window_ms must be >= 0".into()));
        }
        for pattern in &self.errors.text_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| InvalidConfig(format!("text pattern '{}': {}", pattern, e)))?;
        }
        Ok(())
    }
}
