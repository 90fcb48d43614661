//! CAN Log Analyzer Library
//!
//! A reusable library for analyzing vehicle bus logs (CAN, CAN-FD, LIN, UDS, J1939)
//! recorded by common logging tools. It identifies the container format, parses the
//! log into normalized messages, decodes signals against a DBC, detects faults,
//! computes traffic statistics, and groups related faults into incidents.
//!
//! # Architecture
//!
//! Every input file flows through one sequential pipeline:
//! - Format detection by extension, signature and content sniffing
//! - Chunked parsing into [`Message`]s with bounded memory
//! - Signal decoding, error detection and pattern statistics per message
//! - A session-wide merge, followed by correlation and the timeline index
//!
//! Files in one request are processed in parallel on a bounded worker pool.
//!
//! The library does NOT:
//! - Store sessions (results are plain serializable data)
//! - Render anything or expose a network API
//! - Answer natural-language questions about a log
//!
//! The command-line front end lives in can-log-cli.
//!
//! # Example Usage
//!
//! ```no_run
//! use can_log_analyzer::{AnalysisConfig, AnalysisRequest, Analyzer, CancelToken, NoProgress, RawFile};
//! use std::path::Path;
//!
//! let config = AnalysisConfig::new()
//!     .with_timeout_factor(3.0)
//!     .with_correlation_window_ms(500.0);
//! let analyzer = Analyzer::new(config).unwrap();
//!
//! let request = AnalysisRequest::new(vec![
//!     RawFile::from_path(Path::new("trace.blf")).unwrap(),
//!     RawFile::from_path(Path::new("console.log")).unwrap(),
//! ])
//! .with_dbc(RawFile::from_path(Path::new("powertrain.dbc")).unwrap());
//!
//! let session = analyzer.run(&request, &NoProgress, &CancelToken::new()).unwrap();
//!
//! for cluster in &session.clusters {
//!     println!("Incident {} ({:?}):", cluster.id, cluster.max_severity);
//!     for event in session.cluster_events(cluster) {
//!         println!("  {:.6} {} {}", event.timestamp, event.code, event.description);
//!     }
//! }
//! ```

// Public modules
pub mod config;
pub mod correlator;
pub mod detect;
pub mod errors;
pub mod formats;
pub mod input;
pub mod pattern;
pub mod session;
pub mod signal_decoder;
pub mod signals;
pub mod timeline;
pub mod types;

// Re-export main types for convenience
pub use config::{
    AnalysisConfig, BusOffStatus, CorrelationConfig, ErrorConfig, ParserConfig, PatternConfig, TimelineConfig,
};
pub use correlator::{ClusterAffinity, Correlator, IncidentCluster};
pub use detect::FormatDetector;
pub use errors::ErrorDetector;
pub use formats::{MessageChunks, ParseStats};
pub use input::{CancelToken, RawFile};
pub use pattern::{FrequencyClass, IdStatistics, PatternAnalyzer, PatternSummary};
pub use session::{
    AnalysisKind, AnalysisRequest, AnalysisSession, Analyzer, ErrorSummary, FileReport, FileStatus, NoProgress,
    Progress, ProgressSink, SignalSummary, Stage,
};
pub use signal_decoder::SignalDecoder;
pub use signals::{DatabaseStats, SignalDatabase};
pub use timeline::{Timeline, TimelineEvent, TimelineMessage, ZoomBucket};
pub use types::{
    AnalyzerError, DecodedSignal, Direction, ErrorEvent, ErrorType, FileId, FormatTag, Location, Message,
    MessageRef, Result, Severity, Timestamp,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        assert!(!VERSION.is_empty());
        let analyzer = Analyzer::new(AnalysisConfig::default()).unwrap();
        assert_eq!(analyzer.config().parser.chunk_size, 10_000);
        assert_eq!(FormatTag::CanAsc.to_string(), "CAN_ASC");
    }
}
