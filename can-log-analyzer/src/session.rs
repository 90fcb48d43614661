//! Analysis sessions
//!
//! This module provides the primary interface for the analyzer library.
//! [`Analyzer`] takes an [`AnalysisRequest`] (log files, an optional DBC and the
//! analyses to run) and produces an [`AnalysisSession`] owning everything derived
//! from it.
//!
//! Files are parsed in parallel on a bounded worker pool, one worker per file.
//! Within a file every stage runs sequentially over the chunked message stream.
//! Per-file results are merged by file ID, so the session does not depend on
//! which worker finished first.

use crate::config::AnalysisConfig;
use crate::correlator::{Correlator, IncidentCluster};
use crate::detect::FormatDetector;
use crate::errors::ErrorDetector;
use crate::formats::{MessageChunks, ParseStats};
use crate::input::{CancelToken, RawFile};
use crate::pattern::{PatternAnalyzer, PatternSummary};
use crate::signal_decoder::SignalDecoder;
use crate::signals::{DatabaseStats, SignalDatabase};
use crate::timeline::{Timeline, TimelineMessage};
use crate::types::{
    AnalyzerError, DecodedSignal, ErrorEvent, ErrorType, FileId, FormatTag, Location, Result, Severity,
    Timestamp,
};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// An analysis that can be selected for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    /// Error detection
    Errors,
    /// Traffic statistics and bus load
    Patterns,
    /// DBC signal decoding
    Signals,
    /// Ordered, indexed event sequence
    Timeline,
    /// Incident clustering (implies error detection)
    Correlation,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 5] = [
        AnalysisKind::Errors,
        AnalysisKind::Patterns,
        AnalysisKind::Signals,
        AnalysisKind::Timeline,
        AnalysisKind::Correlation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Errors => "errors",
            AnalysisKind::Patterns => "patterns",
            AnalysisKind::Signals => "signals",
            AnalysisKind::Timeline => "timeline",
            AnalysisKind::Correlation => "correlation",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisKind {
    type Err = AnalyzerError;

    fn from_str(s: &str) -> Result<Self> {
        AnalysisKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AnalyzerError::InvalidConfig(format!("unknown analysis '{}'", s)))
    }
}

/// Input of one analysis run
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// Files in request order; a file's index is its [`FileId`]
    pub files: Vec<RawFile>,
    /// Explicit DBC. Takes precedence over DBC files found among `files`.
    pub dbc: Option<RawFile>,
    pub analyses: BTreeSet<AnalysisKind>,
}

impl AnalysisRequest {
    /// Request running every analysis over `files`
    pub fn new(files: Vec<RawFile>) -> Self {
        Self {
            files,
            dbc: None,
            analyses: AnalysisKind::ALL.into_iter().collect(),
        }
    }

    pub fn with_dbc(mut self, dbc: RawFile) -> Self {
        self.dbc = Some(dbc);
        self
    }

    /// Restrict the request to `analyses`
    pub fn with_analyses(mut self, analyses: impl IntoIterator<Item = AnalysisKind>) -> Self {
        self.analyses = analyses.into_iter().collect();
        self
    }

    fn wants(&self, kind: AnalysisKind) -> bool {
        self.analyses.contains(&kind)
    }

    fn wants_errors(&self) -> bool {
        self.wants(AnalysisKind::Errors) || self.wants(AnalysisKind::Correlation)
    }
}

/// Pipeline stage named in progress notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detecting,
    LoadingDbc,
    Parsing,
    Merging,
    Correlating,
    BuildingTimeline,
    Complete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Detecting => "detecting",
            Stage::LoadingDbc => "loading_dbc",
            Stage::Parsing => "parsing",
            Stage::Merging => "merging",
            Stage::Correlating => "correlating",
            Stage::BuildingTimeline => "building_timeline",
            Stage::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// One progress notification
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Stage,
    /// File the notification is about, for per-file stages
    pub file_id: Option<FileId>,
    /// 0.0 ..= 100.0
    pub percent: f32,
}

/// Receiver of progress notifications
///
/// Called from worker threads, so implementations must be thread-safe.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
}

/// Sink that drops every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: Progress) {}
}

impl<F> ProgressSink for F
where
    F: Fn(Progress) + Send + Sync,
{
    fn report(&self, progress: Progress) {
        self(progress)
    }
}

/// How processing of one file ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Completed,
    /// The detector could not identify the format; nothing was parsed
    Unsupported { reason: String },
    /// The file could not be processed; `location` points at the failure when known
    Failed { reason: String, location: Option<Location> },
}

/// Per-file result summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub file_id: FileId,
    pub name: String,
    pub detected_format: FormatTag,
    pub status: FileStatus,
    pub total_messages: u64,
    pub unique_ids: usize,
    pub time_range: Option<(Timestamp, Timestamp)>,
    pub error_count: usize,
    pub channels: BTreeSet<u8>,
    pub extended_ids: usize,
    pub error_frames: u64,
    pub skipped_records: u64,
    /// Signal values outside their declared range
    pub signal_anomalies: u64,
    pub parse_stats: ParseStats,
}

impl FileReport {
    fn new(file_id: FileId, name: &str, detected_format: FormatTag) -> Self {
        Self {
            file_id,
            name: name.to_string(),
            detected_format,
            status: FileStatus::Completed,
            total_messages: 0,
            unique_ids: 0,
            time_range: None,
            error_count: 0,
            channels: BTreeSet::new(),
            extended_ids: 0,
            error_frames: 0,
            skipped_records: 0,
            signal_anomalies: 0,
            parse_stats: ParseStats::default(),
        }
    }

    fn failed(mut self, error: AnalyzerError) -> Self {
        self.status = match error {
            AnalyzerError::UnsupportedFormat { reason, .. } => FileStatus::Unsupported { reason },
            AnalyzerError::FramingFailure { offset, reason, .. } => FileStatus::Failed {
                reason,
                location: Some(offset),
            },
            other => FileStatus::Failed {
                reason: other.to_string(),
                location: None,
            },
        };
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == FileStatus::Completed
    }
}

/// Aggregate counts over the session's error events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_type: BTreeMap<ErrorType, usize>,
    pub time_range: Option<(Timestamp, Timestamp)>,
}

impl ErrorSummary {
    pub fn from_events(events: &[ErrorEvent]) -> Self {
        let mut summary = ErrorSummary {
            total: events.len(),
            ..Default::default()
        };
        for event in events {
            *summary.by_severity.entry(event.severity).or_insert(0) += 1;
            *summary.by_type.entry(event.error_type).or_insert(0) += 1;
            let t = event.timestamp;
            summary.time_range = Some(match summary.time_range {
                Some((start, end)) => (start.min(t), end.max(t)),
                None => (t, t),
            });
        }
        summary
    }

    /// Count of events at `severity` or above
    pub fn at_least(&self, severity: Severity) -> usize {
        self.by_severity.range(severity..).map(|(_, n)| n).sum()
    }
}

/// Running statistics of one decoded signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSummary {
    pub name: String,
    pub unit: Option<String>,
    pub samples: u64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub out_of_range: u64,
    /// Timestamp of the first out-of-range sample
    pub first_out_of_range: Option<Timestamp>,
}

impl SignalSummary {
    fn new(signal: &DecodedSignal) -> Self {
        Self {
            name: signal.signal_name.clone(),
            unit: signal.unit.clone(),
            samples: 0,
            min: signal.physical_value,
            max: signal.physical_value,
            last: signal.physical_value,
            out_of_range: 0,
            first_out_of_range: None,
        }
    }

    fn observe(&mut self, signal: &DecodedSignal) {
        let v = signal.physical_value;
        self.samples += 1;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.last = v;
        if signal.out_of_range {
            self.out_of_range += 1;
            if self.first_out_of_range.is_none() {
                self.first_out_of_range = Some(signal.message_timestamp);
            }
        }
    }

    fn merge(&mut self, other: &SignalSummary) {
        self.samples += other.samples;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        // files are merged in ID order, so the later file's last value wins
        self.last = other.last;
        self.out_of_range += other.out_of_range;
        self.first_out_of_range = match (self.first_out_of_range, other.first_out_of_range) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Everything derived from one analysis request
///
/// The session is plain data. The timeline is kept in memory for queries and is
/// not part of the serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSession {
    pub created_at: DateTime<Utc>,
    pub analyses: BTreeSet<AnalysisKind>,
    /// Name and statistics of the active DBC
    pub dbc: Option<(String, DatabaseStats)>,
    /// One report per requested file, ordered by file ID
    pub files: Vec<FileReport>,
    /// Error events ordered by time; `id` is the position in this list
    pub errors: Vec<ErrorEvent>,
    pub error_summary: ErrorSummary,
    pub clusters: Vec<IncidentCluster>,
    pub patterns: Option<PatternSummary>,
    /// Decoded signal statistics ordered by name
    pub signals: Vec<SignalSummary>,
    #[serde(skip)]
    pub timeline: Option<Timeline>,
}

impl AnalysisSession {
    pub fn error(&self, id: u64) -> Option<&ErrorEvent> {
        self.errors.get(usize::try_from(id).ok()?)
    }

    /// Member events of `cluster`
    pub fn cluster_events<'a>(&'a self, cluster: &'a IncidentCluster) -> impl Iterator<Item = &'a ErrorEvent> + 'a {
        cluster.event_ids.iter().filter_map(move |id| self.error(*id))
    }

    pub fn total_messages(&self) -> u64 {
        self.files.iter().map(|f| f.total_messages).sum()
    }
}

/// What one worker produced for one file
struct FileOutcome {
    report: FileReport,
    errors: Vec<ErrorEvent>,
    patterns: Option<PatternAnalyzer>,
    signals: HashMap<String, SignalSummary>,
    /// Timeline entries, only when a timeline was requested
    messages: Vec<TimelineMessage>,
}

impl FileOutcome {
    fn empty(report: FileReport) -> Self {
        Self {
            report,
            errors: Vec::new(),
            patterns: None,
            signals: HashMap::new(),
            messages: Vec::new(),
        }
    }
}

/// The main analyzer - entry point for all analysis runs
#[derive(Debug, Clone)]
pub struct Analyzer {
    config: AnalysisConfig,
}

impl Analyzer {
    /// Create an analyzer, rejecting invalid configuration
    ///
    /// # Arguments
    /// * `config` - Thresholds and limits for every stage
    ///
    /// # Returns
    /// * `Result<Analyzer>` - Err(InvalidConfig) if a setting is out of range
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Detect the format of a single file
    pub fn detect(&self, file: &RawFile) -> Result<FormatTag> {
        FormatDetector::new(self.config.parser.detect_prefix_bytes).detect(file)
    }

    /// Run every requested analysis and build a session
    ///
    /// Per-file failures are recorded in the file's report and never stop the
    /// other files. Cancellation discards all partial results.
    ///
    /// # Arguments
    /// * `request` - Files, optional DBC and the analyses to run
    /// * `progress` - Receives `{stage, percent}` notifications at chunk boundaries
    /// * `cancel` - Checked at every chunk boundary
    ///
    /// # Returns
    /// * `Result<AnalysisSession>` - Err(Cancelled) if the request was abandoned,
    ///   Err(DbcParse) if the explicit DBC could not be loaded
    ///
    /// # Example
    /// ```no_run
    /// use can_log_analyzer::{AnalysisConfig, AnalysisRequest, Analyzer, CancelToken, NoProgress, RawFile};
    /// use std::path::Path;
    ///
    /// let analyzer = Analyzer::new(AnalysisConfig::default()).unwrap();
    /// let trace = RawFile::from_path(Path::new("trace.asc")).unwrap();
    /// let request = AnalysisRequest::new(vec![trace]);
    /// let session = analyzer.run(&request, &NoProgress, &CancelToken::new()).unwrap();
    ///
    /// for event in &session.errors {
    ///     println!("{:.6} {} {}", event.timestamp, event.error_type, event.description);
    /// }
    /// ```
    pub fn run(&self, request: &AnalysisRequest, progress: &dyn ProgressSink, cancel: &CancelToken) -> Result<AnalysisSession> {
        log::info!(
            "Starting analysis of {} file(s): {}",
            request.files.len(),
            request.analyses.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ")
        );

        let detector = FormatDetector::new(self.config.parser.detect_prefix_bytes);
        let total = request.files.len().max(1) as f32;
        let mut detected: Vec<std::result::Result<FormatTag, AnalyzerError>> = Vec::with_capacity(request.files.len());
        for (i, file) in request.files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AnalyzerError::Cancelled {
                    file: file.name().to_string(),
                });
            }
            detected.push(detector.detect(file));
            progress.report(Progress {
                stage: Stage::Detecting,
                file_id: Some(i as FileId),
                percent: (i + 1) as f32 / total * 100.0,
            });
        }

        progress.report(Progress {
            stage: Stage::LoadingDbc,
            file_id: None,
            percent: 0.0,
        });
        let (decoder, dbc_failures) = self.load_database(request, &detected)?;
        let dbc = decoder
            .database()
            .map(|db| (db.source().to_string(), db.stats()));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parser.max_concurrent_files)
            .build()
            .map_err(|e| AnalyzerError::InvalidConfig(format!("worker pool: {}", e)))?;

        let outcomes: Vec<Result<FileOutcome>> = pool.install(|| {
            request
                .files
                .par_iter()
                .zip(detected.par_iter())
                .enumerate()
                .map(|(i, (file, tag))| {
                    let file_id = i as FileId;
                    let tag = match tag {
                        Ok(tag) => *tag,
                        Err(e) => {
                            let mut report = FileReport::new(file_id, file.name(), FormatTag::Unknown);
                            report.status = FileStatus::Failed {
                                reason: e.to_string(),
                                location: None,
                            };
                            return Ok(FileOutcome::empty(report));
                        }
                    };
                    if let Some(reason) = dbc_failures.get(&file_id) {
                        let report = FileReport::new(file_id, file.name(), tag);
                        return Ok(FileOutcome::empty(
                            report.failed(AnalyzerError::DbcParse(reason.clone())),
                        ));
                    }
                    self.analyze_file(file_id, file, tag, request, decoder.database(), progress, cancel)
                })
                .collect()
        });

        // Merge by file ID
        progress.report(Progress {
            stage: Stage::Merging,
            file_id: None,
            percent: 0.0,
        });
        let mut files = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        let mut messages = Vec::new();
        let mut patterns: Option<PatternAnalyzer> = None;
        let mut signals: HashMap<String, SignalSummary> = HashMap::new();
        for outcome in outcomes {
            let outcome = outcome?;
            files.push(outcome.report);
            errors.extend(outcome.errors);
            messages.extend(outcome.messages);
            if let Some(file_patterns) = outcome.patterns {
                match patterns.as_mut() {
                    Some(merged) => merged.merge(&file_patterns),
                    None => patterns = Some(file_patterns),
                }
            }
            for (name, summary) in outcome.signals {
                match signals.get_mut(&name) {
                    Some(merged) => merged.merge(&summary),
                    None => {
                        signals.insert(name, summary);
                    }
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(AnalyzerError::Cancelled {
                file: String::from("<request>"),
            });
        }

        renumber_errors(&mut errors);

        let clusters = if request.wants(AnalysisKind::Correlation) {
            progress.report(Progress {
                stage: Stage::Correlating,
                file_id: None,
                percent: 0.0,
            });
            Correlator::new(&self.config.correlation).correlate(&errors)
        } else {
            Vec::new()
        };

        let timeline = if request.wants(AnalysisKind::Timeline) {
            progress.report(Progress {
                stage: Stage::BuildingTimeline,
                file_id: None,
                percent: 0.0,
            });
            Some(Timeline::build(messages, errors.clone(), &self.config.timeline))
        } else {
            None
        };

        let patterns = if request.wants(AnalysisKind::Patterns) {
            Some(patterns.map(|p| p.summary()).unwrap_or_else(|| {
                PatternAnalyzer::new(&self.config.patterns).summary()
            }))
        } else {
            None
        };

        let mut signals: Vec<SignalSummary> = signals.into_values().collect();
        signals.sort_by(|a, b| a.name.cmp(&b.name));

        let session = AnalysisSession {
            created_at: Utc::now(),
            analyses: request.analyses.clone(),
            dbc,
            files,
            error_summary: ErrorSummary::from_events(&errors),
            errors,
            clusters,
            patterns,
            signals,
            timeline,
        };

        progress.report(Progress {
            stage: Stage::Complete,
            file_id: None,
            percent: 100.0,
        });
        log::info!(
            "Analysis complete: {} message(s), {} error event(s), {} cluster(s)",
            session.total_messages(),
            session.errors.len(),
            session.clusters.len()
        );
        Ok(session)
    }

    /// Pick the session's single active DBC
    ///
    /// An explicit DBC wins. Otherwise DBC files found among the inputs are loaded
    /// in file order, each replacing the previous one. Failures of input DBC files
    /// are returned per file ID.
    fn load_database(
        &self,
        request: &AnalysisRequest,
        detected: &[std::result::Result<FormatTag, AnalyzerError>],
    ) -> Result<(SignalDecoder, HashMap<FileId, String>)> {
        let mut decoder = SignalDecoder::new();
        let mut failures = HashMap::new();

        if let Some(dbc) = &request.dbc {
            decoder.load_dbc(dbc)?;
        } else {
            for (i, (file, tag)) in request.files.iter().zip(detected).enumerate() {
                if !matches!(tag, Ok(FormatTag::Dbc)) {
                    continue;
                }
                if let Err(e) = decoder.load_dbc(file) {
                    log::warn!("Ignoring DBC {}: {}", file.name(), e);
                    failures.insert(i as FileId, e.to_string());
                }
            }
        }

        if let Some(db) = decoder.database() {
            let stats = db.stats();
            log::info!(
                "Active DBC {}: {} messages, {} signals",
                db.source(),
                stats.num_messages,
                stats.num_signals
            );
        }
        Ok((decoder, failures))
    }

    /// Sequential pipeline over one file's chunked message stream
    #[allow(clippy::too_many_arguments)]
    fn analyze_file(
        &self,
        file_id: FileId,
        file: &RawFile,
        tag: FormatTag,
        request: &AnalysisRequest,
        database: Option<&SignalDatabase>,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<FileOutcome> {
        let mut report = FileReport::new(file_id, file.name(), tag);

        if tag == FormatTag::Unknown {
            log::warn!("Unsupported format: {}", file.name());
            return Ok(FileOutcome::empty(report.failed(AnalyzerError::UnsupportedFormat {
                file: file.name().to_string(),
                reason: "format could not be identified".to_string(),
            })));
        }
        if tag == FormatTag::Dbc {
            // consumed by load_database
            return Ok(FileOutcome::empty(report));
        }

        let mut chunks = match MessageChunks::open(file, tag, file_id, self.config.parser.chunk_size, cancel.clone()) {
            Ok(chunks) => chunks,
            Err(e) => return Ok(FileOutcome::empty(report.failed(e))),
        };

        let mut detector = if request.wants_errors() {
            Some(ErrorDetector::new(&self.config.errors, database)?)
        } else {
            None
        };
        let mut patterns = PatternAnalyzer::new(&self.config.patterns);
        let decode_signals = request.wants(AnalysisKind::Signals) && database.is_some();
        let keep_messages = request.wants(AnalysisKind::Timeline);

        let mut errors = Vec::new();
        let mut messages = Vec::new();
        let mut signals: HashMap<String, SignalSummary> = HashMap::new();
        let mut ids = HashSet::new();
        let mut extended_ids = HashSet::new();
        let size = file.size().max(1) as f32;

        while let Some(chunk) = chunks.next() {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e @ AnalyzerError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    log::warn!("Giving up on {}: {}", file.name(), e);
                    report.parse_stats = chunks.stats().clone();
                    report.skipped_records = report.parse_stats.skipped_records;
                    return Ok(FileOutcome::empty(report.failed(e)));
                }
            };
            log::debug!("{}: chunk of {} message(s)", file.name(), chunk.len());

            for message in &chunk {
                if message.text_line().is_none() {
                    let t = message.timestamp;
                    report.time_range = Some(match report.time_range {
                        Some((start, end)) => (start.min(t), end.max(t)),
                        None => (t, t),
                    });
                    report.channels.insert(message.channel);
                    if message.is_error_frame {
                        report.error_frames += 1;
                    } else {
                        ids.insert(message.id);
                        if message.is_extended {
                            extended_ids.insert(message.id);
                        }
                    }
                }

                if decode_signals {
                    if let Some(db) = database {
                        for signal in crate::signal_decoder::decode(message, db) {
                            if signal.out_of_range {
                                report.signal_anomalies += 1;
                            }
                            signals
                                .entry(signal.signal_name.clone())
                                .or_insert_with(|| SignalSummary::new(&signal))
                                .observe(&signal);
                        }
                    }
                }
                if let Some(detector) = detector.as_mut() {
                    detector.process(message, &mut errors);
                }
                patterns.observe(message);
            }

            if keep_messages {
                messages.extend(chunk.iter().map(TimelineMessage::from));
            }
            progress.report(Progress {
                stage: Stage::Parsing,
                file_id: Some(file_id),
                percent: (chunks.bytes_consumed() as f32 / size * 100.0).min(100.0),
            });
        }

        report.parse_stats = chunks.stats().clone();
        report.total_messages = report.parse_stats.messages;
        report.skipped_records = report.parse_stats.skipped_records;
        report.unique_ids = ids.len();
        report.extended_ids = extended_ids.len();
        report.error_count = errors.len();

        log::info!(
            "{}: {} message(s), {} unique ID(s), {} error event(s)",
            file.name(),
            report.total_messages,
            report.unique_ids,
            report.error_count
        );

        Ok(FileOutcome {
            report,
            errors,
            patterns: request.wants(AnalysisKind::Patterns).then_some(patterns),
            signals,
            messages,
        })
    }
}

/// Order events by time, then source position, and give them session-wide IDs
fn renumber_errors(errors: &mut [ErrorEvent]) {
    errors.sort_by(|a, b| {
        let key = |e: &ErrorEvent| e.source_message_ref.map_or((u32::MAX, u64::MAX), |r| (r.file_id, r.seq));
        a.timestamp
            .total_cmp(&b.timestamp)
            .then_with(|| key(a).cmp(&key(b)))
            .then_with(|| a.id.cmp(&b.id))
    });
    for (i, event) in errors.iter_mut().enumerate() {
        event.id = i as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const ASC: &str = "date Mon Jan 1 10:00:00 2024\n\
base hex  timestamps absolute\n\
   0.000000 1  100             Rx   d 2 01 02\n\
   0.100000 1  100             Rx   d 2 01 02\n\
   0.200000 1  100             Rx   d 2 01 02\n\
   0.600000 1  100             Rx   d 2 01 02\n\
   0.650000 1  ErrorFrame\n";

    fn analyzer() -> Analyzer {
        Analyzer::new(AnalysisConfig::default()).unwrap()
    }

    #[test]
    fn test_analysis_kind_parse() {
        assert_eq!("Errors".parse::<AnalysisKind>().unwrap(), AnalysisKind::Errors);
        assert_eq!(" timeline ".parse::<AnalysisKind>().unwrap(), AnalysisKind::Timeline);
        assert!("bogus".parse::<AnalysisKind>().is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = AnalysisConfig::default().with_chunk_size(0);
        assert!(matches!(Analyzer::new(config), Err(AnalyzerError::InvalidConfig(_))));
    }

    #[test]
    fn test_single_file_session() {
        let request = AnalysisRequest::new(vec![RawFile::from_bytes("trace.asc", ASC)]);
        let session = analyzer().run(&request, &NoProgress, &CancelToken::new()).unwrap();

        assert_eq!(session.files.len(), 1);
        let report = &session.files[0];
        assert!(report.is_completed());
        assert_eq!(report.detected_format, FormatTag::CanAsc);
        assert_eq!(report.total_messages, 5);
        assert_eq!(report.unique_ids, 1);
        assert_eq!(report.error_frames, 1);
        assert_eq!(report.time_range, Some((0.0, 0.65)));

        let types: Vec<ErrorType> = session.errors.iter().map(|e| e.error_type).collect();
        assert_eq!(types, vec![ErrorType::Timeout, ErrorType::ErrorFrame]);
        for (i, event) in session.errors.iter().enumerate() {
            assert_eq!(event.id, i as u64);
        }
        assert_eq!(session.error_summary.total, 2);
        assert_eq!(session.error_summary.at_least(Severity::High), 1);
        assert!(session.patterns.is_some());
        assert_eq!(session.timeline.as_ref().map(|t| t.len()), Some(7));
    }

    #[test]
    fn test_analysis_selection() {
        let request = AnalysisRequest::new(vec![RawFile::from_bytes("trace.asc", ASC)])
            .with_analyses([AnalysisKind::Patterns]);
        let session = analyzer().run(&request, &NoProgress, &CancelToken::new()).unwrap();
        assert!(session.errors.is_empty());
        assert!(session.timeline.is_none());
        assert!(session.clusters.is_empty());
        assert_eq!(session.patterns.as_ref().map(|p| p.total_messages), Some(5));
    }

    #[test]
    fn test_unknown_file_does_not_stop_siblings() {
        let request = AnalysisRequest::new(vec![
            RawFile::from_bytes("noise.bin", vec![0x00, 0x13, 0x37, 0xFE]),
            RawFile::from_bytes("trace.asc", ASC),
        ]);
        let session = analyzer().run(&request, &NoProgress, &CancelToken::new()).unwrap();
        assert!(matches!(session.files[0].status, FileStatus::Unsupported { .. }));
        assert_eq!(session.files[0].detected_format, FormatTag::Unknown);
        assert!(session.files[1].is_completed());
        assert_eq!(session.files[1].file_id, 1);
    }

    #[test]
    fn test_progress_reported_per_chunk() {
        let config = AnalysisConfig::default().with_chunk_size(2);
        let seen = Mutex::new(Vec::new());
        let sink = |p: Progress| seen.lock().unwrap().push(p);
        let request = AnalysisRequest::new(vec![RawFile::from_bytes("trace.asc", ASC)]);
        Analyzer::new(config).unwrap().run(&request, &sink, &CancelToken::new()).unwrap();

        let seen = seen.into_inner().unwrap();
        let parsing: Vec<&Progress> = seen.iter().filter(|p| p.stage == Stage::Parsing).collect();
        assert_eq!(parsing.len(), 3);
        assert!(parsing.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(seen.last().map(|p| p.stage), Some(Stage::Complete));
    }

    #[test]
    fn test_cancelled_request_returns_no_session() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let request = AnalysisRequest::new(vec![RawFile::from_bytes("trace.asc", ASC)]);
        assert!(matches!(
            analyzer().run(&request, &NoProgress, &cancel),
            Err(AnalyzerError::Cancelled { .. })
        ));
    }

    #[test]
    fn test_error_summary() {
        let event = |id, t, severity, error_type| ErrorEvent {
            id,
            error_type,
            severity,
            timestamp: t,
            source_message_ref: None,
            bus_id: None,
            channel: 1,
            code: String::new(),
            description: String::new(),
        };
        let events = vec![
            event(0, 2.0, Severity::Critical, ErrorType::BusOff),
            event(1, 1.0, Severity::High, ErrorType::ErrorFrame),
            event(2, 3.0, Severity::High, ErrorType::ErrorFrame),
        ];
        let summary = ErrorSummary::from_events(&events);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_type.get(&ErrorType::ErrorFrame), Some(&2));
        assert_eq!(summary.by_severity.get(&Severity::Critical), Some(&1));
        assert_eq!(summary.at_least(Severity::High), 3);
        assert_eq!(summary.time_range, Some((1.0, 3.0)));
    }
}
