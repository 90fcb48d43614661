//! Log file format parsers
//!
//! Each supported format has a record reader that turns the raw byte stream into
//! normalized [`Message`]s one record at a time. Readers are a closed set chosen by
//! [`FormatTag`]; [`RecordReader`] dispatches to them with a plain `match`.
//!
//! [`MessageChunks`] sits on top of a reader and hands messages downstream in
//! bounded chunks. No parser ever materializes a whole file.
//!
//! ## Error model
//! - A record that cannot be parsed is counted in [`ParseStats`] and skipped.
//! - The file fails only when framing cannot be established at all
//!   ([`AnalyzerError::FramingFailure`]).

use crate::config::ParserConfig;
use crate::input::{CancelToken, CountingReader, RawFile};
use crate::types::{AnalyzerError, FileId, FormatTag, Location, Message, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub mod asc;
pub mod blf;
pub mod candump;
pub mod csv_export;
pub mod lin;
pub(crate) mod text;
pub mod trc;
pub mod uds;
pub mod xml_export;

/// One unit read from a log file
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Message(Message),
    /// A record that was recognized as data but could not be parsed
    Malformed { at: Location, reason: String },
}

/// Format-specific record reader, one variant per log format
pub enum RecordReader<R: Read> {
    Asc(asc::AscReader<R>),
    CanLog(candump::CanLogReader<R>),
    Trc(trc::TrcReader<R>),
    Blf(blf::BlfReader<R>),
    Lin(lin::LinReader<R>),
    Uds(uds::UdsReader<R>),
    Csv(csv_export::CsvReader<R>),
    Xml(xml_export::XmlReader<R>),
}

impl<R: Read> RecordReader<R> {
    /// Create the reader for `tag` over `reader`
    ///
    /// Fails with `UnsupportedFormat` for tags that carry no message stream, and
    /// with `FramingFailure` if the format's file header is missing.
    pub fn new(tag: FormatTag, reader: R) -> Result<Self> {
        Ok(match tag {
            FormatTag::CanAsc => RecordReader::Asc(asc::AscReader::new(reader)),
            FormatTag::CanLog => RecordReader::CanLog(candump::CanLogReader::new(reader)),
            FormatTag::CanTrc => RecordReader::Trc(trc::TrcReader::new(reader)),
            FormatTag::CanBlf => RecordReader::Blf(blf::BlfReader::new(reader)?),
            FormatTag::Lin => RecordReader::Lin(lin::LinReader::new(reader)),
            FormatTag::Uds => RecordReader::Uds(uds::UdsReader::new(reader)),
            FormatTag::Csv => RecordReader::Csv(csv_export::CsvReader::new(reader)),
            FormatTag::Xml => RecordReader::Xml(xml_export::XmlReader::new(reader)),
            FormatTag::Dbc | FormatTag::Unknown => {
                return Err(AnalyzerError::UnsupportedFormat {
                    file: String::new(),
                    reason: format!("{} files do not contain a message stream", tag),
                })
            }
        })
    }

    /// Read the next record, or `None` at end of input
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        match self {
            RecordReader::Asc(r) => r.next_record(),
            RecordReader::CanLog(r) => r.next_record(),
            RecordReader::Trc(r) => r.next_record(),
            RecordReader::Blf(r) => r.next_record(),
            RecordReader::Lin(r) => r.next_record(),
            RecordReader::Uds(r) => r.next_record(),
            RecordReader::Csv(r) => r.next_record(),
            RecordReader::Xml(r) => r.next_record(),
        }
    }
}

/// Per-file parse accounting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseStats {
    /// Messages handed downstream
    pub messages: u64,
    /// Records recognized as data but skipped because they could not be parsed
    pub skipped_records: u64,
    /// Location of the first skipped record
    pub first_skipped: Option<Location>,
    /// Why the first skipped record was rejected
    pub first_skipped_reason: Option<String>,
    /// Messages whose timestamp went backwards relative to their predecessor
    pub out_of_order: u64,
    /// Chunks emitted
    pub chunks: u64,
}

impl ParseStats {
    fn record_skip(&mut self, at: Location, reason: String) {
        if self.first_skipped.is_none() {
            self.first_skipped = Some(at);
            self.first_skipped_reason = Some(reason);
        }
        self.skipped_records += 1;
    }
}

type Source = CountingReader<Box<dyn Read + Send>>;

/// Lazy, finite sequence of message chunks for one file
///
/// Chunks hold at most `chunk_size` messages. Cancellation is checked at every
/// chunk boundary; after a fatal error or cancellation the iterator is fused.
pub struct MessageChunks {
    reader: RecordReader<Source>,
    file_id: FileId,
    file_name: String,
    chunk_size: usize,
    cancel: CancelToken,
    consumed: Arc<AtomicU64>,
    stats: ParseStats,
    last_timestamp: Option<f64>,
    finished: bool,
}

impl MessageChunks {
    /// Open `file` with the parser for `tag`
    pub fn open(
        file: &RawFile,
        tag: FormatTag,
        file_id: FileId,
        chunk_size: usize,
        cancel: CancelToken,
    ) -> Result<Self> {
        log::info!("Parsing {} file: {}", tag, file.name());

        let (source, consumed) = CountingReader::new(file.open()?);
        let reader = RecordReader::new(tag, source).map_err(|e| e.with_file(file.name()))?;

        Ok(Self {
            reader,
            file_id,
            file_name: file.name().to_string(),
            chunk_size: chunk_size.max(1),
            cancel,
            consumed,
            stats: ParseStats::default(),
            last_timestamp: None,
            finished: false,
        })
    }

    /// Parse statistics so far (complete once the iterator is exhausted)
    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    /// Bytes pulled from the underlying file so far
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    fn accept(&mut self, mut message: Message) -> Message {
        message.file_id = self.file_id;
        message.seq = self.stats.messages;
        self.stats.messages += 1;
        if let Some(last) = self.last_timestamp {
            if message.timestamp < last {
                self.stats.out_of_order += 1;
            }
        }
        self.last_timestamp = Some(message.timestamp);
        message
    }
}

impl Iterator for MessageChunks {
    type Item = Result<Vec<Message>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.finished = true;
            log::info!("Parsing of {} cancelled", self.file_name);
            return Some(Err(AnalyzerError::Cancelled {
                file: self.file_name.clone(),
            }));
        }

        let mut chunk = Vec::with_capacity(self.chunk_size.min(1024));
        while chunk.len() < self.chunk_size {
            match self.reader.next_record() {
                Ok(Some(Record::Message(message))) => {
                    let message = self.accept(message);
                    chunk.push(message);
                }
                Ok(Some(Record::Malformed { at, reason })) => {
                    log::debug!("{}: skipping record at {}: {}", self.file_name, at, reason);
                    self.stats.record_skip(at, reason);
                }
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.with_file(&self.file_name)));
                }
            }
        }

        if chunk.is_empty() {
            if self.stats.skipped_records > 0 {
                log::warn!(
                    "{}: skipped {} malformed record(s), first at {}",
                    self.file_name,
                    self.stats.skipped_records,
                    self.stats.first_skipped.map(|l| l.to_string()).unwrap_or_default()
                );
            }
            return None;
        }
        self.stats.chunks += 1;
        Some(Ok(chunk))
    }
}

/// Parse `file` as `tag` without cancellation
pub fn parse(file: &RawFile, tag: FormatTag, file_id: FileId, config: &ParserConfig) -> Result<MessageChunks> {
    MessageChunks::open(file, tag, file_id, config.chunk_size, CancelToken::new())
}
