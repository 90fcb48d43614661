//! CSV export parser
//!
//! Two layouts are accepted:
//! - Headerless `timestamp,id,dlc,data` where data is one field of hex bytes or
//!   one field per byte.
//! - A header row naming the columns. Recognized names (case and punctuation
//!   insensitive): `time*`, `id`/`can id`/`identifier`/`arbitration id`,
//!   `channel`/`bus`, `dir`/`direction`, `dlc`/`length`, `data`/`payload`,
//!   or per-byte columns such as `d0..d7`/`byte0..byte7`.
//!
//! A header without time or ID column means framing cannot be established.

use crate::formats::text::{parse_hex_byte, parse_hex_string, parse_id, parse_timestamp};
use crate::formats::Record;
use crate::types::{AnalyzerError, Direction, FormatTag, Location, Message, Result};
use std::io::Read;

#[derive(Debug, Clone, Default)]
struct Columns {
    time: usize,
    id: usize,
    channel: Option<usize>,
    direction: Option<usize>,
    dlc: Option<usize>,
    data: DataColumns,
}

#[derive(Debug, Clone, Default)]
enum DataColumns {
    /// One field holding all bytes (`01 02 03` or `010203`)
    Single(usize),
    /// One field per byte
    PerByte(Vec<usize>),
    /// All fields from this index on are bytes
    #[default]
    Rest,
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn byte_column_index(name: &str) -> Option<usize> {
    ["data", "byte", "d", "b"].iter().find_map(|prefix| {
        let digits = name.strip_prefix(prefix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    })
}

impl Columns {
    fn headerless() -> Self {
        Self {
            time: 0,
            id: 1,
            dlc: Some(2),
            data: DataColumns::Rest,
            ..Default::default()
        }
    }

    fn from_header(names: &[String]) -> std::result::Result<Self, String> {
        let mut time = None;
        let mut id = None;
        let mut columns = Columns::default();
        let mut data = None;
        let mut byte_columns: Vec<(usize, usize)> = Vec::new();

        for (i, raw) in names.iter().enumerate() {
            let name = normalize(raw);
            match name.as_str() {
                "id" | "canid" | "identifier" | "arbitrationid" | "arbid" | "msgid" | "messageid" | "frameid" => {
                    id = id.or(Some(i))
                }
                "channel" | "chn" | "ch" | "bus" => columns.channel = columns.channel.or(Some(i)),
                "dir" | "direction" | "rxtx" => columns.direction = columns.direction.or(Some(i)),
                "dlc" | "length" | "len" => columns.dlc = columns.dlc.or(Some(i)),
                "data" | "payload" | "bytes" | "databytes" => data = data.or(Some(i)),
                n if n.contains("time") => time = time.or(Some(i)),
                n => {
                    if let Some(index) = byte_column_index(n) {
                        byte_columns.push((index, i));
                    }
                }
            }
        }

        columns.time = time.ok_or("CSV header has no time column")?;
        columns.id = id.ok_or("CSV header has no ID column")?;
        columns.data = match data {
            Some(i) => DataColumns::Single(i),
            None if !byte_columns.is_empty() => {
                byte_columns.sort();
                DataColumns::PerByte(byte_columns.into_iter().map(|(_, i)| i).collect())
            }
            None => DataColumns::PerByte(Vec::new()),
        };
        Ok(columns)
    }
}

pub struct CsvReader<R: Read> {
    reader: csv::Reader<R>,
    record: csv::ByteRecord,
    columns: Option<Columns>,
}

impl<R: Read> CsvReader<R> {
    pub fn new(reader: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(reader);
        Self {
            reader,
            record: csv::ByteRecord::new(),
            columns: None,
        }
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(false) => return Ok(None),
                Ok(true) => {}
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or(0);
                    return match e.into_kind() {
                        csv::ErrorKind::Io(io) => Err(io.into()),
                        other => Ok(Some(Record::Malformed {
                            at: Location::Line(line),
                            reason: format!("{:?}", other),
                        })),
                    };
                }
            }

            let line = self.record.position().map(|p| p.line()).unwrap_or(0);
            let fields: Vec<String> = self
                .record
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect();
            if fields.iter().all(|f| f.is_empty()) {
                continue;
            }

            if self.columns.is_none() {
                if parse_timestamp(&fields[0]).is_some() {
                    self.columns = Some(Columns::headerless());
                } else {
                    let columns = Columns::from_header(&fields)
                        .map_err(|reason| AnalyzerError::framing(Location::Line(line), reason))?;
                    self.columns = Some(columns);
                    continue;
                }
            }
            let Some(columns) = &self.columns else {
                continue;
            };

            return Ok(Some(match parse_fields(columns, &fields) {
                Ok(message) => Record::Message(message),
                Err(reason) => Record::Malformed {
                    at: Location::Line(line),
                    reason,
                },
            }));
        }
    }
}

fn field<'a>(fields: &'a [String], index: usize, name: &str) -> std::result::Result<&'a str, String> {
    fields
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("missing {} field", name))
}

fn parse_fields(columns: &Columns, fields: &[String]) -> std::result::Result<Message, String> {
    let ts_field = field(fields, columns.time, "time")?;
    let timestamp = parse_timestamp(ts_field).ok_or_else(|| format!("invalid timestamp '{}'", ts_field))?;
    let id_field = field(fields, columns.id, "ID")?;
    let (id, marked) = parse_id(id_field, 16).ok_or_else(|| format!("invalid identifier '{}'", id_field))?;

    let mut data = match &columns.data {
        DataColumns::Single(i) => {
            let raw = fields.get(*i).map(String::as_str).unwrap_or("");
            parse_hex_string(raw).ok_or_else(|| format!("invalid data '{}'", raw))?
        }
        DataColumns::PerByte(indices) => indices
            .iter()
            .filter_map(|i| fields.get(*i).filter(|f| !f.is_empty()))
            .map(|f| parse_hex_byte(f).ok_or_else(|| format!("invalid data byte '{}'", f)))
            .collect::<std::result::Result<Vec<u8>, String>>()?,
        DataColumns::Rest => {
            let start = columns.dlc.map_or(columns.id, |d| d.max(columns.id)) + 1;
            let joined = fields.get(start..).unwrap_or(&[]).join(" ");
            parse_hex_string(&joined).ok_or_else(|| format!("invalid data '{}'", joined))?
        }
    };

    if let Some(i) = columns.dlc {
        let raw = field(fields, i, "DLC")?;
        let dlc: usize = raw.parse().map_err(|_| format!("invalid DLC '{}'", raw))?;
        if dlc > data.len() {
            return Err(format!("DLC {} but only {} data bytes", dlc, data.len()));
        }
        data.truncate(dlc);
    }
    if data.len() > 64 {
        return Err(format!("payload of {} bytes", data.len()));
    }

    let channel = match columns.channel {
        Some(i) => {
            let raw = field(fields, i, "channel")?;
            raw.trim_start_matches(|c: char| !c.is_ascii_digit())
                .parse()
                .map_err(|_| format!("invalid channel '{}'", raw))?
        }
        None => 0,
    };

    let mut message = Message::new(timestamp, channel, id, data, FormatTag::Csv);
    message.is_extended = marked || id > 0x7FF;
    message.is_fd = message.data.len() > 8;
    if let Some(i) = columns.direction {
        message.direction = fields.get(i).and_then(|d| Direction::parse(d)).unwrap_or_default();
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(content: &str) -> Result<Vec<Record>> {
        let mut reader = CsvReader::new(Cursor::new(content.as_bytes().to_vec()));
        let mut records = Vec::new();
        while let Some(record) = reader.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    fn message(record: &Record) -> &Message {
        match record {
            Record::Message(m) => m,
            Record::Malformed { reason, .. } => panic!("unexpected malformed record: {}", reason),
        }
    }

    #[test]
    fn test_headerless_rows() {
        let records = read_all("0.100,123,3,01,02,03\n0.200,7E8,2,AA BB\n").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(message(&records[0]).data, vec![1, 2, 3]);
        assert_eq!(message(&records[1]).id, 0x7E8);
        assert_eq!(message(&records[1]).data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_header_driven_columns() {
        let records = read_all(
            "Time [s],Channel,CAN ID,Dir,DLC,Data\n\
             1.5,CAN2,18FECA00,Tx,4,01 02 03 04\n\
             1.6,CAN1,100,Rx,1,FF\n",
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        let first = message(&records[0]);
        assert_eq!(first.channel, 2);
        assert!(first.is_extended);
        assert_eq!(first.direction, Direction::Tx);
        assert_eq!(first.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_per_byte_columns() {
        let records = read_all("timestamp,id,d0,d1,d2\n0.5,200,10,20,\n").unwrap();
        assert_eq!(message(&records[0]).data, vec![0x10, 0x20]);
    }

    #[test]
    fn test_missing_id_column_is_framing_failure() {
        let err = read_all("time,value\n0.1,5\n").unwrap_err();
        assert!(matches!(err, AnalyzerError::FramingFailure { offset: Location::Line(1), .. }));
    }

    #[test]
    fn test_bad_rows_are_skipped() {
        let records = read_all("0.1,123,2,01,02\n0.2,123,4,01\nnot,a,row\n0.3,124,0\n").unwrap();
        assert_eq!(records.len(), 4);
        assert!(matches!(records[1], Record::Malformed { at: Location::Line(2), .. }));
        assert!(matches!(records[2], Record::Malformed { at: Location::Line(3), .. }));
        assert!(message(&records[3]).data.is_empty());
    }
}
