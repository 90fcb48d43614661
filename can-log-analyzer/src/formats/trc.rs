//! PEAK PCAN trace (TRC) parser
//!
//! Column layout depends on the file version announced by `;$FILEVERSION` and
//! may be overridden by a `;$COLUMNS` header. Without a version header the layout
//! is inferred from the first data line (1.0 vs 1.1).
//!
//! | Version | Columns                                   |
//! |---------|-------------------------------------------|
//! | 1.0     | `N) O I L D`                              |
//! | 1.1     | `N) O T I L D`                            |
//! | 1.2     | `N) O B T I L D`                          |
//! | 1.3     | `N) O B T I R L D`                        |
//! | 2.0     | `N O T I d L D`                           |
//! | 2.1     | `N O T B I d R L D`                       |
//!
//! `O` is the offset from measurement start in milliseconds.

use crate::formats::text::{fd_dlc_to_len, malformed, parse_hex_tokens, parse_id, parse_timestamp, LineReader};
use crate::formats::Record;
use crate::types::{AnalyzerError, Direction, FormatTag, Location, Message, Result};
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Number,
    Offset,
    Type,
    Bus,
    Id,
    Direction,
    Reserved,
    Dlc,
    DataLength,
    Data,
}

impl Column {
    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "N" => Column::Number,
            "O" => Column::Offset,
            "T" => Column::Type,
            "B" => Column::Bus,
            "I" => Column::Id,
            "d" => Column::Direction,
            "R" => Column::Reserved,
            "L" => Column::Dlc,
            "l" => Column::DataLength,
            "D" => Column::Data,
            _ => return None,
        })
    }
}

fn columns_for_version(version: &str) -> Option<Vec<Column>> {
    use Column::*;
    Some(match version {
        "1.0" => vec![Number, Offset, Id, Dlc, Data],
        "1.1" => vec![Number, Offset, Type, Id, Dlc, Data],
        "1.2" => vec![Number, Offset, Bus, Type, Id, Dlc, Data],
        "1.3" => vec![Number, Offset, Bus, Type, Id, Reserved, Dlc, Data],
        "2.0" => vec![Number, Offset, Type, Id, Direction, Dlc, Data],
        "2.1" => vec![Number, Offset, Type, Bus, Id, Direction, Reserved, Dlc, Data],
        _ => return None,
    })
}

pub struct TrcReader<R> {
    lines: LineReader<R>,
    columns: Option<Vec<Column>>,
}

impl<R: Read> TrcReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: LineReader::new(reader),
            columns: None,
        }
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        while let Some((line_no, line)) = self.lines.next_line()? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix(';') {
                self.consume_header(header.trim(), line_no)?;
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            let columns = self.columns_for(&tokens, line_no)?;
            match parse_line(&columns, &tokens) {
                Ok(Some(message)) => return Ok(Some(Record::Message(message))),
                Ok(None) => continue,
                Err(reason) => return Ok(Some(malformed(line_no, reason))),
            }
        }
        Ok(None)
    }

    fn consume_header(&mut self, header: &str, line_no: u64) -> Result<()> {
        if let Some(version) = header.strip_prefix("$FILEVERSION=") {
            let version = version.trim();
            if self.columns.is_none() {
                let columns = columns_for_version(version).ok_or_else(|| {
                    AnalyzerError::framing(Location::Line(line_no), format!("unsupported TRC version {}", version))
                })?;
                self.columns = Some(columns);
            }
        } else if let Some(spec) = header.strip_prefix("$COLUMNS=") {
            let columns: Option<Vec<Column>> = spec.split(',').map(|s| Column::from_symbol(s.trim())).collect();
            match columns {
                Some(columns) if columns.last() == Some(&Column::Data) => self.columns = Some(columns),
                _ => {
                    return Err(AnalyzerError::framing(
                        Location::Line(line_no),
                        format!("unusable $COLUMNS header '{}'", spec),
                    ))
                }
            }
        }
        Ok(())
    }

    fn columns_for(&mut self, tokens: &[&str], line_no: u64) -> Result<Vec<Column>> {
        if let Some(columns) = &self.columns {
            return Ok(columns.clone());
        }
        // no header: 1.1 carries Rx/Tx in the third column, 1.0 does not
        let version = match tokens.get(2) {
            Some(t) if Direction::parse(t).is_some() => "1.1",
            _ => "1.0",
        };
        log::debug!("TRC without $FILEVERSION at line {}, assuming {}", line_no, version);
        let columns = columns_for_version(version).unwrap_or_default();
        self.columns = Some(columns.clone());
        Ok(columns)
    }
}

/// What the `T` column says about the record
enum Kind {
    Data { fd: bool, brs: bool, esi: bool },
    Remote,
    Error,
    Status,
}

fn parse_kind(token: &str, direction: &mut Option<Direction>) -> std::result::Result<Kind, String> {
    Ok(match token {
        "DT" => Kind::Data { fd: false, brs: false, esi: false },
        "FD" => Kind::Data { fd: true, brs: false, esi: false },
        "FB" => Kind::Data { fd: true, brs: true, esi: false },
        "FE" => Kind::Data { fd: true, brs: false, esi: true },
        "BI" => Kind::Data { fd: true, brs: true, esi: true },
        "RR" => Kind::Remote,
        "ER" | "Error" => Kind::Error,
        "ST" | "EC" | "EV" | "Warng" => Kind::Status,
        other => match Direction::parse(other) {
            Some(d) => {
                *direction = Some(d);
                Kind::Data { fd: false, brs: false, esi: false }
            }
            None => return Err(format!("unknown record type '{}'", other)),
        },
    })
}

fn parse_line(columns: &[Column], tokens: &[&str]) -> std::result::Result<Option<Message>, String> {
    let mut timestamp = None;
    let mut kind = Kind::Data { fd: false, brs: false, esi: false };
    let mut direction = None;
    let mut bus = 1u8;
    let mut id = None;
    let mut dlc = None;
    let mut data_len = None;
    let mut data_tokens: &[&str] = &[];

    for (i, column) in columns.iter().enumerate() {
        let token = match tokens.get(i) {
            Some(t) => *t,
            None if *column == Column::Data => break,
            None => return Err("truncated record".to_string()),
        };
        match column {
            Column::Number => {
                token
                    .trim_end_matches(')')
                    .parse::<u64>()
                    .map_err(|_| format!("invalid record number '{}'", token))?;
            }
            Column::Offset => {
                let ms = parse_timestamp(token).ok_or_else(|| format!("invalid offset '{}'", token))?;
                timestamp = Some(ms / 1000.0);
            }
            Column::Type => kind = parse_kind(token, &mut direction)?,
            Column::Bus => bus = token.parse().map_err(|_| format!("invalid bus '{}'", token))?,
            Column::Id => {
                if token != "-" {
                    let (value, marked) = parse_id(token, 16).ok_or_else(|| format!("invalid identifier '{}'", token))?;
                    id = Some((value, marked || token.len() > 4 || value > 0x7FF));
                }
            }
            Column::Direction => {
                direction = Some(Direction::parse(token).ok_or_else(|| format!("invalid direction '{}'", token))?)
            }
            Column::Reserved => {}
            Column::Dlc => dlc = Some(u8::from_str_radix(token, 16).map_err(|_| format!("invalid DLC '{}'", token))?),
            Column::DataLength => {
                data_len = Some(token.parse::<usize>().map_err(|_| format!("invalid data length '{}'", token))?)
            }
            Column::Data => {
                data_tokens = &tokens[i..];
                break;
            }
        }
    }

    let timestamp = timestamp.ok_or("missing offset column")?;
    let status_text = data_tokens.join(" ").to_ascii_uppercase();

    let mut message = match kind {
        Kind::Status => {
            if !status_text.contains("BUSOFF") {
                return Ok(None);
            }
            let mut message = Message::new(timestamp, bus, 0, Vec::new(), FormatTag::CanTrc);
            message.is_bus_off = true;
            message
        }
        Kind::Error => {
            let mut message = Message::new(timestamp, bus, 0, Vec::new(), FormatTag::CanTrc);
            message.is_error_frame = true;
            message.is_bus_off = status_text.contains("BUSOFF");
            message
        }
        Kind::Remote => {
            let (id, extended) = id.ok_or("missing identifier")?;
            let mut message = Message::new(timestamp, bus, id, Vec::new(), FormatTag::CanTrc);
            message.is_remote_frame = true;
            message.is_extended = extended;
            message
        }
        Kind::Data { fd, brs, esi } => {
            let (id, extended) = id.ok_or("missing identifier")?;
            if data_tokens.first() == Some(&"RTR") {
                let mut message = Message::new(timestamp, bus, id, Vec::new(), FormatTag::CanTrc);
                message.is_remote_frame = true;
                message.is_extended = extended;
                message.direction = direction.unwrap_or_default();
                return Ok(Some(message));
            }
            let dlc = dlc.ok_or("missing DLC")?;
            let len = data_len.unwrap_or(if fd { fd_dlc_to_len(dlc) } else { usize::from(dlc.min(8)) });
            if data_tokens.len() < len {
                return Err(format!("expected {} data bytes", len));
            }
            let data = parse_hex_tokens(data_tokens[..len].iter().copied()).ok_or("invalid data byte")?;
            let mut message = Message::new(timestamp, bus, id, data, FormatTag::CanTrc);
            message.is_extended = extended;
            message.is_fd = fd;
            if brs {
                message.set_meta("brs", "1");
            }
            if esi {
                message.set_meta("esi", "1");
            }
            message
        }
    };
    message.direction = direction.unwrap_or_default();
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(content: &str) -> Result<Vec<Record>> {
        let mut reader = TrcReader::new(Cursor::new(content.as_bytes().to_vec()));
        let mut records = Vec::new();
        while let Some(record) = reader.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    fn messages(records: &[Record]) -> Vec<&Message> {
        records
            .iter()
            .filter_map(|r| match r {
                Record::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_version_1_0_without_header() {
        let records = read_all(
            ";##########################################################################\n\
             ;   Message Number\n\
             ;   |         Time Offset (ms)\n\
                  1)      1841  0001  8  00 00 00 00 00 00 00 00\n\
                  2)      1842  0008  4  01 02 03 04\n",
        )
        .unwrap();
        let msgs = messages(&records);
        assert_eq!(msgs.len(), 2);
        assert!((msgs[0].timestamp - 1.841).abs() < 1e-9);
        assert_eq!(msgs[1].id, 0x0008);
        assert_eq!(msgs[1].data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_version_1_1() {
        let records = read_all(
            ";$FILEVERSION=1.1\n\
             ;$STARTTIME=43169.6048465278\n\
                  1)      1059.9  Rx         0300  8  00 00 00 00 04 00 00 00\n\
                  2)      1060.0  Tx     18EFFF00  2  AA BB\n\
                  3)      1062.5  Warng  FFFFFFFF  4  00 00 00 08  BUSHEAVY\n",
        )
        .unwrap();
        let msgs = messages(&records);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].id, 0x300);
        assert!(!msgs[0].is_extended);
        assert!(msgs[1].is_extended);
        assert_eq!(msgs[1].direction, Direction::Tx);
    }

    #[test]
    fn test_version_2_1_with_fd_and_errors() {
        let records = read_all(
            ";$FILEVERSION=2.1\n\
             ;$COLUMNS=N,O,T,B,I,d,R,L,D\n\
                  1      1059.900 DT 1      0300 Rx -  8    00 00 00 00 04 00 00 00\n\
                  2      1060.000 FB 2      0400 Tx -  9    01 02 03 04 05 06 07 08 09 0A 0B 0C\n\
                  3      1061.000 ER 1      -    Rx -  5    04 00 08 00 00\n\
                  4      1062.000 RR 1      0500 Rx -  4\n",
        )
        .unwrap();
        let msgs = messages(&records);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].channel, 1);
        assert!(msgs[1].is_fd);
        assert_eq!(msgs[1].data.len(), 12);
        assert_eq!(msgs[1].channel, 2);
        assert!(msgs[2].is_error_frame);
        assert!(msgs[3].is_remote_frame);
    }

    #[test]
    fn test_unknown_version_fails_framing() {
        let err = read_all(";$FILEVERSION=9.9\n 1 1.0 DT 0300 Rx 1 00\n").unwrap_err();
        assert!(matches!(err, AnalyzerError::FramingFailure { .. }));
    }

    #[test]
    fn test_bad_record_is_skipped() {
        let records = read_all(
            ";$FILEVERSION=2.0\n\
                  1      1.000 DT 0300 Rx 8 00 00\n\
                  2      2.000 DT 0300 Rx 1 00\n",
        )
        .unwrap();
        assert!(matches!(records[0], Record::Malformed { at: Location::Line(2), .. }));
        assert_eq!(messages(&records).len(), 1);
    }
}
