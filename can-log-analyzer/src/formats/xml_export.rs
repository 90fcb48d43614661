//! XML export parser
//!
//! Frames are elements named `Frame`, `Message`, `CanFrame`, `CanMessage` or `Msg`
//! (case-insensitive). Fields may be given as attributes or as child elements:
//!
//! ```xml
//! <Frame time="0.010" id="123" channel="1" dir="Rx" data="01 02 03"/>
//! <Message><Time>0.020</Time><ID>18FECA00</ID><Data>AABB</Data></Message>
//! ```
//!
//! Recognized fields: `time`/`timestamp`, `id`, `channel`/`bus`, `dir`,
//! `data`, `dlc`, `error`, `extended`. Malformed XML cannot be resynchronized and
//! fails the file.

use crate::formats::text::{parse_hex_string, parse_id, parse_timestamp};
use crate::formats::Record;
use crate::types::{AnalyzerError, Direction, FormatTag, Location, Message, Result};
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{BufReader, Read};

const FRAME_ELEMENTS: &[&str] = &["frame", "message", "canframe", "canmessage", "msg"];

fn is_frame_element(name: &str) -> bool {
    FRAME_ELEMENTS.contains(&name)
}

fn parse_attrs(e: &BytesStart) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for attr in e.attributes().filter_map(std::result::Result::ok) {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
        let value = String::from_utf8_lossy(&attr.value).trim().to_string();
        attrs.insert(key, value);
    }
    attrs
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase()
}

/// Frame fields collected from attributes and child elements
struct PendingFrame {
    at: u64,
    fields: HashMap<String, String>,
}

pub struct XmlReader<R: Read> {
    reader: Reader<BufReader<R>>,
    buf: Vec<u8>,
    current: Option<PendingFrame>,
    field: Option<String>,
}

impl<R: Read> XmlReader<R> {
    pub fn new(reader: R) -> Self {
        let mut reader = Reader::from_reader(BufReader::new(reader));
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            current: None,
            field: None,
        }
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let position = self.reader.buffer_position() as u64;
            self.buf.clear();
            let event = self
                .reader
                .read_event_into(&mut self.buf)
                .map_err(|e| AnalyzerError::framing(Location::Byte(position), format!("invalid XML: {}", e)))?;

            match event {
                XmlEvent::Start(ref e) => {
                    let name = element_name(e);
                    if self.current.is_none() && is_frame_element(&name) {
                        self.current = Some(PendingFrame {
                            at: position,
                            fields: parse_attrs(e),
                        });
                    } else if self.current.is_some() {
                        self.field = Some(name);
                    }
                }
                XmlEvent::Empty(ref e) => {
                    let name = element_name(e);
                    if self.current.is_none() && is_frame_element(&name) {
                        let frame = PendingFrame {
                            at: position,
                            fields: parse_attrs(e),
                        };
                        return Ok(Some(finish(frame)));
                    }
                }
                XmlEvent::Text(ref t) => {
                    if let (Some(frame), Some(field)) = (self.current.as_mut(), self.field.as_ref()) {
                        let text = String::from_utf8_lossy(t).trim().to_string();
                        frame.fields.insert(field.clone(), text);
                    }
                }
                XmlEvent::End(ref e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                    if self.field.as_deref() == Some(name.as_str()) {
                        self.field = None;
                    } else if is_frame_element(&name) {
                        if let Some(frame) = self.current.take() {
                            self.field = None;
                            return Ok(Some(finish(frame)));
                        }
                    }
                }
                XmlEvent::Eof => {
                    return match self.current.take() {
                        Some(frame) => Ok(Some(Record::Malformed {
                            at: Location::Byte(frame.at),
                            reason: "document ends inside a frame element".to_string(),
                        })),
                        None => Ok(None),
                    };
                }
                _ => {}
            }
        }
    }
}

fn finish(frame: PendingFrame) -> Record {
    match build_message(&frame.fields) {
        Ok(message) => Record::Message(message),
        Err(reason) => Record::Malformed {
            at: Location::Byte(frame.at),
            reason,
        },
    }
}

fn lookup<'a>(fields: &'a HashMap<String, String>, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|n| fields.get(*n)).map(String::as_str)
}

fn flag(fields: &HashMap<String, String>, names: &[&str]) -> bool {
    lookup(fields, names).map_or(false, |v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
}

fn build_message(fields: &HashMap<String, String>) -> std::result::Result<Message, String> {
    let ts = lookup(fields, &["time", "timestamp", "ts", "t"]).ok_or("missing time")?;
    let timestamp = parse_timestamp(ts).ok_or_else(|| format!("invalid timestamp '{}'", ts))?;
    let is_error = flag(fields, &["error", "errorframe"]);

    let (id, marked) = match lookup(fields, &["id", "canid", "identifier"]) {
        Some(raw) => parse_id(raw, 16).ok_or_else(|| format!("invalid identifier '{}'", raw))?,
        None if is_error => (0, false),
        None => return Err("missing id".to_string()),
    };
    let data = match lookup(fields, &["data", "payload"]) {
        Some(raw) => parse_hex_string(raw).ok_or_else(|| format!("invalid data '{}'", raw))?,
        None => Vec::new(),
    };
    if data.len() > 64 {
        return Err(format!("payload of {} bytes", data.len()));
    }
    if let Some(raw) = lookup(fields, &["dlc", "length"]) {
        let dlc: usize = raw.parse().map_err(|_| format!("invalid DLC '{}'", raw))?;
        if dlc != data.len() {
            return Err(format!("DLC {} but {} data bytes", dlc, data.len()));
        }
    }
    let channel = match lookup(fields, &["channel", "chn", "bus"]) {
        Some(raw) => raw.parse().map_err(|_| format!("invalid channel '{}'", raw))?,
        None => 0,
    };

    let mut message = Message::new(timestamp, channel, id, data, FormatTag::Xml);
    message.is_extended = marked || id > 0x7FF || flag(fields, &["extended", "ext"]);
    message.is_fd = message.data.len() > 8 || flag(fields, &["fd"]);
    message.is_error_frame = is_error;
    message.is_remote_frame = flag(fields, &["remote", "rtr"]);
    if let Some(dir) = lookup(fields, &["dir", "direction"]).and_then(Direction::parse) {
        message.direction = dir;
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(content: &str) -> Result<Vec<Record>> {
        let mut reader = XmlReader::new(Cursor::new(content.as_bytes().to_vec()));
        let mut records = Vec::new();
        while let Some(record) = reader.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    #[test]
    fn test_attribute_and_child_element_frames() {
        let records = read_all(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<CanLog>
  <Frame time="0.010" id="123" channel="1" dir="Tx" data="01 02 03"/>
  <Message>
    <Time>0.020</Time>
    <ID>18FECA00</ID>
    <Data>AABB</Data>
  </Message>
  <Frame time="0.030" error="true"/>
</CanLog>"#,
        )
        .unwrap();
        assert_eq!(records.len(), 3);

        let Record::Message(first) = &records[0] else { panic!("expected message") };
        assert_eq!(first.id, 0x123);
        assert_eq!(first.direction, Direction::Tx);
        assert_eq!(first.data, vec![1, 2, 3]);

        let Record::Message(second) = &records[1] else { panic!("expected message") };
        assert_eq!(second.id, 0x18FECA00);
        assert!(second.is_extended);
        assert_eq!(second.data, vec![0xAA, 0xBB]);

        let Record::Message(third) = &records[2] else { panic!("expected message") };
        assert!(third.is_error_frame);
    }

    #[test]
    fn test_bad_frame_is_malformed() {
        let records = read_all(r#"<Log><Frame time="x" id="1"/><Frame time="1.0" id="2"/></Log>"#).unwrap();
        assert!(matches!(records[0], Record::Malformed { .. }));
        assert!(matches!(records[1], Record::Message(_)));
    }

    #[test]
    fn test_broken_xml_is_framing_failure() {
        let err = read_all("<Log><Frame time=\"1.0\" id=\"2\"></Log>").unwrap_err();
        assert!(matches!(err, AnalyzerError::FramingFailure { .. }));
    }
}
