//! BLF (Binary Log Format) file parser
//!
//! Reads Vector BLF files object by object from any sequential reader.
//! BLF is a proprietary format from Vector Informatik for storing bus data.
//!
//! ## Layout
//! - File header: `LOGG` signature, header size (u32, usually 144)
//! - Objects: `LOBJ` base header (16 bytes), then a v1 (32 byte) or v2 (40 byte)
//!   header carrying flags and the timestamp, then the payload. Objects are padded
//!   to 4 bytes.
//! - Log containers (type 10) hold a zlib-compressed stream of further objects.
//!   An object may span two containers.
//!
//! ## Supported Object Types
//! - Type 1/86 (CanMessage/CanMessage2): classic CAN frames
//! - Type 100/101 (CanFdMessage/CanFdMessage64): CAN-FD frames
//! - Type 2/73 (CanError/CanErrorExt): error frames
//! - Type 11 (LinMessage): LIN frames
//!
//! Other object types are skipped using their declared size (logged once per type).
//! A corrupt object is reported as malformed and the reader resynchronizes on the
//! next `LOBJ` signature.

use crate::formats::lin;
use crate::formats::Record;
use crate::types::{AnalyzerError, Direction, FormatTag, Location, Message, Result};
use byteorder::{ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use std::collections::{HashSet, VecDeque};
use std::io::{self, Read};

const FILE_SIGNATURE: &[u8; 4] = b"LOGG";
const OBJECT_SIGNATURE: &[u8; 4] = b"LOBJ";
const OBJ_HEADER_BASE_SIZE: usize = 16;
const OBJ_HEADER_V1_SIZE: usize = 32;
const MAX_OBJECT_SIZE: usize = 16 * 1024 * 1024;
const RESYNC_LIMIT: u64 = 4 * 1024 * 1024;

/// Object type IDs used by this reader
pub mod object_type {
    pub const CAN_MESSAGE: u32 = 1;
    pub const CAN_ERROR: u32 = 2;
    pub const LOG_CONTAINER: u32 = 10;
    pub const LIN_MESSAGE: u32 = 11;
    pub const CAN_ERROR_EXT: u32 = 73;
    pub const CAN_MESSAGE2: u32 = 86;
    pub const CAN_FD_MESSAGE: u32 = 100;
    pub const CAN_FD_MESSAGE_64: u32 = 101;
}

const CAN_MSG_EXT: u32 = 0x8000_0000;
const TIME_TEN_MICS: u32 = 0x0000_0001;

// CAN_MESSAGE / CAN_FD_MESSAGE flags
const DIR_TX: u8 = 0x01;
const REMOTE_FLAG: u8 = 0x80;

// CAN_FD_MESSAGE fd_flags
const FD_EDL: u8 = 0x01;
const FD_BRS: u8 = 0x02;
const FD_ESI: u8 = 0x04;

// CAN_FD_MESSAGE_64 flags
const FD64_REMOTE: u32 = 0x0010;
const FD64_EDL: u32 = 0x1000;
const FD64_BRS: u32 = 0x2000;
const FD64_ESI: u32 = 0x4000;

/// Sequential BLF object reader
pub struct BlfReader<R> {
    reader: R,
    /// Bytes handed back by a resync scan, read before `reader`
    carry: Vec<u8>,
    /// Logical offset of the next unread byte
    offset: u64,
    /// Decompressed container bytes not yet consumed
    inner: Vec<u8>,
    /// File offset of the container currently feeding `inner`
    container_at: u64,
    pending: VecDeque<Record>,
    skipped_types: HashSet<u32>,
    eof: bool,
}

impl<R: Read> BlfReader<R> {
    /// Read and validate the file header
    pub fn new(mut reader: R) -> Result<Self> {
        let mut header = [0u8; 8];
        if read_full(&mut reader, &mut header)? < header.len() {
            return Err(AnalyzerError::framing(Location::Byte(0), "file too short for a BLF header"));
        }
        if &header[0..4] != FILE_SIGNATURE {
            return Err(AnalyzerError::framing(Location::Byte(0), "missing LOGG file signature"));
        }
        let header_size = LittleEndian::read_u32(&header[4..8]) as u64;
        if header_size < 8 {
            return Err(AnalyzerError::framing(
                Location::Byte(4),
                format!("invalid file header size {}", header_size),
            ));
        }
        let skipped = io::copy(&mut (&mut reader).take(header_size - 8), &mut io::sink())?;
        if skipped < header_size - 8 {
            return Err(AnalyzerError::framing(Location::Byte(8 + skipped), "truncated file header"));
        }
        log::debug!("BLF file header: {} bytes", header_size);

        Ok(Self {
            reader,
            carry: Vec::new(),
            offset: header_size,
            inner: Vec::new(),
            container_at: 0,
            pending: VecDeque::new(),
            skipped_types: HashSet::new(),
            eof: false,
        })
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            if self.eof {
                return Ok(None);
            }
            self.read_object()?;
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.carry.is_empty() {
            let n = buf.len().min(self.carry.len());
            buf[..n].copy_from_slice(&self.carry[..n]);
            self.carry.drain(..n);
            self.offset += n as u64;
            return Ok(n);
        }
        let n = loop {
            match self.reader.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.offset += n as u64;
        Ok(n)
    }

    fn fill_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.fill(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn push_back(&mut self, bytes: &[u8]) {
        let mut carry = bytes.to_vec();
        carry.extend_from_slice(&self.carry);
        self.carry = carry;
        self.offset -= bytes.len() as u64;
    }

    fn malformed(&mut self, at: u64, reason: impl Into<String>) {
        self.pending.push_back(Record::Malformed {
            at: Location::Byte(at),
            reason: reason.into(),
        });
    }

    /// Read one top-level object, queueing whatever records it yields
    fn read_object(&mut self) -> Result<()> {
        let start = self.offset;
        let mut base = [0u8; OBJ_HEADER_BASE_SIZE];
        let n = self.fill_full(&mut base)?;
        if n < base.len() {
            self.eof = true;
            if n > 0 && base[..n].iter().any(|b| *b != 0) {
                self.malformed(start, "truncated object header");
            }
            self.finish_inner();
            return Ok(());
        }

        if &base[0..4] != OBJECT_SIGNATURE {
            self.malformed(start, "missing LOBJ object signature");
            return self.resync(&base[1..], start);
        }
        let header_size = LittleEndian::read_u16(&base[4..6]) as usize;
        let object_size = LittleEndian::read_u32(&base[8..12]) as usize;
        let object_type = LittleEndian::read_u32(&base[12..16]);
        if header_size < OBJ_HEADER_BASE_SIZE || object_size < header_size || object_size > MAX_OBJECT_SIZE {
            self.malformed(
                start,
                format!("implausible object sizes (header {}, object {})", header_size, object_size),
            );
            return self.resync(&base[1..], start);
        }

        let mut object = vec![0u8; object_size];
        object[..OBJ_HEADER_BASE_SIZE].copy_from_slice(&base);
        let n = self.fill_full(&mut object[OBJ_HEADER_BASE_SIZE..])?;
        if n < object_size - OBJ_HEADER_BASE_SIZE {
            self.eof = true;
            self.malformed(start, format!("truncated object of type {}", object_type));
            self.finish_inner();
            return Ok(());
        }
        let mut padding = [0u8; 3];
        self.fill_full(&mut padding[..object_size % 4])?;

        if object_type == object_type::LOG_CONTAINER {
            self.container_at = start;
            self.read_container(&object, start);
        } else {
            self.decode(&object, start);
        }
        Ok(())
    }

    /// Scan forward for the next object signature
    fn resync(&mut self, seen: &[u8], start: u64) -> Result<()> {
        let mut window = seen.to_vec();
        let mut scanned = 0u64;
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(pos) = find(&window, OBJECT_SIGNATURE) {
                let rest = window[pos..].to_vec();
                self.push_back(&rest);
                log::debug!("BLF resynchronized at byte {}", self.offset);
                return Ok(());
            }
            let keep = window.len().saturating_sub(OBJECT_SIGNATURE.len() - 1);
            window.drain(..keep);
            if scanned > RESYNC_LIMIT {
                return Err(AnalyzerError::framing(
                    Location::Byte(start),
                    "no object signature found while resynchronizing",
                ));
            }
            let n = self.fill(&mut chunk)?;
            if n == 0 {
                self.eof = true;
                return Ok(());
            }
            scanned += n as u64;
            window.extend_from_slice(&chunk[..n]);
        }
    }

    fn read_container(&mut self, object: &[u8], at: u64) {
        let header_size = LittleEndian::read_u16(&object[4..6]) as usize;
        let body = &object[header_size.min(object.len())..];
        if body.len() < 16 {
            self.malformed(at, "truncated log container");
            return;
        }
        let method = LittleEndian::read_u16(&body[0..2]);
        let uncompressed_size = LittleEndian::read_u32(&body[8..12]) as usize;
        let payload = &body[16..];

        match method {
            0 => self.inner.extend_from_slice(payload),
            2 => {
                if uncompressed_size > MAX_OBJECT_SIZE {
                    self.malformed(at, format!("container claims {} uncompressed bytes", uncompressed_size));
                    return;
                }
                let mut decoder = ZlibDecoder::new(payload).take(uncompressed_size as u64);
                let before = self.inner.len();
                if let Err(e) = decoder.read_to_end(&mut self.inner) {
                    self.inner.truncate(before);
                    self.malformed(at, format!("container decompression failed: {}", e));
                    return;
                }
            }
            other => {
                self.malformed(at, format!("unknown container compression method {}", other));
                return;
            }
        }
        self.drain_inner();
    }

    /// Decode every complete object buffered from containers
    fn drain_inner(&mut self) {
        let at = self.container_at;
        let mut pos = 0;
        loop {
            let remaining = &self.inner[pos..];
            if remaining.len() < OBJ_HEADER_BASE_SIZE {
                break;
            }
            // inner objects may be followed by up to 4 bytes of padding
            let window = &remaining[..remaining.len().min(8 + OBJECT_SIGNATURE.len())];
            match find(window, OBJECT_SIGNATURE) {
                Some(skip) => pos += skip,
                None if remaining.len() < 8 + OBJECT_SIGNATURE.len() => break,
                None => {
                    self.malformed(at, "corrupt object inside log container");
                    match find(&self.inner[pos..], OBJECT_SIGNATURE) {
                        Some(skip) => {
                            pos += skip;
                            continue;
                        }
                        None => {
                            pos = self.inner.len().saturating_sub(OBJECT_SIGNATURE.len() - 1);
                            break;
                        }
                    }
                }
            }

            let remaining = &self.inner[pos..];
            if remaining.len() < OBJ_HEADER_BASE_SIZE {
                break;
            }
            let header_size = LittleEndian::read_u16(&remaining[4..6]) as usize;
            let object_size = LittleEndian::read_u32(&remaining[8..12]) as usize;
            if header_size < OBJ_HEADER_BASE_SIZE || object_size < header_size || object_size > MAX_OBJECT_SIZE {
                self.malformed(at, "implausible object sizes inside log container");
                pos += 1;
                continue;
            }
            if remaining.len() < object_size {
                // continues in the next container
                break;
            }
            let object = remaining[..object_size].to_vec();
            self.decode(&object, at);
            pos += object_size;
        }
        self.inner.drain(..pos);
    }

    fn finish_inner(&mut self) {
        if self.inner.iter().any(|b| *b != 0) {
            let at = self.container_at;
            self.malformed(at, "container stream ends inside an object");
        }
        self.inner.clear();
    }

    fn decode(&mut self, object: &[u8], at: u64) {
        let object_type = LittleEndian::read_u32(&object[12..16]);
        match decode_object(object_type, object) {
            Ok(Some(message)) => self.pending.push_back(Record::Message(message)),
            Ok(None) => {
                if self.skipped_types.insert(object_type) {
                    log::warn!(
                        "Skipping unsupported BLF object type {} (size {} bytes)",
                        object_type,
                        object.len()
                    );
                }
            }
            Err(reason) => self.malformed(at, reason),
        }
    }
}

/// Decode a complete object (base header included) into a message
///
/// `Ok(None)` means the type carries no frame and is skipped.
pub fn decode_object(object_type: u32, object: &[u8]) -> std::result::Result<Option<Message>, String> {
    let header_size = LittleEndian::read_u16(&object[4..6]) as usize;
    if header_size < OBJ_HEADER_V1_SIZE || object.len() < header_size {
        return Err(format!("object header of {} bytes is too short", header_size));
    }
    let flags = LittleEndian::read_u32(&object[16..20]);
    let raw_time = LittleEndian::read_u64(&object[24..32]);
    let timestamp = if flags == TIME_TEN_MICS {
        raw_time as f64 * 1e-5
    } else {
        raw_time as f64 * 1e-9
    };
    let body = &object[header_size..];

    let need = |len: usize| {
        if body.len() < len {
            Err(format!("object type {} payload too short ({} < {})", object_type, body.len(), len))
        } else {
            Ok(())
        }
    };

    let message = match object_type {
        object_type::CAN_MESSAGE | object_type::CAN_MESSAGE2 => {
            need(16)?;
            let channel = LittleEndian::read_u16(&body[0..2]);
            let msg_flags = body[2];
            let dlc = body[3] as usize;
            let can_id = LittleEndian::read_u32(&body[4..8]);
            let mut message = Message::new(
                timestamp,
                channel as u8,
                can_id & !CAN_MSG_EXT,
                body[8..8 + dlc.min(8)].to_vec(),
                FormatTag::CanBlf,
            );
            message.is_extended = can_id & CAN_MSG_EXT != 0;
            message.is_remote_frame = msg_flags & REMOTE_FLAG != 0;
            if message.is_remote_frame {
                message.data.clear();
            }
            message.direction = direction(msg_flags & DIR_TX != 0);
            message
        }
        object_type::CAN_FD_MESSAGE => {
            need(84)?;
            let channel = LittleEndian::read_u16(&body[0..2]);
            let msg_flags = body[2];
            let can_id = LittleEndian::read_u32(&body[4..8]);
            let fd_flags = body[13];
            let valid = (body[14] as usize).min(64);
            let mut message = Message::new(
                timestamp,
                channel as u8,
                can_id & !CAN_MSG_EXT,
                body[20..20 + valid].to_vec(),
                FormatTag::CanBlf,
            );
            message.is_extended = can_id & CAN_MSG_EXT != 0;
            message.is_fd = fd_flags & FD_EDL != 0;
            message.is_remote_frame = msg_flags & REMOTE_FLAG != 0;
            message.direction = direction(msg_flags & DIR_TX != 0);
            fd_meta(&mut message, fd_flags & FD_BRS != 0, fd_flags & FD_ESI != 0);
            message
        }
        object_type::CAN_FD_MESSAGE_64 => {
            need(40)?;
            let channel = body[0];
            let valid = (body[2] as usize).min(64);
            let can_id = LittleEndian::read_u32(&body[4..8]);
            let fd_flags = LittleEndian::read_u32(&body[12..16]);
            let dir = body[34];
            need(40 + valid)?;
            let mut message = Message::new(
                timestamp,
                channel,
                can_id & !CAN_MSG_EXT,
                body[40..40 + valid].to_vec(),
                FormatTag::CanBlf,
            );
            message.is_extended = can_id & CAN_MSG_EXT != 0;
            message.is_fd = fd_flags & FD64_EDL != 0;
            message.is_remote_frame = fd_flags & FD64_REMOTE != 0;
            message.direction = direction(dir != 0);
            fd_meta(&mut message, fd_flags & FD64_BRS != 0, fd_flags & FD64_ESI != 0);
            message
        }
        object_type::CAN_ERROR => {
            need(4)?;
            let channel = LittleEndian::read_u16(&body[0..2]);
            let mut message = Message::new(timestamp, channel as u8, 0, Vec::new(), FormatTag::CanBlf);
            message.is_error_frame = true;
            message
        }
        object_type::CAN_ERROR_EXT => {
            need(32)?;
            let channel = LittleEndian::read_u16(&body[0..2]);
            let ecc = body[8];
            let dlc = (body[10] as usize).min(8);
            let frame_id = LittleEndian::read_u32(&body[16..20]);
            let mut message = Message::new(timestamp, channel as u8, 0, body[24..24 + dlc].to_vec(), FormatTag::CanBlf);
            message.is_error_frame = true;
            message.set_meta("ecc", format!("0x{:02X}", ecc));
            message.set_meta("frame_id", format!("0x{:X}", frame_id & !CAN_MSG_EXT));
            message
        }
        object_type::LIN_MESSAGE => {
            need(20)?;
            let channel = LittleEndian::read_u16(&body[0..2]);
            let id = body[2] & 0x3F;
            let dlc = (body[3] as usize).min(8);
            let data = body[4..4 + dlc].to_vec();
            let checksum = LittleEndian::read_u16(&body[16..18]) as u8;
            let mut message = Message::new(timestamp, channel as u8, u32::from(id), data, FormatTag::Lin);
            message.checksum_valid = Some(lin::checksum_matches(id, &message.data, checksum));
            message.direction = direction(body[18] != 0);
            message
        }
        _ => return Ok(None),
    };
    Ok(Some(message))
}

fn direction(tx: bool) -> Direction {
    if tx {
        Direction::Tx
    } else {
        Direction::Rx
    }
}

fn fd_meta(message: &mut Message, brs: bool, esi: bool) {
    if brs {
        message.set_meta("brs", "1");
    }
    if esi {
        message.set_meta("esi", "1");
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
