//! Input files and the I/O plumbing around them
//!
//! A [`RawFile`] is immutable once constructed. Content is never held in full for
//! on-disk files: parsers stream through [`RawFile::open`], the detector reads a
//! bounded prefix.

use crate::types::Result;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum FileSource {
    Path(PathBuf),
    Memory(Arc<[u8]>),
}

/// An input file: content plus name/size/extension metadata
#[derive(Debug, Clone)]
pub struct RawFile {
    name: String,
    size: u64,
    extension: Option<String>,
    source: FileSource,
}

impl RawFile {
    /// Reference a file on disk; content is read lazily
    pub fn from_path(path: &Path) -> Result<Self> {
        let size = std::fs::metadata(path)?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        Ok(Self {
            extension: extension_of(&name),
            name,
            size,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// Wrap an in-memory byte stream received from a caller
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        let bytes: Arc<[u8]> = Arc::from(bytes.into());
        Self {
            extension: extension_of(&name),
            size: bytes.len() as u64,
            name,
            source: FileSource::Memory(bytes),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Lowercased extension including the dot (e.g. `.asc`)
    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// Open a fresh sequential reader positioned at the start of the content
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match &self.source {
            FileSource::Path(path) => Ok(Box::new(BufReader::new(File::open(path)?))),
            FileSource::Memory(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
        }
    }

    /// Read at most `limit` bytes from the start of the content
    pub fn read_prefix(&self, limit: usize) -> Result<Vec<u8>> {
        match &self.source {
            FileSource::Memory(bytes) => Ok(bytes[..bytes.len().min(limit)].to_vec()),
            FileSource::Path(path) => {
                let mut buf = Vec::with_capacity(limit.min(self.size as usize));
                File::open(path)?.take(limit as u64).read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
}

/// Cooperative cancellation flag shared between a caller and its analysis run
///
/// Parsers check it at every chunk boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reader adapter counting consumed bytes for progress reporting
pub(crate) struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub(crate) fn new(inner: R) -> (Self, Arc<AtomicU64>) {
        let consumed = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                consumed: Arc::clone(&consumed),
            },
            consumed,
        )
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_in_memory_file() {
        let file = RawFile::from_bytes("Trace.ASC", b"date Mon Jan 1\n".to_vec());
        assert_eq!(file.name(), "Trace.ASC");
        assert_eq!(file.extension(), Some(".asc"));
        assert_eq!(file.size(), 15);
        assert_eq!(file.read_prefix(4).unwrap(), b"date");

        let mut content = String::new();
        file.open().unwrap().read_to_string(&mut content).unwrap();
        assert!(content.starts_with("date"));
    }

    #[test]
    fn test_file_on_disk() {
        let mut temp = tempfile::Builder::new().suffix(".log").tempfile().unwrap();
        temp.write_all(b"(0.1) can0 123#00\n").unwrap();
        temp.flush().unwrap();

        let file = RawFile::from_path(temp.path()).unwrap();
        assert_eq!(file.extension(), Some(".log"));
        assert_eq!(file.size(), 18);
        assert_eq!(file.read_prefix(1024).unwrap().len(), 18);
    }

    #[test]
    fn test_missing_file() {
        assert!(RawFile::from_path(Path::new("does/not/exist.blf")).is_err());
    }

    #[test]
    fn test_counting_reader() {
        let (mut reader, consumed) = CountingReader::new(Cursor::new(vec![0u8; 100]));
        let mut buf = [0u8; 30];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(consumed.load(Ordering::Relaxed), 30);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
