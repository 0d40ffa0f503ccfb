//! Byte sources feeding the command interpreters.
//!
//! Everything upstream of an interpreter is a [`ByteSource`]: a sequential
//! byte reader with optional random seek. Four providers are included:
//!
//! - [`MemorySource`] reads a single in-memory slice.
//! - [`ChunkedMemorySource`] presents several slices as one logical stream,
//!   for platforms where a single constant array cannot hold a whole song.
//! - [`FileSource`] streams from a file.
//! - [`gzip::GzipSource`] streams gzip-compressed data and supports looping
//!   via a one-shot decoder snapshot.
//!
//! The transport ring buffer also implements this trait, so an interpreter
//! can pull directly from a serial feed.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;

pub mod gzip;

pub use gzip::GzipSource;

/// Sequential byte reader with optional seeking.
///
/// Positions are absolute offsets into the logical stream. `read` returning
/// `None` means end of data; for live sources it means "nothing available
/// right now" and the caller re-polls later.
pub trait ByteSource {
    /// Prepare the source for reading. Returns `false` when the source has
    /// nothing to read from.
    fn open(&mut self) -> bool;

    /// Release the source. Reads after `close` return `None`.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Read one byte and advance, or `None` when no data is available.
    fn read(&mut self) -> Option<u8>;

    /// Look at the next byte without consuming it.
    fn peek(&mut self) -> Option<u8>;

    /// `true` when at least one more byte can be read.
    fn available(&mut self) -> bool;

    /// Seek to an absolute position. Returns `false` when the source cannot
    /// reach that position.
    fn seek(&mut self, _position: u64) -> bool {
        false
    }

    /// Absolute position of the next byte `read` would return.
    fn position(&self) -> u64;

    /// Total size in bytes, or 0 when unknown.
    fn size(&self) -> u64 {
        0
    }

    fn can_seek(&self) -> bool {
        false
    }

    /// Tell the source where the stream's loop point lies.
    ///
    /// Most sources ignore this; the gzip source uses it to know when to
    /// capture its loop snapshot.
    fn set_loop_hint(&mut self, _offset: u64) {}

    /// `true` when a `read` that returned `None` may later yield more data
    /// because a producer is still filling the source. Fixed sources return
    /// `false`: their end is final.
    fn more_expected(&self) -> bool {
        false
    }

    /// Fill `buf` as far as possible, returning the number of bytes read.
    fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.read() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Read a little-endian 16-bit value.
    fn read_u16_le(&mut self) -> Option<u16> {
        let lo = self.read()?;
        let hi = self.read()?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    /// Read a little-endian 32-bit value.
    fn read_u32_le(&mut self) -> Option<u32> {
        let b0 = self.read()?;
        let b1 = self.read()?;
        let b2 = self.read()?;
        let b3 = self.read()?;
        Some(u32::from_le_bytes([b0, b1, b2, b3]))
    }

    /// Advance `count` bytes, by seeking when supported and by reading
    /// otherwise.
    fn skip(&mut self, count: u64) {
        if self.can_seek() {
            let pos = self.position();
            self.seek(pos + count);
        } else {
            for _ in 0..count {
                if self.read().is_none() {
                    break;
                }
            }
        }
    }
}

/// In-memory byte source over a borrowed or owned slice.
///
/// ```
/// use chipdrive::source::{ByteSource, MemorySource};
///
/// let mut src = MemorySource::new(vec![0x10, 0x20]);
/// assert!(src.open());
/// assert_eq!(src.read(), Some(0x10));
/// assert_eq!(src.peek(), Some(0x20));
/// assert_eq!(src.position(), 1);
/// ```
pub struct MemorySource {
    data: Cow<'static, [u8]>,
    pos: usize,
    open: bool,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Cow::Owned(data.into()),
            pos: 0,
            open: false,
        }
    }

    /// Borrow a constant table without copying it.
    pub fn from_static(data: &'static [u8]) -> Self {
        Self {
            data: Cow::Borrowed(data),
            pos: 0,
            open: false,
        }
    }
}

impl ByteSource for MemorySource {
    fn open(&mut self) -> bool {
        if self.data.is_empty() {
            return false;
        }
        self.pos = 0;
        self.open = true;
        true
    }

    fn close(&mut self) {
        self.open = false;
        self.pos = 0;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self) -> Option<u8> {
        if !self.open || self.pos >= self.data.len() {
            return None;
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Some(b)
    }

    fn peek(&mut self) -> Option<u8> {
        if !self.open || self.pos >= self.data.len() {
            return None;
        }
        Some(self.data[self.pos])
    }

    fn available(&mut self) -> bool {
        self.open && self.pos < self.data.len()
    }

    fn seek(&mut self, position: u64) -> bool {
        if position > self.data.len() as u64 {
            return false;
        }
        self.pos = position as usize;
        true
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn can_seek(&self) -> bool {
        true
    }
}

/// Several independently stored byte slices presented as one stream.
///
/// Constrained targets split large command streams across multiple constant
/// arrays; this walks them in order and seeks across chunk boundaries.
pub struct ChunkedMemorySource {
    chunks: Vec<Cow<'static, [u8]>>,
    total_len: u64,
    pos: u64,
    current_chunk: usize,
    pos_in_chunk: usize,
    open: bool,
}

impl ChunkedMemorySource {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        let chunks: Vec<Cow<'static, [u8]>> = chunks.into_iter().map(Cow::Owned).collect();
        let total_len = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            chunks,
            total_len,
            pos: 0,
            current_chunk: 0,
            pos_in_chunk: 0,
            open: false,
        }
    }

    pub fn from_static(chunks: &[&'static [u8]]) -> Self {
        let chunks: Vec<Cow<'static, [u8]>> =
            chunks.iter().map(|c| Cow::Borrowed(*c)).collect();
        let total_len = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            chunks,
            total_len,
            pos: 0,
            current_chunk: 0,
            pos_in_chunk: 0,
            open: false,
        }
    }

    fn advance_chunk(&mut self) {
        // Skips zero-length chunks so read never stalls on one.
        while self.current_chunk < self.chunks.len()
            && self.pos_in_chunk >= self.chunks[self.current_chunk].len()
        {
            self.current_chunk += 1;
            self.pos_in_chunk = 0;
        }
    }
}

impl ByteSource for ChunkedMemorySource {
    fn open(&mut self) -> bool {
        if self.chunks.is_empty() || self.total_len == 0 {
            return false;
        }
        self.pos = 0;
        self.current_chunk = 0;
        self.pos_in_chunk = 0;
        self.open = true;
        true
    }

    fn close(&mut self) {
        self.open = false;
        self.pos = 0;
        self.current_chunk = 0;
        self.pos_in_chunk = 0;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self) -> Option<u8> {
        if !self.open || self.pos >= self.total_len {
            return None;
        }
        self.advance_chunk();
        let b = self.chunks[self.current_chunk][self.pos_in_chunk];
        self.pos += 1;
        self.pos_in_chunk += 1;
        Some(b)
    }

    fn peek(&mut self) -> Option<u8> {
        if !self.open || self.pos >= self.total_len {
            return None;
        }
        self.advance_chunk();
        Some(self.chunks[self.current_chunk][self.pos_in_chunk])
    }

    fn available(&mut self) -> bool {
        self.open && self.pos < self.total_len
    }

    fn seek(&mut self, position: u64) -> bool {
        if position > self.total_len {
            return false;
        }
        let mut offset = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let len = chunk.len() as u64;
            if position < offset + len {
                self.current_chunk = i;
                self.pos_in_chunk = (position - offset) as usize;
                self.pos = position;
                return true;
            }
            offset += len;
        }
        // Position is at the very end.
        self.current_chunk = self.chunks.len();
        self.pos_in_chunk = 0;
        self.pos = position;
        true
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn size(&self) -> u64 {
        self.total_len
    }

    fn can_seek(&self) -> bool {
        true
    }
}

/// Buffered file-backed byte source.
pub struct FileSource {
    path: PathBuf,
    file: Option<BufReader<File>>,
    pos: u64,
    len: u64,
    peeked: Option<u8>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            pos: 0,
            len: 0,
            peeked: None,
        }
    }

    fn read_raw(&mut self) -> Option<u8> {
        let file = self.file.as_mut()?;
        let mut byte = [0u8; 1];
        match file.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            Ok(_) => None,
            Err(e) => {
                log::warn!("file read failed at {}: {}", self.pos, e);
                None
            }
        }
    }
}

impl ByteSource for FileSource {
    fn open(&mut self) -> bool {
        self.close();
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("failed to open {}: {}", self.path.display(), e);
                return false;
            }
        };
        self.len = match file.metadata() {
            Ok(m) => m.len(),
            Err(_) => 0,
        };
        self.file = Some(BufReader::new(file));
        self.pos = 0;
        self.peeked = None;
        true
    }

    fn close(&mut self) {
        self.file = None;
        self.pos = 0;
        self.len = 0;
        self.peeked = None;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn read(&mut self) -> Option<u8> {
        if let Some(b) = self.peeked.take() {
            self.pos += 1;
            return Some(b);
        }
        let b = self.read_raw()?;
        self.pos += 1;
        Some(b)
    }

    fn peek(&mut self) -> Option<u8> {
        if self.peeked.is_none() {
            self.peeked = self.read_raw();
        }
        self.peeked
    }

    fn available(&mut self) -> bool {
        self.peeked.is_some() || (self.file.is_some() && self.pos < self.len)
    }

    fn seek(&mut self, position: u64) -> bool {
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        if position > self.len {
            return false;
        }
        match file.seek(SeekFrom::Start(position)) {
            Ok(_) => {
                self.pos = position;
                self.peeked = None;
                true
            }
            Err(e) => {
                log::warn!("file seek to {} failed: {}", position, e);
                false
            }
        }
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn size(&self) -> u64 {
        self.len
    }

    fn can_seek(&self) -> bool {
        true
    }
}
