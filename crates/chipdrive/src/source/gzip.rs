//! Streaming gzip decompression with loop support.
//!
//! Compressed songs are decoded on the fly through a fixed-size output
//! buffer, so the decompressed stream never has to fit in memory. The
//! decoder is forward-only; looping is made possible by capturing a snapshot
//! the first time the decompressed position reaches the loop offset, and
//! restoring it whenever playback seeks back there. Backward seeks to any
//! other position fail.

use flate2::{Decompress, FlushDecompress, Status};

use crate::source::ByteSource;

/// Decompressed bytes served per refill.
const BUFFER_SIZE: usize = 8192;
/// Compressed bytes pulled from the inner source per refill.
const COMPRESSED_BUFFER_SIZE: usize = 4096;

const GZIP_ID1: u8 = 0x1f;
const GZIP_ID2: u8 = 0x8b;
const GZIP_METHOD_DEFLATE: u8 = 8;

const FLAG_FHCRC: u8 = 0x02;
const FLAG_FEXTRA: u8 = 0x04;
const FLAG_FNAME: u8 = 0x08;
const FLAG_FCOMMENT: u8 = 0x10;

/// Byte source that inflates a gzip stream read from an inner source.
///
/// The inner source must support seeking back to the start of the compressed
/// data for loop restore to work; without it the stream is forward-only.
pub struct GzipSource {
    inner: Box<dyn ByteSource>,
    inflate: Decompress,
    /// Compressed offset where the deflate stream begins (after the gzip
    /// header).
    deflate_start: u64,
    out: Vec<u8>,
    out_pos: usize,
    out_len: usize,
    in_buf: Vec<u8>,
    in_pos: usize,
    in_len: usize,
    stream_done: bool,
    /// Decompressed position of the next byte `read` yields.
    pos: u64,
    loop_hint: Option<u64>,
    /// Decompressed position of the captured loop point.
    ///
    /// The inflate engine does not expose its mid-stream state, so nothing
    /// else is recorded; restore rewinds the compressed input and re-derives
    /// the decoder state (including the sliding window) by decoding forward
    /// to this position again. The byte sequence that follows is identical
    /// either way.
    snapshot: Option<u64>,
    open: bool,
}

impl GzipSource {
    pub fn new(inner: Box<dyn ByteSource>) -> Self {
        Self {
            inner,
            inflate: Decompress::new(false),
            deflate_start: 0,
            out: vec![0; BUFFER_SIZE],
            out_pos: 0,
            out_len: 0,
            in_buf: vec![0; COMPRESSED_BUFFER_SIZE],
            in_pos: 0,
            in_len: 0,
            stream_done: false,
            pos: 0,
            loop_hint: None,
            snapshot: None,
            open: false,
        }
    }

    /// Consume the gzip member header from the inner source.
    fn parse_gzip_header(&mut self) -> bool {
        let id1 = self.inner.read();
        let id2 = self.inner.read();
        let method = self.inner.read();
        let flags = match self.inner.read() {
            Some(f) => f,
            None => return false,
        };
        if id1 != Some(GZIP_ID1) || id2 != Some(GZIP_ID2) || method != Some(GZIP_METHOD_DEFLATE) {
            log::warn!("not a gzip stream");
            return false;
        }
        // MTIME (4), XFL, OS.
        self.inner.skip(6);
        if flags & FLAG_FEXTRA != 0 {
            let Some(extra_len) = self.inner.read_u16_le() else {
                return false;
            };
            self.inner.skip(extra_len as u64);
        }
        if flags & FLAG_FNAME != 0 && !self.skip_zero_terminated() {
            return false;
        }
        if flags & FLAG_FCOMMENT != 0 && !self.skip_zero_terminated() {
            return false;
        }
        if flags & FLAG_FHCRC != 0 {
            self.inner.skip(2);
        }
        true
    }

    fn skip_zero_terminated(&mut self) -> bool {
        loop {
            match self.inner.read() {
                Some(0) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    }

    /// Inflate until the output buffer is full or input runs dry.
    fn refill(&mut self) -> bool {
        if self.stream_done {
            self.out_pos = 0;
            self.out_len = 0;
            return false;
        }
        self.out_pos = 0;
        self.out_len = 0;
        while self.out_len < self.out.len() {
            if self.in_pos == self.in_len {
                self.in_len = self.inner.read_into(&mut self.in_buf);
                self.in_pos = 0;
                if self.in_len == 0 {
                    break;
                }
            }
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status = self.inflate.decompress(
                &self.in_buf[self.in_pos..self.in_len],
                &mut self.out[self.out_len..],
                FlushDecompress::None,
            );
            match status {
                Ok(status) => {
                    self.in_pos += (self.inflate.total_in() - before_in) as usize;
                    let produced = (self.inflate.total_out() - before_out) as usize;
                    self.out_len += produced;
                    match status {
                        Status::StreamEnd => {
                            // Trailing CRC32/ISIZE bytes are not verified.
                            self.stream_done = true;
                            break;
                        }
                        Status::BufError if produced == 0 && self.in_pos == self.in_len => {
                            // Needs more input; outer loop refills.
                            continue;
                        }
                        Status::BufError if produced == 0 => {
                            log::warn!("inflate stalled at decompressed {}", self.pos);
                            self.stream_done = true;
                            break;
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    log::warn!("inflate error at decompressed {}: {}", self.pos, e);
                    self.stream_done = true;
                    break;
                }
            }
        }
        self.out_len > 0
    }

    fn capture_snapshot(&mut self) {
        log::debug!(
            "loop snapshot at decompressed {} (compressed {})",
            self.pos,
            self.deflate_start + self.inflate.total_in()
        );
        self.snapshot = Some(self.pos);
    }

    /// Rewind the compressed input and decode forward to the snapshot
    /// position.
    fn restore_snapshot(&mut self) -> bool {
        let Some(snapshot_pos) = self.snapshot else {
            return false;
        };
        if !self.inner.seek(self.deflate_start) {
            log::warn!("cannot rewind compressed input for loop restore");
            return false;
        }
        self.inflate = Decompress::new(false);
        self.stream_done = false;
        self.in_pos = 0;
        self.in_len = 0;
        self.out_pos = 0;
        self.out_len = 0;

        let mut remaining = snapshot_pos;
        while remaining > 0 {
            if self.out_pos >= self.out_len && !self.refill() {
                log::warn!("loop restore ran out of data");
                return false;
            }
            let chunk = remaining.min((self.out_len - self.out_pos) as u64);
            self.out_pos += chunk as usize;
            remaining -= chunk;
        }
        self.pos = snapshot_pos;
        log::debug!("loop restored to decompressed {}", self.pos);
        true
    }
}

impl ByteSource for GzipSource {
    fn open(&mut self) -> bool {
        if !self.inner.open() {
            return false;
        }
        if !self.parse_gzip_header() {
            self.inner.close();
            return false;
        }
        self.deflate_start = self.inner.position();
        self.inflate = Decompress::new(false);
        self.stream_done = false;
        self.in_pos = 0;
        self.in_len = 0;
        self.out_pos = 0;
        self.out_len = 0;
        self.pos = 0;
        self.snapshot = None;
        self.open = true;
        true
    }

    fn close(&mut self) {
        self.inner.close();
        self.open = false;
        self.stream_done = false;
        self.in_pos = 0;
        self.in_len = 0;
        self.out_pos = 0;
        self.out_len = 0;
        self.pos = 0;
        self.snapshot = None;
        self.loop_hint = None;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self) -> Option<u8> {
        if !self.open {
            return None;
        }
        if self.out_pos >= self.out_len && !self.refill() {
            return None;
        }
        if let Some(hint) = self.loop_hint
            && self.snapshot.is_none()
            && self.pos == hint
        {
            self.capture_snapshot();
        }
        let b = self.out[self.out_pos];
        self.out_pos += 1;
        self.pos += 1;
        Some(b)
    }

    fn peek(&mut self) -> Option<u8> {
        if !self.open {
            return None;
        }
        if self.out_pos >= self.out_len && !self.refill() {
            return None;
        }
        Some(self.out[self.out_pos])
    }

    fn available(&mut self) -> bool {
        self.open && (self.out_pos < self.out_len || self.refill())
    }

    fn seek(&mut self, position: u64) -> bool {
        if !self.open {
            return false;
        }
        if position == self.pos {
            return true;
        }
        if position > self.pos {
            // Forward seek: read and discard.
            while self.pos < position {
                if self.out_pos >= self.out_len && !self.refill() {
                    log::warn!("forward seek to {} ran out of data", position);
                    return false;
                }
                let step = (position - self.pos).min((self.out_len - self.out_pos) as u64);
                // The loop point may be inside the discarded span; capture
                // it now or it is gone for good.
                if let Some(hint) = self.loop_hint
                    && self.snapshot.is_none()
                    && hint >= self.pos
                    && hint < self.pos + step
                {
                    self.snapshot = Some(hint);
                }
                self.out_pos += step as usize;
                self.pos += step;
            }
            return true;
        }
        // Backward seek within the bytes still held in the output buffer.
        let buffer_start = self.pos - self.out_pos as u64;
        if position >= buffer_start {
            self.out_pos = (position - buffer_start) as usize;
            self.pos = position;
            return true;
        }
        if self.snapshot == Some(position) {
            return self.restore_snapshot();
        }
        log::warn!(
            "cannot seek backward to {} (current {})",
            position,
            self.pos
        );
        false
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn more_expected(&self) -> bool {
        !self.stream_done && self.inner.more_expected()
    }

    fn set_loop_hint(&mut self, offset: u64) {
        if offset > 0 {
            self.loop_hint = Some(offset);
        }
    }
}
