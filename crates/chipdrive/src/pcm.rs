//! Adaptive PCM sample storage for DAC playback.
//!
//! Sampled audio arrives embedded in the command stream as one data block
//! that can be far larger than the memory a player board has to spare. The
//! bank tries to hold the block at full size, then at half and quarter size
//! by keeping every 2nd or 4th byte, preferring an external memory pool when
//! one exists. When nothing fits, DAC playback is disabled and reads return
//! silence; FM/PSG playback is unaffected.

use crate::source::ByteSource;

/// Byte returned when the bank holds no data: the center value for unsigned
/// 8-bit audio.
const SILENCE: u8 = 0x80;

/// Memory available to the PCM bank.
///
/// Models what the original hardware probes at runtime: free primary RAM
/// (minus a headroom reserve kept for the stack) and an optional secondary
/// pool such as an external RAM chip, which is tried first.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudget {
    /// Free bytes in primary memory.
    pub primary_free: usize,
    /// Size of the secondary pool, when one is present.
    pub secondary_free: Option<usize>,
    /// Primary bytes kept unallocated for other uses.
    pub reserve: usize,
}

impl MemoryBudget {
    /// Budget with a limited primary pool and no secondary pool.
    pub fn with_primary(primary_free: usize) -> Self {
        Self {
            primary_free,
            secondary_free: None,
            reserve: 1024,
        }
    }
}

impl Default for MemoryBudget {
    /// Hosted targets are not memory constrained; allow up to 64 MiB.
    fn default() -> Self {
        Self {
            primary_free: 64 * 1024 * 1024,
            secondary_free: None,
            reserve: 1024,
        }
    }
}

/// Downsampling PCM store with a read cursor in stored coordinates.
///
/// ```
/// use chipdrive::pcm::{MemoryBudget, PcmBank};
/// use chipdrive::source::{ByteSource, MemorySource};
///
/// let mut src = MemorySource::new(vec![1, 2, 3, 4]);
/// src.open();
/// let mut bank = PcmBank::new();
/// assert!(bank.load(4, &mut src, &MemoryBudget::default()));
/// assert_eq!(bank.read_byte(), 1);
/// assert_eq!(bank.read_byte(), 2);
/// ```
#[derive(Debug)]
pub struct PcmBank {
    data: Vec<u8>,
    original_len: u32,
    ratio: u32,
    pos: usize,
    read_count: u32,
    secondary: bool,
    disabled: bool,
    loading: bool,
    load_index: u32,
    load_stored: usize,
}

impl Default for PcmBank {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmBank {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            original_len: 0,
            ratio: 1,
            pos: 0,
            read_count: 0,
            secondary: false,
            disabled: false,
            loading: false,
            load_index: 0,
            load_stored: 0,
        }
    }

    /// Load one data block of `original_len` bytes from `source`.
    ///
    /// Always consumes exactly `original_len` bytes from the source, whether
    /// they are retained, downsampled or discarded; anything less would
    /// desynchronize every later command. Only the first block is kept; a
    /// second block is drained and dropped. Returns `false` only when no
    /// allocation size fit and the bank entered the disabled state.
    pub fn load(
        &mut self,
        original_len: u32,
        source: &mut dyn ByteSource,
        budget: &MemoryBudget,
    ) -> bool {
        // Some streams carry empty data blocks.
        if original_len == 0 {
            return true;
        }
        if self.begin_load(original_len, budget) {
            for _ in 0..original_len {
                let Some(byte) = source.read() else {
                    break;
                };
                self.feed(byte);
            }
            self.finish_load();
            true
        } else {
            Self::drain(source, original_len);
            !self.disabled
        }
    }

    /// Prepare to receive a block of `original_len` bytes fed one at a time
    /// through [`PcmBank::feed`], for sources that deliver the payload in
    /// pieces. Returns `false` when the block will not be retained (a block
    /// is already held, or no allocation size fit); the caller still has to
    /// discard the payload bytes to stay aligned.
    pub fn begin_load(&mut self, original_len: u32, budget: &MemoryBudget) -> bool {
        if original_len == 0 {
            return false;
        }
        self.original_len = original_len;

        if !self.data.is_empty() {
            log::debug!("pcm: skipping additional data block ({} bytes)", original_len);
            return false;
        }

        // Allocation sizes round up so the last partial stride still has a
        // home: stored length is ceil(original / ratio).
        let try_sizes = [
            original_len,
            original_len.div_ceil(2),
            original_len.div_ceil(4),
        ];
        let ratios = [1u32, 2, 4];

        for (size, ratio) in try_sizes.into_iter().zip(ratios) {
            let Some((buffer, secondary)) = Self::try_allocate(size as usize, budget) else {
                continue;
            };
            self.data = buffer;
            self.ratio = ratio;
            self.secondary = secondary;
            self.disabled = false;
            self.pos = 0;
            self.read_count = 0;
            self.loading = true;
            self.load_index = 0;
            self.load_stored = 0;
            return true;
        }

        // Nothing fit. Disable DAC output; the caller drains the payload.
        self.disabled = true;
        log::warn!(
            "pcm: no memory for {} bytes of DAC data, DAC disabled",
            original_len
        );
        false
    }

    /// Consume one original byte of the block being loaded, retaining every
    /// `ratio`-th one.
    pub fn feed(&mut self, byte: u8) {
        if !self.loading {
            return;
        }
        if self.load_index % self.ratio == 0 && self.load_stored < self.data.len() {
            self.data[self.load_stored] = byte;
            self.load_stored += 1;
        }
        self.load_index += 1;
    }

    /// End the block: trim to what was actually stored and rewind the read
    /// cursor. Idempotent.
    pub fn finish_load(&mut self) {
        if !self.loading {
            return;
        }
        self.data.truncate(self.load_stored);
        self.loading = false;
        log::debug!(
            "pcm: loaded {} bytes (ratio {}) into {}",
            self.load_stored,
            self.ratio,
            if self.secondary { "secondary" } else { "primary" }
        );
    }

    fn try_allocate(size: usize, budget: &MemoryBudget) -> Option<(Vec<u8>, bool)> {
        if let Some(secondary) = budget.secondary_free
            && size <= secondary
            && let Some(buffer) = Self::probe(size)
        {
            return Some((buffer, true));
        }
        let safe = budget.primary_free.saturating_sub(budget.reserve);
        if size <= safe
            && let Some(buffer) = Self::probe(size)
        {
            return Some((buffer, false));
        }
        None
    }

    /// Allocate and verify with a write/read check. External pools can fail
    /// the check even when the allocation call succeeds.
    fn probe(size: usize) -> Option<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        buffer[0] = 0xAA;
        buffer[size - 1] = 0x55;
        if buffer[0] != 0xAA || buffer[size - 1] != 0x55 {
            return None;
        }
        Some(buffer)
    }

    fn drain(source: &mut dyn ByteSource, len: u32) {
        for _ in 0..len {
            if source.read().is_none() {
                break;
            }
        }
    }

    /// Read the sample under the cursor.
    ///
    /// Under downsampling the same stored byte is returned `ratio` times
    /// before the cursor advances, so output duration matches the original
    /// regardless of the compression ratio. Past the end, or with no data,
    /// this returns silence.
    pub fn read_byte(&mut self) -> u8 {
        if self.data.is_empty() || self.pos >= self.data.len() {
            return SILENCE;
        }
        let sample = self.data[self.pos];
        self.read_count += 1;
        if self.read_count >= self.ratio {
            self.read_count = 0;
            self.pos += 1;
        }
        sample
    }

    /// Move the cursor to `position`, given in original (pre-downsample)
    /// coordinates.
    pub fn seek(&mut self, position: u32) {
        let stored = (position / self.ratio.max(1)) as usize;
        self.pos = stored.min(self.data.len());
        self.read_count = 0;
    }

    /// Cursor position in original coordinates.
    pub fn position(&self) -> u32 {
        self.pos as u32 * self.ratio
    }

    /// Drop the stored data and return to the initial state.
    pub fn clear(&mut self) {
        self.data = Vec::new();
        self.original_len = 0;
        self.ratio = 1;
        self.pos = 0;
        self.read_count = 0;
        self.secondary = false;
        self.disabled = false;
        self.loading = false;
        self.load_index = 0;
        self.load_stored = 0;
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// `true` when allocation failed outright and DAC reads yield silence.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn stored_len(&self) -> usize {
        self.data.len()
    }

    pub fn original_len(&self) -> u32 {
        self.original_len
    }

    /// Downsample ratio in effect: 1, 2 or 4.
    pub fn ratio(&self) -> u32 {
        self.ratio
    }

    /// `true` when the data lives in the secondary pool.
    pub fn in_secondary(&self) -> bool {
        self.secondary
    }
}
