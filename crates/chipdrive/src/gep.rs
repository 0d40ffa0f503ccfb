//! GEP format parsing and command interpretation.
//!
//! GEP is a dictionary-compressed register-write log that trades the VGM
//! opcode space for a denser one: the most common register rewrites become
//! single dictionary-reference bytes, waits and PSG writes pack repeat
//! counts into the opcode, and sampled audio can be DPCM-coded at two
//! samples per byte. Command data may be split across several chunks so a
//! single array never exceeds the addressing limits of small targets.

use crate::binutil::{PlayError, read_u16_le_at, read_u32_le_at, read_u8_at};
use crate::player::{CommandStream, Step};
use crate::sink::ChipSink;

/// `G`, `E`, `P`, format version 1.
pub const GEP_IDENT: [u8; 4] = [b'G', b'E', b'P', 0x01];

/// Fixed header length.
const HEADER_LEN: usize = 16;

pub const FLAG_PSG: u16 = 0x01;
pub const FLAG_CHIP_A: u16 = 0x02;
pub const FLAG_DAC: u16 = 0x04;
pub const FLAG_MULTI_CHUNK: u16 = 0x08;
pub const FLAG_DPCM: u16 = 0x10;
pub const FLAG_SAMPLES: u16 = 0x20;

const CMD_DICT_EXT: u8 = 0xB0;
const CMD_CHIP_A_RAW_P0: u8 = 0xB1;
const CMD_CHIP_A_RAW_P1: u8 = 0xB2;
const CMD_PSG_RAW: u8 = 0xB3;
const CMD_WAIT_LONG: u8 = 0xB4;
const CMD_LOOP_MARK: u8 = 0xB5;
const CMD_DAC_WRITE: u8 = 0xB6;
const CMD_DAC_SEEK: u8 = 0xB7;
const CMD_DAC_BLOCK: u8 = 0xB8;
const CMD_DAC_RUN: u8 = 0xB9;
const CMD_SAMPLE_PLAY: u8 = 0xBB;
const CMD_DAC_START: u8 = 0xBC;
const CMD_CHUNK_END: u8 = 0xFE;
const CMD_END: u8 = 0xFF;

const SAMPLES_PER_FRAME: u32 = 735;

/// 4-bit DPCM delta steps. Must match the encoder's table.
const DPCM_STEPS: [i16; 16] = [
    -34, -21, -13, -8, -5, -3, -1, 0, 1, 3, 5, 8, 13, 21, 34, 55,
];

/// Loop chunk value meaning "no loop".
const NO_LOOP: u16 = 0xFFFF;

/// Parsed GEP header.
#[derive(Debug, Clone)]
pub struct GepHeader {
    /// Chip/feature presence bits (`FLAG_*`).
    pub flags: u16,
    /// Dictionary entry count; the on-disk 0 encodes 256.
    pub dict_count: u16,
    /// Number of PCM blocks appended to the stream.
    pub pcm_block_count: u8,
    /// Declared playback length in samples.
    pub total_samples: u32,
    /// Chunk index of the loop point; `None` when the stream does not loop.
    pub loop_chunk: Option<u16>,
    /// Byte offset of the loop point within its chunk.
    pub loop_offset: u16,
}

impl GepHeader {
    /// Parse the 16-byte header, rejecting streams that flag neither
    /// supported chip.
    pub fn parse(bytes: &[u8]) -> Result<Self, PlayError> {
        if bytes.len() < HEADER_LEN {
            return Err(PlayError::HeaderTooShort("GEP header".into()));
        }
        let mut ident = [0u8; 4];
        ident.copy_from_slice(&bytes[0..4]);
        if ident != GEP_IDENT {
            return Err(PlayError::InvalidIdent(ident));
        }

        let flags = read_u16_le_at(bytes, 4)?;
        if flags & (FLAG_PSG | FLAG_CHIP_A) == 0 {
            return Err(PlayError::NoSupportedChips);
        }

        let raw_dict_count = read_u8_at(bytes, 6)?;
        let dict_count = if raw_dict_count == 0 {
            256
        } else {
            raw_dict_count as u16
        };
        let pcm_block_count = read_u8_at(bytes, 7)?;
        let total_samples = read_u32_le_at(bytes, 8)?;
        let raw_loop_chunk = read_u16_le_at(bytes, 12)?;
        let loop_chunk = if raw_loop_chunk == NO_LOOP {
            None
        } else {
            Some(raw_loop_chunk)
        };
        let loop_offset = read_u16_le_at(bytes, 14)?;

        Ok(Self {
            flags,
            dict_count,
            pcm_block_count,
            total_samples,
            loop_chunk,
            loop_offset,
        })
    }

    pub fn has_psg(&self) -> bool {
        self.flags & FLAG_PSG != 0
    }

    pub fn has_chip_a(&self) -> bool {
        self.flags & FLAG_CHIP_A != 0
    }

    pub fn uses_dpcm(&self) -> bool {
        self.flags & FLAG_DPCM != 0
    }

    pub fn has_loop(&self) -> bool {
        self.loop_chunk.is_some()
    }
}

/// One dictionary entry: a precomputed FM register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictEntry {
    pub port: u8,
    pub reg: u8,
    pub value: u8,
}

/// One entry of the sample table: a named region of the PCM payload with a
/// default playback rate.
#[derive(Debug, Clone, Copy)]
pub struct SampleEntry {
    pub start: u16,
    pub length: u16,
    /// DAC output interval in 44.1 kHz sample units.
    pub rate: u8,
}

/// A GEP stream with all of its side tables.
pub struct GepSong {
    header: GepHeader,
    dictionary: Vec<DictEntry>,
    chunks: Vec<Vec<u8>>,
    pcm: Option<Vec<u8>>,
    samples: Vec<SampleEntry>,
}

impl GepSong {
    /// Assemble a song from its header, dictionary, and command chunks.
    ///
    /// The dictionary must supply at least the entry count the header
    /// declares, three bytes per entry (port, register, value).
    pub fn new(
        header_bytes: &[u8],
        dict_bytes: &[u8],
        chunks: Vec<Vec<u8>>,
    ) -> Result<Self, PlayError> {
        let header = GepHeader::parse(header_bytes)?;

        let needed = header.dict_count as usize * 3;
        if dict_bytes.len() < needed {
            return Err(PlayError::OffsetOutOfRange {
                offset: dict_bytes.len(),
                needed,
                available: dict_bytes.len(),
                context: Some("dictionary".into()),
            });
        }
        let dictionary = dict_bytes[..needed]
            .chunks_exact(3)
            .map(|e| DictEntry {
                port: e[0],
                reg: e[1],
                value: e[2],
            })
            .collect();

        Ok(Self {
            header,
            dictionary,
            chunks,
            pcm: None,
            samples: Vec::new(),
        })
    }

    /// Attach the PCM payload (raw bytes, or DPCM-coded when the header
    /// flags it).
    pub fn set_pcm(&mut self, pcm: Vec<u8>) {
        self.pcm = Some(pcm);
    }

    /// Attach the sample table: five bytes per entry, `[start:2][length:2]
    /// [rate:1]`, little-endian.
    pub fn set_samples(&mut self, table: &[u8]) {
        self.samples = table
            .chunks_exact(5)
            .map(|e| SampleEntry {
                start: u16::from_le_bytes([e[0], e[1]]),
                length: u16::from_le_bytes([e[2], e[3]]),
                rate: e[4],
            })
            .collect();
    }

    pub fn header(&self) -> &GepHeader {
        &self.header
    }

    pub fn dictionary(&self) -> &[DictEntry] {
        &self.dictionary
    }
}

/// Pull-based GEP command interpreter.
///
/// Besides the command cursor this carries the DPCM decode state (running
/// sample value, nibble position) and the DAC streaming sub-state used by
/// the sample-trigger commands. The scheduler services that sub-state
/// between commands via [`CommandStream::tick_dac`], so DAC output rate is
/// independent of command-processing rate.
pub struct GepInterpreter {
    song: GepSong,
    chunk: usize,
    pos: usize,
    /// PCM cursor: byte position for raw PCM, sample (nibble) position for
    /// DPCM.
    pcm_pos: usize,
    dpcm_sample: u8,
    use_dpcm: bool,
    sample_playing: bool,
    sample_end: usize,
    sample_rate: u32,
    sample_wait_accum: u32,
    finished: bool,
}

impl GepInterpreter {
    pub fn new(song: GepSong) -> Self {
        let use_dpcm = song.header.uses_dpcm();
        let mut this = Self {
            song,
            chunk: 0,
            pos: 0,
            pcm_pos: 0,
            dpcm_sample: 0x80,
            use_dpcm,
            sample_playing: false,
            sample_end: 0,
            sample_rate: 0,
            sample_wait_accum: 0,
            finished: false,
        };
        this.reset_pcm();
        this
    }

    pub fn song(&self) -> &GepSong {
        &self.song
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn reset_pcm(&mut self) {
        if self.use_dpcm
            && let Some(pcm) = self.song.pcm.as_ref()
            && !pcm.is_empty()
        {
            // First PCM byte is the initial sample; nibbles follow.
            self.dpcm_sample = pcm[0];
            self.pcm_pos = 1;
        } else {
            self.dpcm_sample = 0x80;
            self.pcm_pos = 0;
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        let chunk = self.song.chunks.get(self.chunk)?;
        let b = *chunk.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_word(&mut self) -> Option<u16> {
        let lo = self.read_byte()?;
        let hi = self.read_byte()?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    fn write_dict_entry(&mut self, index: usize, sink: &mut dyn ChipSink) {
        match self.song.dictionary.get(index) {
            Some(entry) => sink.write_chip_a(entry.port, entry.reg, entry.value),
            None => log::warn!("dictionary reference {} out of range", index),
        }
    }

    /// Key on/off shortcut: codes 0-5 are key-off for channels 0-5, codes
    /// 6-11 key-on. The FM chip addresses channels 3-5 as bits 4-6.
    fn write_key_on_off(&mut self, code: u8, sink: &mut dyn ChipSink) {
        let channel = code % 6;
        let key_on = code >= 6;
        let ch_bits = if channel < 3 { channel } else { channel + 1 };
        let value = ch_bits | if key_on { 0xF0 } else { 0x00 };
        sink.write_chip_a(0, 0x28, value);
    }

    /// Read one PCM sample at the cursor, decoding through the delta table
    /// when the stream is DPCM-coded.
    fn read_pcm_sample(&mut self) -> u8 {
        let Some(pcm) = self.song.pcm.as_ref() else {
            return 0x80;
        };

        if self.use_dpcm {
            // Two delta nibbles per byte after the initial sample byte,
            // high nibble first. pcm_pos counts samples, starting at 1.
            let nibble_idx = self.pcm_pos.saturating_sub(1);
            let byte_idx = 1 + nibble_idx / 2;
            let Some(&packed) = pcm.get(byte_idx) else {
                return self.dpcm_sample;
            };
            let delta_idx = if nibble_idx % 2 == 0 {
                (packed >> 4) & 0x0F
            } else {
                packed & 0x0F
            };
            let sample = (self.dpcm_sample as i16 + DPCM_STEPS[delta_idx as usize])
                .clamp(0, 255);
            self.dpcm_sample = sample as u8;
            self.pcm_pos += 1;
            self.dpcm_sample
        } else {
            let sample = pcm.get(self.pcm_pos).copied().unwrap_or(0x80);
            self.pcm_pos += 1;
            sample
        }
    }

    /// Position the PCM cursor at `pos` samples.
    ///
    /// DPCM has no random access: the running value is re-derived by
    /// replaying every delta from the start. Seeks only happen at stream
    /// open and at explicit seek commands, so the O(n) cost is acceptable.
    fn seek_pcm(&mut self, pos: u16) {
        if self.use_dpcm {
            self.reset_pcm();
            for _ in 0..pos {
                self.read_pcm_sample();
            }
        } else {
            self.pcm_pos = pos as usize;
        }
    }

    /// Begin streaming a sample-table entry through the DAC sub-state.
    fn trigger_sample(&mut self, sample_id: usize, rate: u8) {
        if self.song.pcm.is_none() {
            return;
        }
        let Some(entry) = self.song.samples.get(sample_id).copied() else {
            log::warn!("sample trigger {} out of range", sample_id);
            return;
        };
        self.seek_pcm(entry.start);
        self.sample_end = entry.start as usize + entry.length as usize;
        self.sample_rate = rate.max(1) as u32;
        // Zero accumulator: first byte goes out on the next tick.
        self.sample_wait_accum = 0;
        self.sample_playing = true;
    }

    fn load_chunk(&mut self, index: usize) -> bool {
        if index >= self.song.chunks.len() {
            return false;
        }
        self.chunk = index;
        self.pos = 0;
        true
    }

    /// Decode one command. `None` wait means end of stream.
    fn process_command(&mut self, sink: &mut dyn ChipSink) -> Option<u32> {
        let cmd = self.read_byte()?;

        // Wait 1-64 samples.
        if cmd <= 0x3F {
            return Some(cmd as u32 + 1);
        }
        // Dictionary entries 0-63.
        if (0x40..=0x7F).contains(&cmd) {
            self.write_dict_entry((cmd & 0x3F) as usize, sink);
            return Some(0);
        }
        // 1-16 raw PSG writes.
        if (0x80..=0x8F).contains(&cmd) {
            let count = (cmd & 0x0F) + 1;
            for _ in 0..count {
                let value = self.read_byte()?;
                sink.write_psg(value);
            }
            return Some(0);
        }
        // Wait 1-16 frames.
        if (0x90..=0x9F).contains(&cmd) {
            return Some(((cmd & 0x0F) as u32 + 1) * SAMPLES_PER_FRAME);
        }
        // Key on/off shortcuts.
        if (0xA0..=0xAB).contains(&cmd) {
            self.write_key_on_off(cmd & 0x0F, sink);
            return Some(0);
        }
        // DAC write plus wait 0-15.
        if (0xC0..=0xCF).contains(&cmd) {
            let sample = self.read_pcm_sample();
            sink.write_dac(sample);
            return Some((cmd & 0x0F) as u32);
        }
        // Quick sample triggers 0-15, rate byte follows.
        if (0xD0..=0xDF).contains(&cmd) {
            let rate = self.read_byte()?;
            self.trigger_sample((cmd & 0x0F) as usize, rate);
            return Some(0);
        }

        match cmd {
            CMD_DICT_EXT => {
                let index = self.read_byte()?;
                self.write_dict_entry(index as usize, sink);
                Some(0)
            }
            CMD_CHIP_A_RAW_P0 | CMD_CHIP_A_RAW_P1 => {
                let port = cmd - CMD_CHIP_A_RAW_P0;
                let reg = self.read_byte()?;
                let value = self.read_byte()?;
                sink.write_chip_a(port, reg, value);
                Some(0)
            }
            CMD_PSG_RAW => {
                let value = self.read_byte()?;
                sink.write_psg(value);
                Some(0)
            }
            CMD_WAIT_LONG => Some(self.read_word()? as u32),
            // Loop position comes from the header; the inline marker is
            // informational.
            CMD_LOOP_MARK => Some(0),
            CMD_DAC_WRITE => {
                let sample = self.read_pcm_sample();
                sink.write_dac(sample);
                Some(0)
            }
            CMD_DAC_SEEK => {
                let pos = self.read_word()?;
                self.seek_pcm(pos);
                Some(0)
            }
            CMD_DAC_BLOCK => {
                // Fixed-interval burst: count samples, one wait for all.
                let count = self.read_byte()?;
                let wait = self.read_byte()?;
                for _ in 0..count {
                    let sample = self.read_pcm_sample();
                    sink.write_dac(sample);
                }
                Some(count as u32 * wait as u32)
            }
            CMD_DAC_RUN => {
                // Variable-interval burst: two 4-bit waits packed per byte,
                // high nibble first.
                let count = self.read_byte()?;
                let mut total_wait = 0u32;
                let mut i = 0;
                while i < count {
                    let packed = self.read_byte()?;
                    let sample = self.read_pcm_sample();
                    sink.write_dac(sample);
                    total_wait += ((packed >> 4) & 0x0F) as u32;
                    if i + 1 < count {
                        let sample = self.read_pcm_sample();
                        sink.write_dac(sample);
                        total_wait += (packed & 0x0F) as u32;
                    }
                    i += 2;
                }
                Some(total_wait)
            }
            CMD_SAMPLE_PLAY => {
                let sample_id = self.read_byte()?;
                let rate = self.read_byte()?;
                self.trigger_sample(sample_id as usize, rate);
                Some(0)
            }
            CMD_DAC_START => {
                // Stream from an explicit PCM position until the payload
                // runs out.
                let pos = self.read_word()?;
                let rate = self.read_byte()?;
                self.seek_pcm(pos);
                self.sample_end = self.song.pcm.as_ref().map_or(0, |p| p.len());
                self.sample_rate = rate.max(1) as u32;
                self.sample_wait_accum = 0;
                self.sample_playing = true;
                Some(0)
            }
            CMD_CHUNK_END => {
                if self.load_chunk(self.chunk + 1) {
                    Some(0)
                } else {
                    None
                }
            }
            CMD_END => None,
            other => {
                log::warn!("unknown gep opcode 0x{:02X}", other);
                Some(0)
            }
        }
    }
}

impl CommandStream for GepInterpreter {
    fn process_one(&mut self, sink: &mut dyn ChipSink) -> Step {
        if self.finished {
            return Step::End;
        }
        match self.process_command(sink) {
            Some(0) => Step::Continue,
            Some(wait) => Step::Wait(wait),
            None => {
                self.finished = true;
                Step::End
            }
        }
    }

    fn seek_to_loop(&mut self) -> bool {
        let Some(loop_chunk) = self.song.header.loop_chunk else {
            return false;
        };
        if !self.load_chunk(loop_chunk as usize) {
            return false;
        }
        self.pos = self.song.header.loop_offset as usize;
        self.finished = false;
        true
    }

    fn has_loop(&self) -> bool {
        self.song.header.has_loop()
    }

    fn total_samples(&self) -> u32 {
        self.song.header.total_samples
    }

    /// Emit one DAC byte when enough wait time has accumulated for the
    /// current sample's rate. The accumulator resets to zero rather than
    /// carrying debt, so a stall never produces a burst.
    fn tick_dac(&mut self, advanced: u32, sink: &mut dyn ChipSink) {
        if !self.sample_playing || self.song.pcm.is_none() {
            return;
        }
        self.sample_wait_accum += advanced;
        if self.sample_wait_accum >= self.sample_rate {
            let sample = self.read_pcm_sample();
            sink.write_dac(sample);
            self.sample_wait_accum = 0;
            if self.sample_end > 0 && self.pcm_pos >= self.sample_end {
                self.sample_playing = false;
            }
        }
    }
}
