//! VGM header parsing and command interpretation.
//!
//! The interpreter is pull-based: [`VgmInterpreter::process_one`] decodes a
//! single command from the byte source, dispatches any chip write to the
//! sink, and reports the wait that follows it. Commands are never collected
//! into a list.

use crate::binutil::{PlayError, read_u32_le_at};
use crate::pcm::{MemoryBudget, PcmBank};
use crate::player::{CommandStream, Step};
use crate::sink::ChipSink;
use crate::source::ByteSource;

/// "Vgm " identifier at offset 0.
pub const VGM_IDENT: [u8; 4] = *b"Vgm ";

/// Fixed header region read before playback begins.
const HEADER_LEN: usize = 0x40;

const OFF_VERSION: usize = 0x08;
const OFF_PSG_CLOCK: usize = 0x0C;
const OFF_TOTAL_SAMPLES: usize = 0x18;
const OFF_LOOP: usize = 0x1C;
const OFF_LOOP_SAMPLES: usize = 0x20;
const OFF_CHIP_A_CLOCK: usize = 0x2C;
const OFF_DATA: usize = 0x34;

const CMD_PSG: u8 = 0x50;
const CMD_CHIP_A_P0: u8 = 0x52;
const CMD_CHIP_A_P1: u8 = 0x53;
const CMD_WAIT: u8 = 0x61;
const CMD_WAIT_NTSC: u8 = 0x62;
const CMD_WAIT_PAL: u8 = 0x63;
const CMD_END: u8 = 0x66;
const CMD_DATA_BLOCK: u8 = 0x67;
const CMD_PCM_SEEK: u8 = 0xE0;

/// Data block type carrying the FM chip's PCM bank.
const DATA_TYPE_PCM: u8 = 0x00;

const WAIT_NTSC: u32 = 735;
const WAIT_PAL: u32 = 882;

/// Parsed VGM header fields relevant to playback.
#[derive(Debug, Clone)]
pub struct VgmHeader {
    /// BCD version, e.g. `0x0171` for v1.71.
    pub version: u32,
    /// PSG clock in Hz; 0 when the chip is absent.
    pub psg_clock: u32,
    /// FM chip clock in Hz; 0 when the chip is absent.
    pub chip_a_clock: u32,
    /// Declared playback length in samples.
    pub total_samples: u32,
    /// Absolute offset of the loop point, when the stream loops.
    pub loop_offset: Option<u32>,
    /// Samples in one pass of the loop body.
    pub loop_samples: u32,
    /// Absolute offset of the first command byte.
    pub data_offset: u32,
}

impl VgmHeader {
    /// Parse the fixed header region.
    ///
    /// Rejects streams that flag neither supported chip; there would be
    /// nothing to play on them.
    ///
    /// ```
    /// use chipdrive::vgm::VgmHeader;
    ///
    /// let mut raw = vec![0u8; 0x40];
    /// raw[0..4].copy_from_slice(b"Vgm ");
    /// raw[0x08..0x0C].copy_from_slice(&0x0171u32.to_le_bytes());
    /// raw[0x0C..0x10].copy_from_slice(&3_579_545u32.to_le_bytes());
    /// raw[0x18..0x1C].copy_from_slice(&44100u32.to_le_bytes());
    ///
    /// let header = VgmHeader::parse(&raw).unwrap();
    /// assert_eq!(header.total_samples, 44100);
    /// assert!(header.has_psg());
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self, PlayError> {
        if bytes.len() < HEADER_LEN {
            return Err(PlayError::HeaderTooShort("VGM header".into()));
        }
        let mut ident = [0u8; 4];
        ident.copy_from_slice(&bytes[0..4]);
        if ident != VGM_IDENT {
            return Err(PlayError::InvalidIdent(ident));
        }

        let version = read_u32_le_at(bytes, OFF_VERSION)?;
        let psg_clock = read_u32_le_at(bytes, OFF_PSG_CLOCK)?;
        let total_samples = read_u32_le_at(bytes, OFF_TOTAL_SAMPLES)?;

        let loop_rel = read_u32_le_at(bytes, OFF_LOOP)?;
        let loop_offset = if loop_rel != 0 {
            Some(OFF_LOOP as u32 + loop_rel)
        } else {
            None
        };
        let loop_samples = read_u32_le_at(bytes, OFF_LOOP_SAMPLES)?;

        // The FM chip clock field only exists from v1.10 on.
        let chip_a_clock = if version >= 0x110 {
            read_u32_le_at(bytes, OFF_CHIP_A_CLOCK)?
        } else {
            0
        };

        // Relative data offset from v1.50; fixed 0x40 before that.
        let data_offset = if version >= 0x150 {
            let rel = read_u32_le_at(bytes, OFF_DATA)?;
            if rel != 0 { OFF_DATA as u32 + rel } else { 0x40 }
        } else {
            0x40
        };

        if chip_a_clock == 0 && psg_clock == 0 {
            return Err(PlayError::NoSupportedChips);
        }

        Ok(Self {
            version,
            psg_clock,
            chip_a_clock,
            total_samples,
            loop_offset,
            loop_samples,
            data_offset,
        })
    }

    pub fn has_psg(&self) -> bool {
        self.psg_clock != 0
    }

    pub fn has_chip_a(&self) -> bool {
        self.chip_a_clock != 0
    }

    pub fn has_loop(&self) -> bool {
        self.loop_offset.is_some()
    }
}

/// Progress through a data block's payload, kept across calls so a live
/// source can deliver the payload in pieces.
enum DataBlock {
    Idle,
    Pcm { remaining: u32 },
    Skip { remaining: u32 },
}

/// Pull-based VGM command interpreter.
///
/// Works against live sources: when the source runs dry mid-command the
/// bytes consumed so far are kept in a replay buffer and the same command is
/// resumed on the next call, so operands are never dropped.
pub struct VgmInterpreter {
    source: Box<dyn ByteSource>,
    header: VgmHeader,
    pcm: PcmBank,
    budget: MemoryBudget,
    finished: bool,
    partial: Vec<u8>,
    block: DataBlock,
}

impl VgmInterpreter {
    /// Open `source`, parse and validate the header, and position the source
    /// at the first command byte.
    pub fn open(
        mut source: Box<dyn ByteSource>,
        budget: MemoryBudget,
    ) -> Result<Self, PlayError> {
        if !source.is_open() && !source.open() {
            return Err(PlayError::Other("could not open byte source".into()));
        }

        let mut raw = [0u8; HEADER_LEN];
        if source.read_into(&mut raw) < HEADER_LEN {
            return Err(PlayError::UnexpectedEof);
        }
        let header = VgmHeader::parse(&raw)?;

        log::debug!(
            "vgm v{:X}: psg={} chip_a={} samples={} loop={:?}",
            header.version,
            header.has_psg(),
            header.has_chip_a(),
            header.total_samples,
            header.loop_offset
        );

        // The header region is already consumed; skip any extended header
        // bytes up to the data start.
        if header.data_offset as u64 > source.position() {
            source.skip(header.data_offset as u64 - source.position());
        }
        if let Some(loop_offset) = header.loop_offset {
            source.set_loop_hint(loop_offset as u64);
        }

        Ok(Self {
            source,
            header,
            pcm: PcmBank::new(),
            budget,
            finished: false,
            partial: Vec::new(),
            block: DataBlock::Idle,
        })
    }

    pub fn header(&self) -> &VgmHeader {
        &self.header
    }

    pub fn pcm(&self) -> &PcmBank {
        &self.pcm
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Byte counts for opcodes this interpreter does not act on, keyed by
    /// opcode range. Skipping the right amount keeps the cursor aligned
    /// across commands for chips this hardware does not have.
    fn skip_len(cmd: u8) -> u32 {
        match cmd {
            0x30..=0x3F => 1,
            0x40..=0x4E => 2,
            0x4F => 1,
            0x51..=0x5F => 2,
            0x90 | 0x91 => 4,
            0x92 => 5,
            0x93 => 10,
            0x94 => 1,
            0x95 => 4,
            0xA0..=0xBF => 2,
            0xC0..=0xDF => 3,
            0xE1..=0xFF => 4,
            _ => 0,
        }
    }

    /// Byte `idx` of the command being decoded, reading from the source only
    /// for bytes not yet buffered. `None` means the source has run dry; the
    /// bytes read so far stay buffered for the next attempt.
    fn fetch(&mut self, idx: usize) -> Option<u8> {
        while self.partial.len() <= idx {
            self.partial.push(self.source.read()?);
        }
        Some(self.partial[idx])
    }

    /// The source yielded nothing. A live source means "come back later";
    /// anything else means the stream is over.
    fn stall(&mut self) -> Step {
        if self.source.more_expected() {
            Step::NeedData
        } else {
            self.pcm.finish_load();
            self.finished = true;
            Step::End
        }
    }

    /// Data block: `0x67 0x66 tt ss ss ss ss [payload]`.
    ///
    /// Reads the block introducer and decides the payload's fate. The PCM
    /// payload type feeds the bank; every other type is drained so the
    /// source stays byte-aligned. `None` means the source stalled inside the
    /// introducer.
    fn begin_data_block(&mut self) -> Option<Step> {
        let marker = self.fetch(1)?;
        if marker != 0x66 {
            log::warn!("invalid data block marker 0x{:02X}", marker);
            return Some(Step::Continue);
        }
        let data_type = self.fetch(2)?;
        let mut size_bytes = [0u8; 4];
        for (i, b) in size_bytes.iter_mut().enumerate() {
            *b = self.fetch(3 + i)?;
        }
        let size = u32::from_le_bytes(size_bytes);

        if size > 0 {
            if data_type == DATA_TYPE_PCM && self.pcm.begin_load(size, &self.budget) {
                self.block = DataBlock::Pcm { remaining: size };
            } else {
                if data_type != DATA_TYPE_PCM {
                    log::debug!(
                        "skipping data block type 0x{:02X} ({} bytes)",
                        data_type,
                        size
                    );
                }
                self.block = DataBlock::Skip { remaining: size };
            }
        }
        Some(Step::Continue)
    }

    /// Consume payload bytes of an in-progress data block. `None` when no
    /// block is in progress; otherwise the step to report.
    fn continue_data_block(&mut self) -> Option<Step> {
        match self.block {
            DataBlock::Idle => return None,
            DataBlock::Pcm { remaining } => {
                let mut left = remaining;
                while left > 0 {
                    let Some(byte) = self.source.read() else {
                        self.block = DataBlock::Pcm { remaining: left };
                        return Some(self.stall());
                    };
                    self.pcm.feed(byte);
                    left -= 1;
                }
                self.pcm.finish_load();
            }
            DataBlock::Skip { remaining } => {
                let mut left = remaining;
                while left > 0 {
                    if self.source.read().is_none() {
                        self.block = DataBlock::Skip { remaining: left };
                        return Some(self.stall());
                    }
                    left -= 1;
                }
            }
        }
        self.block = DataBlock::Idle;
        Some(Step::Continue)
    }
}

impl CommandStream for VgmInterpreter {
    fn process_one(&mut self, sink: &mut dyn ChipSink) -> Step {
        if self.finished {
            return Step::End;
        }
        if let Some(step) = self.continue_data_block() {
            return step;
        }
        let Some(cmd) = self.fetch(0) else {
            return self.stall();
        };

        let step = match cmd {
            CMD_PSG => match self.fetch(1) {
                Some(value) => {
                    sink.write_psg(value);
                    Step::Continue
                }
                None => return self.stall(),
            },
            CMD_CHIP_A_P0 | CMD_CHIP_A_P1 => {
                let port = cmd & 0x01;
                match (self.fetch(1), self.fetch(2)) {
                    (Some(reg), Some(value)) => {
                        sink.write_chip_a(port, reg, value);
                        Step::Continue
                    }
                    _ => return self.stall(),
                }
            }
            CMD_WAIT => match (self.fetch(1), self.fetch(2)) {
                (Some(lo), Some(hi)) => Step::Wait(u16::from_le_bytes([lo, hi]) as u32),
                _ => return self.stall(),
            },
            CMD_WAIT_NTSC => Step::Wait(WAIT_NTSC),
            CMD_WAIT_PAL => Step::Wait(WAIT_PAL),
            CMD_END => {
                self.finished = true;
                Step::End
            }
            CMD_DATA_BLOCK => match self.begin_data_block() {
                Some(step) => {
                    // The introducer is complete; any payload is consumed
                    // through `continue_data_block` on this and later calls.
                    self.partial.clear();
                    if let Some(payload_step) = self.continue_data_block() {
                        return payload_step;
                    }
                    step
                }
                None => return self.stall(),
            },
            0x70..=0x7F => Step::Wait((cmd & 0x0F) as u32 + 1),
            0x80..=0x8F => {
                if self.pcm.has_data() {
                    sink.write_dac(self.pcm.read_byte());
                }
                Step::Wait((cmd & 0x0F) as u32)
            }
            CMD_PCM_SEEK => {
                let mut pos_bytes = [0u8; 4];
                for (i, b) in pos_bytes.iter_mut().enumerate() {
                    match self.fetch(1 + i) {
                        Some(byte) => *b = byte,
                        None => return self.stall(),
                    }
                }
                self.pcm.seek(u32::from_le_bytes(pos_bytes));
                Step::Continue
            }
            other => {
                let skip = Self::skip_len(other);
                if skip > 0 {
                    for i in 0..skip {
                        if self.fetch(1 + i as usize).is_none() {
                            return self.stall();
                        }
                    }
                } else {
                    log::warn!(
                        "unknown opcode 0x{:02X} at offset 0x{:X}",
                        other,
                        self.source.position().saturating_sub(1)
                    );
                }
                Step::Continue
            }
        };
        self.partial.clear();
        step
    }

    fn seek_to_loop(&mut self) -> bool {
        let Some(loop_offset) = self.header.loop_offset else {
            return false;
        };
        if !self.source.can_seek() {
            return false;
        }
        if self.source.seek(loop_offset as u64) {
            self.finished = false;
            self.partial.clear();
            self.block = DataBlock::Idle;
            true
        } else {
            false
        }
    }

    fn has_loop(&self) -> bool {
        self.header.has_loop()
    }

    fn total_samples(&self) -> u32 {
        self.header.total_samples
    }
}
