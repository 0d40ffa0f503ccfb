//! Hardware sink contract.
//!
//! The interpreters never touch hardware directly; they emit register writes
//! through the [`ChipSink`] trait. A real implementation bit-bangs the FM
//! chip and PSG bus lines, the implementations here are for silent operation
//! and for inspecting the emitted write sequence.

/// One decoded chip access, as recorded by [`CaptureSink`] and as carried by
/// the bridge transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipWrite {
    /// FM chip register write: `(port, register, value)`.
    ChipA { port: u8, reg: u8, value: u8 },
    /// PSG data byte.
    Psg(u8),
    /// One 8-bit DAC sample.
    Dac(u8),
}

/// Receiver for decoded chip accesses.
///
/// Calls are assumed to always succeed or to fail silently into a safe
/// state; no return values are consulted.
pub trait ChipSink {
    /// Write `value` to FM chip register `reg` on `port` (0 or 1).
    fn write_chip_a(&mut self, port: u8, reg: u8, value: u8);

    /// Write one data byte to the PSG.
    fn write_psg(&mut self, value: u8);

    /// Write one unsigned 8-bit DAC sample.
    fn write_dac(&mut self, value: u8);

    /// Silence both chips without losing register state.
    fn mute_all(&mut self);

    /// Full hardware reset, clearing any hanging notes.
    fn reset(&mut self);
}

/// Sink that discards everything. Useful for dry runs and timing tests.
pub struct NullSink;

impl ChipSink for NullSink {
    fn write_chip_a(&mut self, _port: u8, _reg: u8, _value: u8) {}
    fn write_psg(&mut self, _value: u8) {}
    fn write_dac(&mut self, _value: u8) {}
    fn mute_all(&mut self) {}
    fn reset(&mut self) {}
}

/// Sink that records every call in order.
///
/// ```
/// use chipdrive::sink::{CaptureSink, ChipSink, ChipWrite};
///
/// let mut sink = CaptureSink::new();
/// sink.write_psg(0x9F);
/// assert_eq!(sink.writes, vec![ChipWrite::Psg(0x9F)]);
/// ```
#[derive(Debug, Default)]
pub struct CaptureSink {
    /// Chip accesses in emission order.
    pub writes: Vec<ChipWrite>,
    /// Number of `mute_all` calls.
    pub mutes: u32,
    /// Number of `reset` calls.
    pub resets: u32,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything recorded so far.
    pub fn clear(&mut self) {
        self.writes.clear();
        self.mutes = 0;
        self.resets = 0;
    }
}

impl ChipSink for CaptureSink {
    fn write_chip_a(&mut self, port: u8, reg: u8, value: u8) {
        self.writes.push(ChipWrite::ChipA { port, reg, value });
    }

    fn write_psg(&mut self, value: u8) {
        self.writes.push(ChipWrite::Psg(value));
    }

    fn write_dac(&mut self, value: u8) {
        self.writes.push(ChipWrite::Dac(value));
    }

    fn mute_all(&mut self) {
        self.mutes += 1;
    }

    fn reset(&mut self) {
        self.resets += 1;
    }
}
