#![doc = include_str!("../README.md")]

mod binutil;
pub mod gep;
pub mod pcm;
pub mod player;
pub mod sink;
pub mod source;
pub mod transport;
pub mod vgm;

pub use binutil::PlayError;
pub use gep::{GepHeader, GepInterpreter, GepSong};
pub use pcm::{MemoryBudget, PcmBank};
pub use player::{Clock, CommandStream, Player, PlayerState, StdClock, Step};
pub use sink::{CaptureSink, ChipSink, ChipWrite, NullSink};
pub use source::{ByteSource, ChunkedMemorySource, FileSource, GzipSource, MemorySource};
pub use transport::{BridgeEvent, BridgeReceiver, ChunkReceiver, Reply, RingBuffer, RingSource};
pub use vgm::{VgmHeader, VgmInterpreter};
