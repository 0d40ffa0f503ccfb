//! Byte-oriented chunk transport for feeding command data over a serial
//! link.
//!
//! The link layer is deliberately simple: the sender frames data into
//! checksummed chunks and waits for a one-byte flow-control reply before
//! sending the next one, so a receiver with a small buffer can pace an
//! arbitrarily fast sender. Received payload lands in a ring buffer that
//! implements [`ByteSource`], letting an interpreter consume the stream
//! while frames are still arriving.
//!
//! The bridge variant carries individual timed register writes instead of
//! stream chunks, for hosts that run the interpreter themselves and only
//! forward chip traffic.

use std::cell::RefCell;
use std::rc::Rc;

use crate::sink::{ChipSink, ChipWrite};
use crate::source::ByteSource;

/// Start of a data chunk frame.
pub const CHUNK_HEADER: u8 = 0x01;
/// Sender is done; no more chunks follow.
pub const STREAM_END: u8 = 0x02;
/// Liveness probe; answered with [`Reply::Handshake`].
pub const CMD_PING: u8 = 0x00;
/// First byte of the handshake reply.
pub const CMD_ACK: u8 = 0x0F;
/// Flow control: chunk accepted, send the next one.
pub const FLOW_READY: u8 = 0x06;
/// Flow control: chunk rejected, resend it.
pub const FLOW_NAK: u8 = 0x15;

/// Microseconds of silence after which a partially received stream is
/// considered abandoned.
const ACTIVITY_TIMEOUT_MICROS: u32 = 1_000_000;

/// Reply owed to the sender after a received byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Answer to a ping: ack byte, board identifier, ready byte.
    Handshake(u8),
    Ready,
    Nak,
}

impl Reply {
    /// Append the wire form of this reply to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Reply::Handshake(board_type) => {
                out.extend_from_slice(&[CMD_ACK, board_type, FLOW_READY]);
            }
            Reply::Ready => out.push(FLOW_READY),
            Reply::Nak => out.push(FLOW_NAK),
        }
    }
}

/// Fixed-capacity byte FIFO.
///
/// Capacity is rounded up to a power of two and one slot is kept empty to
/// distinguish full from empty, so `available() + free()` is always
/// `capacity - 1`.
pub struct RingBuffer {
    buf: Vec<u8>,
    mask: usize,
    head: usize,
    tail: usize,
    /// Total bytes ever popped, serves as the reader position.
    consumed: u64,
    /// The producer has declared the stream complete; an empty ring is a
    /// final end, not a momentary underrun.
    ended: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            buf: vec![0; capacity],
            mask: capacity - 1,
            head: 0,
            tail: 0,
            consumed: 0,
            ended: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes ready to pop.
    pub fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bytes that can still be pushed.
    pub fn free(&self) -> usize {
        self.buf.len() - 1 - self.len()
    }

    pub fn push(&mut self, byte: u8) -> bool {
        if self.free() == 0 {
            return false;
        }
        self.buf[self.head] = byte;
        self.head = (self.head + 1) & self.mask;
        true
    }

    /// Push every byte of `data`, or nothing if it does not all fit.
    pub fn push_all(&mut self, data: &[u8]) -> bool {
        if data.len() > self.free() {
            return false;
        }
        for &b in data {
            self.buf[self.head] = b;
            self.head = (self.head + 1) & self.mask;
        }
        true
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let b = self.buf[self.tail];
        self.tail = (self.tail + 1) & self.mask;
        self.consumed += 1;
        Some(b)
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.consumed = 0;
        self.ended = false;
    }

    /// Declare that no more bytes will ever be pushed.
    pub fn mark_ended(&mut self) {
        self.ended = true;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn front(&self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            Some(self.buf[self.tail])
        }
    }
}

impl ByteSource for RingBuffer {
    fn open(&mut self) -> bool {
        true
    }

    fn close(&mut self) {
        self.clear();
    }

    fn is_open(&self) -> bool {
        true
    }

    fn read(&mut self) -> Option<u8> {
        self.pop()
    }

    fn peek(&mut self) -> Option<u8> {
        self.front()
    }

    fn available(&mut self) -> bool {
        !self.is_empty()
    }

    fn position(&self) -> u64 {
        self.consumed
    }

    fn more_expected(&self) -> bool {
        !self.ended
    }
}

/// Clonable reader handle over a receiver's ring buffer.
///
/// [`ChunkReceiver::source`] hands one of these to an interpreter; the
/// receiver keeps pushing into the same ring through its own handle. Owned
/// and `'static`, so it can be boxed like any other [`ByteSource`].
#[derive(Clone)]
pub struct RingSource {
    ring: Rc<RefCell<RingBuffer>>,
}

impl ByteSource for RingSource {
    fn open(&mut self) -> bool {
        true
    }

    fn close(&mut self) {
        self.ring.borrow_mut().clear();
    }

    fn is_open(&self) -> bool {
        true
    }

    fn read(&mut self) -> Option<u8> {
        self.ring.borrow_mut().pop()
    }

    fn peek(&mut self) -> Option<u8> {
        self.ring.borrow().front()
    }

    fn available(&mut self) -> bool {
        !self.ring.borrow().is_empty()
    }

    fn position(&self) -> u64 {
        self.ring.borrow().consumed
    }

    fn more_expected(&self) -> bool {
        !self.ring.borrow().ended
    }
}

/// Frame decoder progress. Each state stores exactly what it has collected
/// so far; feeding one byte moves it at most one step.
enum ReceiveState {
    Idle,
    /// Header byte seen, length byte next.
    HaveHeader,
    /// Collecting `expected` payload bytes.
    HaveLength { expected: usize, payload: Vec<u8> },
    /// Payload complete, checksum byte next.
    AwaitingChecksum { payload: Vec<u8> },
}

/// Receives checksummed chunks into a ring buffer and produces the flow
/// control replies the sender waits for.
///
/// Byte-at-a-time and re-entrant: call [`ChunkReceiver::receive`] from
/// whatever delivers serial input, write any returned [`Reply`] back to the
/// sender, and hand [`ChunkReceiver::source`] to an interpreter.
pub struct ChunkReceiver {
    ring: Rc<RefCell<RingBuffer>>,
    state: ReceiveState,
    board_type: u8,
    last_activity: u32,
    active: bool,
}

impl ChunkReceiver {
    pub fn new(buffer_capacity: usize, board_type: u8) -> Self {
        Self {
            ring: Rc::new(RefCell::new(RingBuffer::new(buffer_capacity))),
            state: ReceiveState::Idle,
            board_type,
            last_activity: 0,
            active: false,
        }
    }

    /// Reader handle over the receive buffer, for handing to an interpreter.
    pub fn source(&self) -> RingSource {
        RingSource {
            ring: Rc::clone(&self.ring),
        }
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.ring.borrow().len()
    }

    /// `true` once the sender has signalled the end of the stream.
    pub fn is_ended(&self) -> bool {
        self.ring.borrow().is_ended()
    }

    /// Feed one received byte. `now` is the current microsecond counter,
    /// used for the abandonment timeout.
    pub fn receive(&mut self, byte: u8, now: u32) -> Option<Reply> {
        self.last_activity = now;
        self.active = true;

        match std::mem::replace(&mut self.state, ReceiveState::Idle) {
            ReceiveState::Idle => match byte {
                CHUNK_HEADER => {
                    self.state = ReceiveState::HaveHeader;
                    None
                }
                STREAM_END => {
                    self.ring.borrow_mut().mark_ended();
                    None
                }
                CMD_PING => Some(Reply::Handshake(self.board_type)),
                other => {
                    log::warn!("unexpected transport byte 0x{:02X}", other);
                    None
                }
            },
            ReceiveState::HaveHeader => {
                let expected = byte as usize;
                if expected == 0 {
                    // Empty chunk: checksum is just the length byte.
                    self.state = ReceiveState::AwaitingChecksum { payload: Vec::new() };
                } else {
                    self.state = ReceiveState::HaveLength {
                        expected,
                        payload: Vec::with_capacity(expected),
                    };
                }
                None
            }
            ReceiveState::HaveLength { expected, mut payload } => {
                payload.push(byte);
                if payload.len() == expected {
                    self.state = ReceiveState::AwaitingChecksum { payload };
                } else {
                    self.state = ReceiveState::HaveLength { expected, payload };
                }
                None
            }
            ReceiveState::AwaitingChecksum { payload } => {
                let mut checksum = payload.len() as u8;
                for &b in &payload {
                    checksum ^= b;
                }
                if checksum != byte {
                    log::warn!(
                        "chunk checksum mismatch: got 0x{:02X}, computed 0x{:02X}",
                        byte,
                        checksum
                    );
                    return Some(Reply::Nak);
                }
                // All or nothing: a rejected chunk is resent in full, so a
                // partial copy would duplicate data.
                if !self.ring.borrow_mut().push_all(&payload) {
                    return Some(Reply::Nak);
                }
                Some(Reply::Ready)
            }
        }
    }

    /// Detect an abandoned transfer. When the line has been silent past the
    /// timeout with a stream in progress, the chips are muted and the
    /// receiver resets for a fresh stream.
    pub fn check_timeout(&mut self, now: u32, sink: &mut dyn ChipSink) {
        if !self.active || self.is_ended() {
            return;
        }
        if now.wrapping_sub(self.last_activity) > ACTIVITY_TIMEOUT_MICROS {
            log::warn!("transport timed out, resetting");
            sink.mute_all();
            self.state = ReceiveState::Idle;
            self.ring.borrow_mut().clear();
            self.active = false;
        }
    }
}

/// One event decoded from the bridge stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Perform `write` after `delay_us` microseconds.
    Write { delay_us: u16, write: ChipWrite },
    /// The sender is done.
    End,
}

/// Bridge frame decoder progress.
enum BridgeState {
    /// Collecting the 16-bit delay, low byte first.
    Delay { low: Option<u8> },
    /// Delay complete, opcode byte next.
    Opcode { delay_us: u16 },
    /// Collecting opcode operands.
    Operands {
        delay_us: u16,
        opcode: u8,
        operands: [u8; 2],
        got: usize,
        needed: usize,
    },
}

/// Decodes the bridge protocol: timed individual register writes sent by a
/// host that runs the interpreter itself.
///
/// Each event is `[delay_us: u16 LE][opcode][operands]` with the opcodes
/// borrowed from the stream format: `0x50` PSG write, `0x52`/`0x53` FM
/// writes to port 0/1, `0x66` end.
pub struct BridgeReceiver {
    state: BridgeState,
}

impl BridgeReceiver {
    pub fn new() -> Self {
        Self {
            state: BridgeState::Delay { low: None },
        }
    }

    fn operand_count(opcode: u8) -> Option<usize> {
        match opcode {
            0x50 => Some(1),
            0x52 | 0x53 => Some(2),
            0x66 => Some(0),
            _ => None,
        }
    }

    fn decode(delay_us: u16, opcode: u8, operands: &[u8; 2]) -> Option<BridgeEvent> {
        let write = match opcode {
            0x50 => ChipWrite::Psg(operands[0]),
            0x52 | 0x53 => ChipWrite::ChipA {
                port: opcode & 0x01,
                reg: operands[0],
                value: operands[1],
            },
            _ => return None,
        };
        Some(BridgeEvent::Write { delay_us, write })
    }

    /// Feed one received byte; returns an event when one completes.
    pub fn receive(&mut self, byte: u8) -> Option<BridgeEvent> {
        match std::mem::replace(&mut self.state, BridgeState::Delay { low: None }) {
            BridgeState::Delay { low: None } => {
                self.state = BridgeState::Delay { low: Some(byte) };
                None
            }
            BridgeState::Delay { low: Some(low) } => {
                self.state = BridgeState::Opcode {
                    delay_us: u16::from_le_bytes([low, byte]),
                };
                None
            }
            BridgeState::Opcode { delay_us } => match Self::operand_count(byte) {
                Some(0) if byte == 0x66 => Some(BridgeEvent::End),
                Some(needed) => {
                    self.state = BridgeState::Operands {
                        delay_us,
                        opcode: byte,
                        operands: [0; 2],
                        got: 0,
                        needed,
                    };
                    None
                }
                _ => {
                    log::warn!("unknown bridge opcode 0x{:02X}", byte);
                    None
                }
            },
            BridgeState::Operands {
                delay_us,
                opcode,
                mut operands,
                mut got,
                needed,
            } => {
                operands[got] = byte;
                got += 1;
                if got == needed {
                    Self::decode(delay_us, opcode, &operands)
                } else {
                    self.state = BridgeState::Operands {
                        delay_us,
                        opcode,
                        operands,
                        got,
                        needed,
                    };
                    None
                }
            }
        }
    }
}

impl Default for BridgeReceiver {
    fn default() -> Self {
        Self::new()
    }
}
