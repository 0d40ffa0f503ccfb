//! Playback error type and little-endian byte readers used by the header parsers.
use std::fmt;

/// Error type for failures that prevent playback from starting.
///
/// Steady-state playback never returns these; recoverable conditions (unknown
/// opcodes, exhausted PCM memory, transport checksum failures) are handled in
/// place as the format requires.
#[derive(Debug, Clone)]
pub enum PlayError {
    /// Input ended while a header or operand was still being read.
    UnexpectedEof,

    /// An attempted read was outside the available buffer range.
    ///
    /// - `offset` is the index that was attempted to be accessed.
    /// - `needed` is the number of bytes required for the operation.
    /// - `available` is the current buffer length.
    /// - `context` optionally names the logical field (for example
    ///   `"total_samples"`) where the access was attempted.
    OffsetOutOfRange {
        offset: usize,
        needed: usize,
        available: usize,
        context: Option<String>,
    },

    /// A four-byte identifier did not match an expected value.
    ///
    /// The contained array is the raw 4 bytes that were read.
    InvalidIdent([u8; 4]),

    /// The header flags neither of the two supported sound chips, so the
    /// stream cannot produce any output on this hardware.
    NoSupportedChips,

    /// A header was shorter than the minimum required length.
    ///
    /// The contained `String` identifies which header was too short.
    HeaderTooShort(String),

    /// A generic error with a human-readable message.
    Other(String),
}

impl fmt::Display for PlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayError::UnexpectedEof => write!(f, "unexpected end of input"),
            PlayError::OffsetOutOfRange {
                offset,
                needed,
                available,
                context,
            } => {
                if let Some(ctx) = context {
                    write!(
                        f,
                        "offset out of range at {}: 0x{:X} (needed {} bytes, available {})",
                        ctx, offset, needed, available
                    )
                } else {
                    write!(
                        f,
                        "offset out of range: 0x{:X} (needed {} bytes, available {})",
                        offset, needed, available
                    )
                }
            }
            PlayError::InvalidIdent(id) => write!(f, "invalid ident: {:?}", id),
            PlayError::NoSupportedChips => write!(f, "stream uses no supported sound chip"),
            PlayError::HeaderTooShort(name) => write!(f, "header too short: {}", name),
            PlayError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for PlayError {}

/// Read a 32-bit little-endian unsigned integer from `bytes` at `off`.
///
/// Returns `Err(PlayError::OffsetOutOfRange)` when the buffer is too short.
pub fn read_u32_le_at(bytes: &[u8], off: usize) -> Result<u32, PlayError> {
    if bytes.len() < off + 4 {
        return Err(PlayError::OffsetOutOfRange {
            offset: off,
            needed: 4,
            available: bytes.len(),
            context: None,
        });
    }
    let mut tmp: [u8; 4] = [0; 4];
    tmp.copy_from_slice(&bytes[off..off + 4]);
    Ok(u32::from_le_bytes(tmp))
}

/// Read a 16-bit little-endian unsigned integer from `bytes` at `off`.
///
/// Returns `Err(PlayError::OffsetOutOfRange)` when the buffer is too short.
pub fn read_u16_le_at(bytes: &[u8], off: usize) -> Result<u16, PlayError> {
    if bytes.len() < off + 2 {
        return Err(PlayError::OffsetOutOfRange {
            offset: off,
            needed: 2,
            available: bytes.len(),
            context: None,
        });
    }
    let mut tmp: [u8; 2] = [0; 2];
    tmp.copy_from_slice(&bytes[off..off + 2]);
    Ok(u16::from_le_bytes(tmp))
}

/// Read a single byte from `bytes` at `off`.
///
/// Returns `Err(PlayError::OffsetOutOfRange)` when `off` is out of bounds.
pub fn read_u8_at(bytes: &[u8], off: usize) -> Result<u8, PlayError> {
    if bytes.len() <= off {
        return Err(PlayError::OffsetOutOfRange {
            offset: off,
            needed: 1,
            available: bytes.len(),
            context: None,
        });
    }
    Ok(bytes[off])
}
