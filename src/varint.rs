//! Variable-length unsigned integer codec used throughout the header.
//!
//! Values up to `0xFA` take a single byte; larger values are written as a
//! tag byte followed by the value in little-endian form:
//!
//! ```text
//! n <= 0xFA          -> [n]
//! n <= 0xFFFF        -> [0xFB, u16 LE]
//! n <= 0xFFFF_FFFF   -> [0xFC, u32 LE]
//! otherwise          -> [0xFD, u64 LE]
//! ```
//!
//! Tags `0xFE` and `0xFF` are reserved. Decoding rejects reserved tags,
//! truncated input, and non-minimal encodings; a value must be encoded in
//! its shortest form so that every integer has exactly one wire
//! representation.

use crate::lib::Vec;
use core::fmt::Display;

/// Ways a varint can fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// The input ended before the encoded value was complete.
    Truncated,
    /// The tag byte is one of the reserved values `0xFE`/`0xFF`.
    Reserved(u8),
    /// The value was encoded in a longer form than necessary.
    NonMinimal,
}

impl Display for VarintError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VarintError::Truncated => write!(f, "truncated varint"),
            VarintError::Reserved(tag) => write!(f, "reserved varint tag {tag:#04x}"),
            VarintError::NonMinimal => write!(f, "non-minimal varint encoding"),
        }
    }
}

#[cfg(not(feature = "std"))]
impl core::error::Error for VarintError {}

#[cfg(feature = "std")]
impl std::error::Error for VarintError {}

/// Largest value that fits in the single-byte form.
pub const MAX_SINGLE_BYTE: u8 = 0xFA;

/// Appends `value` to `out` in its shortest wire form.
pub fn encode(value: u64, out: &mut Vec<u8>) {
    if value <= MAX_SINGLE_BYTE as u64 {
        out.push(value as u8);
    } else if value <= u16::MAX as u64 {
        out.push(0xFB);
        out.extend((value as u16).to_le_bytes());
    } else if value <= u32::MAX as u64 {
        out.push(0xFC);
        out.extend((value as u32).to_le_bytes());
    } else {
        out.push(0xFD);
        out.extend(value.to_le_bytes());
    }
}

/// Decodes a varint from the start of `buf`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    let &tag = buf.first().ok_or(VarintError::Truncated)?;
    match tag {
        0xFB => {
            let raw: [u8; 2] = buf
                .get(1..3)
                .and_then(|b| b.try_into().ok())
                .ok_or(VarintError::Truncated)?;
            let value = u16::from_le_bytes(raw) as u64;
            if value <= MAX_SINGLE_BYTE as u64 {
                return Err(VarintError::NonMinimal);
            }
            Ok((value, 3))
        }
        0xFC => {
            let raw: [u8; 4] = buf
                .get(1..5)
                .and_then(|b| b.try_into().ok())
                .ok_or(VarintError::Truncated)?;
            let value = u32::from_le_bytes(raw) as u64;
            if value <= u16::MAX as u64 {
                return Err(VarintError::NonMinimal);
            }
            Ok((value, 5))
        }
        0xFD => {
            let raw: [u8; 8] = buf
                .get(1..9)
                .and_then(|b| b.try_into().ok())
                .ok_or(VarintError::Truncated)?;
            let value = u64::from_le_bytes(raw);
            if value <= u32::MAX as u64 {
                return Err(VarintError::NonMinimal);
            }
            Ok((value, 9))
        }
        0xFE | 0xFF => Err(VarintError::Reserved(tag)),
        byte => Ok((byte as u64, 1)),
    }
}
