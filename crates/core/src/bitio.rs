//! Bit-field access over sensor memory buffers.
//!
//! Sensor records pack values at arbitrary bit positions: a 14-bit glucose count
//! followed by an 11-bit quality word, a 12-bit thermistor count, and so on.
//! This module reads and writes unsigned fields of 0-16 bits addressed by a
//! `(byte_offset, bit_offset)` pair, where `bit_offset` may run past the end of
//! the first byte.
//!
//! # Bit Order
//!
//! Bits are numbered LSB-first within each byte, and a field's bit `i` lives at
//! absolute position `byte_offset * 8 + bit_offset + i`. Fields freely cross
//! byte boundaries.
//!
//! # Example
//! ```
//! use cgm_link_core::bitio::{read_bits, write_bits};
//!
//! let mut buffer = [0u8; 4];
//! write_bits(&mut buffer, 0, 14, 12, 0x5A3).unwrap();
//! assert_eq!(read_bits(&buffer, 0, 14, 12).unwrap(), 0x5A3);
//! // A zero-width field is a sentinel, not an error.
//! assert_eq!(read_bits(&buffer, 0, 0, 0).unwrap(), 0);
//! ```

use crate::error::{BitIoError, Result};

/// Widest field that can be read or written in one call.
pub const MAX_FIELD_BITS: usize = 16;

/// Check that a field lies inside a buffer of `len` bytes.
fn check_span(len: usize, byte_offset: usize, bit_offset: usize, bit_count: usize) -> Result<usize> {
    if bit_count > MAX_FIELD_BITS {
        return Err(BitIoError::InvalidBitCount(bit_count).into());
    }

    let start = byte_offset * 8 + bit_offset;
    let end = start + bit_count;
    let available = len * 8;
    if end > available {
        return Err(BitIoError::OutOfBounds {
            required_bits: end,
            available_bits: available,
        }
        .into());
    }

    Ok(start)
}

/// Read an unsigned field of up to 16 bits.
///
/// # Arguments
/// - `buffer`: source bytes
/// - `byte_offset`: byte where the field's addressing starts
/// - `bit_offset`: additional bit displacement (may exceed 7)
/// - `bit_count`: width of the field (0-16)
///
/// # Errors
/// - `BitIoError::InvalidBitCount` if `bit_count > 16`
/// - `BitIoError::OutOfBounds` if the field runs past the end of `buffer`
pub fn read_bits(buffer: &[u8], byte_offset: usize, bit_offset: usize, bit_count: usize) -> Result<u16> {
    if bit_count == 0 {
        return Ok(0);
    }

    let start = check_span(buffer.len(), byte_offset, bit_offset, bit_count)?;

    let mut value = 0u16;
    for i in 0..bit_count {
        let position = start + i;
        if (buffer[position / 8] >> (position % 8)) & 1 == 1 {
            value |= 1 << i;
        }
    }

    Ok(value)
}

/// Write an unsigned field of up to 16 bits, leaving every other bit untouched.
///
/// Bits of `value` above `bit_count` are ignored.
///
/// # Errors
/// Same as [`read_bits`].
pub fn write_bits(
    buffer: &mut [u8],
    byte_offset: usize,
    bit_offset: usize,
    bit_count: usize,
    value: u16,
) -> Result<()> {
    if bit_count == 0 {
        return Ok(());
    }

    let start = check_span(buffer.len(), byte_offset, bit_offset, bit_count)?;

    for i in 0..bit_count {
        let position = start + i;
        let mask = 1u8 << (position % 8);
        if (value >> i) & 1 == 1 {
            buffer[position / 8] |= mask;
        } else {
            buffer[position / 8] &= !mask;
        }
    }

    Ok(())
}

/// A named field location inside a fixed-layout record.
///
/// Record layouts are declared as tables of `BitField`s relative to the start
/// of a record, then rebased onto a concrete record with [`BitField::at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub byte_offset: usize,
    pub bit_offset: usize,
    pub bit_count: usize,
}

impl BitField {
    pub const fn new(byte_offset: usize, bit_offset: usize, bit_count: usize) -> Self {
        Self {
            byte_offset,
            bit_offset,
            bit_count,
        }
    }

    /// The same field inside a record starting at `record_offset`.
    pub const fn at(self, record_offset: usize) -> Self {
        Self {
            byte_offset: self.byte_offset + record_offset,
            ..self
        }
    }

    pub fn read(&self, buffer: &[u8]) -> Result<u16> {
        read_bits(buffer, self.byte_offset, self.bit_offset, self.bit_count)
    }

    pub fn write(&self, buffer: &mut [u8], value: u16) -> Result<()> {
        write_bits(buffer, self.byte_offset, self.bit_offset, self.bit_count, value)
    }

    /// Read a sign-magnitude value: this field is the magnitude, `sign` a 1-bit flag.
    pub fn read_signed(&self, sign: BitField, buffer: &[u8]) -> Result<i32> {
        let magnitude = i32::from(self.read(buffer)?);
        Ok(if sign.read(buffer)? != 0 { -magnitude } else { magnitude })
    }

    /// Inverse of [`BitField::read_signed`].
    pub fn write_signed(&self, sign: BitField, buffer: &mut [u8], value: i32) -> Result<()> {
        let magnitude = value.unsigned_abs().min(u32::from(u16::MAX)) as u16;
        self.write(buffer, magnitude)?;
        sign.write(buffer, u16::from(value < 0))
    }
}
