//! Bounds-checked little-endian reads over a borrowed byte buffer.

use byteorder::{ByteOrder, LittleEndian};

use crate::{UsnResult, errors::UsnError};

/// A read-only view over a byte buffer.
///
/// All reads take an absolute offset into the buffer and fail with
/// [`UsnError::OutOfBounds`] instead of reading past its end. The cursor is
/// only a convenience for callers that walk the buffer sequentially.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        ByteReader {
            buffer,
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor. Positions past the end are allowed; reads from there fail.
    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn advance(&mut self, count: usize) {
        self.position = self.position.saturating_add(count);
    }

    /// Bytes left between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Returns `length` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: usize, length: usize) -> UsnResult<&'a [u8]> {
        let end = offset.checked_add(length).ok_or(UsnError::OutOfBounds {
            offset,
            size: length,
            len: self.buffer.len(),
        })?;

        self.buffer.get(offset..end).ok_or(UsnError::OutOfBounds {
            offset,
            size: length,
            len: self.buffer.len(),
        })
    }

    pub fn read_u8(&self, offset: usize) -> UsnResult<u8> {
        Ok(self.read_bytes(offset, 1)?[0])
    }

    pub fn read_u16(&self, offset: usize) -> UsnResult<u16> {
        self.read_bytes(offset, 2).map(LittleEndian::read_u16)
    }

    pub fn read_u32(&self, offset: usize) -> UsnResult<u32> {
        self.read_bytes(offset, 4).map(LittleEndian::read_u32)
    }

    pub fn read_u64(&self, offset: usize) -> UsnResult<u64> {
        self.read_bytes(offset, 8).map(LittleEndian::read_u64)
    }

    pub fn read_i64(&self, offset: usize) -> UsnResult<i64> {
        self.read_bytes(offset, 8).map(LittleEndian::read_i64)
    }

    /// Reads a 128-bit value, the width of version 3 file identifiers.
    pub fn read_u128(&self, offset: usize) -> UsnResult<u128> {
        self.read_bytes(offset, 16).map(LittleEndian::read_u128)
    }
}
