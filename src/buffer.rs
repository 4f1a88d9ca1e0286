//! Byte buffers for the wire codecs.
//!
//! `WriteBuffer` grows on demand and hands out stable offsets, so a caller
//! can reserve a span up front and patch it once the real value is known.
//! `ReadBuffer` is a bounds-checked cursor over a borrowed slice; every
//! failed read reports the offset it failed at.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Growable output buffer with a logical write offset.
///
/// Offsets returned by [`alloc`](WriteBuffer::alloc) stay valid across later
/// growth; the backing storage may move but indices do not.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    bytes: Vec<u8>,
    offset: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        WriteBuffer {
            bytes: Vec::with_capacity(capacity),
            offset: 0,
        }
    }

    /// Current logical length in bytes.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reserves `n` zeroed bytes and returns the offset of the span.
    ///
    /// Growth is geometric, so repeated small allocations stay amortized
    /// constant.
    pub fn alloc(&mut self, n: usize) -> usize {
        let start = self.offset;
        let needed = start + n;
        if needed > self.bytes.len() {
            let grown = (self.bytes.len() * 2).max(needed);
            self.bytes.resize(grown, 0);
        }
        self.offset = needed;
        start
    }

    pub fn push(&mut self, byte: u8) {
        let at = self.alloc(1);
        self.bytes[at] = byte;
    }

    pub fn write(&mut self, src: &[u8]) {
        let at = self.alloc(src.len());
        self.bytes[at..at + src.len()].copy_from_slice(src);
    }

    pub fn write_i32_be(&mut self, value: i32) {
        let at = self.alloc(4);
        BigEndian::write_i32(&mut self.bytes[at..at + 4], value);
    }

    pub fn write_i64_be(&mut self, value: i64) {
        let at = self.alloc(8);
        BigEndian::write_i64(&mut self.bytes[at..at + 8], value);
    }

    pub fn write_f32_be(&mut self, value: f32) {
        self.write_i32_be(value.to_bits() as i32);
    }

    pub fn write_f64_be(&mut self, value: f64) {
        self.write_i64_be(value.to_bits() as i64);
    }

    /// Overwrites one previously allocated byte.
    pub fn patch_u8(&mut self, at: usize, value: u8) {
        self.bytes[at] = value;
    }

    /// Back-patches a big-endian `i32` into a previously allocated span.
    pub fn patch_i32_be(&mut self, at: usize, value: i32) {
        BigEndian::write_i32(&mut self.bytes[at..at + 4], value);
    }

    /// Appends the written portion of another buffer.
    pub fn append(&mut self, other: &WriteBuffer) {
        self.write(other.as_slice());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.offset]
    }

    /// Consumes the buffer, returning exactly the written bytes.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.bytes.truncate(self.offset);
        self.bytes
    }
}

/// Bounds-checked read cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct ReadBuffer<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ReadBuffer<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ReadBuffer { bytes, offset: 0 }
    }

    pub fn with_offset(bytes: &'a [u8], offset: usize) -> Self {
        ReadBuffer { bytes, offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }

    /// Moves the cursor to an absolute position. Positions up to one past
    /// the end are valid (nothing further may be read there).
    pub fn seek(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n)?;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::UnexpectedEof {
                offset: self.offset,
                needed: n - self.remaining(),
            });
        }
        let span = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(span)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_i32_be(&mut self) -> Result<i32> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub fn read_i64_be(&mut self) -> Result<i64> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    pub fn read_f32_be(&mut self) -> Result<f32> {
        Ok(f32::from_bits(BigEndian::read_i32(self.take(4)?) as u32))
    }

    pub fn read_f64_be(&mut self) -> Result<f64> {
        Ok(f64::from_bits(BigEndian::read_i64(self.take(8)?) as u64))
    }

    /// Borrows `len` bytes at an absolute position without moving the cursor.
    pub fn slice_at(&self, at: usize, len: usize) -> Result<&'a [u8]> {
        if at + len > self.bytes.len() {
            return Err(Error::UnexpectedEof {
                offset: at,
                needed: at + len - self.bytes.len(),
            });
        }
        Ok(&self.bytes[at..at + len])
    }
}
