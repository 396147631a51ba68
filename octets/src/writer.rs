//! Byte writer over a caller-provided buffer.

use crate::error::{OctetError, OctetResult};

/// Writes big-endian integers and raw bytes into a fixed `&mut [u8]`.
///
/// The writer never grows the buffer; a write that does not fit fails with
/// [`OctetError::BufferTooSmall`] and leaves the position unchanged.
#[derive(Debug)]
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    /// Creates a writer positioned at the start of `buf`.
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the number of bytes written so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns the space left in the buffer.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn reserve(&mut self, needed: usize) -> OctetResult<&mut [u8]> {
        let available = self.remaining();
        if needed > available {
            return Err(OctetError::BufferTooSmall { needed, available });
        }
        let start = self.pos;
        self.pos += needed;
        Ok(&mut self.buf[start..start + needed])
    }

    pub fn write_u8(&mut self, value: u8) -> OctetResult<()> {
        self.reserve(1)?[0] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> OctetResult<()> {
        self.reserve(2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> OctetResult<()> {
        self.reserve(4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Copies `bytes` verbatim.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> OctetResult<()> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Consumes the writer, returning the number of bytes written.
    #[must_use]
    pub fn finish(self) -> usize {
        self.pos
    }
}
