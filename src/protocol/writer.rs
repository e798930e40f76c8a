//! Fixed-capacity frame writer
//!
//! Every request frame has an exact size known up front. `FrameWriter` tracks
//! how much of that budget is left and refuses writes that would overrun it,
//! so a layout mistake shows up as a `CodecError` instead of a short or
//! oversized frame.

use crate::error::CodecError;
use bytes::{BufMut, Bytes, BytesMut};

pub struct FrameWriter {
    buf: BytesMut,
    limit: usize,
}

impl FrameWriter {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit),
            limit,
        }
    }

    /// Bytes still available before the frame is full
    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    pub fn written(&self) -> usize {
        self.buf.len()
    }

    fn reserve(&self, needed: usize) -> Result<(), CodecError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(CodecError::Overrun { needed, remaining });
        }
        Ok(())
    }

    pub fn put_slice(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.reserve(data.len())?;
        self.buf.put_slice(data);
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.reserve(1)?;
        self.buf.put_u8(value);
        Ok(())
    }

    /// Big-endian (network order)
    pub fn put_u16(&mut self, value: u16) -> Result<(), CodecError> {
        self.reserve(2)?;
        self.buf.put_u16(value);
        Ok(())
    }

    /// Big-endian (network order)
    pub fn put_u32(&mut self, value: u32) -> Result<(), CodecError> {
        self.reserve(4)?;
        self.buf.put_u32(value);
        Ok(())
    }

    /// Big-endian (network order)
    pub fn put_u64(&mut self, value: u64) -> Result<(), CodecError> {
        self.reserve(8)?;
        self.buf.put_u64(value);
        Ok(())
    }

    /// Repeat `byte` `count` times
    pub fn fill(&mut self, byte: u8, count: usize) -> Result<(), CodecError> {
        self.reserve(count)?;
        self.buf.put_bytes(byte, count);
        Ok(())
    }

    /// Write `value` in decimal, left-padded with zeros to at least `width` digits
    pub fn put_decimal(&mut self, value: u64, width: usize) -> Result<(), CodecError> {
        let digits = decimal_digits(value);
        let padding = width.saturating_sub(digits);
        self.reserve(padding + digits)?;
        self.buf.put_bytes(b'0', padding);
        self.buf.put_slice(value.to_string().as_bytes());
        Ok(())
    }

    /// Finish the frame, which must be exactly full
    pub fn finish(self) -> Result<Bytes, CodecError> {
        let remaining = self.remaining();
        if remaining != 0 {
            return Err(CodecError::Underfilled { remaining });
        }
        Ok(self.buf.freeze())
    }
}

/// Number of decimal digits needed to print `value`
pub fn decimal_digits(value: u64) -> usize {
    let mut digits = 1;
    let mut rest = value / 10;
    while rest > 0 {
        digits += 1;
        rest /= 10;
    }
    digits
}
