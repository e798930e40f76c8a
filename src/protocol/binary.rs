//! Binary protocol frames
//!
//! A request is a 24-byte header followed by the command's extras, the key
//! and, for store and incr/decr commands, a value. Multi-byte header fields
//! are big-endian. Silent mode uses the quiet opcode variants, for which the
//! server only answers on error.

use super::writer::FrameWriter;
use super::{Command, EncodeParams, FrameLayout, ReplyMode, FILLER, MAX_KEY_LEN};
use crate::error::CodecError;
use bytes::{Buf, Bytes};

pub const HEADER_LEN: usize = 24;
pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;
pub const RAW_BYTES: u8 = 0x00;

const STORE_EXTRAS: usize = 8;
const ARITHMETIC_EXTRAS: usize = 20;

pub fn opcode(command: Command, reply_mode: ReplyMode) -> u8 {
    match (command, reply_mode) {
        (Command::Set, ReplyMode::Acknowledged) => 0x01,
        (Command::Add, ReplyMode::Acknowledged) => 0x02,
        (Command::Replace, ReplyMode::Acknowledged) => 0x03,
        (Command::Delete, ReplyMode::Acknowledged) => 0x04,
        (Command::Incr, ReplyMode::Acknowledged) => 0x05,
        (Command::Decr, ReplyMode::Acknowledged) => 0x06,
        (Command::Append, ReplyMode::Acknowledged) => 0x0e,
        (Command::Prepend, ReplyMode::Acknowledged) => 0x0f,
        (Command::Set, ReplyMode::Silent) => 0x11,
        (Command::Add, ReplyMode::Silent) => 0x12,
        (Command::Replace, ReplyMode::Silent) => 0x13,
        (Command::Delete, ReplyMode::Silent) => 0x14,
        (Command::Incr, ReplyMode::Silent) => 0x15,
        (Command::Decr, ReplyMode::Silent) => 0x16,
        (Command::Append, ReplyMode::Silent) => 0x19,
        (Command::Prepend, ReplyMode::Silent) => 0x1a,
    }
}

/// Inverse of [`opcode`]
pub fn command_for_opcode(op: u8) -> Result<(Command, ReplyMode), CodecError> {
    for reply_mode in [ReplyMode::Acknowledged, ReplyMode::Silent] {
        if let Some(command) = Command::ALL
            .into_iter()
            .find(|&c| opcode(c, reply_mode) == op)
        {
            return Ok((command, reply_mode));
        }
    }
    Err(CodecError::UnknownOpcode(op))
}

fn extras_len(command: Command) -> usize {
    match command {
        Command::Add | Command::Set | Command::Replace => STORE_EXTRAS,
        Command::Incr | Command::Decr => ARITHMETIC_EXTRAS,
        Command::Append | Command::Prepend | Command::Delete => 0,
    }
}

fn carries_value(command: Command) -> bool {
    command != Command::Delete
}

pub(super) fn min_size(command: Command) -> usize {
    let value = if carries_value(command) { 1 } else { 0 };
    HEADER_LEN + extras_len(command) + 1 + value
}

pub(super) fn encode(
    command: Command,
    reply_mode: ReplyMode,
    size: usize,
    params: &EncodeParams,
) -> Result<(Bytes, FrameLayout), CodecError> {
    let extras = extras_len(command);
    let budget = size
        .checked_sub(HEADER_LEN + extras)
        .ok_or(CodecError::BelowMinimum {
            size,
            minimum: min_size(command),
        })?;

    let key_len = if carries_value(command) {
        budget.saturating_sub(1).min(MAX_KEY_LEN)
    } else {
        budget.min(MAX_KEY_LEN)
    };
    let value_len = budget - key_len;
    let body_len = u32::try_from(budget + extras).map_err(|_| CodecError::Overrun {
        needed: size,
        remaining: u32::MAX as usize,
    })?;

    let header = RequestHeader {
        magic: REQUEST_MAGIC,
        opcode: opcode(command, reply_mode),
        key_len: key_len as u16,
        extras_len: extras as u8,
        data_type: RAW_BYTES,
        reserved: 0,
        body_len,
        opaque: params.opaque,
        cas: 0,
    };

    let mut w = FrameWriter::new(size);
    header.write(&mut w)?;
    match extras {
        STORE_EXTRAS => {
            w.put_u32(params.store.flags)?;
            w.put_u32(params.store.exptime)?;
        }
        ARITHMETIC_EXTRAS => {
            w.put_u64(params.arithmetic.delta)?;
            w.put_u64(params.arithmetic.initial)?;
            w.put_u32(params.arithmetic.exptime)?;
        }
        _ => {}
    }
    w.fill(FILLER, key_len)?;
    w.fill(FILLER, value_len)?;

    Ok((w.finish()?, FrameLayout { key_len, value_len }))
}

/// Request header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub reserved: u16,
    /// extras + key + value
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                actual: buf.len(),
            });
        }
        let mut b = &buf[..HEADER_LEN];
        let magic = b.get_u8();
        if magic != REQUEST_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        Ok(Self {
            magic,
            opcode: b.get_u8(),
            key_len: b.get_u16(),
            extras_len: b.get_u8(),
            data_type: b.get_u8(),
            reserved: b.get_u16(),
            body_len: b.get_u32(),
            opaque: b.get_u32(),
            cas: b.get_u64(),
        })
    }

    pub fn write(&self, w: &mut FrameWriter) -> Result<(), CodecError> {
        w.put_u8(self.magic)?;
        w.put_u8(self.opcode)?;
        w.put_u16(self.key_len)?;
        w.put_u8(self.extras_len)?;
        w.put_u8(self.data_type)?;
        w.put_u16(self.reserved)?;
        w.put_u32(self.body_len)?;
        w.put_u32(self.opaque)?;
        w.put_u64(self.cas)
    }

    pub fn value_len(&self) -> usize {
        (self.body_len as usize).saturating_sub(self.extras_len as usize + self.key_len as usize)
    }

    /// Header plus body
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }
}

/// Response header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                actual: buf.len(),
            });
        }
        let mut b = &buf[..HEADER_LEN];
        let magic = b.get_u8();
        if magic != RESPONSE_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        Ok(Self {
            opcode: b.get_u8(),
            key_len: b.get_u16(),
            extras_len: b.get_u8(),
            data_type: b.get_u8(),
            status: b.get_u16(),
            body_len: b.get_u32(),
            opaque: b.get_u32(),
            cas: b.get_u64(),
        })
    }

    pub fn write(&self, w: &mut FrameWriter) -> Result<(), CodecError> {
        w.put_u8(RESPONSE_MAGIC)?;
        w.put_u8(self.opcode)?;
        w.put_u16(self.key_len)?;
        w.put_u8(self.extras_len)?;
        w.put_u8(self.data_type)?;
        w.put_u16(self.status)?;
        w.put_u32(self.body_len)?;
        w.put_u32(self.opaque)?;
        w.put_u64(self.cas)
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        0x0000 => "no error",
        0x0001 => "key not found",
        0x0002 => "key exists",
        0x0003 => "value too large",
        0x0004 => "invalid arguments",
        0x0005 => "item not stored",
        0x0006 => "non-numeric value",
        0x0081 => "unknown command",
        0x0082 => "out of memory",
        _ => "unknown status",
    }
}

/// One-line description of a binary reply
pub fn summarize_reply(payload: &[u8]) -> String {
    match ResponseHeader::parse(payload) {
        Ok(h) => format!(
            "opcode={:#04x} status={:#06x} ({}) opaque={} body={}",
            h.opcode,
            h.status,
            status_text(h.status),
            h.opaque,
            h.body_len
        ),
        Err(e) => format!("unparseable reply ({e}): {}", payload.escape_ascii()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(command: Command, reply_mode: ReplyMode, size: usize) -> (Bytes, FrameLayout) {
        let params = EncodeParams {
            opaque: 7,
            ..Default::default()
        };
        encode(command, reply_mode, size, &params).unwrap()
    }

    #[test]
    fn test_header_fields_round_trip() {
        for command in Command::ALL {
            for reply_mode in [ReplyMode::Silent, ReplyMode::Acknowledged] {
                for size in [min_size(command), 100, 300, 4096] {
                    let (bytes, layout) = frame(command, reply_mode, size);
                    let header = RequestHeader::parse(&bytes).unwrap();
                    assert_eq!(command_for_opcode(header.opcode).unwrap(), (command, reply_mode));
                    assert_eq!(header.key_len as usize, layout.key_len);
                    assert_eq!(header.extras_len as usize, extras_len(command));
                    assert_eq!(header.value_len(), layout.value_len);
                    assert_eq!(header.frame_len(), size);
                    assert_eq!(header.opaque, 7);
                    assert_eq!(header.cas, 0);
                }
            }
        }
    }

    #[test]
    fn test_header_is_network_byte_order() {
        let (bytes, _) = frame(Command::Set, ReplyMode::Acknowledged, 300);
        // 300 - 24 header - 8 extras = 268: key 250, value 18
        assert_eq!(&bytes[0..4], &[0x80, 0x01, 0x00, 250]);
        assert_eq!(bytes[4], 8);
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x01, 0x14]);
        assert_eq!(&bytes[12..16], &[0x00, 0x00, 0x00, 0x07]);
    }

    #[test]
    fn test_minimum_sizes() {
        assert_eq!(min_size(Command::Set), 34);
        assert_eq!(min_size(Command::Append), 26);
        assert_eq!(min_size(Command::Delete), 25);
        assert_eq!(min_size(Command::Incr), 46);
    }

    #[test]
    fn test_arithmetic_extras_layout() {
        let params = EncodeParams {
            arithmetic: super::super::ArithmeticParams {
                delta: 5,
                initial: 9,
                exptime: 60,
            },
            ..Default::default()
        };
        let (bytes, layout) = encode(Command::Incr, ReplyMode::Acknowledged, 46, &params).unwrap();
        let mut extras = &bytes[HEADER_LEN..HEADER_LEN + ARITHMETIC_EXTRAS];
        assert_eq!(extras.get_u64(), 5);
        assert_eq!(extras.get_u64(), 9);
        assert_eq!(extras.get_u32(), 60);
        assert_eq!(layout, FrameLayout { key_len: 1, value_len: 1 });
    }

    #[test]
    fn test_delete_key_takes_whole_budget() {
        let (_, layout) = frame(Command::Delete, ReplyMode::Silent, 100);
        assert_eq!(layout, FrameLayout { key_len: 76, value_len: 0 });
        let (_, layout) = frame(Command::Delete, ReplyMode::Silent, 300);
        assert_eq!(layout, FrameLayout { key_len: 250, value_len: 26 });
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            RequestHeader::parse(&[0x80; 10]),
            Err(CodecError::Truncated { needed: 24, actual: 10 })
        );
        assert_eq!(RequestHeader::parse(&[0x81; 24]), Err(CodecError::BadMagic(0x81)));
        assert_eq!(command_for_opcode(0x0a), Err(CodecError::UnknownOpcode(0x0a)));
    }

    #[test]
    fn test_response_summary() {
        let header = ResponseHeader {
            opcode: 0x01,
            key_len: 0,
            extras_len: 0,
            data_type: RAW_BYTES,
            status: 0x0005,
            body_len: 0,
            opaque: 3,
            cas: 0,
        };
        let mut w = FrameWriter::new(HEADER_LEN);
        header.write(&mut w).unwrap();
        let bytes = w.finish().unwrap();
        assert_eq!(ResponseHeader::parse(&bytes).unwrap(), header);
        assert_eq!(
            summarize_reply(&bytes),
            "opcode=0x01 status=0x0005 (item not stored) opaque=3 body=0"
        );
    }
}
