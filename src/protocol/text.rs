//! Text protocol frames
//!
//! ```text
//! <verb> <key> <flags> <exptime> <bytes>[ noreply]\r\n<value>\r\n   store
//! <verb> <key> <delta>[ noreply]\r\n                                incr/decr
//! <verb> <key>[ noreply]\r\n                                        delete
//! ```
//!
//! The key grows up to 250 bytes. Beyond that, store commands grow the value,
//! incr/decr zero-pad the delta and delete pads with spaces, all of which
//! memcached still parses as the same command.

use super::writer::{decimal_digits, FrameWriter};
use super::{Command, EncodeParams, FrameLayout, ReplyMode, FILLER, MAX_KEY_LEN};
use crate::error::CodecError;
use bytes::Bytes;

const CRLF: &[u8] = b"\r\n";
const NOREPLY: &[u8] = b" noreply";

/// Bytes of a frame that do not depend on the size budget. For store
/// commands this excludes the `<bytes>` length field.
fn fixed_len(command: Command, reply_mode: ReplyMode, params: &EncodeParams) -> usize {
    let mut len = command.verb().len() + 1 + CRLF.len();
    if reply_mode == ReplyMode::Silent {
        len += NOREPLY.len();
    }
    if command.is_store() {
        len += 1 + decimal_digits(params.store.flags as u64);
        len += 1 + decimal_digits(params.store.exptime as u64);
        len += 1 + CRLF.len();
    } else if command.is_arithmetic() {
        len += 1;
    }
    len
}

pub(super) fn min_size(command: Command, reply_mode: ReplyMode, params: &EncodeParams) -> usize {
    let fixed = fixed_len(command, reply_mode, params);
    if command.is_store() {
        // one-byte key, one-digit length, one-byte value
        fixed + 3
    } else if command.is_arithmetic() {
        fixed + 1 + decimal_digits(params.arithmetic.delta)
    } else {
        fixed + 1
    }
}

pub(super) fn encode(
    command: Command,
    reply_mode: ReplyMode,
    size: usize,
    params: &EncodeParams,
) -> Result<(Bytes, FrameLayout), CodecError> {
    let fixed = fixed_len(command, reply_mode, params);
    let budget = size.checked_sub(fixed).ok_or(CodecError::BelowMinimum {
        size,
        minimum: min_size(command, reply_mode, params),
    })?;

    let mut w = FrameWriter::new(size);
    w.put_slice(command.verb().as_bytes())?;
    w.put_u8(b' ')?;

    let layout = if command.is_store() {
        let (layout, width) = split_store_budget(budget);
        w.fill(FILLER, layout.key_len)?;
        w.put_u8(b' ')?;
        w.put_decimal(params.store.flags as u64, 1)?;
        w.put_u8(b' ')?;
        w.put_decimal(params.store.exptime as u64, 1)?;
        w.put_u8(b' ')?;
        w.put_decimal(layout.value_len as u64, width)?;
        put_noreply(&mut w, reply_mode)?;
        w.put_slice(CRLF)?;
        w.fill(FILLER, layout.value_len)?;
        w.put_slice(CRLF)?;
        layout
    } else if command.is_arithmetic() {
        let delta = params.arithmetic.delta;
        let key_len = budget
            .saturating_sub(decimal_digits(delta))
            .min(MAX_KEY_LEN);
        let width = budget - key_len;
        w.fill(FILLER, key_len)?;
        w.put_u8(b' ')?;
        w.put_decimal(delta, width)?;
        put_noreply(&mut w, reply_mode)?;
        w.put_slice(CRLF)?;
        FrameLayout {
            key_len,
            value_len: width,
        }
    } else {
        let key_len = budget.min(MAX_KEY_LEN);
        let padding = budget - key_len;
        w.fill(FILLER, key_len)?;
        w.fill(b' ', padding)?;
        put_noreply(&mut w, reply_mode)?;
        w.put_slice(CRLF)?;
        FrameLayout {
            key_len,
            value_len: padding,
        }
    };

    Ok((w.finish()?, layout))
}

/// Split a store command's budget between key, length field and value.
///
/// The length field's digit count depends on the value length, which in turn
/// depends on how many digits the field takes. Widen the field until the value
/// fits; when the value shrinks below the field width the field is
/// zero-padded.
fn split_store_budget(budget: usize) -> (FrameLayout, usize) {
    let mut width = 1;
    loop {
        let remaining = budget - width;
        let key_len = (remaining - 1).min(MAX_KEY_LEN);
        let value_len = remaining - key_len;
        if decimal_digits(value_len as u64) <= width {
            return (FrameLayout { key_len, value_len }, width);
        }
        width += 1;
    }
}

fn put_noreply(w: &mut FrameWriter, reply_mode: ReplyMode) -> Result<(), CodecError> {
    if reply_mode == ReplyMode::Silent {
        w.put_slice(NOREPLY)?;
    }
    Ok(())
}

/// A parsed text request line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextRequest {
    pub command: Command,
    pub noreply: bool,
    /// Total frame length including the value line, if any
    pub frame_len: usize,
}

/// Parse the command line (and skip the value block) of a text request
pub fn parse_request(buf: &[u8]) -> Result<TextRequest, CodecError> {
    let line_end = find_crlf(buf).ok_or(CodecError::Truncated {
        needed: buf.len() + 1,
        actual: buf.len(),
    })?;
    let line = &buf[..line_end];
    let mut tokens = line
        .split(|&b| b == b' ')
        .filter(|token| !token.is_empty());

    let verb = tokens.next().unwrap_or_default();
    let verb = String::from_utf8_lossy(verb);
    let command = Command::from_verb(&verb).ok_or_else(|| CodecError::UnknownVerb(verb.to_string()))?;

    let tokens: Vec<&[u8]> = tokens.collect();
    let noreply = tokens.last().is_some_and(|t| *t == &NOREPLY[1..]);

    let mut frame_len = line_end + CRLF.len();
    if command.is_store() {
        // key flags exptime bytes
        let value_len = tokens
            .get(3)
            .and_then(|t| std::str::from_utf8(t).ok())
            .and_then(|t| t.parse::<usize>().ok())
            .ok_or_else(|| CodecError::Malformed(format!("{verb}: bad length field")))?;
        frame_len += value_len + CRLF.len();
        if buf.len() < frame_len {
            return Err(CodecError::Truncated {
                needed: frame_len,
                actual: buf.len(),
            });
        }
    }

    Ok(TextRequest {
        command,
        noreply,
        frame_len,
    })
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// First line of a text reply with control bytes escaped
pub fn summarize_reply(payload: &[u8]) -> String {
    let line = match find_crlf(payload) {
        Some(end) => &payload[..end],
        None => payload,
    };
    line.escape_ascii().to_string()
}
