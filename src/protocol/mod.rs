//! Memcached request messages
//!
//! Builds fixed-size request frames for the eight mutation commands in both
//! the text and the binary memcached protocol. Every frame for a given
//! request size has exactly that size: the key (and the value, delta or
//! padding field, depending on the command) is stretched or shrunk to fill
//! the budget, so a single receive/send buffer size fits every command.

pub mod binary;
pub mod text;
pub mod writer;

use crate::config::BenchConfig;
use crate::error::{BenchError, CodecError, ConfigError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest key memcached accepts
pub const MAX_KEY_LEN: usize = 250;

/// Byte used for synthesized keys and values
pub const FILLER: u8 = b'1';

/// Largest request frame we are willing to build (memcached's default item ceiling)
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Longest text command line memcached reads before closing the connection.
/// Text incr/decr/delete frames are a single line.
pub const MAX_TEXT_LINE: usize = 2048;

/// The mutation commands exercised by the benchmark
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Add,
    Set,
    Replace,
    Append,
    Prepend,
    Incr,
    Decr,
    Delete,
}

impl Command {
    /// Canonical command cycle
    pub const ALL: [Command; 8] = [
        Command::Add,
        Command::Set,
        Command::Replace,
        Command::Append,
        Command::Prepend,
        Command::Incr,
        Command::Decr,
        Command::Delete,
    ];

    pub fn verb(self) -> &'static str {
        match self {
            Command::Add => "add",
            Command::Set => "set",
            Command::Replace => "replace",
            Command::Append => "append",
            Command::Prepend => "prepend",
            Command::Incr => "incr",
            Command::Decr => "decr",
            Command::Delete => "delete",
        }
    }

    pub fn from_verb(verb: &str) -> Option<Command> {
        Command::ALL.into_iter().find(|c| c.verb() == verb)
    }

    /// add/set/replace/append/prepend
    pub fn is_store(self) -> bool {
        matches!(
            self,
            Command::Add | Command::Set | Command::Replace | Command::Append | Command::Prepend
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(self, Command::Incr | Command::Decr)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Wire encoding
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Text,
    Binary,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Text => f.write_str("text"),
            Encoding::Binary => f.write_str("binary"),
        }
    }
}

/// Whether the server is asked to answer a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// `noreply` in text, quiet opcodes in binary
    Silent,
    Acknowledged,
}

impl ReplyMode {
    pub fn from_reply_wait(reply_wait: bool) -> Self {
        if reply_wait {
            ReplyMode::Acknowledged
        } else {
            ReplyMode::Silent
        }
    }
}

/// Flags and expiration carried by store commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreParams {
    pub flags: u32,
    pub exptime: u32,
}

/// Delta, initial value and expiration carried by incr/decr
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArithmeticParams {
    pub delta: u64,
    /// Binary protocol only
    pub initial: u64,
    /// Binary protocol only
    pub exptime: u32,
}

impl Default for ArithmeticParams {
    fn default() -> Self {
        Self {
            delta: 1,
            initial: 0,
            exptime: 0,
        }
    }
}

/// Per-command fields that are not derived from the size budget
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeParams {
    pub store: StoreParams,
    pub arithmetic: ArithmeticParams,
    /// Binary header opaque
    pub opaque: u32,
}

/// How a frame's variable budget was split
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub key_len: usize,
    /// Bytes in the field that takes whatever the key could not: the value
    /// payload, or for text incr/decr the delta field, or for text delete the
    /// padding run
    pub value_len: usize,
}

/// One immutable pre-built request frame
#[derive(Clone, Debug)]
pub struct MessageTemplate {
    command: Command,
    encoding: Encoding,
    reply_mode: ReplyMode,
    layout: FrameLayout,
    bytes: Bytes,
}

impl MessageTemplate {
    pub fn command(&self) -> Command {
        self.command
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn reply_mode(&self) -> ReplyMode {
        self.reply_mode
    }

    pub fn expects_reply(&self) -> bool {
        self.reply_mode == ReplyMode::Acknowledged
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Smallest frame that can carry `command` with a one-byte key (and a
/// one-byte value where the command has one)
pub fn min_request_size(
    command: Command,
    encoding: Encoding,
    reply_mode: ReplyMode,
    params: &EncodeParams,
) -> usize {
    match encoding {
        Encoding::Text => text::min_size(command, reply_mode, params),
        Encoding::Binary => binary::min_size(command),
    }
}

/// Build a frame of exactly `size` bytes
pub fn encode(
    command: Command,
    encoding: Encoding,
    reply_mode: ReplyMode,
    size: usize,
    params: &EncodeParams,
) -> Result<MessageTemplate, CodecError> {
    let minimum = min_request_size(command, encoding, reply_mode, params);
    if size < minimum {
        return Err(CodecError::BelowMinimum { size, minimum });
    }

    let (bytes, layout) = match encoding {
        Encoding::Text => text::encode(command, reply_mode, size, params)?,
        Encoding::Binary => binary::encode(command, reply_mode, size, params)?,
    };
    debug_assert_eq!(bytes.len(), size);

    Ok(MessageTemplate {
        command,
        encoding,
        reply_mode,
        layout,
        bytes,
    })
}

/// The command cycle for a run, built once and shared read-only by every context
#[derive(Debug)]
pub struct TemplateTable {
    templates: Vec<MessageTemplate>,
    request_size: usize,
    encoding: Encoding,
    reply_mode: ReplyMode,
}

impl TemplateTable {
    /// Build the templates for `config`, rejecting request sizes that cannot
    /// hold every command in the sequence
    pub fn build(config: &BenchConfig) -> Result<Self, BenchError> {
        let size = config.request_size;
        let encoding = config.protocol;
        let reply_mode = ReplyMode::from_reply_wait(config.reply_wait);

        if config.commands.is_empty() {
            return Err(ConfigError::NoCommands.into());
        }
        if size > MAX_REQUEST_SIZE {
            return Err(ConfigError::RequestTooLarge {
                size,
                maximum: MAX_REQUEST_SIZE,
            }
            .into());
        }

        let mut templates = Vec::with_capacity(config.commands.len());
        for (index, &command) in config.commands.iter().enumerate() {
            let params = EncodeParams {
                store: config.store,
                arithmetic: config.arithmetic,
                opaque: index as u32,
            };

            let minimum = min_request_size(command, encoding, reply_mode, &params);
            if size < minimum {
                return Err(ConfigError::RequestTooSmall {
                    command,
                    encoding,
                    size,
                    minimum,
                }
                .into());
            }

            if encoding == Encoding::Text && !command.is_store() && size > MAX_TEXT_LINE {
                return Err(ConfigError::CommandLineTooLong {
                    command,
                    size,
                    maximum: MAX_TEXT_LINE,
                }
                .into());
            }

            templates.push(encode(command, encoding, reply_mode, size, &params)?);
        }

        tracing::debug!(
            "Built {} {} templates of {} bytes ({:?})",
            templates.len(),
            encoding,
            size,
            reply_mode
        );

        Ok(Self {
            templates,
            request_size: size,
            encoding,
            reply_mode,
        })
    }

    /// Template for the given iteration, cycling through the sequence
    pub fn for_iteration(&self, iteration: u64) -> &MessageTemplate {
        let index = (iteration % self.templates.len() as u64) as usize;
        &self.templates[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageTemplate> {
        self.templates.iter()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn request_size(&self) -> usize {
        self.request_size
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn reply_mode(&self) -> ReplyMode {
        self.reply_mode
    }
}

/// Human-readable one-line summary of a reply, for verbose logging
pub fn summarize_reply(encoding: Encoding, payload: &[u8]) -> String {
    match encoding {
        Encoding::Text => text::summarize_reply(payload),
        Encoding::Binary => binary::summarize_reply(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize, encoding: Encoding, reply_wait: bool) -> BenchConfig {
        BenchConfig {
            request_size: size,
            protocol: encoding,
            reply_wait,
            ..Default::default()
        }
    }

    #[test]
    fn test_every_frame_has_the_configured_size() {
        let params = EncodeParams::default();
        for encoding in [Encoding::Text, Encoding::Binary] {
            for reply_mode in [ReplyMode::Silent, ReplyMode::Acknowledged] {
                for command in Command::ALL {
                    let minimum = min_request_size(command, encoding, reply_mode, &params);
                    for size in (minimum..minimum + 300).chain([1024, 4096, 65536]) {
                        let t = encode(command, encoding, reply_mode, size, &params)
                            .unwrap_or_else(|e| {
                                panic!("{command} {encoding} {reply_mode:?} {size}: {e}")
                            });
                        assert_eq!(t.len(), size, "{command} {encoding} {reply_mode:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_below_minimum_is_rejected() {
        let params = EncodeParams::default();
        for encoding in [Encoding::Text, Encoding::Binary] {
            for command in Command::ALL {
                let minimum = min_request_size(command, encoding, ReplyMode::Silent, &params);
                assert_eq!(
                    encode(command, encoding, ReplyMode::Silent, minimum - 1, &params).unwrap_err(),
                    CodecError::BelowMinimum {
                        size: minimum - 1,
                        minimum
                    }
                );
            }
        }
    }

    #[test]
    fn test_key_caps_at_250_and_value_absorbs_the_rest() {
        let params = EncodeParams::default();
        for encoding in [Encoding::Text, Encoding::Binary] {
            for command in [Command::Set, Command::Append] {
                let minimum = min_request_size(command, encoding, ReplyMode::Acknowledged, &params);
                // Small excess goes entirely into the key
                let small = encode(command, encoding, ReplyMode::Acknowledged, minimum + 100, &params)
                    .unwrap();
                assert_eq!(small.layout().key_len, 101);
                assert_eq!(small.layout().value_len, 1);

                // Excess past the key ceiling spills into the value
                let big = encode(command, encoding, ReplyMode::Acknowledged, minimum + 249, &params)
                    .unwrap();
                assert_eq!(big.layout().key_len, MAX_KEY_LEN);
                assert_eq!(big.layout().value_len, 1);

                let bigger = encode(command, encoding, ReplyMode::Acknowledged, minimum + 251, &params)
                    .unwrap();
                assert_eq!(bigger.layout().key_len, MAX_KEY_LEN);
                assert_eq!(bigger.layout().value_len, 3);
            }
        }
    }

    #[test]
    fn test_table_cycles_through_commands() {
        let table = TemplateTable::build(&config(100, Encoding::Text, false)).unwrap();
        assert_eq!(table.len(), 8);
        assert_eq!(table.for_iteration(0).command(), Command::Add);
        assert_eq!(table.for_iteration(7).command(), Command::Delete);
        assert_eq!(table.for_iteration(8).command(), Command::Add);
        assert_eq!(table.for_iteration(13).command(), Command::Incr);
        assert!(table.iter().all(|t| t.len() == 100));
        assert!(table.iter().all(|t| !t.expects_reply()));
    }

    #[test]
    fn test_table_rejects_size_too_small_for_any_command() {
        // Binary incr/decr need 46 bytes even though delete fits in 25
        let err = TemplateTable::build(&config(40, Encoding::Binary, true)).unwrap_err();
        match err {
            BenchError::Config(ConfigError::RequestTooSmall {
                command, minimum, ..
            }) => {
                assert_eq!(command, Command::Incr);
                assert_eq!(minimum, 46);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_binary_delete_at_header_size_is_rejected() {
        let mut cfg = config(24, Encoding::Binary, false);
        cfg.commands = vec![Command::Delete];
        let err = TemplateTable::build(&cfg).unwrap_err();
        assert!(matches!(
            err,
            BenchError::Config(ConfigError::RequestTooSmall { minimum: 25, .. })
        ));

        cfg.request_size = 25;
        let table = TemplateTable::build(&cfg).unwrap();
        assert_eq!(table.for_iteration(0).layout().key_len, 1);
    }

    #[test]
    fn test_table_rejects_oversized_requests() {
        let err = TemplateTable::build(&config(MAX_REQUEST_SIZE + 1, Encoding::Text, false))
            .unwrap_err();
        assert!(matches!(
            err,
            BenchError::Config(ConfigError::RequestTooLarge { .. })
        ));
    }

    #[test]
    fn test_long_text_command_lines_are_rejected() {
        let err = TemplateTable::build(&config(4096, Encoding::Text, false)).unwrap_err();
        match err {
            BenchError::Config(ConfigError::CommandLineTooLong {
                command, maximum, ..
            }) => {
                assert_eq!(command, Command::Incr);
                assert_eq!(maximum, MAX_TEXT_LINE);
            }
            other => panic!("unexpected error: {other}"),
        }

        // store commands put the excess in the value, binary has no line
        let mut cfg = config(4096, Encoding::Text, true);
        cfg.commands = vec![Command::Set, Command::Append];
        assert_eq!(TemplateTable::build(&cfg).unwrap().len(), 2);
        assert_eq!(
            TemplateTable::build(&config(4096, Encoding::Binary, false))
                .unwrap()
                .len(),
            8
        );
        assert_eq!(
            TemplateTable::build(&config(MAX_TEXT_LINE, Encoding::Text, false))
                .unwrap()
                .len(),
            8
        );
    }

    #[test]
    fn test_command_verbs_round_trip() {
        for command in Command::ALL {
            assert_eq!(Command::from_verb(command.verb()), Some(command));
        }
        assert_eq!(Command::from_verb("get"), None);
    }
}
