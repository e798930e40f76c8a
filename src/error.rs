//! Error types for the benchmark client
//!
//! Errors are split along the lines the driver needs to act on: configuration
//! errors stop the whole run before any connection exists, transport errors
//! are contained to the context that hit them, and codec errors only surface
//! while templates are being built.

use crate::protocol::{Command, Encoding};
use crate::transport::WorkCompletionStatus;
use std::time::Duration;
use thiserror::Error;

/// Invalid or incompatible benchmark configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("thread count must be at least 1")]
    NoThreads,

    #[error("request size must be greater than zero")]
    ZeroRequestSize,

    #[error(
        "request size {size} is below the minimum of {minimum} bytes for `{command}` in {encoding} mode"
    )]
    RequestTooSmall {
        command: Command,
        encoding: Encoding,
        size: usize,
        minimum: usize,
    },

    #[error("request size {size} exceeds the maximum of {maximum} bytes")]
    RequestTooLarge { size: usize, maximum: usize },

    #[error("`{command}` text request of {size} bytes exceeds the {maximum}-byte command line limit")]
    CommandLineTooLong {
        command: Command,
        size: usize,
        maximum: usize,
    },

    #[error("command sequence is empty")]
    NoCommands,

    #[error("invalid transport setting: {0}")]
    Transport(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures while building or parsing wire messages
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("write of {needed} bytes overruns frame ({remaining} bytes left)")]
    Overrun { needed: usize, remaining: usize },

    #[error("request size {size} is below the {minimum}-byte minimum for this command")]
    BelowMinimum { size: usize, minimum: usize },

    #[error("frame finished with {remaining} unused bytes")]
    Underfilled { remaining: usize },

    #[error("message too short: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("unknown command verb {0:?}")]
    UnknownVerb(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Stage of connection establishment that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupStage {
    Resolve,
    Route,
    Handshake,
    Registration,
    PostReceive,
}

impl std::fmt::Display for SetupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupStage::Resolve => write!(f, "address resolution"),
            SetupStage::Route => write!(f, "route resolution"),
            SetupStage::Handshake => write!(f, "connection handshake"),
            SetupStage::Registration => write!(f, "memory registration"),
            SetupStage::PostReceive => write!(f, "receive posting"),
        }
    }
}

/// Transport failures, both while opening a connection and while running
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{stage} failed: {reason}")]
    Setup { stage: SetupStage, reason: String },

    #[error("failed to register {len} bytes: {reason}")]
    Registration { len: usize, reason: String },

    #[error("unknown memory region (lkey {0:#x})")]
    UnknownRegion(u32),

    #[error("failed to post work request {wr_id}: {reason}")]
    Post { wr_id: u64, reason: String },

    #[error("work request {wr_id} completed with status {status:?}")]
    Completion {
        wr_id: u64,
        status: WorkCompletionStatus,
    },

    #[error("no completion within {0:?}")]
    CompletionTimeout(Duration),

    #[error("completion for unknown work request {0}")]
    UnknownWorkRequest(u64),

    #[error("work request {wr_id} completed on the wrong queue")]
    ContextMismatch { wr_id: u64 },

    #[error("connection is not established")]
    NotConnected,

    #[error("transport backend unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub(crate) fn setup(stage: SetupStage, reason: impl Into<String>) -> Self {
        TransportError::Setup {
            stage,
            reason: reason.into(),
        }
    }

    /// Whether this error happened while the connection was being opened
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            TransportError::Setup { .. }
                | TransportError::Registration { .. }
                | TransportError::Unavailable(_)
        )
    }
}

/// Errors returned while preparing a benchmark run
#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
