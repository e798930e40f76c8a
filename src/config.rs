//! Benchmark configuration
//!
//! One `BenchConfig` describes a whole run. It can be loaded from a JSON file
//! and then overridden from the command line; `validate` catches every
//! inconsistency that does not depend on the wire encoding before any
//! connection is attempted.

use crate::error::ConfigError;
use crate::protocol::{ArithmeticParams, Command, Encoding, StoreParams};
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a benchmark run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Number of independent connections, one thread each
    pub threads: usize,
    /// Upper bound on requests sent per context
    pub requests_per_thread: u64,
    /// Upper bound on each context's running time
    #[serde(with = "secs")]
    pub run_duration: Duration,
    pub server_addr: String,
    pub server_port: String,
    pub protocol: Encoding,
    /// Exact size of every request frame
    pub request_size: usize,
    /// Ask for and wait on a reply to every request
    pub reply_wait: bool,
    /// Log every received reply
    pub verbose: bool,
    /// Command cycle
    pub commands: Vec<Command>,
    pub store: StoreParams,
    pub arithmetic: ArithmeticParams,
    pub transport: TransportConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            requests_per_thread: 10_000,
            run_duration: Duration::from_secs(1000),
            server_addr: "127.0.0.1".to_string(),
            server_port: "11211".to_string(),
            protocol: Encoding::Text,
            request_size: 100,
            reply_wait: false,
            verbose: false,
            commands: Command::ALL.to_vec(),
            store: StoreParams::default(),
            arithmetic: ArithmeticParams::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl BenchConfig {
    /// Load a configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Check everything that can be checked without building templates
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.request_size == 0 {
            return Err(ConfigError::ZeroRequestSize);
        }
        if self.commands.is_empty() {
            return Err(ConfigError::NoCommands);
        }

        let t = &self.transport;
        if t.recv_slots == 0 {
            return Err(ConfigError::Transport("at least one receive slot is required".into()));
        }
        if t.recv_buffer_size == 0 {
            return Err(ConfigError::Transport("receive buffer size must be non-zero".into()));
        }
        if t.recv_slots > t.max_recv_wr as usize {
            return Err(ConfigError::Transport(format!(
                "{} receive slots exceed the receive queue depth of {}",
                t.recv_slots, t.max_recv_wr
            )));
        }
        if t.recv_slots > t.cq_depth as usize {
            return Err(ConfigError::Transport(format!(
                "{} receive slots exceed the completion queue depth of {}",
                t.recv_slots, t.cq_depth
            )));
        }
        if t.max_send_wr == 0 || t.max_sge == 0 {
            return Err(ConfigError::Transport(
                "send queue depth and SGE count must be non-zero".into(),
            ));
        }
        if t.poll_batch == 0 {
            return Err(ConfigError::Transport("poll batch must be non-zero".into()));
        }
        if t.completion_timeout.is_zero() || t.connect_timeout.is_zero() {
            return Err(ConfigError::Transport(
                "completion and connect timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
