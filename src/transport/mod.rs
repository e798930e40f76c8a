//! RDMA transport abstraction
//!
//! The benchmark talks to the network through two traits: a [`Fabric`]
//! opens reliable connections, and each connection is a [`QueuePair`] with
//! its own memory registrations, send/receive queues and a completion queue
//! per direction. The default backend is an in-process loopback fabric that
//! emulates a cache endpoint; the real rdma-cm/ibverbs backend is compiled
//! in with the `rdma` feature.

pub mod loopback;
#[cfg(feature = "rdma")]
pub mod verbs;

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;

pub use loopback::{FaultPlan, LoopbackFabric, LoopbackOptions};

/// Which fabric implementation to use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process emulation, no hardware needed
    #[default]
    Loopback,
    /// rdma-cm + ibverbs (requires the `rdma` feature)
    Verbs,
}

/// Configuration for the RDMA transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub backend: Backend,
    /// Receive slots posted per connection
    pub recv_slots: usize,
    /// Bytes per receive slot
    pub recv_buffer_size: usize,
    /// Entries per completion queue
    pub cq_depth: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_sge: u32,
    #[serde(with = "millis")]
    pub resolve_timeout: Duration,
    #[serde(with = "millis")]
    pub route_timeout: Duration,
    /// Wait for the connect response once the route is resolved
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Upper bound on any single wait for a completion
    #[serde(with = "millis")]
    pub completion_timeout: Duration,
    /// Completions drained per poll call
    pub poll_batch: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Loopback,
            recv_slots: 128,
            recv_buffer_size: 1024,
            cq_depth: 1024,
            max_send_wr: 8,
            max_recv_wr: 1024,
            max_sge: 8,
            resolve_timeout: Duration::from_millis(100),
            route_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(2),
            completion_timeout: Duration::from_secs(5),
            poll_batch: 16,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// A registered memory region, as seen by the local side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegionHandle {
    pub lkey: u32,
    pub addr: u64,
    pub len: usize,
}

impl MemoryRegionHandle {
    /// Scatter/gather entry covering the first `len` bytes of the region
    pub fn sge(&self, len: usize) -> ScatterGather {
        ScatterGather {
            addr: self.addr,
            len: len.min(self.len) as u32,
            lkey: self.lkey,
        }
    }
}

/// One scatter/gather element of a work request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScatterGather {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

/// Outcome of a work request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkCompletionStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WorkRequestFlushed,
    RetryExceeded,
    Other(u32),
}

impl WorkCompletionStatus {
    /// Map an `ibv_wc_status` value
    pub fn from_raw(status: u32) -> Self {
        match status {
            0 => Self::Success,
            1 => Self::LocalLengthError,
            4 => Self::LocalProtectionError,
            5 => Self::WorkRequestFlushed,
            12 => Self::RetryExceeded,
            other => Self::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkCompletionOpcode {
    Send,
    Receive,
}

/// A completion queue entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WorkCompletionStatus,
    pub opcode: WorkCompletionOpcode,
    /// Bytes received (receive completions only)
    pub byte_len: u32,
}

/// Which of a connection's two completion queues
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionQueueKind {
    Send,
    Recv,
}

impl CompletionQueueKind {
    pub fn opcode(self) -> WorkCompletionOpcode {
        match self {
            CompletionQueueKind::Send => WorkCompletionOpcode::Send,
            CompletionQueueKind::Recv => WorkCompletionOpcode::Receive,
        }
    }
}

/// Batch of completions returned by one poll
pub type CompletionBatch = SmallVec<[WorkCompletion; 16]>;

/// Opens connections
pub trait Fabric: Send + Sync {
    /// Backend name for logs and reports
    fn name(&self) -> &'static str;

    /// Resolve `addr:port`, build the per-connection resources and complete
    /// the connection handshake
    fn connect(
        &self,
        addr: &str,
        port: &str,
        config: &TransportConfig,
    ) -> Result<Box<dyn QueuePair>, TransportError>;
}

/// One established reliable connection
pub trait QueuePair: Send {
    /// Register `len` bytes at `ptr` for local access.
    ///
    /// # Safety
    ///
    /// The memory must stay valid and must not move until the region is
    /// deregistered.
    unsafe fn register_memory(
        &mut self,
        ptr: *mut u8,
        len: usize,
    ) -> Result<MemoryRegionHandle, TransportError>;

    fn deregister_memory(&mut self, handle: MemoryRegionHandle) -> Result<(), TransportError>;

    /// Post a signaled send of one scatter/gather element
    fn post_send(&mut self, wr_id: u64, sge: ScatterGather) -> Result<(), TransportError>;

    fn post_recv(&mut self, wr_id: u64, sge: ScatterGather) -> Result<(), TransportError>;

    /// Non-blocking poll of one completion queue. Appends at most `max`
    /// completions to `out` and returns how many were appended.
    fn poll(
        &mut self,
        kind: CompletionQueueKind,
        max: usize,
        out: &mut CompletionBatch,
    ) -> Result<usize, TransportError>;

    /// Tear the connection down. Outstanding receives complete as flushed.
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Build the fabric selected by `config`
pub fn build_fabric(config: &TransportConfig) -> Result<Arc<dyn Fabric>, TransportError> {
    match config.backend {
        Backend::Loopback => Ok(Arc::new(LoopbackFabric::new(LoopbackOptions::default()))),
        Backend::Verbs => {
            #[cfg(feature = "rdma")]
            {
                Ok(Arc::new(verbs::VerbsFabric::new()))
            }
            #[cfg(not(feature = "rdma"))]
            {
                tracing::error!("Verbs backend requested but binary was not compiled with 'rdma' feature");
                Err(TransportError::Unavailable(
                    "rebuild with '--features rdma' or use the loopback backend".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(WorkCompletionStatus::from_raw(0), WorkCompletionStatus::Success);
        assert_eq!(
            WorkCompletionStatus::from_raw(5),
            WorkCompletionStatus::WorkRequestFlushed
        );
        assert_eq!(WorkCompletionStatus::from_raw(99), WorkCompletionStatus::Other(99));
        assert!(!WorkCompletionStatus::LocalLengthError.is_success());
    }

    #[test]
    fn test_sge_is_clamped_to_region() {
        let handle = MemoryRegionHandle {
            lkey: 3,
            addr: 0x1000,
            len: 64,
        };
        assert_eq!(handle.sge(16).len, 16);
        assert_eq!(handle.sge(128).len, 64);
    }

    #[test]
    fn test_transport_config_json_uses_millis() {
        let config = TransportConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["resolve_timeout"], 100);
        assert_eq!(json["completion_timeout"], 5000);
        assert_eq!(json["connect_timeout"], 2000);
        assert_eq!(json["backend"], "loopback");

        let parsed: TransportConfig =
            serde_json::from_str(r#"{"backend":"verbs","recv_slots":4}"#).unwrap();
        assert_eq!(parsed.backend, Backend::Verbs);
        assert_eq!(parsed.recv_slots, 4);
        assert_eq!(parsed.cq_depth, 1024);
    }

    #[cfg(not(feature = "rdma"))]
    #[test]
    fn test_verbs_backend_unavailable_without_feature() {
        let config = TransportConfig {
            backend: Backend::Verbs,
            ..Default::default()
        };
        let err = build_fabric(&config).err().unwrap();
        assert!(err.is_setup());
    }
}
