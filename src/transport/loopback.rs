//! In-process loopback fabric
//!
//! Emulates the verbs model closely enough to drive the benchmark without
//! hardware: memory must be registered before it can appear in a work
//! request, sends and receives complete on separate completion queues, and
//! a minimal cache endpoint on the far side answers every request that asks
//! for a reply, plus binary requests it rejects even when they are quiet. A
//! reply that arrives while no receive is posted breaks the connection the
//! way receiver-not-ready retries do on a real fabric. Registrations live in
//! one table shared by every connection so tests can check that nothing is
//! left registered after a run.
//!
//! Faults can be injected to exercise the error paths: refused connections,
//! failed registrations, and send or receive completions with an error
//! status.

use super::{
    CompletionBatch, CompletionQueueKind, Fabric, MemoryRegionHandle, QueuePair, ScatterGather,
    TransportConfig, WorkCompletion, WorkCompletionOpcode, WorkCompletionStatus,
};
use crate::error::{CodecError, SetupStage, TransportError};
use crate::protocol::binary::{self, RequestHeader, ResponseHeader, HEADER_LEN, RAW_BYTES};
use crate::protocol::text;
use crate::protocol::writer::FrameWriter;
use crate::protocol::{Command, ReplyMode};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Faults to inject. Counts are per connection except `refuse_after`,
/// which counts connection attempts across the whole fabric.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Accept this many connections, refuse the rest
    pub refuse_after: Option<u64>,
    /// Allow this many registrations per connection, fail the rest
    pub fail_registration_after: Option<u64>,
    /// Complete this many sends successfully, fail the rest
    pub fail_send_after: Option<u64>,
    /// Deliver this many messages successfully, fail the rest
    pub fail_recv_after: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoopbackOptions {
    /// Message the endpoint sends as soon as a connection is established
    pub greeting: Option<Vec<u8>>,
    pub faults: FaultPlan,
}

#[derive(Clone, Copy, Debug)]
struct Region {
    addr: u64,
    len: usize,
    owner: u64,
}

impl Region {
    fn contains(&self, sge: &ScatterGather) -> bool {
        sge.addr >= self.addr && sge.addr + sge.len as u64 <= self.addr + self.len as u64
    }
}

#[derive(Default)]
struct FabricStats {
    attempts: AtomicU64,
    connects: AtomicU64,
    refused: AtomicU64,
    sends: AtomicU64,
    replies: AtomicU64,
}

struct Shared {
    regions: DashMap<u32, Region>,
    next_lkey: AtomicU32,
    next_qp: AtomicU64,
    greeting: Option<Vec<u8>>,
    faults: RwLock<FaultPlan>,
    stats: FabricStats,
}

/// Loopback fabric handle, cheap to clone
#[derive(Clone)]
pub struct LoopbackFabric {
    shared: Arc<Shared>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl LoopbackFabric {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                regions: DashMap::new(),
                next_lkey: AtomicU32::new(1),
                next_qp: AtomicU64::new(1),
                greeting: options.greeting,
                faults: RwLock::new(options.faults),
                stats: FabricStats::default(),
            }),
        }
    }

    /// Replace the fault plan for connections opened from now on
    pub fn set_faults(&self, faults: FaultPlan) {
        *self.shared.faults.write() = faults;
    }

    /// Regions currently registered across all connections
    pub fn active_registrations(&self) -> usize {
        self.shared.regions.len()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> u64 {
        self.shared.stats.connects.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> u64 {
        self.shared.stats.refused.load(Ordering::Relaxed)
    }

    /// Requests received by the emulated endpoint
    pub fn requests_received(&self) -> u64 {
        self.shared.stats.sends.load(Ordering::Relaxed)
    }

    pub fn replies_sent(&self) -> u64 {
        self.shared.stats.replies.load(Ordering::Relaxed)
    }
}

impl Fabric for LoopbackFabric {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn connect(
        &self,
        addr: &str,
        port: &str,
        config: &TransportConfig,
    ) -> Result<Box<dyn QueuePair>, TransportError> {
        if addr.is_empty() {
            return Err(TransportError::setup(SetupStage::Resolve, "empty server address"));
        }
        if port.parse::<u16>().is_err() {
            return Err(TransportError::setup(
                SetupStage::Resolve,
                format!("invalid port {port:?}"),
            ));
        }

        let faults = self.shared.faults.read().clone();
        let attempt = self.shared.stats.attempts.fetch_add(1, Ordering::Relaxed);
        if faults.refuse_after.is_some_and(|limit| attempt >= limit) {
            self.shared.stats.refused.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::setup(
                SetupStage::Handshake,
                "connection rejected by peer",
            ));
        }

        self.shared.stats.connects.fetch_add(1, Ordering::Relaxed);
        let id = self.shared.next_qp.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Loopback connection {} to {}:{}", id, addr, port);

        let mut pending_replies = VecDeque::new();
        if let Some(greeting) = &self.shared.greeting {
            pending_replies.push_back(greeting.clone());
        }

        Ok(Box::new(LoopbackQueuePair {
            shared: Arc::clone(&self.shared),
            id,
            connected: true,
            faults,
            max_send_wr: config.max_send_wr as usize,
            max_recv_wr: config.max_recv_wr as usize,
            cq_depth: config.cq_depth as usize,
            registrations: 0,
            sends: 0,
            receiver_not_ready: false,
            deliveries: 0,
            posted_recvs: VecDeque::new(),
            pending_replies,
            send_cq: VecDeque::new(),
            recv_cq: VecDeque::new(),
        }))
    }
}

/// One loopback connection
pub struct LoopbackQueuePair {
    shared: Arc<Shared>,
    id: u64,
    connected: bool,
    faults: FaultPlan,
    max_send_wr: usize,
    max_recv_wr: usize,
    cq_depth: usize,
    registrations: u64,
    sends: u64,
    /// A reply found no posted receive; the connection is broken
    receiver_not_ready: bool,
    deliveries: u64,
    posted_recvs: VecDeque<(u64, ScatterGather)>,
    pending_replies: VecDeque<Vec<u8>>,
    send_cq: VecDeque<WorkCompletion>,
    recv_cq: VecDeque<WorkCompletion>,
}

impl LoopbackQueuePair {
    fn lookup(&self, sge: &ScatterGather) -> Option<Region> {
        let region = *self.shared.regions.get(&sge.lkey)?;
        (region.owner == self.id && region.contains(sge)).then_some(region)
    }

    fn push_completion(&mut self, kind: CompletionQueueKind, completion: WorkCompletion) {
        let cq = match kind {
            CompletionQueueKind::Send => &mut self.send_cq,
            CompletionQueueKind::Recv => &mut self.recv_cq,
        };
        if cq.len() >= self.cq_depth {
            tracing::warn!("Loopback connection {}: {:?} CQ overrun", self.id, kind);
        }
        cq.push_back(completion);
    }

    /// Match queued replies with posted receives
    fn deliver(&mut self) {
        while !self.pending_replies.is_empty() && !self.posted_recvs.is_empty() {
            let (Some(reply), Some((wr_id, sge))) =
                (self.pending_replies.pop_front(), self.posted_recvs.pop_front())
            else {
                break;
            };

            let fail = self
                .faults
                .fail_recv_after
                .is_some_and(|limit| self.deliveries >= limit);
            self.deliveries += 1;

            let status = if fail {
                WorkCompletionStatus::RetryExceeded
            } else if self.lookup(&sge).is_none() {
                WorkCompletionStatus::LocalProtectionError
            } else if reply.len() > sge.len as usize {
                WorkCompletionStatus::LocalLengthError
            } else {
                // SAFETY: the SGE lies inside a region registered by this
                // connection, and registered memory stays valid until it is
                // deregistered.
                unsafe {
                    std::ptr::copy_nonoverlapping(reply.as_ptr(), sge.addr as *mut u8, reply.len());
                }
                WorkCompletionStatus::Success
            };

            if status.is_success() {
                self.shared.stats.replies.fetch_add(1, Ordering::Relaxed);
            }
            self.push_completion(
                CompletionQueueKind::Recv,
                WorkCompletion {
                    wr_id,
                    status,
                    opcode: WorkCompletionOpcode::Receive,
                    byte_len: if status.is_success() { reply.len() as u32 } else { 0 },
                },
            );
        }
    }
}

impl QueuePair for LoopbackQueuePair {
    unsafe fn register_memory(
        &mut self,
        ptr: *mut u8,
        len: usize,
    ) -> Result<MemoryRegionHandle, TransportError> {
        if ptr.is_null() || len == 0 {
            return Err(TransportError::Registration {
                len,
                reason: "null or empty buffer".to_string(),
            });
        }
        if self
            .faults
            .fail_registration_after
            .is_some_and(|limit| self.registrations >= limit)
        {
            return Err(TransportError::Registration {
                len,
                reason: "injected registration failure".to_string(),
            });
        }
        self.registrations += 1;

        let lkey = self.shared.next_lkey.fetch_add(1, Ordering::Relaxed);
        let addr = ptr as u64;
        self.shared.regions.insert(
            lkey,
            Region {
                addr,
                len,
                owner: self.id,
            },
        );
        Ok(MemoryRegionHandle { lkey, addr, len })
    }

    fn deregister_memory(&mut self, handle: MemoryRegionHandle) -> Result<(), TransportError> {
        match self.shared.regions.remove(&handle.lkey) {
            Some(_) => Ok(()),
            None => Err(TransportError::UnknownRegion(handle.lkey)),
        }
    }

    fn post_send(&mut self, wr_id: u64, sge: ScatterGather) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.send_cq.len() >= self.max_send_wr {
            return Err(TransportError::Post {
                wr_id,
                reason: format!("send queue full ({} outstanding)", self.send_cq.len()),
            });
        }

        let fail = self.receiver_not_ready
            || self
                .faults
                .fail_send_after
                .is_some_and(|limit| self.sends >= limit);
        self.sends += 1;

        let mut replied = false;
        let status = if fail {
            WorkCompletionStatus::RetryExceeded
        } else if self.lookup(&sge).is_none() {
            WorkCompletionStatus::LocalProtectionError
        } else {
            // SAFETY: bounds checked against a live registration owned by this
            // connection.
            let request =
                unsafe { std::slice::from_raw_parts(sge.addr as *const u8, sge.len as usize) };
            self.shared.stats.sends.fetch_add(1, Ordering::Relaxed);
            if let Some(reply) = respond(request) {
                self.pending_replies.push_back(reply);
                replied = true;
            }
            WorkCompletionStatus::Success
        };

        self.push_completion(
            CompletionQueueKind::Send,
            WorkCompletion {
                wr_id,
                status,
                opcode: WorkCompletionOpcode::Send,
                byte_len: 0,
            },
        );
        self.deliver();

        if replied && !self.pending_replies.is_empty() {
            tracing::warn!(
                "Loopback connection {}: reply found no posted receive, failing further sends",
                self.id
            );
            self.receiver_not_ready = true;
        }
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64, sge: ScatterGather) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.posted_recvs.len() >= self.max_recv_wr {
            return Err(TransportError::Post {
                wr_id,
                reason: format!("receive queue full ({} posted)", self.posted_recvs.len()),
            });
        }
        self.posted_recvs.push_back((wr_id, sge));
        self.deliver();
        Ok(())
    }

    fn poll(
        &mut self,
        kind: CompletionQueueKind,
        max: usize,
        out: &mut CompletionBatch,
    ) -> Result<usize, TransportError> {
        let cq = match kind {
            CompletionQueueKind::Send => &mut self.send_cq,
            CompletionQueueKind::Recv => &mut self.recv_cq,
        };
        let n = max.min(cq.len());
        out.extend(cq.drain(..n));
        Ok(n)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.pending_replies.clear();
        while let Some((wr_id, _)) = self.posted_recvs.pop_front() {
            self.push_completion(
                CompletionQueueKind::Recv,
                WorkCompletion {
                    wr_id,
                    status: WorkCompletionStatus::WorkRequestFlushed,
                    opcode: WorkCompletionOpcode::Receive,
                    byte_len: 0,
                },
            );
        }
        tracing::debug!("Loopback connection {} disconnected", self.id);
        Ok(())
    }
}

impl Drop for LoopbackQueuePair {
    fn drop(&mut self) {
        let leaked = self
            .shared
            .regions
            .iter()
            .filter(|r| r.owner == self.id)
            .count();
        if leaked > 0 {
            tracing::warn!(
                "Loopback connection {} dropped with {} regions still registered",
                self.id,
                leaked
            );
        }
    }
}

const STATUS_INVALID_ARGUMENTS: u16 = 0x0004;
const STATUS_UNKNOWN_COMMAND: u16 = 0x0081;

/// The emulated cache endpoint: the reply to one request, if it asks for one
/// or is rejected
fn respond(request: &[u8]) -> Option<Vec<u8>> {
    match request.first() {
        Some(&binary::REQUEST_MAGIC) => respond_binary(request),
        Some(_) => respond_text(request),
        None => None,
    }
}

fn respond_text(request: &[u8]) -> Option<Vec<u8>> {
    match text::parse_request(request) {
        Ok(req) if req.noreply => None,
        Ok(req) => {
            let reply: &[u8] = match req.command {
                Command::Incr | Command::Decr => b"1\r\n",
                Command::Delete => b"DELETED\r\n",
                _ => b"STORED\r\n",
            };
            Some(reply.to_vec())
        }
        Err(e) => {
            tracing::warn!("Loopback endpoint rejected text request: {}", e);
            Some(b"ERROR\r\n".to_vec())
        }
    }
}

fn respond_binary(request: &[u8]) -> Option<Vec<u8>> {
    let header = match RequestHeader::parse(request) {
        Ok(header) => header,
        Err(e) => {
            tracing::warn!("Loopback endpoint dropped binary request: {}", e);
            return None;
        }
    };

    // quiet opcodes only suppress successful responses
    let (status, body): (u16, Option<u64>) = match binary::command_for_opcode(header.opcode) {
        Ok((Command::Incr | Command::Decr | Command::Delete, _)) if header.value_len() > 0 => {
            (STATUS_INVALID_ARGUMENTS, None)
        }
        Ok((_, ReplyMode::Silent)) => return None,
        Ok((Command::Incr | Command::Decr, ReplyMode::Acknowledged)) => (0x0000, Some(1)),
        Ok(_) => (0x0000, None),
        Err(_) => (STATUS_UNKNOWN_COMMAND, None),
    };

    let body_len = if body.is_some() { 8 } else { 0 };
    let response = ResponseHeader {
        opcode: header.opcode,
        key_len: 0,
        extras_len: 0,
        data_type: RAW_BYTES,
        status,
        body_len,
        opaque: header.opaque,
        cas: 0,
    };
    match build_response(&response, body) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!("Loopback endpoint failed to build response: {}", e);
            None
        }
    }
}

fn build_response(header: &ResponseHeader, body: Option<u64>) -> Result<Vec<u8>, CodecError> {
    let mut w = FrameWriter::new(HEADER_LEN + header.body_len as usize);
    header.write(&mut w)?;
    if let Some(value) = body {
        w.put_u64(value)?;
    }
    Ok(w.finish()?.to_vec())
}
