//! rdma-cm / ibverbs backend
//!
//! Connection establishment follows the usual active-side sequence: resolve
//! the address, resolve the route, build the protection domain, completion
//! queues and RC queue pair on the device rdma-cm picked, move the QP to
//! INIT, connect, then RTR/RTS on the connect response. Every connection
//! owns its resources, so nothing here is shared between threads.

use super::{
    CompletionBatch, CompletionQueueKind, Fabric, MemoryRegionHandle, QueuePair, ScatterGather,
    TransportConfig, WorkCompletion, WorkCompletionStatus,
};
use crate::error::{SetupStage, TransportError};
use sideway::ibverbs::completion::{GenericCompletionQueue, PollCompletionQueueError};
use sideway::ibverbs::memory_region::MemoryRegion;
use sideway::ibverbs::protection_domain::ProtectionDomain;
use sideway::ibverbs::queue_pair::{
    GenericQueuePair, PostSendGuard as _, QueuePair as _, QueuePairAttribute, QueuePairState,
    QueuePairType, SetScatterGatherEntry, WorkRequestFlags,
};
use sideway::ibverbs::AccessFlags;
use sideway::rdmacm::communication_manager::{
    ConnectionParameter, EventChannel, EventType, Identifier, PortSpace,
};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

/// Opens rdma-cm connections
#[derive(Default)]
pub struct VerbsFabric;

impl VerbsFabric {
    pub fn new() -> Self {
        Self
    }
}

fn resolve(addr: &str, port: &str) -> Result<SocketAddr, TransportError> {
    let port: u16 = port
        .parse()
        .map_err(|_| TransportError::setup(SetupStage::Resolve, format!("invalid port {port:?}")))?;
    (addr, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::setup(SetupStage::Resolve, e.to_string()))?
        .next()
        .ok_or_else(|| TransportError::setup(SetupStage::Resolve, format!("no address for {addr}")))
}

/// Resources built once the route is known, before the handshake completes
struct Pending {
    pd: Arc<ProtectionDomain>,
    send_cq: GenericCompletionQueue,
    recv_cq: GenericCompletionQueue,
    qp: GenericQueuePair,
}

impl Fabric for VerbsFabric {
    fn name(&self) -> &'static str {
        "verbs"
    }

    fn connect(
        &self,
        addr: &str,
        port: &str,
        config: &TransportConfig,
    ) -> Result<Box<dyn QueuePair>, TransportError> {
        let dst = resolve(addr, port)?;

        // get_cm_event blocks, so the handshake runs on its own thread and
        // is abandoned once the deadline passes
        let deadline = config.resolve_timeout + config.route_timeout + config.connect_timeout;
        let (tx, rx) = crossbeam::channel::bounded(1);
        let stage_config = config.clone();
        std::thread::Builder::new()
            .name(format!("rdma-cm-{dst}"))
            .spawn(move || {
                let _ = tx.send(establish(dst, &stage_config));
            })
            .map_err(|e| TransportError::setup(SetupStage::Handshake, e.to_string()))?;

        rx.recv_timeout(deadline).unwrap_or_else(|_| {
            tracing::warn!("No rdma-cm connection to {} within {:?}", dst, deadline);
            Err(TransportError::setup(
                SetupStage::Handshake,
                format!("no connection within {deadline:?}"),
            ))
        })
    }
}

/// Run the active-side rdma-cm sequence to completion
fn establish(dst: SocketAddr, config: &TransportConfig) -> Result<Box<dyn QueuePair>, TransportError> {
    let ec = EventChannel::new()
        .map_err(|e| TransportError::setup(SetupStage::Resolve, e.to_string()))?;
    let id = ec
        .create_id(PortSpace::Tcp)
        .map_err(|e| TransportError::setup(SetupStage::Resolve, e.to_string()))?;
    id.resolve_addr(None, dst, config.resolve_timeout)
        .map_err(|e| TransportError::setup(SetupStage::Resolve, e.to_string()))?;

    let mut pending: Option<Pending> = None;
    loop {
        let event = ec
            .get_cm_event()
            .map_err(|e| TransportError::setup(SetupStage::Handshake, e.to_string()))?;
        let event_type = event.event_type();
        tracing::debug!("rdma-cm event {:?} for {}", event_type, dst);

        match event_type {
            EventType::AddressResolved => {
                id.resolve_route(config.route_timeout)
                    .map_err(|e| TransportError::setup(SetupStage::Route, e.to_string()))?;
            }
            EventType::RouteResolved => {
                let resources = build_resources(&id, config)?;
                let mut param = ConnectionParameter::new();
                param.setup_qp_number(resources.qp.qp_number());
                id.connect(param)
                    .map_err(|e| TransportError::setup(SetupStage::Handshake, e.to_string()))?;
                pending = Some(resources);
            }
            EventType::ConnectResponse | EventType::Established => {
                let Some(mut resources) = pending.take() else {
                    continue;
                };
                if matches!(event_type, EventType::ConnectResponse) {
                    for state in [QueuePairState::ReadyToReceive, QueuePairState::ReadyToSend] {
                        let attr = id
                            .get_qp_attr(state)
                            .map_err(|e| TransportError::setup(SetupStage::Handshake, e.to_string()))?;
                        resources
                            .qp
                            .modify(&attr)
                            .map_err(|e| TransportError::setup(SetupStage::Handshake, e.to_string()))?;
                    }
                    id.establish()
                        .map_err(|e| TransportError::setup(SetupStage::Handshake, e.to_string()))?;
                }
                tracing::info!("Connected to {} over rdma-cm", dst);
                return Ok(Box::new(VerbsQueuePair {
                    _ec: ec,
                    id,
                    pd: resources.pd,
                    send_cq: resources.send_cq,
                    recv_cq: resources.recv_cq,
                    qp: resources.qp,
                    regions: HashMap::new(),
                    connected: true,
                }));
            }
            EventType::AddressError => {
                return Err(TransportError::setup(SetupStage::Resolve, format!("{event_type:?}")));
            }
            EventType::RouteError => {
                return Err(TransportError::setup(SetupStage::Route, format!("{event_type:?}")));
            }
            EventType::ConnectError | EventType::Rejected | EventType::Unreachable => {
                return Err(TransportError::setup(SetupStage::Handshake, format!("{event_type:?}")));
            }
            _ => {
                tracing::debug!("Ignoring rdma-cm event {:?}", event_type);
            }
        }
    }
}

fn build_resources(id: &Arc<Identifier>, config: &TransportConfig) -> Result<Pending, TransportError> {
    let fail = |e: &dyn std::fmt::Display| TransportError::setup(SetupStage::Route, e.to_string());

    let ctx = id
        .get_device_context()
        .ok_or_else(|| TransportError::setup(SetupStage::Route, "no device context"))?;
    let pd = ctx.alloc_pd().map_err(|e| fail(&e))?;
    let send_cq: GenericCompletionQueue = ctx
        .create_cq_builder()
        .setup_cqe(config.cq_depth)
        .build()
        .map_err(|e| fail(&e))?
        .into();
    let recv_cq: GenericCompletionQueue = ctx
        .create_cq_builder()
        .setup_cqe(config.cq_depth)
        .build()
        .map_err(|e| fail(&e))?
        .into();

    let mut builder = pd.create_qp_builder();
    builder.setup_send_cq(send_cq.clone());
    builder.setup_recv_cq(recv_cq.clone());
    builder.setup_qp_type(QueuePairType::ReliableConnection);
    builder
        .setup_max_send_wr(config.max_send_wr)
        .setup_max_send_sge(config.max_sge)
        .setup_max_recv_wr(config.max_recv_wr)
        .setup_max_recv_sge(config.max_sge);
    let mut qp = GenericQueuePair::Basic(builder.build().map_err(|e| fail(&e))?);

    let attr = id.get_qp_attr(QueuePairState::Init).map_err(|e| fail(&e))?;
    qp.modify(&attr).map_err(|e| fail(&e))?;

    Ok(Pending {
        pd,
        send_cq,
        recv_cq,
        qp,
    })
}

/// One rdma-cm connection and the verbs resources it owns
pub struct VerbsQueuePair {
    _ec: Arc<EventChannel>,
    id: Arc<Identifier>,
    pd: Arc<ProtectionDomain>,
    send_cq: GenericCompletionQueue,
    recv_cq: GenericCompletionQueue,
    qp: GenericQueuePair,
    regions: HashMap<u32, Arc<MemoryRegion>>,
    connected: bool,
}

impl QueuePair for VerbsQueuePair {
    unsafe fn register_memory(
        &mut self,
        ptr: *mut u8,
        len: usize,
    ) -> Result<MemoryRegionHandle, TransportError> {
        let mr = self
            .pd
            .reg_mr(ptr as usize, len, AccessFlags::LocalWrite)
            .map_err(|e| TransportError::Registration {
                len,
                reason: e.to_string(),
            })?;
        let lkey = mr.lkey();
        self.regions.insert(lkey, mr);
        Ok(MemoryRegionHandle {
            lkey,
            addr: ptr as u64,
            len,
        })
    }

    fn deregister_memory(&mut self, handle: MemoryRegionHandle) -> Result<(), TransportError> {
        // ibv_dereg_mr runs when the last reference drops
        self.regions
            .remove(&handle.lkey)
            .map(drop)
            .ok_or(TransportError::UnknownRegion(handle.lkey))
    }

    fn post_send(&mut self, wr_id: u64, sge: ScatterGather) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let mut guard = self.qp.start_post_send();
        let wr = guard.construct_wr(wr_id, WorkRequestFlags::Signaled);
        unsafe {
            wr.setup_send().setup_sge(sge.lkey, sge.addr, sge.len);
        }
        guard.post().map_err(|e| TransportError::Post {
            wr_id,
            reason: e.to_string(),
        })
    }

    fn post_recv(&mut self, wr_id: u64, sge: ScatterGather) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let mut guard = self.qp.start_post_recv();
        unsafe {
            guard.construct_wr(wr_id).setup_sge(sge.lkey, sge.addr, sge.len);
        }
        guard.post().map_err(|e| TransportError::Post {
            wr_id,
            reason: e.to_string(),
        })
    }

    fn poll(
        &mut self,
        kind: CompletionQueueKind,
        max: usize,
        out: &mut CompletionBatch,
    ) -> Result<usize, TransportError> {
        let cq = match kind {
            CompletionQueueKind::Send => &self.send_cq,
            CompletionQueueKind::Recv => &self.recv_cq,
        };
        match cq.start_poll() {
            Ok(poller) => {
                let before = out.len();
                out.extend(poller.take(max).map(|wc| WorkCompletion {
                    wr_id: wc.wr_id(),
                    status: WorkCompletionStatus::from_raw(wc.status() as u32),
                    opcode: kind.opcode(),
                    byte_len: wc.byte_len(),
                }));
                Ok(out.len() - before)
            }
            Err(PollCompletionQueueError::CompletionQueueEmpty) => Ok(0),
            Err(e) => Err(TransportError::Other(format!("failed to poll {kind:?} CQ: {e}"))),
        }
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        // Error state flushes every outstanding receive
        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::Error);
        let flushed = self
            .qp
            .modify(&attr)
            .map_err(|e| TransportError::Other(format!("failed to move QP to error state: {e}")));
        if let Err(e) = self.id.disconnect() {
            tracing::warn!("rdma-cm disconnect failed: {}", e);
        }
        flushed
    }
}
