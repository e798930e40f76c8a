//! Completion correlation
//!
//! Every work request carries a `wr_id` that keys a `WorkContext` in the
//! connection's arena: a send owns its scratch buffer until the send
//! completes, a receive names the slot it was posted from. Completions are
//! resolved through that map, never through the address of anything.
//!
//! Each completion queue keeps a FIFO backlog, so when one poll returns
//! several completions they are still consumed in delivery order.

use crate::error::TransportError;
use crate::memory::{BufferRole, RecvPool, RegisteredBuffer};
use crate::transport::{CompletionBatch, CompletionQueueKind, QueuePair, WorkCompletion};
use crossbeam::utils::Backoff;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// What an outstanding work request refers to
#[derive(Debug)]
pub enum WorkContext {
    Send { scratch: RegisteredBuffer },
    Recv { slot: usize },
}

impl WorkContext {
    fn queue(&self) -> CompletionQueueKind {
        match self {
            WorkContext::Send { .. } => CompletionQueueKind::Send,
            WorkContext::Recv { .. } => CompletionQueueKind::Recv,
        }
    }
}

/// Per-connection work request bookkeeping
#[derive(Debug)]
pub struct Correlator {
    next_wr_id: u64,
    outstanding: HashMap<u64, WorkContext>,
    send_backlog: VecDeque<WorkCompletion>,
    recv_backlog: VecDeque<WorkCompletion>,
    batch: CompletionBatch,
    poll_batch: usize,
    timeout: Duration,
}

impl Correlator {
    pub fn new(poll_batch: usize, timeout: Duration) -> Self {
        Self {
            next_wr_id: 1,
            outstanding: HashMap::new(),
            send_backlog: VecDeque::new(),
            recv_backlog: VecDeque::new(),
            batch: CompletionBatch::new(),
            poll_batch: poll_batch.max(1),
            timeout,
        }
    }

    /// Work requests posted but not yet completed
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn issue(&mut self, context: WorkContext) -> u64 {
        let wr_id = self.next_wr_id;
        self.next_wr_id += 1;
        self.outstanding.insert(wr_id, context);
        wr_id
    }

    /// Post receive slot `slot` under a fresh `wr_id`
    pub fn post_recv_slot(
        &mut self,
        qp: &mut dyn QueuePair,
        pool: &RecvPool,
        slot: usize,
    ) -> Result<u64, TransportError> {
        let buffer = pool
            .slot(slot)
            .ok_or_else(|| TransportError::Other(format!("no receive slot {slot}")))?;
        let sge = buffer.sge(buffer.len())?;
        let wr_id = self.issue(WorkContext::Recv { slot });
        if let Err(e) = qp.post_recv(wr_id, sge) {
            self.outstanding.remove(&wr_id);
            return Err(e);
        }
        Ok(wr_id)
    }

    /// Send `bytes` from a freshly registered scratch buffer and wait for the
    /// send completion. The scratch buffer is deregistered once the
    /// completion is observed.
    pub fn send(&mut self, qp: &mut dyn QueuePair, bytes: &[u8]) -> Result<(), TransportError> {
        let mut scratch = RegisteredBuffer::from_bytes(bytes, BufferRole::SendScratch);
        scratch.register(qp)?;
        let sge = match scratch.sge(bytes.len()) {
            Ok(sge) => sge,
            Err(e) => {
                scratch.deregister(qp)?;
                return Err(e);
            }
        };

        let wr_id = self.issue(WorkContext::Send { scratch });
        if let Err(e) = qp.post_send(wr_id, sge) {
            if let Some(WorkContext::Send { mut scratch }) = self.outstanding.remove(&wr_id) {
                if let Err(de) = scratch.deregister(qp) {
                    tracing::warn!("Failed to deregister send scratch buffer after failed post: {}", de);
                }
            }
            return Err(e);
        }

        let wc = self.wait(qp, CompletionQueueKind::Send)?;
        let WorkContext::Send { mut scratch } = self.claim(wc, CompletionQueueKind::Send)? else {
            return Err(TransportError::ContextMismatch { wr_id: wc.wr_id });
        };
        let deregistered = scratch.deregister(qp);
        if !wc.status.is_success() {
            return Err(TransportError::Completion {
                wr_id: wc.wr_id,
                status: wc.status,
            });
        }
        deregistered
    }

    /// Wait for the next receive completion, hand its payload to `inspect`,
    /// then re-post the slot. Returns the number of bytes received.
    pub fn await_reply<F>(
        &mut self,
        qp: &mut dyn QueuePair,
        pool: &RecvPool,
        inspect: F,
    ) -> Result<usize, TransportError>
    where
        F: FnOnce(&[u8]),
    {
        let wc = self.wait(qp, CompletionQueueKind::Recv)?;
        self.consume_recv(qp, pool, wc, inspect)
    }

    /// Consume every receive completion that has already arrived, without
    /// waiting. Each payload goes to `inspect` and each slot is re-posted, so
    /// replies nobody waits for never use up receive capacity. Returns how
    /// many completions were consumed.
    pub fn collect_replies<F>(
        &mut self,
        qp: &mut dyn QueuePair,
        pool: &RecvPool,
        mut inspect: F,
    ) -> Result<usize, TransportError>
    where
        F: FnMut(&[u8]),
    {
        self.poll_into_backlog(qp, CompletionQueueKind::Recv)?;
        let mut consumed = 0;
        while let Some(wc) = self.recv_backlog.pop_front() {
            self.consume_recv(qp, pool, wc, &mut inspect)?;
            consumed += 1;
        }
        Ok(consumed)
    }

    fn consume_recv<F>(
        &mut self,
        qp: &mut dyn QueuePair,
        pool: &RecvPool,
        wc: WorkCompletion,
        inspect: F,
    ) -> Result<usize, TransportError>
    where
        F: FnOnce(&[u8]),
    {
        let WorkContext::Recv { slot } = self.claim(wc, CompletionQueueKind::Recv)? else {
            return Err(TransportError::ContextMismatch { wr_id: wc.wr_id });
        };
        if !wc.status.is_success() {
            return Err(TransportError::Completion {
                wr_id: wc.wr_id,
                status: wc.status,
            });
        }

        let len = wc.byte_len as usize;
        if let Some(buffer) = pool.slot(slot) {
            inspect(&buffer.as_slice()[..len.min(buffer.len())]);
        }
        self.post_recv_slot(qp, pool, slot)?;
        Ok(len)
    }

    fn backlog(&mut self, kind: CompletionQueueKind) -> &mut VecDeque<WorkCompletion> {
        match kind {
            CompletionQueueKind::Send => &mut self.send_backlog,
            CompletionQueueKind::Recv => &mut self.recv_backlog,
        }
    }

    /// Poll `kind` once, moving whatever arrived into its backlog
    fn poll_into_backlog(
        &mut self,
        qp: &mut dyn QueuePair,
        kind: CompletionQueueKind,
    ) -> Result<usize, TransportError> {
        self.batch.clear();
        let n = qp.poll(kind, self.poll_batch, &mut self.batch)?;
        let arrived: Vec<WorkCompletion> = self.batch.drain(..).collect();
        self.backlog(kind).extend(arrived);
        Ok(n)
    }

    /// Next completion on `kind`, busy-polling with backoff until one
    /// arrives or the completion timeout expires
    fn wait(
        &mut self,
        qp: &mut dyn QueuePair,
        kind: CompletionQueueKind,
    ) -> Result<WorkCompletion, TransportError> {
        if let Some(wc) = self.backlog(kind).pop_front() {
            return Ok(wc);
        }

        let deadline = Instant::now() + self.timeout;
        let backoff = Backoff::new();
        loop {
            if self.poll_into_backlog(qp, kind)? > 0 {
                if let Some(wc) = self.backlog(kind).pop_front() {
                    return Ok(wc);
                }
            }
            if backoff.is_completed() {
                if Instant::now() >= deadline {
                    return Err(TransportError::CompletionTimeout(self.timeout));
                }
                std::thread::sleep(Duration::from_micros(10));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Resolve a completion to its context. A context that belongs to the
    /// other queue stays outstanding so teardown can still release it.
    fn claim(
        &mut self,
        wc: WorkCompletion,
        kind: CompletionQueueKind,
    ) -> Result<WorkContext, TransportError> {
        let context = self
            .outstanding
            .remove(&wc.wr_id)
            .ok_or(TransportError::UnknownWorkRequest(wc.wr_id))?;
        if context.queue() != kind {
            self.outstanding.insert(wc.wr_id, context);
            return Err(TransportError::ContextMismatch { wr_id: wc.wr_id });
        }
        Ok(context)
    }

    /// Consume and discard every completion still queued on either queue.
    /// Scratch buffers of completed sends are deregistered. Returns how many
    /// completions were discarded and how many deregistrations failed.
    pub fn drain(&mut self, qp: &mut dyn QueuePair) -> (usize, usize) {
        let mut discarded = 0;
        let mut failures = 0;
        for kind in [CompletionQueueKind::Send, CompletionQueueKind::Recv] {
            loop {
                match self.poll_into_backlog(qp, kind) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Failed to drain {:?} completions: {}", kind, e);
                        failures += 1;
                        break;
                    }
                }
            }
            while let Some(wc) = self.backlog(kind).pop_front() {
                discarded += 1;
                match self.outstanding.remove(&wc.wr_id) {
                    Some(WorkContext::Send { mut scratch }) => {
                        if let Err(e) = scratch.deregister(qp) {
                            tracing::warn!("Failed to deregister send scratch buffer: {}", e);
                            failures += 1;
                        }
                    }
                    Some(WorkContext::Recv { .. }) => {}
                    None => tracing::debug!("Discarding completion for unknown wr_id {}", wc.wr_id),
                }
            }
        }
        (discarded, failures)
    }

    /// Forget every outstanding context, deregistering any scratch buffers
    /// they still own. Returns how many deregistrations failed.
    pub fn release_all(&mut self, qp: &mut dyn QueuePair) -> usize {
        let mut failures = 0;
        for (_, context) in self.outstanding.drain() {
            if let WorkContext::Send { mut scratch } = context {
                if let Err(e) = scratch.deregister(qp) {
                    tracing::warn!("Failed to deregister send scratch buffer: {}", e);
                    failures += 1;
                }
            }
        }
        failures
    }
}
