//! Registered buffers
//!
//! A `RegisteredBuffer` owns a heap allocation and, while registered, the
//! transport's handle for it. The allocation never moves, so the address
//! handed to the transport stays valid until the buffer is deregistered.
//! A connection keeps its receive slots in a `RecvPool`, registered for the
//! connection's whole lifetime; send scratch buffers are registered for a
//! single send.

use crate::error::TransportError;
use crate::transport::{MemoryRegionHandle, QueuePair, ScatterGather};

/// What a buffer is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferRole {
    ReceiveSlot,
    SendScratch,
}

/// A byte buffer plus its registration, if any
#[derive(Debug)]
pub struct RegisteredBuffer {
    data: Box<[u8]>,
    region: Option<MemoryRegionHandle>,
    role: BufferRole,
}

impl RegisteredBuffer {
    /// Zeroed, unregistered buffer of `len` bytes
    pub fn new(len: usize, role: BufferRole) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
            region: None,
            role,
        }
    }

    /// Unregistered buffer holding a copy of `bytes`
    pub fn from_bytes(bytes: &[u8], role: BufferRole) -> Self {
        Self {
            data: bytes.into(),
            region: None,
            role,
        }
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_registered(&self) -> bool {
        self.region.is_some()
    }

    pub fn region(&self) -> Option<MemoryRegionHandle> {
        self.region
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Register with `qp`. Registering twice is a no-op.
    pub fn register(&mut self, qp: &mut dyn QueuePair) -> Result<MemoryRegionHandle, TransportError> {
        if let Some(region) = self.region {
            return Ok(region);
        }
        // SAFETY: `data` is a boxed slice that is never reallocated, and it is
        // leaked rather than freed if dropped while still registered.
        let region = unsafe { qp.register_memory(self.data.as_mut_ptr(), self.data.len())? };
        self.region = Some(region);
        Ok(region)
    }

    /// Deregister from `qp`. Deregistering an unregistered buffer is a no-op.
    pub fn deregister(&mut self, qp: &mut dyn QueuePair) -> Result<(), TransportError> {
        match self.region.take() {
            Some(region) => qp.deregister_memory(region),
            None => Ok(()),
        }
    }

    /// Scatter/gather entry covering the first `len` bytes
    pub fn sge(&self, len: usize) -> Result<ScatterGather, TransportError> {
        let region = self
            .region
            .ok_or_else(|| TransportError::Other(format!("{:?} buffer is not registered", self.role)))?;
        Ok(region.sge(len))
    }
}

impl Drop for RegisteredBuffer {
    fn drop(&mut self) {
        if let Some(region) = self.region {
            tracing::warn!(
                "Leaking {} byte {:?} buffer still registered as lkey {:#x}",
                self.data.len(),
                self.role,
                region.lkey
            );
            std::mem::forget(std::mem::take(&mut self.data));
        }
    }
}

/// Pool statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub slots: usize,
    pub slot_size: usize,
    pub registered: usize,
}

/// A connection's receive slots
#[derive(Debug, Default)]
pub struct RecvPool {
    slots: Vec<RegisteredBuffer>,
}

impl RecvPool {
    /// Allocate and register `count` slots of `slot_size` bytes. On failure
    /// every slot registered so far is deregistered again.
    pub fn allocate(
        qp: &mut dyn QueuePair,
        count: usize,
        slot_size: usize,
    ) -> Result<Self, TransportError> {
        let mut pool = Self {
            slots: Vec::with_capacity(count),
        };
        for _ in 0..count {
            let mut slot = RegisteredBuffer::new(slot_size, BufferRole::ReceiveSlot);
            if let Err(e) = slot.register(qp) {
                let failures = pool.deregister_all(qp);
                if failures > 0 {
                    tracing::warn!("{} receive slots failed to deregister after setup error", failures);
                }
                return Err(e);
            }
            pool.slots.push(slot);
        }
        Ok(pool)
    }

    pub fn slot(&self, index: usize) -> Option<&RegisteredBuffer> {
        self.slots.get(index)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Deregister every slot, returning how many failed
    pub fn deregister_all(&mut self, qp: &mut dyn QueuePair) -> usize {
        let mut failures = 0;
        for slot in &mut self.slots {
            if let Err(e) = slot.deregister(qp) {
                tracing::warn!("Failed to deregister receive slot: {}", e);
                failures += 1;
            }
        }
        failures
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slots: self.slots.len(),
            slot_size: self.slots.first().map_or(0, RegisteredBuffer::len),
            registered: self.slots.iter().filter(|s| s.is_registered()).count(),
        }
    }
}
