//! Connection lifecycle
//!
//! `Connection::open` either returns a fully usable connection, with every
//! receive slot registered and posted, or releases whatever it had acquired
//! and returns the error. `close` consumes the connection, so teardown runs
//! exactly once; dropping an unclosed connection runs the same teardown.

use crate::completion::Correlator;
use crate::config::BenchConfig;
use crate::error::{SetupStage, TransportError};
use crate::memory::{PoolStats, RecvPool};
use crate::protocol::MessageTemplate;
use crate::transport::{Fabric, QueuePair};
use serde::Serialize;

/// What teardown released, and what went wrong while releasing it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TeardownSummary {
    /// Completions drained and thrown away
    pub discarded_completions: usize,
    /// Receive slots deregistered
    pub deregistered_slots: usize,
    /// Disconnect or deregistration failures (logged, never raised)
    pub failures: usize,
}

/// One connection to the cache server, owned by a single context
pub struct Connection {
    id: usize,
    qp: Box<dyn QueuePair>,
    pool: RecvPool,
    correlator: Correlator,
    open: bool,
}

impl Connection {
    /// Connect to the configured server and pre-post every receive slot
    pub fn open(fabric: &dyn Fabric, config: &BenchConfig, id: usize) -> Result<Self, TransportError> {
        let transport = &config.transport;
        let mut qp = fabric.connect(&config.server_addr, &config.server_port, transport)?;

        let pool = match RecvPool::allocate(qp.as_mut(), transport.recv_slots, transport.recv_buffer_size) {
            Ok(pool) => pool,
            Err(e) => {
                if let Err(de) = qp.disconnect() {
                    tracing::warn!("Context {}: disconnect after failed setup: {}", id, de);
                }
                return Err(e);
            }
        };

        let mut conn = Self {
            id,
            qp,
            pool,
            correlator: Correlator::new(transport.poll_batch, transport.completion_timeout),
            open: true,
        };

        for slot in 0..conn.pool.len() {
            if let Err(e) = conn
                .correlator
                .post_recv_slot(conn.qp.as_mut(), &conn.pool, slot)
            {
                let summary = conn.teardown();
                tracing::debug!("Context {}: released partial connection: {:?}", id, summary);
                return Err(TransportError::setup(SetupStage::PostReceive, e.to_string()));
            }
        }

        tracing::debug!(
            "Context {}: connected via {} with {} receive slots of {} bytes",
            id,
            fabric.name(),
            conn.pool.len(),
            transport.recv_buffer_size
        );
        Ok(conn)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Work requests posted and not yet completed
    pub fn outstanding(&self) -> usize {
        self.correlator.outstanding()
    }

    /// Send one request and wait for its send completion
    pub fn send_request(&mut self, template: &MessageTemplate) -> Result<(), TransportError> {
        self.correlator.send(self.qp.as_mut(), template.as_bytes())
    }

    /// Wait for one reply, pass its bytes to `inspect` and re-post the slot
    pub fn await_reply<F>(&mut self, inspect: F) -> Result<usize, TransportError>
    where
        F: FnOnce(&[u8]),
    {
        self.correlator
            .await_reply(self.qp.as_mut(), &self.pool, inspect)
    }

    /// Consume replies that arrived on their own (rejected quiet requests)
    /// and re-post their slots. Never waits.
    pub fn collect_replies<F>(&mut self, inspect: F) -> Result<usize, TransportError>
    where
        F: FnMut(&[u8]),
    {
        self.correlator
            .collect_replies(self.qp.as_mut(), &self.pool, inspect)
    }

    /// Disconnect and release everything
    pub fn close(mut self) -> TeardownSummary {
        self.teardown()
    }

    fn teardown(&mut self) -> TeardownSummary {
        if !self.open {
            return TeardownSummary::default();
        }
        self.open = false;

        let mut summary = TeardownSummary::default();
        if let Err(e) = self.qp.disconnect() {
            tracing::warn!("Context {}: disconnect failed: {}", self.id, e);
            summary.failures += 1;
        }

        let (discarded, failures) = self.correlator.drain(self.qp.as_mut());
        summary.discarded_completions = discarded;
        summary.failures += failures;
        summary.failures += self.correlator.release_all(self.qp.as_mut());

        let registered = self.pool.stats().registered;
        let failures = self.pool.deregister_all(self.qp.as_mut());
        summary.deregistered_slots = registered - failures;
        summary.failures += failures;

        if summary.failures > 0 {
            tracing::warn!("Context {}: teardown finished with {} failures", self.id, summary.failures);
        } else {
            tracing::debug!("Context {}: teardown complete: {:?}", self.id, summary);
        }
        summary
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.open {
            tracing::warn!("Context {}: connection dropped without close", self.id);
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TemplateTable;
    use crate::transport::loopback::{FaultPlan, LoopbackFabric, LoopbackOptions};

    fn small_config() -> BenchConfig {
        let mut config = BenchConfig {
            reply_wait: true,
            ..Default::default()
        };
        config.transport.recv_slots = 4;
        config
    }

    #[test]
    fn test_open_posts_every_slot() {
        let fabric = LoopbackFabric::default();
        let conn = Connection::open(&fabric, &small_config(), 0).unwrap();
        assert_eq!(conn.outstanding(), 4);
        assert_eq!(conn.pool_stats().registered, 4);
        assert_eq!(fabric.active_registrations(), 4);

        let summary = conn.close();
        assert_eq!(summary.discarded_completions, 4);
        assert_eq!(summary.deregistered_slots, 4);
        assert_eq!(summary.failures, 0);
        assert_eq!(fabric.active_registrations(), 0);
    }

    #[test]
    fn test_request_reply_round() {
        let fabric = LoopbackFabric::default();
        let config = small_config();
        let table = TemplateTable::build(&config).unwrap();
        let mut conn = Connection::open(&fabric, &config, 0).unwrap();

        for i in 0..16 {
            conn.send_request(table.for_iteration(i)).unwrap();
            assert!(conn.await_reply(|_| {}).unwrap() > 0);
        }
        conn.close();
        assert_eq!(fabric.replies_sent(), 16);
        assert_eq!(fabric.active_registrations(), 0);
    }

    #[test]
    fn test_failed_registration_leaves_nothing_behind() {
        let fabric = LoopbackFabric::new(LoopbackOptions {
            faults: FaultPlan {
                fail_registration_after: Some(2),
                ..Default::default()
            },
            ..Default::default()
        });
        let err = Connection::open(&fabric, &small_config(), 0).err().unwrap();
        assert!(err.is_setup());
        assert_eq!(fabric.active_registrations(), 0);
    }

    #[test]
    fn test_failed_receive_posting_is_a_setup_error() {
        let fabric = LoopbackFabric::default();
        let mut config = small_config();
        // more slots than the receive queue accepts once validation is bypassed
        config.transport.max_recv_wr = 2;
        let err = Connection::open(&fabric, &config, 0).err().unwrap();
        assert!(matches!(
            err,
            TransportError::Setup {
                stage: SetupStage::PostReceive,
                ..
            }
        ));
        assert_eq!(fabric.active_registrations(), 0);
    }

    #[test]
    fn test_drop_without_close_tears_down() {
        let fabric = LoopbackFabric::default();
        let conn = Connection::open(&fabric, &small_config(), 0).unwrap();
        drop(conn);
        assert_eq!(fabric.active_registrations(), 0);
    }
}
