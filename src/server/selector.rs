//! Pool selection.
//!
//! Each request is routed to a pool by the class of its opcode, so cheap
//! pings never wait behind slow RSA operations.

use std::sync::Arc;

use crate::config::PoolsConfig;
use crate::ops::Executor;
use crate::protocol::{Packet, PoolClass};
use crate::worker::WorkerPool;

/// Chooses the pool that services a packet.
pub trait PoolSelector: Send + Sync {
    fn select_pool(&self, packet: &Packet) -> Arc<WorkerPool>;
}

impl<F> PoolSelector for F
where
    F: Fn(&Packet) -> Arc<WorkerPool> + Send + Sync,
{
    fn select_pool(&self, packet: &Packet) -> Arc<WorkerPool> {
        self(packet)
    }
}

/// Routes by [`PoolClass`]: control, ECDSA and RSA pools.
pub struct OpcodeSelector {
    control: Arc<WorkerPool>,
    ecdsa: Arc<WorkerPool>,
    rsa: Arc<WorkerPool>,
}

impl OpcodeSelector {
    /// Spawn one pool per class, sized from configuration.
    pub fn new(config: &PoolsConfig, executor: Arc<Executor>) -> Self {
        let spawn = |class: PoolClass| {
            let pool = config.get(class);
            WorkerPool::new(class.to_string(), pool.workers, pool.queue_size, Arc::clone(&executor))
        };
        Self {
            control: spawn(PoolClass::Control),
            ecdsa: spawn(PoolClass::Ecdsa),
            rsa: spawn(PoolClass::Rsa),
        }
    }

    pub fn pool(&self, class: PoolClass) -> &Arc<WorkerPool> {
        match class {
            PoolClass::Control => &self.control,
            PoolClass::Ecdsa => &self.ecdsa,
            PoolClass::Rsa => &self.rsa,
        }
    }

    pub fn pools(&self) -> [&Arc<WorkerPool>; 3] {
        [&self.control, &self.ecdsa, &self.rsa]
    }

    /// Stop every pool and wait for its workers.
    pub async fn shutdown(&self) {
        for pool in self.pools() {
            pool.shutdown().await;
        }
    }
}

impl PoolSelector for OpcodeSelector {
    fn select_pool(&self, packet: &Packet) -> Arc<WorkerPool> {
        Arc::clone(self.pool(packet.opcode().class()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::ops::MemoryKeystore;
    use crate::protocol::{Op, Operation};

    fn selector() -> OpcodeSelector {
        let config = PoolsConfig {
            control: PoolConfig { workers: 1, queue_size: 4 },
            ecdsa: PoolConfig { workers: 1, queue_size: 4 },
            rsa: PoolConfig { workers: 2, queue_size: 4 },
        };
        OpcodeSelector::new(&config, Arc::new(Executor::new(Arc::new(MemoryKeystore::new()))))
    }

    fn packet(op: Op) -> Packet {
        Packet::new(1, Operation::new(op, vec![])).unwrap()
    }

    #[tokio::test]
    async fn routes_by_opcode_class() {
        let selector = selector();
        assert_eq!(selector.select_pool(&packet(Op::Ping)).name(), "control");
        assert_eq!(selector.select_pool(&packet(Op::Unknown(0x99))).name(), "control");
        assert_eq!(selector.select_pool(&packet(Op::EcdsaSignSha256)).name(), "ecdsa");
        assert_eq!(selector.select_pool(&packet(Op::Ed25519Sign)).name(), "ecdsa");
        assert_eq!(selector.select_pool(&packet(Op::RsaDecrypt)).name(), "rsa");
        assert_eq!(selector.select_pool(&packet(Op::RsaPssSignSha384)).name(), "rsa");
        selector.shutdown().await;
        assert!(selector.pools().iter().all(|pool| pool.is_shut_down()));
    }
}
