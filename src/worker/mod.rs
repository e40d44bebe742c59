//! Worker pool subsystem.
//!
//! # Data Flow
//! ```text
//! Connection reader (get_job)
//!     → selector picks a pool
//!     → pool.rs (bounded queue)
//!     → worker task: Executor::execute
//!     → Response
//!     → JobSource::submit_result on the originating connection
//! ```
//!
//! # Design Decisions
//! - A job carries a handle to its connection, so any worker can answer it
//! - Execution failures become error responses; workers never exit on them
//! - A failed submit means the connection is gone; the response is dropped

pub mod pool;

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;

use crate::protocol::packet::MAX_RESPONSE_PAYLOAD;
use crate::protocol::{ErrorCode, Op, Operation, Packet, ProtocolError};

pub use pool::{PoolError, WorkerPool};

/// Origin of jobs and destination of their responses.
///
/// Implemented by server connections; workers only see this trait.
pub trait JobSource: Send + Sync {
    /// Name used to identify the connection in logs.
    fn name(&self) -> &str;

    /// Lock-free liveness check.
    fn is_alive(&self) -> bool;

    /// Frame and write a response. Returns false once the connection is dead.
    fn submit_result(&self, response: Response) -> BoxFuture<'_, bool>;

    /// Gracefully close the connection. Returns true for the one call that
    /// performed the shutdown.
    fn destroy(&self) -> BoxFuture<'_, bool>;
}

/// A received packet waiting for a worker.
pub struct Job {
    pub packet: Packet,
    /// When the packet finished reading.
    pub received_at: Instant,
    pub source: Arc<dyn JobSource>,
}

impl Job {
    pub fn id(&self) -> u32 {
        self.packet.id()
    }

    pub fn opcode(&self) -> Op {
        self.packet.opcode()
    }
}

/// Outcome of one job, addressed back to its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u32,
    /// Opcode of the originating request.
    pub opcode: Op,
    pub outcome: Result<Vec<u8>, ErrorCode>,
    pub received_at: Instant,
    pub completed_at: Instant,
}

impl Response {
    /// Build the response for `job`.
    ///
    /// A payload too large to frame is replaced by an internal error so the
    /// response always serializes.
    pub fn for_job(job: &Job, outcome: Result<Vec<u8>, ErrorCode>) -> Self {
        let outcome = match outcome {
            Ok(payload) if payload.len() > MAX_RESPONSE_PAYLOAD => {
                tracing::warn!(
                    id = job.id(),
                    opcode = %job.opcode(),
                    size = payload.len(),
                    "Result payload too large to frame"
                );
                Err(ErrorCode::Internal)
            }
            other => other,
        };
        Self {
            id: job.id(),
            opcode: job.opcode(),
            outcome,
            received_at: job.received_at,
            completed_at: Instant::now(),
        }
    }

    pub fn error(&self) -> Option<ErrorCode> {
        self.outcome.as_ref().err().copied()
    }

    /// Frame this response under the request's correlation ID and opcode.
    pub fn to_packet(&self) -> Result<Packet, ProtocolError> {
        let operation = match &self.outcome {
            Ok(payload) => Operation::new(self.opcode, payload.clone()),
            Err(code) => Operation::error(self.opcode, *code),
        };
        Packet::new(self.id, operation)
    }
}
