//! A multiplexed client connection to one keyserver.
//!
//! # Data Flow
//! ```text
//! do_operation ─ allocate id ─ register waiter ─ queue frame
//!                                                    │
//!                          writer task ◄─────────────┘ (whole frames only)
//!
//! reader task ◄─────────── responses in any order
//!     → look up waiter by id → deliver
//! ```
//!
//! # Design Decisions
//! - Many requests may be in flight; responses are matched by correlation ID
//! - Only the writer task touches the write half, so a caller that gives up
//!   never leaves half a frame on the wire
//! - A request that times out or is cancelled gives up its waiter; its ID is
//!   remembered (up to [`MAX_ABANDONED`]) so a late reply is dropped quietly
//! - Any other response with an unknown ID means the stream can't be
//!   trusted; close

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::client::connector::BoxedTransport;
use crate::client::ClientError;
use crate::protocol::{Op, Operation, Packet, ProtocolError};

/// Abandoned request IDs remembered per connection. Older ones are
/// forgotten, and a reply to one of those closes the connection.
pub const MAX_ABANDONED: usize = 1024;

const FRAME_QUEUE: usize = 256;

#[derive(Default)]
struct Requests {
    waiters: HashMap<u32, oneshot::Sender<Operation>>,
    abandoned: HashSet<u32>,
    abandoned_order: VecDeque<u32>,
}

enum Settled {
    Waiting(oneshot::Sender<Operation>),
    Abandoned,
    Unknown,
}

impl Requests {
    fn is_free(&self, id: u32) -> bool {
        !self.waiters.contains_key(&id) && !self.abandoned.contains(&id)
    }

    /// Drop the waiter for `id` and expect a reply nobody will read.
    fn abandon(&mut self, id: u32) {
        if self.waiters.remove(&id).is_none() || !self.abandoned.insert(id) {
            return;
        }
        self.abandoned_order.push_back(id);
        while self.abandoned_order.len() > MAX_ABANDONED {
            if let Some(oldest) = self.abandoned_order.pop_front() {
                self.abandoned.remove(&oldest);
            }
        }
    }

    fn settle(&mut self, id: u32) -> Settled {
        if let Some(tx) = self.waiters.remove(&id) {
            Settled::Waiting(tx)
        } else if self.abandoned.remove(&id) {
            self.abandoned_order.retain(|&old| old != id);
            Settled::Abandoned
        } else {
            Settled::Unknown
        }
    }

    fn clear(&mut self) {
        self.waiters.clear();
        self.abandoned.clear();
        self.abandoned_order.clear();
    }
}

/// State shared between the handle and its reader and writer tasks.
struct Shared {
    addr: String,
    open: AtomicBool,
    requests: StdMutex<Requests>,
}

impl Shared {
    fn requests(&self) -> std::sync::MutexGuard<'_, Requests> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark closed, then fail everything still waiting.
    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.requests().clear();
    }
}

/// Retires a request's waiter unless a response was delivered.
struct Pending<'a> {
    shared: &'a Shared,
    id: u32,
    sent: bool,
    answered: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        let mut requests = self.shared.requests();
        if self.sent {
            requests.abandon(self.id);
        } else {
            requests.waiters.remove(&self.id);
        }
    }
}

/// Client side of one keyserver connection.
pub struct Conn {
    shared: Arc<Shared>,
    frames: mpsc::Sender<Vec<u8>>,
    next_id: AtomicU32,
    request_timeout: Duration,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Conn {
    /// Take ownership of `transport` and start the reader and writer tasks.
    pub fn spawn(addr: impl Into<String>, transport: BoxedTransport, request_timeout: Duration) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(transport);
        let shared = Arc::new(Shared {
            addr: addr.into(),
            open: AtomicBool::new(true),
            requests: StdMutex::default(),
        });
        let (frames, queue) = mpsc::channel(FRAME_QUEUE);

        let tasks = vec![
            tokio::spawn(read_responses(Arc::clone(&shared), reader)),
            tokio::spawn(write_requests(Arc::clone(&shared), writer, queue)),
        ];

        Arc::new(Self {
            shared,
            frames,
            next_id: AtomicU32::new(1),
            request_timeout,
            tasks: StdMutex::new(tasks),
        })
    }

    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.shared.requests().waiters.len()
    }

    /// Send one operation and wait for its response.
    ///
    /// A response carrying an error tag becomes [`ClientError::Remote`].
    /// Dropping the returned future at any point leaves the connection usable.
    pub async fn do_operation(&self, operation: Operation) -> Result<Operation, ClientError> {
        if !self.is_open() {
            return Err(self.closed());
        }

        let (tx, rx) = oneshot::channel();
        let mut pending = Pending {
            shared: self.shared.as_ref(),
            id: self.register(tx),
            sent: false,
            answered: false,
        };
        let id = pending.id;
        // The tasks mark the connection closed before dropping waiters.
        if !self.is_open() {
            return Err(self.closed());
        }

        let bytes = Packet::new(id, operation).and_then(|packet| packet.marshal_binary())?;
        self.frames.send(bytes).await.map_err(|_| self.closed())?;
        pending.sent = true;

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => {
                pending.answered = true;
                response
            }
            Ok(Err(_)) => return Err(self.closed()),
            Err(_) => {
                tracing::debug!(server = %self.shared.addr, id, "Request timed out");
                return Err(ClientError::Timeout {
                    addr: self.shared.addr.clone(),
                    id,
                });
            }
        };

        match response.error {
            Some(code) => Err(ClientError::Remote(code)),
            None => Ok(response),
        }
    }

    /// Round-trip `data` through the keyserver's echo operation.
    pub async fn ping(&self, data: &[u8]) -> Result<Vec<u8>, ClientError> {
        let response = self.do_operation(Operation::new(Op::Ping, data.to_vec())).await?;
        Ok(response.payload)
    }

    /// Close the connection. Pending requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            tracing::debug!(server = %self.shared.addr, "Closing keyserver connection");
        }
        for task in std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner)) {
            task.abort();
        }
        self.shared.shut();
    }

    fn closed(&self) -> ClientError {
        ClientError::ConnectionClosed(self.shared.addr.clone())
    }

    fn register(&self, tx: oneshot::Sender<Operation>) -> u32 {
        let mut requests = self.shared.requests();
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            // After wraparound an old request may still hold this id.
            if !requests.is_free(id) {
                continue;
            }
            if let Entry::Vacant(slot) = requests.waiters.entry(id) {
                slot.insert(tx);
                return id;
            }
        }
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_requests(shared: Arc<Shared>, mut writer: WriteHalf<BoxedTransport>, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(server = %shared.addr, error = %e, "Keyserver write failed");
            break;
        }
    }
    shared.shut();
    let _ = writer.shutdown().await;
}

async fn read_responses(shared: Arc<Shared>, mut reader: ReadHalf<BoxedTransport>) {
    loop {
        match Packet::read_from(&mut reader).await {
            Ok(packet) => {
                let id = packet.id();
                let settled = shared.requests().settle(id);
                match settled {
                    Settled::Waiting(tx) => {
                        let _ = tx.send(packet.operation);
                    }
                    Settled::Abandoned => {
                        tracing::debug!(server = %shared.addr, id, "Discarding reply to abandoned request");
                    }
                    Settled::Unknown => {
                        tracing::error!(server = %shared.addr, id, "Response for unknown request");
                        break;
                    }
                }
            }
            Err(ProtocolError::Closed) => {
                tracing::debug!(server = %shared.addr, "Keyserver closed connection");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %shared.addr, error = %e, "Keyserver connection failed");
                break;
            }
        }
    }
    shared.shut();
}
