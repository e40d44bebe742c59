//! Server-side connection: a job source over one client stream.
//!
//! # Responsibilities
//! - Read packets under an idle deadline and turn them into jobs
//! - Serialize response writes from many workers onto one stream
//! - Close exactly once, waking a reader blocked on the stream
//! - Classify and log connection failures
//!
//! # Design Decisions
//! - The stream is split; reads and writes each sit behind their own lock,
//!   so a slow reader never delays responses
//! - Liveness is an atomic flag, readable without either lock
//! - Closing drops both halves, so the socket is released even while jobs
//!   still hold the connection
//! - Graceful closure (`destroy`) and failure closure (`force_close`) share
//!   one close signal; only graceful closure silences error logging

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};

use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::protocol::{Op, Packet, ProtocolError};
use crate::server::selector::PoolSelector;
use crate::worker::{Job, JobSource, Response, WorkerPool};

/// Why a connection stopped.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
}

#[derive(Debug, Clone, Copy)]
struct PacketEvent {
    at: Instant,
    id: u32,
    opcode: Op,
}

/// Per-connection traffic counters, rendered into closing log lines.
#[derive(Debug, Clone)]
pub struct ConnStats {
    pub spawned: Instant,
    pub reads: u64,
    pub writes: u64,
    last_read: Option<PacketEvent>,
    last_write: Option<PacketEvent>,
}

impl ConnStats {
    fn new() -> Self {
        Self {
            spawned: Instant::now(),
            reads: 0,
            writes: 0,
            last_read: None,
            last_write: None,
        }
    }
}

impl fmt::Display for ConnStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spawned {:.3?} ago, {} reads, {} writes",
            self.spawned.elapsed(),
            self.reads,
            self.writes
        )?;
        for (label, event) in [("last read", self.last_read), ("last write", self.last_write)] {
            if let Some(event) = event {
                write!(
                    f,
                    ", {} {:.3?} ago (id {}, {})",
                    label,
                    event.at.elapsed(),
                    event.id,
                    event.opcode
                )?;
            }
        }
        Ok(())
    }
}

enum ReadOutcome {
    Packet(Packet),
    Idle,
    Closed,
    Failed(ProtocolError),
}

/// One accepted client connection.
pub struct ServerConnection<S> {
    id: ConnectionId,
    name: String,
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    idle_timeout: Duration,
    write_timeout: Duration,
    selector: Arc<dyn PoolSelector>,
    /// Set once the connection is closed for any reason.
    closed: AtomicBool,
    /// Set by the one `destroy` call that wins.
    server_closing: AtomicBool,
    close_signal: watch::Sender<bool>,
    stats: StdMutex<ConnStats>,
}

impl<S> ServerConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        peer: impl fmt::Display,
        stream: S,
        idle_timeout: Duration,
        write_timeout: Duration,
        selector: Arc<dyn PoolSelector>,
    ) -> Arc<Self> {
        let id = ConnectionId::new();
        let (reader, writer) = tokio::io::split(stream);
        let (close_signal, _) = watch::channel(false);
        Arc::new(Self {
            id,
            name: format!("{}@{}", id, peer),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            idle_timeout,
            write_timeout,
            selector,
            closed: AtomicBool::new(false),
            server_closing: AtomicBool::new(false),
            close_signal,
            stats: StdMutex::new(ConnStats::new()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> ConnStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Read the next packet and pair it with the pool that should run it.
    ///
    /// Returns `None` once the connection is finished: idle expiry, peer
    /// closure, a fatal read error or server-initiated closure.
    pub async fn get_job(self: &Arc<Self>) -> Option<(Job, Arc<WorkerPool>)> {
        if !self.is_alive() {
            return None;
        }

        let mut close_rx = self.close_signal.subscribe();
        let outcome = {
            let mut reader = self.reader.lock().await;
            let outcome = match reader.as_mut() {
                None => ReadOutcome::Closed,
                Some(stream) => tokio::select! {
                    biased;
                    _ = close_rx.wait_for(|closed| *closed) => ReadOutcome::Closed,
                    read = tokio::time::timeout(self.idle_timeout, Packet::read_from(stream)) => match read {
                        Err(_) => ReadOutcome::Idle,
                        Ok(Ok(packet)) => ReadOutcome::Packet(packet),
                        Ok(Err(e)) => ReadOutcome::Failed(e),
                    },
                },
            };
            // Nothing reads from a finished connection again.
            if !matches!(outcome, ReadOutcome::Packet(_)) {
                reader.take();
            }
            outcome
        };

        let packet = match outcome {
            ReadOutcome::Packet(packet) => packet,
            ReadOutcome::Idle => {
                tracing::debug!(connection = %self.name, timeout = ?self.idle_timeout, "Connection idle");
                self.destroy().await;
                return None;
            }
            // Whoever closed the connection already reported it.
            ReadOutcome::Closed => return None,
            ReadOutcome::Failed(e) => {
                let err = ConnError::Protocol(e);
                self.log_conn_err(Some(&err));
                self.force_close().await;
                return None;
            }
        };

        let received_at = Instant::now();
        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.reads += 1;
            stats.last_read = Some(PacketEvent {
                at: received_at,
                id: packet.id(),
                opcode: packet.opcode(),
            });
        }
        metrics::record_request(packet.opcode());
        tracing::trace!(connection = %self.name, id = packet.id(), opcode = %packet.opcode(), "Packet read");

        let pool = self.selector.select_pool(&packet);
        let source: Arc<dyn JobSource> = self.clone();
        Some((
            Job {
                packet,
                received_at,
                source,
            },
            pool,
        ))
    }

    /// Frame and write one response. Returns false if the connection is dead
    /// or the write failed.
    ///
    /// # Panics
    /// If the response cannot be serialized. Worker-built responses are
    /// clamped to a frameable size, so this indicates a bug.
    pub async fn submit_result(&self, response: Response) -> bool {
        if !self.is_alive() {
            return false;
        }

        let bytes = match response.to_packet().and_then(|packet| packet.marshal_binary()) {
            Ok(bytes) => bytes,
            Err(e) => panic!("failed to serialize response {}: {}", response.id, e),
        };

        let written = {
            let mut writer = self.writer.lock().await;
            let Some(stream) = writer.as_mut().filter(|_| self.is_alive()) else {
                return false;
            };
            tokio::time::timeout(self.write_timeout, async {
                stream.write_all(&bytes).await?;
                stream.flush().await
            })
            .await
        };

        let err = match written {
            Ok(Ok(())) => {
                let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
                stats.writes += 1;
                stats.last_write = Some(PacketEvent {
                    at: Instant::now(),
                    id: response.id,
                    opcode: response.opcode,
                });
                drop(stats);
                metrics::record_request_duration(response.opcode, response.received_at, response.error());
                return true;
            }
            Ok(Err(e)) => ConnError::Protocol(ProtocolError::Io(e)),
            Err(_) => ConnError::WriteTimeout(self.write_timeout),
        };

        self.log_conn_err(Some(&err));
        self.force_close().await;
        false
    }

    /// Gracefully close the connection, waking any blocked reader.
    ///
    /// Returns true only for the call that initiated the shutdown.
    pub async fn destroy(&self) -> bool {
        if self
            .server_closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.log_conn_err(None);
        self.force_close().await;
        true
    }

    /// Log why the connection is going away.
    ///
    /// `None` means server-initiated closure. Errors raised after the server
    /// began closing are expected and suppressed.
    pub fn log_conn_err(&self, err: Option<&ConnError>) {
        if err.is_some() && self.server_closing.load(Ordering::SeqCst) {
            return;
        }
        let stats = self.stats();
        match err {
            None => tracing::debug!(connection = %self.name, stats = %stats, "Server closing connection"),
            Some(ConnError::Protocol(ProtocolError::Closed)) => {
                tracing::debug!(connection = %self.name, stats = %stats, "Connection closed by client")
            }
            Some(e) => {
                metrics::record_connection_failure();
                tracing::error!(connection = %self.name, error = %e, stats = %stats, "Connection error");
            }
        }
    }

    async fn force_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_signal.send_replace(true);
        // A writer stuck on a full socket holds the lock for at most the write deadline.
        if let Ok(mut writer) = tokio::time::timeout(self.write_timeout, self.writer.lock()).await {
            if let Some(mut stream) = writer.take() {
                let _ = tokio::time::timeout(self.write_timeout, stream.shutdown()).await;
            }
        }
        // A reader blocked in `get_job` holds the lock and drops the half itself.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }
}

impl<S> JobSource for ServerConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&self) -> bool {
        ServerConnection::is_alive(self)
    }

    fn submit_result(&self, response: Response) -> BoxFuture<'_, bool> {
        Box::pin(ServerConnection::submit_result(self, response))
    }

    fn destroy(&self) -> BoxFuture<'_, bool> {
        Box::pin(ServerConnection::destroy(self))
    }
}
