//! Keyserver: accepts client connections and multiplexes their requests
//! onto worker pools.
//!
//! # Data Flow
//! ```text
//! Listener::accept
//!     → TLS handshake (when configured, bounded by handshake timeout)
//!     → ServerConnection (tracked for shutdown)
//!     → dispatch loop: get_job → selector → pool.submit
//!     → workers write responses back through the connection
//! ```
//!
//! # Design Decisions
//! - One dispatch task per connection; it only reads and enqueues
//! - A full pool queue stalls that connection's reads (backpressure)
//! - Responses are written in completion order, not request order

pub mod conn;
pub mod selector;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

use crate::config::{ServerConfig, TimeoutConfig};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Accepted, ConnectionPermit, Listener, ListenerError};
use crate::observability::metrics;
use crate::ops::{Executor, Keystore};

pub use conn::{ConnError, ConnStats, ServerConnection};
pub use selector::{OpcodeSelector, PoolSelector};

/// A keyless keyserver bound to a set of worker pools.
pub struct KeyServer {
    timeouts: TimeoutConfig,
    selector: Arc<OpcodeSelector>,
    tracker: ConnectionTracker,
}

impl KeyServer {
    /// Spawn the worker pools. Must be called from within a Tokio runtime.
    pub fn new(config: &ServerConfig, keystore: Arc<dyn Keystore>) -> Self {
        let executor = Arc::new(Executor::new(keystore));
        Self {
            timeouts: config.timeouts.clone(),
            selector: Arc::new(OpcodeSelector::new(&config.pools, executor)),
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept connections until `shutdown` fires, then close every live
    /// connection and stop the pools.
    pub async fn run(
        self,
        listener: Listener,
        tls: Option<TlsAcceptor>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(Accepted { stream, peer, permit }) => self.spawn_connection(stream, peer, permit, tls.clone()),
                    Err(ListenerError::Closed) => break,
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!(connections = self.tracker.active_count(), "Keyserver shutting down");
        let closed = self.tracker.destroy_all().await;
        self.selector.shutdown().await;
        tracing::info!(closed, "Keyserver stopped");
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: ConnectionPermit,
        tls: Option<TlsAcceptor>,
    ) {
        let selector: Arc<dyn PoolSelector> = self.selector.clone();
        let tracker = self.tracker.clone();
        let timeouts = self.timeouts.clone();

        tokio::spawn(async move {
            let _permit = permit;

            match tls {
                Some(acceptor) => {
                    match tokio::time::timeout(timeouts.handshake(), acceptor.accept(stream)).await {
                        Ok(Ok(stream)) => {
                            let conn = ServerConnection::new(peer, stream, timeouts.idle(), timeouts.write(), selector);
                            serve_connection(conn, &tracker).await;
                        }
                        Ok(Err(e)) => {
                            metrics::record_connection_failure();
                            tracing::warn!(peer = %peer, error = %e, "TLS handshake failed");
                        }
                        Err(_) => {
                            metrics::record_connection_failure();
                            tracing::warn!(peer = %peer, "TLS handshake timed out");
                        }
                    }
                }
                None => {
                    let conn = ServerConnection::new(peer, stream, timeouts.idle(), timeouts.write(), selector);
                    serve_connection(conn, &tracker).await;
                }
            }
        });
    }
}

/// Drive one connection: read jobs and hand them to their pools until the
/// connection finishes.
pub async fn serve_connection<S>(conn: Arc<ServerConnection<S>>, tracker: &ConnectionTracker)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let _guard = tracker.track(conn.id(), conn.clone());
    tracing::debug!(connection = %conn.name(), "Connection established");

    while let Some((job, pool)) = conn.get_job().await {
        if let Err(e) = pool.submit(job).await {
            metrics::record_pool_rejection(pool.name());
            tracing::warn!(connection = %conn.name(), error = %e, "Job rejected");
            conn.destroy().await;
            break;
        }
    }
}
