//! Keyserver socket listener.
//!
//! Each accepted socket holds a [`ConnectionPermit`] until its connection
//! task ends, so at most `listener.max_connections` clients are served at
//! once. Further clients queue in the kernel backlog rather than being
//! refused.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid bind address '{0}'")]
    Address(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
    #[error("listener is closed")]
    Closed,
}

/// A socket accepted by the keyserver, with its connection slot.
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub permit: ConnectionPermit,
}

pub struct Listener {
    tcp: TcpListener,
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|_| ListenerError::Address(config.bind_address.clone()))?;
        let tcp = TcpListener::bind(addr).await.map_err(|source| ListenerError::Bind {
            addr: config.bind_address.clone(),
            source,
        })?;
        Self::from_tcp(tcp, config.max_connections)
    }

    /// Serve on a socket the caller already bound, e.g. an ephemeral port.
    pub fn from_tcp(tcp: TcpListener, max_connections: usize) -> Result<Self, ListenerError> {
        let local = tcp.local_addr().map_err(|source| ListenerError::Bind {
            addr: "<unknown>".into(),
            source,
        })?;
        tracing::info!(address = %local, max_connections, "Keyserver listening");

        Ok(Self {
            tcp,
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Wait for a free connection slot, then for the next client.
    ///
    /// Responses are small and latency bound, so Nagle is disabled on every
    /// accepted socket.
    pub async fn accept(&self) -> Result<Accepted, ListenerError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;
        let (stream, peer) = self.tcp.accept().await.map_err(ListenerError::Accept)?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        tracing::debug!(peer = %peer, free_slots = self.slots.available_permits(), "Client accepted");

        Ok(Accepted {
            stream,
            peer,
            permit: ConnectionPermit { _slot: permit },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Connection slots not held by a live client.
    pub fn available_permits(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Holds one of the listener's connection slots; dropping it frees the slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    _slot: OwnedSemaphorePermit,
}
