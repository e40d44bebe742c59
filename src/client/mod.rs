//! Keyless client: routes private-key operations to keyservers.
//!
//! # Responsibilities
//! - Cache one multiplexed connection per keyserver address
//! - Map each key's SKI to the keyservers that hold it
//! - Pick a healthy keyserver for a key, dialing new ones as needed
//!
//! # Data Flow
//! ```text
//! PrivateKey::sign
//!     → Client::dial_any(ski)
//!         → an open cached connection to one of ski's servers, else
//!         → dial candidates in random order until one succeeds
//!     → Conn::do_operation
//! ```
//!
//! # Design Decisions
//! - The SKI → servers registry only grows; failed dials never prune it
//! - Dialing happens outside every lock; a lost dial race keeps the
//!   connection that was cached first

pub mod conn;
pub mod connector;
pub mod key;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use rand::Rng;

use crate::config::ClientConfig;
use crate::net::tls::{self, TlsError};
use crate::observability::metrics;
use crate::protocol::{spki_from_cert_der, ErrorCode, KeyParseError, Op, ProtocolError, Ski};

pub use conn::Conn;
pub use connector::{BoxedTransport, Connect, TcpConnector, TlsConnector, Transport};
pub use key::PrivateKey;

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client transport is not configured")]
    NotConfigured,
    #[error("no keyservers registered for key {0}")]
    NoServers(Ski),
    #[error("couldn't dial any of the {attempted} keyservers for key {ski}")]
    NoReachableServer { ski: Ski, attempted: usize },
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to {0} is closed")]
    ConnectionClosed(String),
    #[error("request {id} to {addr} timed out")]
    Timeout { addr: String, id: u32 },
    #[error("keyserver returned error: {0}")]
    Remote(ErrorCode),
    #[error("{0} is not a signing operation")]
    Unsupported(Op),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Key(#[from] KeyParseError),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

struct ClientInner {
    connector: StdMutex<Option<Arc<dyn Connect>>>,
    request_timeout: Duration,
    conns: StdMutex<HashMap<String, Arc<Conn>>>,
    servers: StdMutex<HashMap<Ski, Vec<String>>>,
}

/// Shared handle to a keyless client. Clones share connections and the
/// key registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// A client with no transport. Dials fail with
    /// [`ClientError::NotConfigured`] until [`Client::configure`] is called.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connector: StdMutex::new(None),
                request_timeout: config.request_timeout(),
                conns: StdMutex::default(),
                servers: StdMutex::default(),
            }),
        }
    }

    /// A client that opens transports through `connector`.
    pub fn with_connector(config: &ClientConfig, connector: Arc<dyn Connect>) -> Self {
        let client = Self::new(config);
        client.configure(connector);
        client
    }

    /// Build a mutually authenticated TLS client from configuration.
    ///
    /// Without a CA bundle the client is left unconfigured.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = Self::new(config);
        if let Some(ca_path) = &config.ca_path {
            let cert_and_key = match (&config.cert_path, &config.key_path) {
                (Some(cert), Some(key)) => Some((Path::new(cert), Path::new(key))),
                _ => None,
            };
            let tls = tls::client_config(Path::new(ca_path), cert_and_key)?;
            client.configure(Arc::new(TlsConnector::new(tls, config.connect_timeout())));
        }
        Ok(client)
    }

    /// Install the transport used for new dials.
    pub fn configure(&self, connector: Arc<dyn Connect>) {
        *self.inner.connector.lock().unwrap_or_else(PoisonError::into_inner) = Some(connector);
    }

    fn connector(&self) -> Result<Arc<dyn Connect>, ClientError> {
        self.inner
            .connector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ClientError::NotConfigured)
    }

    /// Open cached connection to `server`, if any. Closed ones are evicted.
    fn cached(&self, server: &str) -> Option<Arc<Conn>> {
        let mut conns = self.inner.conns.lock().unwrap_or_else(PoisonError::into_inner);
        match conns.get(server) {
            Some(conn) if conn.is_open() => Some(Arc::clone(conn)),
            Some(_) => {
                conns.remove(server);
                None
            }
            None => None,
        }
    }

    /// Return the connection to `server`, dialing if none is open.
    pub async fn dial(&self, server: &str) -> Result<Arc<Conn>, ClientError> {
        let connector = self.connector()?;
        if let Some(conn) = self.cached(server) {
            return Ok(conn);
        }

        tracing::debug!(server, "Dialing keyserver");
        let transport = connector.connect(server).await.map_err(|source| {
            metrics::record_dial_failure();
            ClientError::Dial {
                addr: server.to_string(),
                source,
            }
        })?;
        let conn = Conn::spawn(server, transport, self.inner.request_timeout);

        let mut conns = self.inner.conns.lock().unwrap_or_else(PoisonError::into_inner);
        match conns.get(server) {
            Some(existing) if existing.is_open() => {
                conn.close();
                Ok(Arc::clone(existing))
            }
            _ => {
                conns.insert(server.to_string(), Arc::clone(&conn));
                tracing::info!(server, "Connected to keyserver");
                Ok(conn)
            }
        }
    }

    /// Return a connection to some keyserver holding `ski`.
    ///
    /// Prefers an already-open connection chosen at random; otherwise dials
    /// the registered servers in random order until one answers.
    pub async fn dial_any(&self, ski: &Ski) -> Result<Arc<Conn>, ClientError> {
        let mut candidates = self.servers_for(ski);
        if candidates.is_empty() {
            return Err(ClientError::NoServers(*ski));
        }
        self.connector()?;

        let open: Vec<Arc<Conn>> = {
            let conns = self.inner.conns.lock().unwrap_or_else(PoisonError::into_inner);
            candidates
                .iter()
                .filter_map(|server| conns.get(server))
                .filter(|conn| conn.is_open())
                .cloned()
                .collect()
        };
        if !open.is_empty() {
            let pick = rand::thread_rng().gen_range(0..open.len());
            return Ok(Arc::clone(&open[pick]));
        }

        let attempted = candidates.len();
        while !candidates.is_empty() {
            let pick = rand::thread_rng().gen_range(0..candidates.len());
            let server = candidates.swap_remove(pick);
            match self.dial(&server).await {
                Ok(conn) => return Ok(conn),
                Err(e) => tracing::warn!(server = %server, ski = %ski, error = %e, "Couldn't dial keyserver"),
            }
        }
        Err(ClientError::NoReachableServer { ski: *ski, attempted })
    }

    /// Keyservers registered for `ski`, in registration order.
    pub fn servers_for(&self, ski: &Ski) -> Vec<String> {
        self.inner
            .servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ski)
            .cloned()
            .unwrap_or_default()
    }

    fn register_ski(&self, server: &str, ski: Ski) {
        self.inner
            .servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(ski)
            .or_default()
            .push(server.to_string());
    }

    /// Record that `server` holds the private half of a DER-encoded
    /// SubjectPublicKeyInfo and return a handle for it.
    pub fn register_public_key(&self, server: &str, spki_der: &[u8]) -> Result<PrivateKey, ClientError> {
        let ski = Ski::from_spki_der(spki_der)?;
        self.register_ski(server, ski);
        tracing::debug!(server, ski = %ski, "Registered key");
        Ok(PrivateKey::new(spki_der.to_vec(), ski, self.clone()))
    }

    /// Like [`Client::register_public_key`], taking the key from a DER
    /// certificate.
    pub fn register_cert(&self, server: &str, cert_der: &[u8]) -> Result<PrivateKey, ClientError> {
        let spki = spki_from_cert_der(cert_der)?;
        self.register_public_key(server, &spki)
    }
}
