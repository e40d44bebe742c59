//! Shared utilities for keyserver integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use keyless::client::TcpConnector;
use keyless::net::connection::ConnectionTracker;
use keyless::net::listener::Listener;
use keyless::protocol::{ErrorCode, Op};
use keyless::{Client, ClientConfig, KeyOperator, KeyServer, Keystore, ServerConfig, Shutdown};

/// A keyserver running on an ephemeral local port, without TLS.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub tracker: ConnectionTracker,
    pub handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("keyserver did not stop")
            .expect("keyserver task panicked");
    }
}

pub async fn start_keyserver(config: ServerConfig, keystore: Arc<dyn Keystore>) -> TestServer {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let listener = Listener::from_tcp(tcp, config.listener.max_connections).unwrap();

    let shutdown = Shutdown::new();
    let server = KeyServer::new(&config, keystore);
    let tracker = server.tracker().clone();
    let signal = shutdown.subscribe();
    let handle = tokio::spawn(server.run(listener, None, signal));

    TestServer {
        addr,
        shutdown,
        tracker,
        handle,
    }
}

/// A plaintext client with short timeouts.
pub fn tcp_client() -> Client {
    let config = ClientConfig {
        connect_secs: 1,
        request_secs: 5,
        ..ClientConfig::default()
    };
    Client::with_connector(&config, Arc::new(TcpConnector::new(config.connect_timeout())))
}

/// An address nothing listens on.
pub async fn unreachable_addr() -> String {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    drop(tcp);
    addr.to_string()
}

/// Signs by returning the digest reversed, optionally after a delay.
pub struct ReversingKey {
    pub delay: Duration,
}

impl KeyOperator for ReversingKey {
    fn sign(&self, _op: Op, digest: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(digest.iter().rev().copied().collect())
    }
}

/// Ed25519 SubjectPublicKeyInfo around `raw`.
pub fn ed25519_spki(raw: [u8; 32]) -> Vec<u8> {
    let mut der = vec![0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00];
    der.extend_from_slice(&raw);
    der
}
