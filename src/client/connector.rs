//! Transport establishment for keyless clients.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::net::tls::server_name_for;

/// A bidirectional byte stream to a keyserver.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports to keyserver addresses.
pub trait Connect: Send + Sync {
    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxedTransport>>;
}

async fn tcp_connect(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr)))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Mutually authenticated TLS over TCP.
pub struct TlsConnector {
    config: Arc<rustls::ClientConfig>,
    timeout: Duration,
}

impl TlsConnector {
    pub fn new(config: Arc<rustls::ClientConfig>, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

impl Connect for TlsConnector {
    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxedTransport>> {
        Box::pin(async move {
            let name = server_name_for(addr).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let connector = tokio_rustls::TlsConnector::from(Arc::clone(&self.config));

            // One deadline covers both TCP connect and handshake.
            let stream = tokio::time::timeout(self.timeout, async {
                let tcp = tcp_connect(addr, self.timeout).await?;
                connector.connect(name, tcp).await
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("TLS connect to {} timed out", addr)))??;

            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}

/// Plain TCP, for deployments that terminate TLS elsewhere and for tests.
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Connect for TcpConnector {
    fn connect<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxedTransport>> {
        Box::pin(async move {
            let stream = tcp_connect(addr, self.timeout).await?;
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_connector_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let connector = TcpConnector::new(Duration::from_secs(1));
        let (connected, accepted) = tokio::join!(connector.connect(&addr), listener.accept());
        assert!(connected.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn tcp_connector_reports_refusal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = TcpConnector::new(Duration::from_secs(1));
        assert!(connector.connect(&addr).await.is_err());
    }
}
