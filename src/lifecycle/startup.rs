//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Initialize metrics, TLS and worker pools in dependency order
//! - Bind the listener and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listener binds last (traffic only when ready)

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;

use crate::config::validation::{validate_config, ValidationError};
use crate::config::ServerConfig;
use crate::lifecycle::Shutdown;
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::{self, TlsError};
use crate::observability::metrics;
use crate::ops::Keystore;
use crate::server::KeyServer;

/// Error type for startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {}", join(.0))]
    Config(Vec<ValidationError>),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Run a keyserver until `shutdown` fires.
pub async fn run(
    config: ServerConfig,
    keystore: Arc<dyn Keystore>,
    shutdown: &Shutdown,
) -> Result<(), StartupError> {
    validate_config(&config).map_err(StartupError::Config)?;

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let acceptor = match &config.listener.tls {
        Some(tls_config) => Some(TlsAcceptor::from(tls::server_config(tls_config)?)),
        None => {
            tracing::warn!("TLS disabled, serving plaintext");
            None
        }
    };

    let server = KeyServer::new(&config, keystore);
    let listener = Listener::bind(&config.listener).await?;

    tracing::info!(
        bind_address = %config.listener.bind_address,
        control_workers = config.pools.control.workers,
        ecdsa_workers = config.pools.ecdsa.workers,
        rsa_workers = config.pools.rsa.workers,
        "Keyserver ready"
    );

    server.run(listener, acceptor, shutdown.subscribe()).await;
    Ok(())
}
