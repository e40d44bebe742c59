//! Configuration schema definitions.
//!
//! This module defines the configuration structures for the keyserver and the
//! keyless client. All types derive Serde traits for deserialization from
//! config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::PoolClass;

/// Root configuration for the keyserver.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Worker pool sizing per operation class.
    pub pools: PoolsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:2407").
    pub bind_address: String,

    /// Optional TLS configuration. Plain TCP when absent.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2407".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// Server TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// CA bundle used to authenticate client certificates (PEM).
    /// Client certificates are required when set.
    pub client_ca_path: Option<String>,
}

/// Timeout configuration for server connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle connection timeout in seconds: longest wait for the next packet.
    pub idle_secs: u64,

    /// Bound on writing one response, in seconds.
    pub write_secs: u64,

    /// TLS handshake timeout in seconds.
    pub handshake_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: 300,
            write_secs: 10,
            handshake_secs: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }
}

/// Sizing for a single worker pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Number of persistent workers.
    pub workers: usize,

    /// Bounded queue capacity.
    pub queue_size: usize,
}

/// Worker pools, one per operation class.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// Pings and rejected opcodes.
    pub control: PoolConfig,

    /// ECDSA and Ed25519 signatures.
    pub ecdsa: PoolConfig,

    /// RSA signatures and decryption.
    pub rsa: PoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            control: PoolConfig {
                workers: 2,
                queue_size: 1024,
            },
            ecdsa: PoolConfig {
                workers: 4,
                queue_size: 1024,
            },
            rsa: PoolConfig {
                workers: 4,
                queue_size: 1024,
            },
        }
    }
}

impl PoolsConfig {
    pub fn get(&self, class: PoolClass) -> &PoolConfig {
        match class {
            PoolClass::Control => &self.control,
            PoolClass::Ecdsa => &self.ecdsa,
            PoolClass::Rsa => &self.rsa,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "json").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Keyless client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client certificate presented to keyservers (PEM).
    pub cert_path: Option<String>,

    /// Private key for the client certificate (PEM).
    pub key_path: Option<String>,

    /// CA bundle used to verify keyservers (PEM).
    pub ca_path: Option<String>,

    /// Connection establishment timeout (TCP + TLS) in seconds.
    pub connect_secs: u64,

    /// Time to wait for a response to one request, in seconds.
    pub request_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            ca_path: None,
            connect_secs: 5,
            request_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}
