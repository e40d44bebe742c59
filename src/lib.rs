//! Keyless TLS private-key offload: keyserver and client library.

pub mod client;
pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod ops;
pub mod protocol;
pub mod server;
pub mod worker;

pub use client::{Client, ClientError, PrivateKey};
pub use config::{ClientConfig, ServerConfig};
pub use lifecycle::Shutdown;
pub use ops::{KeyOperator, Keystore, MemoryKeystore};
pub use server::KeyServer;
