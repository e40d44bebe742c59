//! Keyless keyserver
//!
//! Terminates keyless client connections and performs private-key
//! operations on their behalf.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────┐
//!                        │                  KEYSERVER                   │
//!                        │                                              │
//!   Keyless client  ─────┼─▶ net::listener ─▶ TLS ─▶ server::conn       │
//!   (many requests       │                              │ get_job       │
//!    in flight)          │                              ▼               │
//!                        │                      server::selector        │
//!                        │               ┌──────────┼──────────┐        │
//!                        │               ▼          ▼          ▼        │
//!                        │            control     ecdsa       rsa       │
//!                        │             pool       pool       pool       │
//!                        │               └──────────┼──────────┘        │
//!                        │                          ▼                   │
//!   responses, in   ◀────┼──────────── submit_result (write lock)       │
//!   completion order     │                                              │
//!                        └──────────────────────────────────────────────┘
//! ```
//!
//! Keys are supplied through the [`keyless::Keystore`] trait. This binary
//! starts with an empty in-memory keystore, which answers pings and reports
//! `KeyNotFound` for everything else.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use keyless::config::loader::load_config;
use keyless::config::ServerConfig;
use keyless::lifecycle::{signals, startup, Shutdown};
use keyless::observability::logging::init_logging;
use keyless::MemoryKeystore;

#[derive(Parser)]
#[command(name = "keyless-server")]
#[command(about = "Keyless TLS private-key server", long_about = None)]
struct Args {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "keyless-server starting");

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    startup::run(config, Arc::new(MemoryKeystore::new()), &shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
