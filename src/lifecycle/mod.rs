//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Logging/metrics → TLS → Pools → Listener
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Destroy connections → Stop pools
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then pools, then the listener
//! - Ordered shutdown: stop accept, close connections, join workers

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
