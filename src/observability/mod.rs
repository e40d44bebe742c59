//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields (connection, opcode, id) on every connection event
//! - Metrics are cheap (atomic increments behind the `metrics` facade)
//! - Expected closures (idle timeout, peer hang-up) stay at debug level

pub mod logging;
pub mod metrics;
