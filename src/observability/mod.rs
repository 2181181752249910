//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Handshakes, connections, container:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection ID flows through every connection log event
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
