//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Logging/metrics → Secure configuration → Start container
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Close connections (ServerShutdown) → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then observability, then the listener
//! - Ordered shutdown: stop accept, then close

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
