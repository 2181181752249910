//! Secure transport subsystem.
//!
//! # Data Flow
//! ```text
//! SecureConfiguration (per role, shared as Arc)
//!     → handshake.rs (client or server session, trust policy from tls.rs)
//!     → connection.rs (secure stream, byte I/O, close sequencing)
//!     → engine.rs (external packet engine reads and dispatches)
//!
//! Server side:
//!     listener.rs (accept, connection limits)
//!     → container.rs (handshake task per socket, registry, events)
//!
//! Connection States:
//!     Handshaking → Open → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - No connection handle exists until its handshake succeeded
//! - Each connection's reads run on their own task
//! - Close is idempotent and records the first reason only

pub mod configuration;
pub mod connection;
pub mod container;
pub mod engine;
pub mod handshake;
pub mod listener;
pub mod tls;
