//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TlsSettings::to_configuration (credentials loaded from disk)
//!     → Arc<SecureConfiguration> handed to the container
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → container swaps its handshake template
//!     → new connections use the new template
//! ```
//!
//! # Design Decisions
//! - Established connections keep the configuration they were created with
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::CredentialConfig;
pub use schema::ListenerConfig;
pub use schema::LogFormat;
pub use schema::ObservabilityConfig;
pub use schema::TlsSettings;
pub use schema::TransportConfig;
