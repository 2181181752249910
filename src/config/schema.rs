//! Configuration schema definitions.
//!
//! This module defines the on-disk configuration for the secure transport
//! server. All types derive Serde traits for deserialization from TOML.

use serde::{Deserialize, Serialize};

use crate::net::configuration::TlsProtocol;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Where the secure connection container listens.
    pub listener: ListenerConfig,

    /// Trust policy, timeouts and credentials.
    pub tls: TlsSettings,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// IP address to bind (e.g., "0.0.0.0").
    pub address: String,

    /// TCP port; 0 picks an ephemeral port.
    pub port: u16,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 4433,
            max_connections: 10_000,
        }
    }
}

/// A certificate bundle on disk.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CredentialConfig {
    /// PEM file holding the certificate chain and private key.
    pub path: String,

    /// Password of an encrypted private key.
    pub password: Option<String>,

    /// Resolve `path` against the directory of the running executable.
    pub relative_to_executable: bool,
}

/// TLS section, mirroring [`crate::net::configuration::SecureConfiguration`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSettings {
    pub allow_untrusted_certificates: bool,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub leave_inner_stream_open: bool,
    pub force_flush: bool,
    pub check_client_revocation: bool,
    pub require_client_certificate: bool,
    pub target_host: String,
    pub protocol: TlsProtocol,

    /// Certificate presented when accepting connections.
    pub server_credential: Option<CredentialConfig>,

    /// Certificates offered when dialing with mutual authentication.
    pub client_credentials: Vec<CredentialConfig>,

    /// PEM files of CA certificates trusted for peer verification.
    pub trust_anchors: Vec<String>,

    /// PEM files of certificate revocation lists.
    pub revocation_lists: Vec<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            allow_untrusted_certificates: true,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
            handshake_timeout_ms: 10_000,
            leave_inner_stream_open: false,
            force_flush: true,
            check_client_revocation: true,
            require_client_certificate: false,
            target_host: "localhost".to_string(),
            protocol: TlsProtocol::Tls12,
            server_credential: None,
            client_credentials: Vec::new(),
            trust_anchors: Vec::new(),
            revocation_lists: Vec::new(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
