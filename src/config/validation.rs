//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Check that credential entries name a file
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - Credential files are opened later, when the secure configuration is built

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::config::schema::{CredentialConfig, TransportConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.address `{0}` is not an IP address")]
    InvalidListenAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("tls.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("tls.target_host must not be empty")]
    EmptyTargetHost,

    #[error("tls.server_credential is required to accept secure connections")]
    MissingServerCredential,

    #[error("{0}.path must not be empty")]
    EmptyCredentialPath(String),

    #[error("{0}.password is set but no path is given")]
    PasswordWithoutPath(String),

    #[error("observability.metrics_address `{0}` is not a socket address")]
    InvalidMetricsAddress(String),
}

/// Validate a parsed configuration for running a server.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.address.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::InvalidListenAddress(
            config.listener.address.clone(),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    let tls = &config.tls;
    for (name, value) in [
        ("read_timeout_ms", tls.read_timeout_ms),
        ("write_timeout_ms", tls.write_timeout_ms),
        ("handshake_timeout_ms", tls.handshake_timeout_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }
    if tls.target_host.trim().is_empty() {
        errors.push(ValidationError::EmptyTargetHost);
    }

    match &tls.server_credential {
        Some(credential) => check_credential("tls.server_credential", credential, &mut errors),
        None => errors.push(ValidationError::MissingServerCredential),
    }
    for (i, credential) in tls.client_credentials.iter().enumerate() {
        check_credential(&format!("tls.client_credentials[{i}]"), credential, &mut errors);
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_credential(name: &str, credential: &CredentialConfig, errors: &mut Vec<ValidationError>) {
    if credential.path.trim().is_empty() {
        if credential.password.is_some() {
            errors.push(ValidationError::PasswordWithoutPath(name.to_string()));
        } else {
            errors.push(ValidationError::EmptyCredentialPath(name.to_string()));
        }
    }
}
