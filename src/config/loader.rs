//! Configuration loading from disk.

use std::fs;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::config::schema::{CredentialConfig, TlsSettings, TransportConfig};
use crate::config::validation::{validate_config, ValidationError};
use crate::net::configuration::{Role, SecureConfiguration};
use crate::net::tls::{self, Credential, CredentialError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<TransportConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config: TransportConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

impl TlsSettings {
    /// Build a secure configuration for `role`, loading every referenced file.
    pub fn to_configuration(&self, role: Role) -> Result<SecureConfiguration, CredentialError> {
        let mut configuration = SecureConfiguration::create(role);
        configuration.allow_untrusted_certificates = self.allow_untrusted_certificates;
        configuration.read_timeout = Duration::from_millis(self.read_timeout_ms);
        configuration.write_timeout = Duration::from_millis(self.write_timeout_ms);
        configuration.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        configuration.leave_inner_stream_open = self.leave_inner_stream_open;
        configuration.force_flush = self.force_flush;
        configuration.check_client_revocation = self.check_client_revocation;
        configuration.require_client_certificate = self.require_client_certificate;
        configuration.target_host = self.target_host.clone();
        configuration.protocol = self.protocol;

        if let Some(server) = &self.server_credential {
            configuration.load_server_credential(
                &server.path,
                server.password.as_deref(),
                server.relative_to_executable,
            )?;
        }
        let mut clients = self.client_credentials.iter();
        if let Some(first) = clients.next() {
            configuration.load_client_credential(
                &first.path,
                first.password.as_deref(),
                first.relative_to_executable,
            )?;
        }
        for credential in clients {
            configuration.add_client_credential(load_credential(credential)?);
        }
        for anchor in &self.trust_anchors {
            configuration.add_trust_anchor(anchor)?;
        }
        for list in &self.revocation_lists {
            configuration.add_revocation_list(list)?;
        }
        Ok(configuration)
    }
}

fn load_credential(config: &CredentialConfig) -> Result<Credential, CredentialError> {
    let path = tls::resolve_path(Path::new(&config.path), config.relative_to_executable)?;
    Credential::load(&path, config.password.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_defaults_for_missing_fields() {
        let file = write_config(
            r#"
            [tls.server_credential]
            path = "server.pem"
            "#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.listener.address, "0.0.0.0");
        assert_eq!(config.listener.max_connections, 10_000);
        assert_eq!(config.tls.read_timeout_ms, 5000);
        assert!(config.tls.allow_untrusted_certificates);
        assert!(!config.observability.metrics_enabled);
    }

    #[test]
    fn rejects_unknown_log_format() {
        let file = write_config(
            r#"
            [observability]
            log_format = "xml"
            "#,
        );
        assert!(matches!(load_config(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn surfaces_validation_errors() {
        let file = write_config(
            r#"
            [listener]
            max_connections = 0
            "#,
        );
        match load_config(file.path()) {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors.contains(&ValidationError::ZeroMaxConnections));
                assert!(errors.contains(&ValidationError::MissingServerCredential));
                let message = ConfigError::Validation(errors.clone()).to_string();
                assert!(message.starts_with("Validation failed: "));
                assert!(message.contains(&ValidationError::ZeroMaxConnections.to_string()));
                assert!(message.contains(", "));
            }
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn settings_map_onto_secure_configuration() {
        let settings = TlsSettings {
            allow_untrusted_certificates: false,
            read_timeout_ms: 250,
            target_host: "transport.test".to_string(),
            ..Default::default()
        };
        let configuration = settings.to_configuration(Role::Client).unwrap();
        assert!(!configuration.allow_untrusted_certificates);
        assert_eq!(configuration.read_timeout, Duration::from_millis(250));
        assert_eq!(configuration.target_host, "transport.test");
        assert_eq!(configuration.role(), Role::Client);
    }

    #[test]
    fn missing_server_credential_file_is_reported() {
        let settings = TlsSettings {
            server_credential: Some(CredentialConfig {
                path: "/nonexistent/server.pem".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            settings.to_configuration(Role::Server),
            Err(CredentialError::NotFound(_))
        ));
    }
}
