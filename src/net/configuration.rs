//! Secure transport configuration.
//!
//! One type carries both the client and the server slots because a process
//! may act in either role; unused slots stay unset. Whether a configuration is
//! usable for a role is only checked when a session is built for it.
//!
//! A configuration is mutable while owned by value. Connections and containers
//! hold it as `Arc<SecureConfiguration>`, so it is read-only for their lifetime.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::tls::{self, Credential, CredentialError, CredentialSelector, TrustPolicyVerifier};

/// Which side of the handshake a configuration or connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS protocol versions a handshake may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsProtocol {
    #[default]
    Tls12,
    Tls13,
    Tls12OrLater,
}

static TLS12_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS12];
static TLS13_ONLY: [&SupportedProtocolVersion; 1] = [&rustls::version::TLS13];

impl TlsProtocol {
    pub(crate) fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsProtocol::Tls12 => &TLS12_ONLY,
            TlsProtocol::Tls13 => &TLS13_ONLY,
            TlsProtocol::Tls12OrLater => rustls::ALL_VERSIONS,
        }
    }
}

/// Errors raised when a configuration cannot produce a TLS session for a role.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("No server certificate loaded; a server credential is required to accept secure connections")]
    MissingServerCredential,

    #[error("Client certificates are required but no trust anchors are configured to verify them")]
    MissingClientTrustAnchors,

    #[error("Invalid target host `{0}`")]
    InvalidTargetHost(String),

    #[error("Certificate verifier could not be built: {0}")]
    Verifier(String),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

/// Trust policy, timeouts, protocol version and credential material for one role.
#[derive(Debug, Clone)]
pub struct SecureConfiguration {
    role: Role,

    /// Accept any server certificate (client). Required for self-signed development certificates.
    pub allow_untrusted_certificates: bool,

    /// Per-call read timeout on the secure stream.
    pub read_timeout: Duration,

    /// Per-call write timeout on the secure stream.
    pub write_timeout: Duration,

    /// Upper bound for the whole handshake.
    pub handshake_timeout: Duration,

    /// Keep the raw socket usable after the secure stream is closed.
    pub leave_inner_stream_open: bool,

    /// Flush after every write so small packets are not coalesced.
    pub force_flush: bool,

    /// Check peer certificates against the loaded revocation lists.
    pub check_client_revocation: bool,

    /// Reject clients that present no certificate (server).
    pub require_client_certificate: bool,

    /// Expected server identity (client).
    pub target_host: String,

    /// Negotiated protocol version range.
    pub protocol: TlsProtocol,

    public_key_hint: String,
    server_credential: Option<Credential>,
    client_credentials: Vec<Credential>,
    trust_anchors: Vec<CertificateDer<'static>>,
    revocation_lists: Vec<CertificateRevocationListDer<'static>>,
}

impl SecureConfiguration {
    /// Create a configuration with the documented defaults.
    pub fn create(role: Role) -> Self {
        Self {
            role,
            allow_untrusted_certificates: true,
            read_timeout: Duration::from_millis(5000),
            write_timeout: Duration::from_millis(5000),
            handshake_timeout: Duration::from_millis(10_000),
            leave_inner_stream_open: false,
            force_flush: true,
            check_client_revocation: true,
            require_client_certificate: false,
            target_host: "localhost".to_string(),
            protocol: TlsProtocol::Tls12,
            public_key_hint: String::new(),
            server_credential: None,
            client_credentials: Vec::new(),
            trust_anchors: Vec::new(),
            revocation_lists: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Public key of the first loaded client certificate, hex encoded. Advisory only.
    pub fn public_key_hint(&self) -> &str {
        &self.public_key_hint
    }

    pub fn server_credential(&self) -> Option<&Credential> {
        self.server_credential.as_ref()
    }

    pub fn client_credentials(&self) -> &[Credential] {
        &self.client_credentials
    }

    /// Load the client credential, replacing any previously configured client certificates.
    pub fn load_client_credential(
        &mut self,
        path: impl AsRef<Path>,
        password: Option<&str>,
        relative_to_executable: bool,
    ) -> Result<(), CredentialError> {
        let path = tls::resolve_path(path.as_ref(), relative_to_executable)?;
        let credential = Credential::load(&path, password)?;
        tracing::debug!(path = ?path, subject = %credential.subject(), "Client credential loaded");
        self.public_key_hint = credential.public_key_hint();
        self.client_credentials = vec![credential];
        Ok(())
    }

    /// Append a client credential, for servers that accept certificates from several issuers.
    pub fn add_client_credential(&mut self, credential: Credential) {
        if self.client_credentials.is_empty() {
            self.public_key_hint = credential.public_key_hint();
        }
        self.client_credentials.push(credential);
    }

    /// Load the server credential. Required before accepting secure connections.
    pub fn load_server_credential(
        &mut self,
        path: impl AsRef<Path>,
        password: Option<&str>,
        relative_to_executable: bool,
    ) -> Result<(), CredentialError> {
        let path = tls::resolve_path(path.as_ref(), relative_to_executable)?;
        let credential = Credential::load(&path, password)?;
        tracing::debug!(path = ?path, subject = %credential.subject(), "Server credential loaded");
        self.server_credential = Some(credential);
        Ok(())
    }

    /// Trust the CA certificates in `path` when verifying the peer.
    pub fn add_trust_anchor(&mut self, path: impl AsRef<Path>) -> Result<(), CredentialError> {
        let certificates = tls::load_certificates(path.as_ref())?;
        self.trust_anchors.extend(certificates);
        Ok(())
    }

    /// Load revocation lists consulted when `check_client_revocation` is set.
    pub fn add_revocation_list(&mut self, path: impl AsRef<Path>) -> Result<(), CredentialError> {
        let lists = tls::load_revocation_lists(path.as_ref())?;
        self.revocation_lists.extend(lists);
        Ok(())
    }

    fn active_revocation_lists(&self) -> Vec<CertificateRevocationListDer<'static>> {
        if self.check_client_revocation {
            self.revocation_lists.clone()
        } else {
            Vec::new()
        }
    }

    /// Configured trust anchors only. Used to verify client certificates.
    fn anchor_store(&self) -> Result<RootCertStore, ConfigurationError> {
        let mut roots = RootCertStore::empty();
        for anchor in &self.trust_anchors {
            roots.add(anchor.clone())?;
        }
        Ok(roots)
    }

    /// Public web roots plus the configured trust anchors. Used to verify servers.
    pub(crate) fn server_trust_store(&self) -> Result<RootCertStore, ConfigurationError> {
        let mut roots = self.anchor_store()?;
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Ok(roots)
    }

    /// Build the rustls client session configuration.
    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>, ConfigurationError> {
        let provider = crypto_provider();
        let verifier = TrustPolicyVerifier::new(
            self.allow_untrusted_certificates,
            self.server_trust_store()?,
            self.active_revocation_lists(),
            Arc::clone(&provider),
        )
        .map_err(|err| ConfigurationError::Verifier(err.to_string()))?;

        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(self.protocol.versions())?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        let config = if self.client_credentials.is_empty() {
            builder.with_no_client_auth()
        } else {
            let selector = CredentialSelector::new(&self.client_credentials, &provider)?;
            builder.with_client_cert_resolver(Arc::new(selector))
        };
        Ok(Arc::new(config))
    }

    /// Build the rustls server session configuration.
    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, ConfigurationError> {
        let credential = self
            .server_credential
            .as_ref()
            .ok_or(ConfigurationError::MissingServerCredential)?;
        let provider = crypto_provider();

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(self.protocol.versions())?;

        let builder = if self.trust_anchors.is_empty() {
            if self.require_client_certificate {
                return Err(ConfigurationError::MissingClientTrustAnchors);
            }
            builder.with_no_client_auth()
        } else {
            let mut verifier = WebPkiClientVerifier::builder_with_provider(
                Arc::new(self.anchor_store()?),
                Arc::clone(&provider),
            );
            let revocation_lists = self.active_revocation_lists();
            if !revocation_lists.is_empty() {
                verifier = verifier
                    .with_crls(revocation_lists)
                    .allow_unknown_revocation_status();
            }
            if !self.require_client_certificate {
                verifier = verifier.allow_unauthenticated();
            }
            let verifier = verifier
                .build()
                .map_err(|err| ConfigurationError::Verifier(err.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        };

        let config = builder.with_single_cert(
            credential.certificate_chain().to_vec(),
            credential.private_key(),
        )?;
        Ok(Arc::new(config))
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
