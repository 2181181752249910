//! Role-specific TLS authentication.
//!
//! Both variants share the connection plumbing in [`crate::net::connection`]
//! and differ only in how the session is built and which side of the
//! handshake they drive.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::AlertDescription;
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::net::configuration::{ConfigurationError, Role, SecureConfiguration};
use crate::net::connection::{InnerStream, SecureStream};

/// Outcome of a connection attempt, as surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionResult {
    Connected,
    /// The peer certificate was rejected, or ours was.
    CertificateError,
    /// No common protocol version or cipher suite, or a malformed handshake.
    ProtocolMismatch,
    HandshakeTimeout,
    /// The TCP connection could not be opened or died during the handshake.
    TcpConnectionNotAlive,
    /// The local configuration cannot produce a session for this role.
    ConfigurationError,
}

impl ConnectionResult {
    /// Result code of any connection attempt.
    pub fn of<T>(result: &Result<T, crate::net::connection::ConnectError>) -> Self {
        match result {
            Ok(_) => ConnectionResult::Connected,
            Err(err) => err.result(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionResult::Connected => "connected",
            ConnectionResult::CertificateError => "certificate_error",
            ConnectionResult::ProtocolMismatch => "protocol_mismatch",
            ConnectionResult::HandshakeTimeout => "handshake_timeout",
            ConnectionResult::TcpConnectionNotAlive => "tcp_connection_not_alive",
            ConnectionResult::ConfigurationError => "configuration_error",
        }
    }
}

impl fmt::Display for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a secure connection could not be established.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Certificate rejected: {0}")]
    Certificate(#[source] rustls::Error),

    #[error("TLS negotiation failed: {0}")]
    Protocol(#[source] rustls::Error),

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Socket failed during handshake: {0}")]
    Io(#[source] io::Error),
}

impl HandshakeError {
    /// Classify an I/O error returned by the TLS stream.
    pub(crate) fn from_io(err: io::Error) -> Self {
        let tls = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .cloned();
        match tls {
            Some(tls) if is_certificate_failure(&tls) => HandshakeError::Certificate(tls),
            Some(tls) => HandshakeError::Protocol(tls),
            None => HandshakeError::Io(err),
        }
    }

    pub fn result(&self) -> ConnectionResult {
        match self {
            HandshakeError::Configuration(_) => ConnectionResult::ConfigurationError,
            HandshakeError::Certificate(_) => ConnectionResult::CertificateError,
            HandshakeError::Protocol(_) => ConnectionResult::ProtocolMismatch,
            HandshakeError::Timeout(_) => ConnectionResult::HandshakeTimeout,
            HandshakeError::Io(_) => ConnectionResult::TcpConnectionNotAlive,
        }
    }
}

fn is_certificate_failure(err: &rustls::Error) -> bool {
    match err {
        rustls::Error::InvalidCertificate(_)
        | rustls::Error::NoCertificatesPresented
        | rustls::Error::InvalidCertRevocationList(_) => true,
        rustls::Error::AlertReceived(alert) => matches!(
            alert,
            AlertDescription::BadCertificate
                | AlertDescription::UnsupportedCertificate
                | AlertDescription::CertificateRevoked
                | AlertDescription::CertificateExpired
                | AlertDescription::CertificateUnknown
                | AlertDescription::UnknownCA
                | AlertDescription::AccessDenied
                | AlertDescription::CertificateRequired
        ),
        _ => false,
    }
}

/// The role-specific half of a secure connection.
#[async_trait]
pub(crate) trait Handshake: Send + Sync {
    fn role(&self) -> Role;

    /// Drive the TLS handshake over `stream`.
    async fn authenticate(&self, stream: InnerStream) -> io::Result<SecureStream>;
}

/// Dials: verifies the server against the trust policy and offers client certificates.
pub(crate) struct ClientHandshake {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientHandshake {
    pub(crate) fn initialize_session(
        configuration: &SecureConfiguration,
    ) -> Result<Self, ConfigurationError> {
        let connector = TlsConnector::from(configuration.client_config()?);
        let server_name = ServerName::try_from(configuration.target_host.clone())
            .map_err(|_| ConfigurationError::InvalidTargetHost(configuration.target_host.clone()))?;
        Ok(Self {
            connector,
            server_name,
        })
    }
}

#[async_trait]
impl Handshake for ClientHandshake {
    fn role(&self) -> Role {
        Role::Client
    }

    async fn authenticate(&self, stream: InnerStream) -> io::Result<SecureStream> {
        let stream = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await?;
        Ok(TlsStream::Client(stream))
    }
}

/// Accepts: presents the server credential and applies the client certificate policy.
pub(crate) struct ServerHandshake {
    acceptor: TlsAcceptor,
}

impl ServerHandshake {
    pub(crate) fn initialize_session(
        configuration: &SecureConfiguration,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            acceptor: TlsAcceptor::from(configuration.server_config()?),
        })
    }
}

#[async_trait]
impl Handshake for ServerHandshake {
    fn role(&self) -> Role {
        Role::Server
    }

    async fn authenticate(&self, stream: InnerStream) -> io::Result<SecureStream> {
        let stream = self.acceptor.accept(stream).await?;
        Ok(TlsStream::Server(stream))
    }
}
