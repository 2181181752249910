//! Secure transport library: TLS sessions over raw TCP exposed as packet
//! connections, plus a server-side connection container.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::TransportConfig;
pub use lifecycle::Shutdown;
pub use net::configuration::{Role, SecureConfiguration, TlsProtocol};
pub use net::connection::{CloseReason, ConnectError, SecureConnection, SecureReader, TransportError};
pub use net::container::{ContainerEvent, SecureConnectionContainer};
pub use net::engine::{Dispatch, Packet, PacketEngine};
pub use net::handshake::{ConnectionResult, HandshakeError};
pub use net::tls::{Credential, CredentialError};
