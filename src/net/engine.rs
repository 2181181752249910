//! Packet engine seam.
//!
//! Framing, packet registration and request/response correlation live in the
//! packet engine. This layer only hands it byte I/O ([`SecureReader::read_bytes`],
//! [`SecureConnection::write_bytes`]) and lifecycle hooks.

use async_trait::async_trait;

use crate::net::connection::{CloseReason, SecureConnection, SecureReader, TransportError};

/// A serialised packet ready to be written to a connection.
pub trait Packet: Send + Sync {
    /// The complete wire frame, as produced by the packet engine.
    fn to_bytes(&self) -> Vec<u8>;
}

impl Packet for [u8] {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl Packet for Vec<u8> {
    fn to_bytes(&self) -> Vec<u8> {
        self.clone()
    }
}

/// Outcome of reading one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The packet was routed to a handler.
    Handled,
    /// No handler exists for the packet; the stream can no longer be trusted.
    Unknown,
}

/// The packet engine driving an established secure connection.
///
/// `receive` is called in a loop on a task dedicated to the connection. An
/// error closes the connection with [`TransportError::close_reason`];
/// [`Dispatch::Unknown`] closes it with [`CloseReason::UnknownPacket`].
#[async_trait]
pub trait PacketEngine: Send + Sync + 'static {
    /// Read one packet from `reader` and dispatch it.
    async fn receive(
        &self,
        connection: &SecureConnection,
        reader: &mut SecureReader,
    ) -> Result<Dispatch, TransportError>;

    /// Called once the connection is registered and may be used end to end.
    async fn on_registered(&self, _connection: &SecureConnection) -> Result<(), TransportError> {
        Ok(())
    }

    /// Generic close path, run before the secure stream is released.
    fn on_close(&self, _connection: &SecureConnection, _reason: CloseReason) {}
}
