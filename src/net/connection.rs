//! Secure connection state machine and byte I/O.
//!
//! # Responsibilities
//! - Own exactly one raw socket and the TLS session layered on it
//! - Track connection state (Handshaking → Open → Closing → Closed)
//! - Expose byte I/O to the packet engine
//! - Record the close reason once and notify close listeners once
//!
//! # Design Decisions
//! - A connection object only exists after a successful handshake; a failed
//!   handshake drops the socket and never yields a handle
//! - The read half is owned by a task dedicated to the connection, so a slow
//!   peer never stalls the accept loop or other connections
//! - Reads suspend until data arrives instead of polling

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_rustls::TlsStream;

use crate::net::configuration::{Role, SecureConfiguration};
use crate::net::engine::{Dispatch, Packet, PacketEngine};
use crate::net::handshake::{
    ClientHandshake, ConnectionResult, Handshake, HandshakeError, ServerHandshake,
};
use crate::net::listener::ConnectionPermit;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TLS negotiation in progress. No handle is handed out in this state.
    Handshaking,
    /// Authenticated and carrying packets.
    Open,
    /// Close requested; the secure stream is being released.
    Closing,
    /// Socket and secure stream released.
    Closed,
}

/// Why a connection was closed. Recorded once, on the first close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The peer closed the stream or reset the socket.
    PeerClosed,
    /// The local application closed the connection.
    LocalClosed,
    /// The hosting server is shutting down.
    ServerShutdown,
    /// A read or write exceeded its timeout.
    Timeout,
    /// Reading from the secure stream failed.
    ReadPacketFailure,
    /// Writing to the secure stream failed.
    WritePacketFailure,
    /// A received packet could not be dispatched; the framing is out of sync.
    UnknownPacket,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::LocalClosed => "local_closed",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::Timeout => "timeout",
            CloseReason::ReadPacketFailure => "read_failure",
            CloseReason::WritePacketFailure => "write_failure",
            CloseReason::UnknownPacket => "unknown_packet",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket tuning knobs that only apply to unencrypted sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    Ttl,
    DualMode,
    Fragment,
    HopLimit,
    NoDelay,
    Routing,
    Loopback,
}

/// Value of a [`SocketOption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOptionValue {
    Flag(bool),
    Number(u32),
}

/// Errors raised by byte I/O on an established connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection is closed")]
    Closed,

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Write failed: {0}")]
    Write(#[source] io::Error),

    #[error("{0:?} is not supported on a secure connection")]
    Unsupported(SocketOption),

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    fn from_read(source: io::Error) -> Self {
        if is_peer_gone(&source) {
            TransportError::PeerClosed
        } else {
            TransportError::Read(source)
        }
    }

    fn from_write(source: io::Error) -> Self {
        if is_peer_gone(&source) {
            TransportError::PeerClosed
        } else {
            TransportError::Write(source)
        }
    }

    /// Close reason recorded when this error terminates a connection.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            TransportError::Closed | TransportError::Unsupported(_) => CloseReason::LocalClosed,
            TransportError::PeerClosed => CloseReason::PeerClosed,
            TransportError::Timeout { .. } => CloseReason::Timeout,
            TransportError::Read(_) | TransportError::Protocol(_) => CloseReason::ReadPacketFailure,
            TransportError::Write(_) => CloseReason::WritePacketFailure,
        }
    }
}

fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Errors raised while dialing a secure connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("TCP connect to {address} failed: {source}")]
    Tcp {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl ConnectError {
    /// Result code of the failed attempt.
    pub fn result(&self) -> ConnectionResult {
        match self {
            ConnectError::Tcp { .. } => ConnectionResult::TcpConnectionNotAlive,
            ConnectError::Handshake(err) => err.result(),
        }
    }
}

/// Raw TCP socket underneath the TLS session.
///
/// With `leave_open`, shutting down the secure stream sends `close_notify`
/// but does not shut the socket down.
#[derive(Debug)]
pub(crate) struct InnerStream {
    socket: TcpStream,
    leave_open: bool,
}

impl InnerStream {
    pub(crate) fn new(socket: TcpStream, leave_open: bool) -> Self {
        Self { socket, leave_open }
    }
}

impl AsyncRead for InnerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket).poll_read(cx, buf)
    }
}

impl AsyncWrite for InnerStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().socket).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.leave_open {
            Pin::new(&mut this.socket).poll_flush(cx)
        } else {
            Pin::new(&mut this.socket).poll_shutdown(cx)
        }
    }
}

pub(crate) type SecureStream = TlsStream<InnerStream>;

fn into_socket(stream: SecureStream) -> TcpStream {
    match stream {
        TlsStream::Client(stream) => stream.into_inner().0.socket,
        TlsStream::Server(stream) => stream.into_inner().0.socket,
    }
}

/// Read side of a secure connection, handed to the packet engine.
pub struct SecureReader {
    stream: ReadHalf<SecureStream>,
    read_timeout: Duration,
}

impl SecureReader {
    /// Read exactly `amount` bytes, however the peer fragmented them.
    ///
    /// Returns immediately with an empty buffer when `amount` is zero. Each
    /// underlying read is bounded by the configured read timeout.
    pub async fn read_bytes(&mut self, amount: usize) -> Result<Vec<u8>, TransportError> {
        let mut buffer = vec![0u8; amount];
        let mut received = 0;
        while received < amount {
            let read = tokio::time::timeout(self.read_timeout, self.stream.read(&mut buffer[received..]))
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "read",
                    timeout: self.read_timeout,
                })?
                .map_err(TransportError::from_read)?;
            if read == 0 {
                return Err(TransportError::PeerClosed);
            }
            received += read;
        }
        Ok(buffer)
    }
}

type CloseListener = Box<dyn FnOnce(&SecureConnection, CloseReason) + Send>;

#[derive(Default)]
struct Released {
    reader: Option<ReadHalf<SecureStream>>,
    writer: Option<WriteHalf<SecureStream>>,
    socket: Option<TcpStream>,
}

struct ConnectionInner {
    id: ConnectionId,
    role: Role,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    configuration: Arc<SecureConfiguration>,
    state: Mutex<ConnectionState>,
    close_reason: OnceLock<CloseReason>,
    closed: watch::Sender<bool>,
    close_listeners: Mutex<Option<Vec<CloseListener>>>,
    engine: OnceLock<Arc<dyn PacketEngine>>,
    pending_reader: Mutex<Option<SecureReader>>,
    writer: AsyncMutex<Option<WriteHalf<SecureStream>>>,
    released: Mutex<Released>,
    permit: Mutex<Option<ConnectionPermit>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An authenticated, encrypted connection.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct SecureConnection {
    inner: Arc<ConnectionInner>,
}

impl SecureConnection {
    /// Dial `host:port` and run the client handshake, then start the packet engine.
    pub async fn connect(
        host: &str,
        port: u16,
        configuration: Arc<SecureConfiguration>,
        engine: Arc<dyn PacketEngine>,
    ) -> Result<Self, ConnectError> {
        let result = Self::dial(host, port, configuration).await;
        metrics::record_handshake(
            Role::Client,
            result.as_ref().map_or_else(ConnectError::result, |_| ConnectionResult::Connected),
        );
        let connection = result?;
        connection.init(engine);
        Ok(connection)
    }

    async fn dial(
        host: &str,
        port: u16,
        configuration: Arc<SecureConfiguration>,
    ) -> Result<Self, ConnectError> {
        let handshake =
            ClientHandshake::initialize_session(&configuration).map_err(HandshakeError::from)?;
        let timeout = configuration.handshake_timeout;
        let socket = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| HandshakeError::Timeout(timeout))?
            .map_err(|source| ConnectError::Tcp {
                address: format!("{host}:{port}"),
                source,
            })?;
        Ok(Self::establish(socket, configuration, &handshake).await?)
    }

    /// Run the server handshake on an accepted socket.
    ///
    /// The packet engine is not started; call [`SecureConnection::init`] once
    /// the connection has been registered.
    pub async fn accept(
        socket: TcpStream,
        configuration: Arc<SecureConfiguration>,
    ) -> Result<Self, HandshakeError> {
        let result = match ServerHandshake::initialize_session(&configuration) {
            Ok(handshake) => Self::establish(socket, configuration, &handshake).await,
            Err(err) => Err(err.into()),
        };
        metrics::record_handshake(
            Role::Server,
            result.as_ref().map_or_else(HandshakeError::result, |_| ConnectionResult::Connected),
        );
        result
    }

    async fn establish<H: Handshake>(
        socket: TcpStream,
        configuration: Arc<SecureConfiguration>,
        handshake: &H,
    ) -> Result<Self, HandshakeError> {
        let local_addr = socket.local_addr().map_err(HandshakeError::Io)?;
        let peer_addr = socket.peer_addr().map_err(HandshakeError::Io)?;
        let inner = InnerStream::new(socket, configuration.leave_inner_stream_open);

        let timeout = configuration.handshake_timeout;
        let stream = tokio::time::timeout(timeout, handshake.authenticate(inner))
            .await
            .map_err(|_| HandshakeError::Timeout(timeout))?
            .map_err(HandshakeError::from_io)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        let reader = SecureReader {
            stream: read_half,
            read_timeout: configuration.read_timeout,
        };
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::new(),
                role: handshake.role(),
                local_addr,
                peer_addr,
                configuration,
                state: Mutex::new(ConnectionState::Open),
                close_reason: OnceLock::new(),
                closed,
                close_listeners: Mutex::new(Some(Vec::new())),
                engine: OnceLock::new(),
                pending_reader: Mutex::new(Some(reader)),
                writer: AsyncMutex::new(Some(write_half)),
                released: Mutex::new(Released::default()),
                permit: Mutex::new(None),
            }),
        };

        metrics::record_connection_opened();
        tracing::debug!(
            connection_id = %connection.id(),
            role = %connection.role(),
            peer_addr = %peer_addr,
            "Secure connection established"
        );
        Ok(connection)
    }

    /// Start the packet engine's read cycle. Only the first call has an effect.
    pub fn init(&self, engine: Arc<dyn PacketEngine>) {
        if self.inner.engine.set(Arc::clone(&engine)).is_err() {
            return;
        }
        let Some(mut reader) = lock(&self.inner.pending_reader).take() else {
            return;
        };
        let connection = self.clone();
        let mut closed = self.inner.closed.subscribe();

        tokio::spawn(async move {
            loop {
                let outcome = tokio::select! {
                    biased;
                    _ = async { let _ = closed.wait_for(|closed| *closed).await; } => break,
                    outcome = engine.receive(&connection, &mut reader) => outcome,
                };
                match outcome {
                    Ok(Dispatch::Handled) => {}
                    Ok(Dispatch::Unknown) => {
                        connection.handle_unknown_packet().await;
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(
                            connection_id = %connection.id(),
                            error = %err,
                            "Read cycle terminated"
                        );
                        connection.close_with(err.close_reason(), false).await;
                        break;
                    }
                }
            }
            connection.release(Some(reader.stream), None);
        });
    }

    /// Run the packet engine's post-registration step, letting the peer start sending.
    pub async fn unlock_remote(&self) -> Result<(), TransportError> {
        match self.inner.engine.get() {
            Some(engine) => engine.on_registered(self).await,
            None => Err(TransportError::Protocol(
                "packet engine not initialised".to_string(),
            )),
        }
    }

    /// Write all bytes to the secure stream.
    ///
    /// A failed or timed-out write closes the connection.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let write_timeout = self.inner.configuration.write_timeout;
        let force_flush = self.inner.configuration.force_flush;

        let outcome = {
            let mut guard = self.inner.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(TransportError::Closed);
            };
            tokio::time::timeout(write_timeout, async {
                writer.write_all(bytes).await?;
                if force_flush {
                    writer.flush().await?;
                }
                Ok::<(), io::Error>(())
            })
            .await
        };

        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(source)) => TransportError::from_write(source),
            Err(_) => TransportError::Timeout {
                operation: "write",
                timeout: write_timeout,
            },
        };
        tracing::warn!(connection_id = %self.id(), error = %err, "Write failed");
        self.close_with(err.close_reason(), false).await;
        Err(err)
    }

    /// Send a packet produced by the packet engine.
    pub async fn send<P: Packet + ?Sized>(&self, packet: &P) -> Result<(), TransportError> {
        self.write_bytes(&packet.to_bytes()).await
    }

    /// Called when a received packet has no handler. The stream is out of sync, so the
    /// connection is closed.
    pub async fn handle_unknown_packet(&self) {
        tracing::error!(
            connection_id = %self.id(),
            peer_addr = %self.peer_addr(),
            "Connection can't handle the received packet. No listener defined."
        );
        self.close_with(CloseReason::UnknownPacket, true).await;
    }

    /// Close the connection and notify the peer.
    pub async fn close(&self, reason: CloseReason) {
        self.close_with(reason, true).await;
    }

    /// Close the connection. Idempotent; only the first reason is recorded.
    ///
    /// With `notify_remote`, a TLS `close_notify` is sent before the stream is
    /// released. Errors while releasing are ignored.
    ///
    /// The release runs on its own task: dropping this future, as the read
    /// loop does once the connection is marked closed, never leaves the
    /// connection stuck in [`ConnectionState::Closing`].
    pub async fn close_with(&self, reason: CloseReason, notify_remote: bool) {
        {
            let mut state = lock(&self.inner.state);
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        let _ = self.inner.close_reason.set(reason);

        let connection = self.clone();
        let release = tokio::spawn(async move { connection.finish_close(reason, notify_remote).await });
        if let Err(err) = release.await {
            tracing::warn!(connection_id = %self.id(), error = %err, "Close task ended abnormally");
        }
    }

    async fn finish_close(&self, reason: CloseReason, notify_remote: bool) {
        if let Some(engine) = self.inner.engine.get() {
            engine.on_close(self, reason);
        }
        self.inner.closed.send_replace(true);
        self.close_socket(notify_remote).await;

        *lock(&self.inner.state) = ConnectionState::Closed;
        lock(&self.inner.permit).take();
        metrics::record_connection_closed(reason);
        tracing::info!(
            connection_id = %self.id(),
            peer_addr = %self.peer_addr(),
            reason = %reason,
            "Secure connection closed"
        );

        let listeners = lock(&self.inner.close_listeners).take().unwrap_or_default();
        for listener in listeners {
            listener(self, reason);
        }
    }

    async fn close_socket(&self, notify_remote: bool) {
        let writer = self.inner.writer.lock().await.take();
        let writer = match writer {
            Some(mut writer) if notify_remote => {
                let timeout = self.inner.configuration.write_timeout;
                match tokio::time::timeout(timeout, writer.shutdown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::debug!(connection_id = %self.id(), error = %err, "Secure stream shutdown failed");
                    }
                    Err(_) => {
                        tracing::debug!(connection_id = %self.id(), "Secure stream shutdown timed out");
                    }
                }
                Some(writer)
            }
            other => other,
        };
        let reader = lock(&self.inner.pending_reader)
            .take()
            .map(|reader| reader.stream);
        self.release(reader, writer);
    }

    fn release(&self, reader: Option<ReadHalf<SecureStream>>, writer: Option<WriteHalf<SecureStream>>) {
        if !self.inner.configuration.leave_inner_stream_open {
            return;
        }
        let mut released = lock(&self.inner.released);
        if reader.is_some() {
            released.reader = reader;
        }
        if writer.is_some() {
            released.writer = writer;
        }
        if released.reader.is_some() && released.writer.is_some() {
            if let (Some(reader), Some(writer)) = (released.reader.take(), released.writer.take()) {
                released.socket = Some(into_socket(reader.unsplit(writer)));
            }
        }
    }

    /// Take the raw socket once the connection is closed.
    ///
    /// Only available when `leave_inner_stream_open` is set.
    pub fn take_inner_socket(&self) -> Option<TcpStream> {
        lock(&self.inner.released).socket.take()
    }

    /// Register a callback run once when the connection closes.
    ///
    /// Runs immediately if the connection is already closed.
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce(&SecureConnection, CloseReason) + Send + 'static,
    {
        let mut guard = lock(&self.inner.close_listeners);
        if let Some(listeners) = guard.as_mut() {
            listeners.push(Box::new(listener));
            return;
        }
        drop(guard);
        let reason = self.close_reason().unwrap_or(CloseReason::LocalClosed);
        listener(self, reason);
    }

    pub(crate) fn hold_permit(&self, permit: ConnectionPermit) {
        *lock(&self.inner.permit) = Some(permit);
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Reason recorded at the first close, if closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().copied()
    }

    pub fn configuration(&self) -> &Arc<SecureConfiguration> {
        &self.inner.configuration
    }

    /// Socket tuning is owned by the TLS layer; always fails.
    pub fn socket_option(&self, option: SocketOption) -> Result<SocketOptionValue, TransportError> {
        Err(TransportError::Unsupported(option))
    }

    /// Socket tuning is owned by the TLS layer; always fails.
    pub fn set_socket_option(
        &self,
        option: SocketOption,
        _value: SocketOptionValue,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(option))
    }
}

impl PartialEq for SecureConnection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for SecureConnection {}

impl fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureConnection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn transport_errors_map_to_close_reasons() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(TransportError::from_read(reset).close_reason(), CloseReason::PeerClosed);

        let other = io::Error::other("boom");
        assert_eq!(
            TransportError::from_write(other).close_reason(),
            CloseReason::WritePacketFailure
        );

        let timeout = TransportError::Timeout {
            operation: "read",
            timeout: Duration::from_millis(5),
        };
        assert_eq!(timeout.close_reason(), CloseReason::Timeout);
    }

    #[test]
    fn close_reason_labels_are_stable() {
        assert_eq!(CloseReason::UnknownPacket.to_string(), "unknown_packet");
        assert_eq!(CloseReason::ServerShutdown.as_str(), "server_shutdown");
    }
}
