//! Server-side container of secure connections.
//!
//! # Responsibilities
//! - Run the accept loop while online
//! - Hand each accepted socket to its own handshake task
//! - Keep the registry of established connections
//! - Fan out established/lost events and broadcast packets
//!
//! # Design Decisions
//! - The registry is a copy-on-write snapshot (`ArcSwap<HashMap>`); broadcast
//!   and close-all iterate a snapshot while the accept path and close
//!   listeners publish replacements
//! - No lock is held across network I/O
//! - A failed handshake drops the socket; it is neither registered nor reported lost
//! - Handshakes still in progress when the accept loop stops are abandoned, so
//!   nothing is registered after `stop` returns

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::lifecycle::shutdown::Shutdown;
use crate::net::configuration::SecureConfiguration;
use crate::net::connection::{CloseReason, ConnectionId, SecureConnection};
use crate::net::engine::{Packet, PacketEngine};
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::observability::metrics;

/// Default limit on concurrently held connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

const EVENT_CAPACITY: usize = 256;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle notifications published by a container.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    /// A handshake succeeded and the connection was registered.
    Established(SecureConnection),
    /// A registered connection closed and was removed.
    Lost {
        connection: SecureConnection,
        reason: CloseReason,
    },
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Failed to listen on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: ListenerError,
    },
}

struct AcceptLoop {
    shutdown: Shutdown,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct ContainerInner {
    address: IpAddr,
    port: u16,
    max_connections: usize,
    configuration: ArcSwap<SecureConfiguration>,
    engine: Arc<dyn PacketEngine>,
    connections: ArcSwap<HashMap<ConnectionId, SecureConnection>>,
    online: AtomicBool,
    acceptor: AsyncMutex<Option<AcceptLoop>>,
    local_addr: Mutex<Option<SocketAddr>>,
    events: broadcast::Sender<ContainerEvent>,
}

impl ContainerInner {
    fn register(self: &Arc<Self>, connection: &SecureConnection) {
        self.connections.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(connection.id(), connection.clone());
            next
        });

        let container = Arc::downgrade(self);
        connection.on_close(move |connection, reason| {
            if let Some(container) = container.upgrade() {
                container.connection_lost(connection, reason);
            }
        });
    }

    fn connection_lost(&self, connection: &SecureConnection, reason: CloseReason) {
        let id = connection.id();
        self.connections.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&id);
            next
        });

        tracing::info!(
            connection_id = %id,
            peer_addr = %connection.peer_addr(),
            reason = %reason,
            "Connection lost"
        );
        let _ = self.events.send(ContainerEvent::Lost {
            connection: connection.clone(),
            reason,
        });
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = addr;
    }
}

impl Drop for ContainerInner {
    fn drop(&mut self) {
        if let Some(running) = self.acceptor.get_mut().take() {
            running.task.abort();
        }
    }
}

/// Accepts inbound TCP sockets, performs the server handshake and keeps the
/// established connections.
///
/// Cheap to clone; clones share the same registry and accept loop.
#[derive(Clone)]
pub struct SecureConnectionContainer {
    inner: Arc<ContainerInner>,
}

impl SecureConnectionContainer {
    /// Create a container listening on `address:port`, optionally starting it.
    pub async fn create(
        address: IpAddr,
        port: u16,
        configuration: Arc<SecureConfiguration>,
        engine: Arc<dyn PacketEngine>,
        autostart: bool,
    ) -> Result<Self, ContainerError> {
        Self::create_with_limit(
            address,
            port,
            DEFAULT_MAX_CONNECTIONS,
            configuration,
            engine,
            autostart,
        )
        .await
    }

    /// Like [`SecureConnectionContainer::create`], with an explicit connection limit.
    pub async fn create_with_limit(
        address: IpAddr,
        port: u16,
        max_connections: usize,
        configuration: Arc<SecureConfiguration>,
        engine: Arc<dyn PacketEngine>,
        autostart: bool,
    ) -> Result<Self, ContainerError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let container = Self {
            inner: Arc::new(ContainerInner {
                address,
                port,
                max_connections,
                configuration: ArcSwap::new(configuration),
                engine,
                connections: ArcSwap::from_pointee(HashMap::new()),
                online: AtomicBool::new(false),
                acceptor: AsyncMutex::new(None),
                local_addr: Mutex::new(None),
                events,
            }),
        };
        if autostart {
            container.start().await?;
        }
        Ok(container)
    }

    /// Bind and begin accepting. A no-op returning the bound address if already listening.
    pub async fn start(&self) -> Result<SocketAddr, ContainerError> {
        let mut acceptor = self.inner.acceptor.lock().await;
        if let Some(running) = acceptor.as_ref() {
            return Ok(running.local_addr);
        }

        let address = SocketAddr::new(self.inner.address, self.inner.port);
        let listener = Listener::bind(address, self.inner.max_connections)
            .await
            .map_err(|source| ContainerError::Bind { address, source })?;
        let local_addr = listener.local_addr().map_err(|err| ContainerError::Bind {
            address,
            source: ListenerError::Bind(err),
        })?;

        let shutdown = Shutdown::new();
        let task = tokio::spawn(accept_loop(
            Arc::downgrade(&self.inner),
            listener,
            shutdown.subscribe(),
        ));

        self.inner.online.store(true, Ordering::Release);
        self.inner.set_local_addr(Some(local_addr));
        *acceptor = Some(AcceptLoop {
            shutdown,
            task,
            local_addr,
        });

        tracing::info!(address = %local_addr, "Secure connection container online");
        Ok(local_addr)
    }

    /// Stop accepting new sockets and abandon handshakes in progress.
    /// Established connections stay open.
    pub async fn stop(&self) {
        let running = self.inner.acceptor.lock().await.take();
        self.inner.online.store(false, Ordering::Release);
        self.inner.set_local_addr(None);

        if let Some(running) = running {
            running.shutdown.trigger();
            if let Err(err) = running.task.await {
                tracing::debug!(error = %err, "Accept loop task ended abnormally");
            }
            tracing::info!(address = %running.local_addr, "Secure connection container offline");
        }
    }

    /// Close every registered connection with `reason` and clear the registry.
    pub async fn close_connections(&self, reason: CloseReason) {
        let connections = self.inner.connections.swap(Arc::new(HashMap::new()));
        tracing::info!(count = connections.len(), reason = %reason, "Closing all connections");
        join_all(connections.values().map(|connection| connection.close(reason))).await;
    }

    /// Send `packet` to every registered connection.
    ///
    /// A failing connection does not stop delivery to the others. Returns the
    /// number of connections the packet was written to.
    pub async fn broadcast<P: Packet + ?Sized>(&self, packet: &P) -> usize {
        let snapshot = self.inner.connections.load_full();
        let bytes = packet.to_bytes();
        let bytes = bytes.as_slice();

        let results = join_all(snapshot.values().map(|connection| async move {
            let result = connection.write_bytes(bytes).await;
            (connection, result)
        }))
        .await;

        let mut delivered = 0;
        for (connection, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    metrics::record_broadcast_failure();
                    tracing::debug!(
                        connection_id = %connection.id(),
                        error = %err,
                        "Broadcast delivery failed"
                    );
                }
            }
        }
        delivered
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.inner.connections.load().len()
    }

    /// Snapshot of the registered connections.
    pub fn connections(&self) -> Vec<SecureConnection> {
        self.inner.connections.load().values().cloned().collect()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Address the accept loop is bound to, while online.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration used for future handshakes.
    pub fn configuration(&self) -> Arc<SecureConfiguration> {
        self.inner.configuration.load_full()
    }

    /// Replace the configuration used for future handshakes. Established
    /// connections keep the one they were created with.
    pub fn replace_configuration(&self, configuration: Arc<SecureConfiguration>) {
        self.inner.configuration.store(configuration);
        tracing::info!("Secure configuration replaced");
    }

    /// Subscribe to established/lost events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.inner.events.subscribe()
    }
}

impl fmt::Display for SecureConnectionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureConnectionContainer. IsOnline {}.", self.is_online())
    }
}

impl fmt::Debug for SecureConnectionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureConnectionContainer")
            .field("address", &self.inner.address)
            .field("port", &self.inner.port)
            .field("online", &self.is_online())
            .field("connections", &self.count())
            .finish()
    }
}

async fn accept_loop(
    container: Weak<ContainerInner>,
    listener: Listener,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut admissions = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => break,
            Some(_) = admissions.join_next() => continue,
            accepted = listener.accept() => accepted,
        };
        let Some(inner) = container.upgrade() else {
            break;
        };
        match accepted {
            Ok((socket, peer_addr, permit)) => {
                admissions.spawn(admit(inner, socket, peer_addr, permit));
            }
            Err(ListenerError::Closed) => break,
            Err(err) => {
                tracing::warn!(error = %err, "Accept failed");
                drop(inner);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    if !admissions.is_empty() {
        tracing::debug!(pending = admissions.len(), "Abandoning handshakes in progress");
    }
    admissions.shutdown().await;
    tracing::debug!("Accept loop exited");
}

async fn admit(
    inner: Arc<ContainerInner>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    permit: ConnectionPermit,
) {
    let configuration = inner.configuration.load_full();
    let connection = match SecureConnection::accept(socket, configuration).await {
        Ok(connection) => connection,
        Err(err) => {
            tracing::warn!(
                peer_addr = %peer_addr,
                result = %err.result(),
                error = %err,
                "Secure handshake failed, dropping socket"
            );
            return;
        }
    };

    connection.hold_permit(permit);
    inner.register(&connection);
    let _ = inner
        .events
        .send(ContainerEvent::Established(connection.clone()));

    connection.init(Arc::clone(&inner.engine));
    if let Err(err) = connection.unlock_remote().await {
        tracing::warn!(
            connection_id = %connection.id(),
            error = %err,
            "Post-registration step failed"
        );
        connection.close(err.close_reason()).await;
    }
}
