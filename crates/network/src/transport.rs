//! Transport capability interfaces.
//!
//! Concrete wire transports (TCP, QUIC, WebSocket, ...) live outside this
//! crate and are plugged in through the [`Transport`] trait. The upgrade core
//! only needs the ability to dial an address into a raw duplex byte stream
//! and to listen for such streams.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use multiaddr::Multiaddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkResult;

/// A duplex byte stream usable by the upgrade pipeline.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Duplex for T {}

/// An owned, type-erased duplex byte stream.
pub type BoxedDuplex = Box<dyn Duplex>;

/// An unauthenticated, unmultiplexed duplex connection produced by a
/// transport dial or accept.
///
/// Ephemeral: owned by the dial/accept path that created it until the upgrade
/// succeeds (the bytes move into the secured connection) or fails (the stream
/// is closed by drop).
pub struct RawConn {
    /// The raw byte stream.
    pub io: BoxedDuplex,
    /// Local network address.
    pub local_addr: Multiaddr,
    /// Remote network address.
    pub remote_addr: Multiaddr,
}

impl RawConn {
    /// Wrap a duplex stream with its addresses.
    pub fn new<T>(io: T, local_addr: Multiaddr, remote_addr: Multiaddr) -> Self
    where
        T: Duplex + 'static,
    {
        Self {
            io: Box::new(io),
            local_addr,
            remote_addr,
        }
    }

    /// Close the raw connection, flushing nothing.
    pub async fn close(mut self) {
        let _ = self.io.shutdown().await;
    }
}

impl std::fmt::Debug for RawConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConn")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// A transport capable of dialing and listening on some class of addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial the address into a raw connection.
    async fn dial(&self, addr: &Multiaddr) -> NetworkResult<RawConn>;

    /// Start listening on the address.
    async fn listen(&self, addr: &Multiaddr) -> NetworkResult<Box<dyn RawListener>>;

    /// Whether this transport can dial the address.
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    /// Human-readable protocol names handled by this transport.
    fn protocols(&self) -> &'static [&'static str];

    /// Whether this transport reaches peers through an intermediary.
    fn is_proxy(&self) -> bool {
        false
    }
}

/// A listener for raw connections, produced by [`Transport::listen`].
#[async_trait]
pub trait RawListener: Send + Sync {
    /// Accept the next raw connection.
    async fn accept(&self) -> NetworkResult<RawConn>;

    /// The local address this listener is bound to.
    fn local_addr(&self) -> Multiaddr;

    /// Stop the listener. Pending and future `accept` calls fail.
    async fn close(&self) -> NetworkResult<()>;
}

/// The set of transports registered with a swarm.
///
/// Selection is first-match on [`Transport::can_dial`], in registration
/// order.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: Arc<RwLock<Vec<Arc<dyn Transport>>>>,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport. Later registrations have lower priority.
    pub fn add(&self, transport: Arc<dyn Transport>) {
        self.transports.write().unwrap().push(transport);
    }

    /// The transport to use for dialing `addr`, if any.
    pub fn for_dialing(&self, addr: &Multiaddr) -> Option<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap()
            .iter()
            .find(|t| t.can_dial(addr))
            .cloned()
    }

    /// The transport to use for listening on `addr`, if any.
    pub fn for_listening(&self, addr: &Multiaddr) -> Option<Arc<dyn Transport>> {
        // Listening and dialing use the same address-class match.
        self.for_dialing(addr)
    }

    /// Number of registered transports.
    pub fn len(&self) -> usize {
        self.transports.read().unwrap().len()
    }

    /// True if no transports are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&'static [&'static str]> = self
            .transports
            .read()
            .unwrap()
            .iter()
            .map(|t| t.protocols())
            .collect();
        f.debug_struct("TransportRegistry")
            .field("transports", &names)
            .finish()
    }
}
