//! The swarm: live connection registry and top-level dial/listen surface.
//!
//! Owns the peer → connections map, the notification fan-out, the dial
//! synchronizer, and the set of listeners. Critical sections around the
//! registry are kept minimal: map mutations happen under the lock,
//! notification dispatch and connection I/O happen strictly outside it, so
//! high connection churn does not serialize on the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use multiaddr::Multiaddr;
use peermesh_common::{EventType, LogEvent, NetMetrics};
use peermesh_types::PeerId;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::address_book::AddressBook;
use crate::config::SwarmConfig;
use crate::conn::{ConnInner, Connection};
use crate::dial::{DialOpts, DialSync};
use crate::error::{NetworkError, NetworkResult};
use crate::gater::{AllowAllGater, Gater};
use crate::listener::Listener;
use crate::muxing::StreamMuxer;
use crate::rcmgr::{NullResourceManager, ResourceManager};
use crate::security::SecureChannel;
use crate::stream::Stream;
use crate::transport::{Transport, TransportRegistry};

/// Observer of connection lifecycle events.
///
/// For any single connection, `connected` is always observed strictly
/// before `disconnected`, even under concurrent closes.
pub trait Notifiee: Send + Sync {
    fn connected(&self, _conn: &Connection) {}
    fn disconnected(&self, _conn: &Connection) {}
    fn listen(&self, _addr: &Multiaddr) {}
    fn listen_close(&self, _addr: &Multiaddr) {}
}

/// Handler invoked for every accepted inbound stream.
pub type StreamHandler = Arc<dyn Fn(Stream) + Send + Sync>;

pub(crate) struct SwarmInner {
    pub(crate) local_peer: PeerId,
    pub(crate) config: SwarmConfig,
    pub(crate) transports: TransportRegistry,
    pub(crate) security: Arc<dyn SecureChannel>,
    pub(crate) muxer: Arc<dyn StreamMuxer>,
    pub(crate) gater: Arc<dyn Gater>,
    pub(crate) rcmgr: Arc<dyn ResourceManager>,
    pub(crate) metrics: Arc<NetMetrics>,
    pub(crate) address_book: AddressBook,
    pub(crate) dial_sync: DialSync,
    conns: Mutex<HashMap<PeerId, Vec<Connection>>>,
    notifiees: RwLock<Vec<Arc<dyn Notifiee>>>,
    stream_handler: RwLock<Option<StreamHandler>>,
    listeners: Mutex<Vec<Arc<Listener>>>,
    closed: AtomicBool,
    pub(crate) next_conn_id: AtomicU64,
    pub(crate) next_stream_id: AtomicU64,
    pub(crate) tracker: TaskTracker,
}

impl SwarmInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_handler(&self) -> Option<StreamHandler> {
        self.stream_handler.read().unwrap().clone()
    }

    pub(crate) fn notify_all(&self, f: impl Fn(&dyn Notifiee)) {
        let notifiees = self.notifiees.read().unwrap().clone();
        for n in notifiees {
            f(n.as_ref());
        }
    }

    /// Admit an upgraded connection into the registry, emit the connect
    /// notification, and start its inbound-stream accept loop.
    ///
    /// The connection's notification lock is held across the connect
    /// dispatch so a racing close cannot emit its disconnect notification
    /// first.
    pub(crate) async fn add_conn(self: &Arc<Self>, conn: &Connection) -> NetworkResult<()> {
        let guard = conn.inner.notify_lock.lock().await;

        if self.is_closed() {
            drop(guard);
            let _ = conn.close().await;
            return Err(NetworkError::SwarmClosed);
        }

        {
            let mut conns = self.conns.lock().unwrap();
            conns
                .entry(conn.remote_peer())
                .or_default()
                .push(conn.clone());
        }

        conn.inner.announced.store(true, Ordering::SeqCst);
        self.metrics.inc_conns_opened(conn.direction());
        LogEvent::new(EventType::ConnOpened)
            .with_correlation_id(conn.debug_id())
            .with_peer(&conn.remote_peer())
            .with_address(conn.remote_addr().to_string())
            .with_direction(conn.direction())
            .emit();

        self.notify_all(|n| n.connected(conn));
        drop(guard);

        conn.start(self);
        Ok(())
    }

    pub(crate) fn remove_conn(&self, inner: &ConnInner) {
        let mut conns = self.conns.lock().unwrap();
        if let Some(list) = conns.get_mut(&inner.remote_peer) {
            list.retain(|c| c.id() != inner.id);
            if list.is_empty() {
                conns.remove(&inner.remote_peer);
            }
        }
    }

    /// The preferred live connection to a peer, if any.
    pub(crate) fn best_conn_to(&self, peer: &PeerId) -> Option<Connection> {
        let conns = self.conns.lock().unwrap();
        conns
            .get(peer)?
            .iter()
            .find(|c| !c.is_closed())
            .cloned()
    }
}

/// The connection-upgrade and stream-multiplexing core.
///
/// Cheap to clone; all clones share one swarm.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

impl Swarm {
    /// Create a swarm with an allow-all gater, a pass-through resource
    /// manager, and default metrics.
    pub fn new(
        local_peer: PeerId,
        security: Arc<dyn SecureChannel>,
        muxer: Arc<dyn StreamMuxer>,
        config: SwarmConfig,
    ) -> Self {
        Self::with_parts(
            local_peer,
            security,
            muxer,
            Arc::new(AllowAllGater),
            Arc::new(NullResourceManager),
            Arc::new(NetMetrics::new(local_peer.short())),
            config,
        )
    }

    /// Create a swarm with explicit collaborators.
    pub fn with_parts(
        local_peer: PeerId,
        security: Arc<dyn SecureChannel>,
        muxer: Arc<dyn StreamMuxer>,
        gater: Arc<dyn Gater>,
        rcmgr: Arc<dyn ResourceManager>,
        metrics: Arc<NetMetrics>,
        config: SwarmConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SwarmInner {
                local_peer,
                config,
                transports: TransportRegistry::new(),
                security,
                muxer,
                gater,
                rcmgr,
                metrics,
                address_book: AddressBook::new(),
                dial_sync: DialSync::new(),
                conns: Mutex::new(HashMap::new()),
                notifiees: RwLock::new(Vec::new()),
                stream_handler: RwLock::new(None),
                listeners: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(0),
                next_stream_id: AtomicU64::new(0),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Our own identity.
    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    /// The swarm's known-address book.
    pub fn address_book(&self) -> &AddressBook {
        &self.inner.address_book
    }

    /// The swarm's metrics handle.
    pub fn metrics(&self) -> &Arc<NetMetrics> {
        &self.inner.metrics
    }

    /// Register a transport. Later registrations have lower priority.
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.inner.transports.add(transport);
    }

    /// Install the handler invoked for every accepted inbound stream.
    pub fn set_stream_handler<F>(&self, handler: F)
    where
        F: Fn(Stream) + Send + Sync + 'static,
    {
        *self.inner.stream_handler.write().unwrap() = Some(Arc::new(handler));
    }

    /// Subscribe to connection lifecycle notifications.
    pub fn register_notifiee(&self, notifiee: Arc<dyn Notifiee>) {
        self.inner.notifiees.write().unwrap().push(notifiee);
    }

    /// Unsubscribe a previously registered notifiee.
    pub fn unregister_notifiee(&self, notifiee: &Arc<dyn Notifiee>) {
        self.inner
            .notifiees
            .write()
            .unwrap()
            .retain(|n| !Arc::ptr_eq(n, notifiee));
    }

    /// Start listening on an address.
    pub async fn listen(&self, addr: &Multiaddr) -> NetworkResult<Arc<Listener>> {
        if self.inner.is_closed() {
            return Err(NetworkError::SwarmClosed);
        }
        let transport = self
            .inner
            .transports
            .for_listening(addr)
            .ok_or_else(|| NetworkError::NoTransport(addr.clone()))?;
        let raw = transport.listen(addr).await?;
        let listener = Listener::spawn(raw, &self.inner);

        self.inner.listeners.lock().unwrap().push(listener.clone());
        info!("listener started on {}", listener.local_addr());
        LogEvent::new(EventType::ListenerStarted)
            .with_address(listener.local_addr().to_string())
            .emit();
        self.inner.notify_all(|n| n.listen(listener.local_addr()));

        Ok(listener)
    }

    /// Dial a peer by identity, using the address book's candidates.
    ///
    /// Concurrent dials to the same peer share one underlying ranked dial
    /// sequence and observe the same outcome. Dropping the returned future
    /// abandons only this caller's interest.
    pub async fn dial(&self, peer: PeerId) -> NetworkResult<Connection> {
        self.dial_with_opts(peer, DialOpts::default()).await
    }

    /// [`Swarm::dial`] with explicit options.
    pub async fn dial_with_opts(&self, peer: PeerId, opts: DialOpts) -> NetworkResult<Connection> {
        if self.inner.is_closed() {
            return Err(NetworkError::SwarmClosed);
        }
        if peer == self.inner.local_peer {
            return Err(NetworkError::DialToSelf);
        }
        self.inner.dial_sync.dial(&self.inner, peer, opts).await
    }

    /// Open a stream to a peer, dialing if no connection exists.
    pub async fn new_stream(&self, peer: PeerId) -> NetworkResult<Stream> {
        let conn = match self.inner.best_conn_to(&peer) {
            Some(conn) => conn,
            None => self.dial(peer).await?,
        };
        conn.new_stream().await
    }

    /// Peers with at least one live connection.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.conns.lock().unwrap().keys().copied().collect()
    }

    /// All live connections.
    pub fn conns(&self) -> Vec<Connection> {
        self.inner
            .conns
            .lock()
            .unwrap()
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Live connections to one peer.
    pub fn conns_to_peer(&self, peer: &PeerId) -> Vec<Connection> {
        self.inner
            .conns
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    /// The preferred live connection to a peer, if any.
    pub fn best_conn_to(&self, peer: &PeerId) -> Option<Connection> {
        self.inner.best_conn_to(peer)
    }

    /// Shut the swarm down: close every listener and connection, then join
    /// all background tasks.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing swarm {}", self.inner.local_peer.short());

        // Stop in-flight dials first so their workers can wind down.
        self.inner.dial_sync.cancel_all();

        let listeners: Vec<Arc<Listener>> =
            { self.inner.listeners.lock().unwrap().drain(..).collect() };
        for listener in listeners {
            let _ = listener.close().await;
            LogEvent::new(EventType::ListenerClosed)
                .with_address(listener.local_addr().to_string())
                .emit();
            self.inner.notify_all(|n| n.listen_close(listener.local_addr()));
        }

        let conns: Vec<Connection> = {
            self.inner
                .conns
                .lock()
                .unwrap()
                .values()
                .flatten()
                .cloned()
                .collect()
        };
        for conn in conns {
            let _ = conn.close().await;
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("swarm {} closed", self.inner.local_peer.short());
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("local_peer", &self.inner.local_peer)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}
