//! Common test utilities and in-process fakes for integration tests:
//! an in-memory duplex transport, an identity-passthrough security
//! provider, a trivial single-stream muxer stub, and tracking fakes for
//! resource accounting and gating.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use multiaddr::{Multiaddr, Protocol};
use peermesh_network::{
    BoxedDuplex, ConnScope, Connection, Direction, Gater, Listener, MuxedConn, MuxedStream,
    NetworkError, NetworkResult, Notifiee, PeerId, ProtocolId, PublicKey, RawConn, RawListener,
    ResourceKind, ResourceManager, ResourceScope, SecureChannel, SecuredStream, StreamMuxer,
    StreamScope, Swarm, SwarmConfig, Transport,
};
use peermesh_common::NetMetrics;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

// ---------------------------------------------------------------------------
// fixtures

/// A deterministic keypair for tests.
pub fn keypair(seed: u8) -> (PublicKey, PeerId) {
    let key = PublicKey::new(vec![seed; 32]);
    let peer = key.peer_id();
    (key, peer)
}

pub fn ma(s: &str) -> Multiaddr {
    s.parse().unwrap()
}

/// Install a test tracing subscriber honoring `RUST_LOG`. Idempotent.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `f` returns true, panicking after ~2s.
pub async fn wait_until(mut f: impl FnMut() -> bool) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

/// Keep accepting connections from a listener until it closes.
pub fn drive_accepts(listener: Arc<Listener>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { while listener.accept().await.is_ok() {} })
}

// ---------------------------------------------------------------------------
// in-memory transport

fn memory_id(addr: &Multiaddr) -> Option<u64> {
    addr.iter().find_map(|p| match p {
        Protocol::Memory(id) => Some(id),
        _ => None,
    })
}

/// An in-process network of `/memory/<n>` endpoints connected by
/// `tokio::io::duplex` pipes.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<u64, mpsc::UnboundedSender<RawConn>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn connect(&self, id: u64) -> NetworkResult<RawConn> {
        let tx = self
            .listeners
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| {
                NetworkError::from(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no memory listener {}", id),
                ))
            })?;

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let listen_addr = ma(&format!("/memory/{}", id));
        let dialer_addr = ma("/memory/0");

        let server_conn = RawConn::new(server_io, listen_addr.clone(), dialer_addr.clone());
        tx.send(server_conn).map_err(|_| {
            NetworkError::from(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory listener gone",
            ))
        })?;

        Ok(RawConn::new(client_io, dialer_addr, listen_addr))
    }

    fn register(&self, id: u64, tx: mpsc::UnboundedSender<RawConn>) {
        self.listeners.lock().unwrap().insert(id, tx);
    }

    fn unregister(&self, id: u64) {
        self.listeners.lock().unwrap().remove(&id);
    }
}

/// Transport over a [`MemoryNetwork`], with counters for dials and raw
/// accepts and an optional artificial dial latency.
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    pub dials: Arc<AtomicUsize>,
    pub accepts: Arc<AtomicUsize>,
    pub dial_delay: Option<Duration>,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network,
            dials: Arc::new(AtomicUsize::new(0)),
            accepts: Arc::new(AtomicUsize::new(0)),
            dial_delay: None,
        })
    }

    pub fn with_dial_delay(network: Arc<MemoryNetwork>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            network,
            dials: Arc::new(AtomicUsize::new(0)),
            accepts: Arc::new(AtomicUsize::new(0)),
            dial_delay: Some(delay),
        })
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn accept_count(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, addr: &Multiaddr) -> NetworkResult<RawConn> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.dial_delay {
            tokio::time::sleep(delay).await;
        }
        let id = memory_id(addr).ok_or_else(|| NetworkError::NoTransport(addr.clone()))?;
        self.network.connect(id)
    }

    async fn listen(&self, addr: &Multiaddr) -> NetworkResult<Box<dyn RawListener>> {
        let id = memory_id(addr).ok_or_else(|| NetworkError::NoTransport(addr.clone()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.network.register(id, tx);
        Ok(Box::new(MemoryListener {
            network: self.network.clone(),
            id,
            addr: addr.clone(),
            rx: AsyncMutex::new(rx),
            accepts: self.accepts.clone(),
        }))
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        memory_id(addr).is_some()
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["memory"]
    }
}

pub struct MemoryListener {
    network: Arc<MemoryNetwork>,
    id: u64,
    addr: Multiaddr,
    rx: AsyncMutex<mpsc::UnboundedReceiver<RawConn>>,
    accepts: Arc<AtomicUsize>,
}

#[async_trait]
impl RawListener for MemoryListener {
    async fn accept(&self) -> NetworkResult<RawConn> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(conn) => {
                self.accepts.fetch_add(1, Ordering::SeqCst);
                Ok(conn)
            }
            None => Err(NetworkError::ListenerClosed),
        }
    }

    fn local_addr(&self) -> Multiaddr {
        self.addr.clone()
    }

    async fn close(&self) -> NetworkResult<()> {
        self.network.unregister(self.id);
        Ok(())
    }
}

/// Transport wrapper whose listeners fail a configurable number of accepts
/// with a transient error before delegating.
pub struct FlakyTransport {
    inner: Arc<MemoryTransport>,
    transient_failures: Arc<AtomicUsize>,
}

impl FlakyTransport {
    pub fn new(inner: Arc<MemoryTransport>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            transient_failures: Arc::new(AtomicUsize::new(failures)),
        })
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn dial(&self, addr: &Multiaddr) -> NetworkResult<RawConn> {
        self.inner.dial(addr).await
    }

    async fn listen(&self, addr: &Multiaddr) -> NetworkResult<Box<dyn RawListener>> {
        let inner = self.inner.listen(addr).await?;
        Ok(Box::new(FlakyListener {
            inner,
            remaining: self.transient_failures.clone(),
        }))
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        self.inner.can_dial(addr)
    }

    fn protocols(&self) -> &'static [&'static str] {
        self.inner.protocols()
    }
}

struct FlakyListener {
    inner: Box<dyn RawListener>,
    remaining: Arc<AtomicUsize>,
}

#[async_trait]
impl RawListener for FlakyListener {
    async fn accept(&self) -> NetworkResult<RawConn> {
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(NetworkError::from(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "simulated transient accept failure",
            )));
        }
        self.inner.accept().await
    }

    fn local_addr(&self) -> Multiaddr {
        self.inner.local_addr()
    }

    async fn close(&self) -> NetworkResult<()> {
        self.inner.close().await
    }
}

// ---------------------------------------------------------------------------
// identity-passthrough security

/// Security provider that exchanges public keys in the clear and derives
/// peer identities from them. No encryption; for tests only.
pub struct PlaintextSecurity {
    local_key: PublicKey,
}

impl PlaintextSecurity {
    pub fn new(local_key: PublicKey) -> Self {
        Self { local_key }
    }

    async fn handshake(
        &self,
        mut io: BoxedDuplex,
        expected_peer: Option<PeerId>,
    ) -> NetworkResult<SecuredStream> {
        let key_bytes = self.local_key.as_bytes();
        io.write_u16(key_bytes.len() as u16).await?;
        io.write_all(key_bytes).await?;
        io.flush().await?;

        let len = io.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        io.read_exact(&mut buf).await?;

        let remote_public_key = PublicKey::new(buf);
        let remote_peer = remote_public_key.peer_id();
        if let Some(expected) = expected_peer {
            if expected != remote_peer {
                return Err(NetworkError::PeerIdMismatch {
                    expected,
                    actual: remote_peer,
                });
            }
        }

        Ok(SecuredStream {
            io,
            remote_peer,
            remote_public_key,
        })
    }
}

#[async_trait]
impl SecureChannel for PlaintextSecurity {
    fn protocol_id(&self) -> ProtocolId {
        ProtocolId::from("/plaintext/1.0.0")
    }

    async fn secure_outbound(
        &self,
        io: BoxedDuplex,
        expected_peer: Option<PeerId>,
    ) -> NetworkResult<SecuredStream> {
        self.handshake(io, expected_peer).await
    }

    async fn secure_inbound(
        &self,
        io: BoxedDuplex,
        expected_peer: Option<PeerId>,
    ) -> NetworkResult<SecuredStream> {
        self.handshake(io, expected_peer).await
    }
}

// ---------------------------------------------------------------------------
// single-stream muxer stub

/// A muxer stub exposing the secured stream as a single logical stream:
/// the initiator side opens it, the acceptor side accepts it.
pub struct StubMuxer;

#[async_trait]
impl StreamMuxer for StubMuxer {
    fn protocol_id(&self) -> ProtocolId {
        ProtocolId::from("/stub-mux/1.0.0")
    }

    async fn new_muxed_conn(
        &self,
        io: BoxedDuplex,
        is_initiator: bool,
    ) -> NetworkResult<Box<dyn MuxedConn>> {
        Ok(Box::new(StubMuxedConn {
            io: Mutex::new(Some(io)),
            is_initiator,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }))
    }
}

pub struct StubMuxedConn {
    io: Mutex<Option<BoxedDuplex>>,
    is_initiator: bool,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl StubMuxedConn {
    async fn wait_closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MuxedConn for StubMuxedConn {
    async fn open_stream(&self) -> NetworkResult<Box<dyn MuxedStream>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionClosed);
        }
        if !self.is_initiator {
            return Err(NetworkError::MuxerFailed {
                reason: "stub muxer: acceptor side cannot open streams".to_string(),
            });
        }
        match self.io.lock().unwrap().take() {
            Some(io) => Ok(Box::new(StubStream { io })),
            None => Err(NetworkError::MuxerFailed {
                reason: "stub muxer: single stream already opened".to_string(),
            }),
        }
    }

    async fn accept_stream(&self) -> NetworkResult<Box<dyn MuxedStream>> {
        if !self.is_initiator {
            if let Some(io) = self.io.lock().unwrap().take() {
                return Ok(Box::new(StubStream { io }));
            }
        }
        // Nothing further will ever arrive; park until the session closes.
        self.wait_closed().await;
        Err(NetworkError::ConnectionClosed)
    }

    async fn close(&self) -> NetworkResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct StubStream {
    io: BoxedDuplex,
}

impl AsyncRead for StubStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for StubStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[async_trait]
impl MuxedStream for StubStream {
    async fn reset(&mut self) -> NetworkResult<()> {
        let _ = self.io.shutdown().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// tracking resource manager

/// Counters shared by all scopes of a [`TrackingResourceManager`].
#[derive(Default)]
pub struct ScopeLedger {
    pub conns_opened: AtomicUsize,
    pub conns_released: AtomicUsize,
    pub streams_opened: AtomicUsize,
    pub streams_released: AtomicUsize,
}

impl ScopeLedger {
    pub fn conns_live(&self) -> usize {
        self.conns_opened.load(Ordering::SeqCst) - self.conns_released.load(Ordering::SeqCst)
    }

    pub fn streams_live(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst) - self.streams_released.load(Ordering::SeqCst)
    }

    /// Every opened scope has been released exactly once.
    pub fn assert_no_leaks(&self) {
        assert_eq!(self.conns_live(), 0, "leaked connection scopes");
        assert_eq!(self.streams_live(), 0, "leaked stream scopes");
    }
}

/// Resource manager that counts scope open/release pairs, panics on
/// double-release, and can be told to deny admissions.
pub struct TrackingResourceManager {
    pub ledger: Arc<ScopeLedger>,
    pub deny_peer: Mutex<Option<PeerId>>,
    pub deny_streams: AtomicBool,
}

impl TrackingResourceManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ledger: Arc::new(ScopeLedger::default()),
            deny_peer: Mutex::new(None),
            deny_streams: AtomicBool::new(false),
        })
    }

    pub fn deny_peer(&self, peer: PeerId) {
        *self.deny_peer.lock().unwrap() = Some(peer);
    }
}

impl ResourceManager for TrackingResourceManager {
    fn open_connection(
        &self,
        _direction: Direction,
        _is_transient: bool,
        _remote_addr: &Multiaddr,
    ) -> NetworkResult<Box<dyn ConnScope>> {
        self.ledger.conns_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackingConnScope {
            ledger: self.ledger.clone(),
            deny_peer: *self.deny_peer.lock().unwrap(),
            released: AtomicBool::new(false),
        }))
    }

    fn open_stream(
        &self,
        _peer: &PeerId,
        _direction: Direction,
    ) -> NetworkResult<Box<dyn StreamScope>> {
        if self.deny_streams.load(Ordering::SeqCst) {
            return Err(NetworkError::ResourceLimitExceeded {
                kind: ResourceKind::Stream,
            });
        }
        self.ledger.streams_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackingStreamScope {
            ledger: self.ledger.clone(),
            released: AtomicBool::new(false),
        }))
    }
}

pub struct TrackingConnScope {
    ledger: Arc<ScopeLedger>,
    deny_peer: Option<PeerId>,
    released: AtomicBool,
}

impl ResourceScope for TrackingConnScope {
    fn reserve_memory(&self, _size: usize, _priority: u8) -> NetworkResult<()> {
        Ok(())
    }
    fn release_memory(&self, _size: usize) {}
    fn done(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            panic!("connection scope released twice");
        }
        self.ledger.conns_released.fetch_add(1, Ordering::SeqCst);
    }
}

impl ConnScope for TrackingConnScope {
    fn set_peer(&self, peer: &PeerId) -> NetworkResult<()> {
        if self.deny_peer == Some(*peer) {
            return Err(NetworkError::ResourceLimitExceeded {
                kind: ResourceKind::Peer,
            });
        }
        Ok(())
    }
}

pub struct TrackingStreamScope {
    ledger: Arc<ScopeLedger>,
    released: AtomicBool,
}

impl ResourceScope for TrackingStreamScope {
    fn reserve_memory(&self, _size: usize, _priority: u8) -> NetworkResult<()> {
        Ok(())
    }
    fn release_memory(&self, _size: usize) {}
    fn done(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            panic!("stream scope released twice");
        }
        self.ledger.streams_released.fetch_add(1, Ordering::SeqCst);
    }
}

impl StreamScope for TrackingStreamScope {
    fn set_protocol(&self, _protocol: &ProtocolId) -> NetworkResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// gating and notification fakes

/// Gater with per-checkpoint deny switches.
#[derive(Default)]
pub struct SwitchGater {
    pub deny_peer_dial: AtomicBool,
    pub deny_addr_dial: AtomicBool,
    pub deny_accept: AtomicBool,
    pub deny_secured: AtomicBool,
    pub deny_upgraded: AtomicBool,
    pub upgraded_reason: AtomicUsize,
}

impl Gater for SwitchGater {
    fn intercept_peer_dial(&self, _peer: &PeerId) -> bool {
        !self.deny_peer_dial.load(Ordering::SeqCst)
    }

    fn intercept_addr_dial(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        !self.deny_addr_dial.load(Ordering::SeqCst)
    }

    fn intercept_accept(&self, _local: &Multiaddr, _remote: &Multiaddr) -> bool {
        !self.deny_accept.load(Ordering::SeqCst)
    }

    fn intercept_secured(&self, _dir: Direction, _peer: &PeerId, _remote: &Multiaddr) -> bool {
        !self.deny_secured.load(Ordering::SeqCst)
    }

    fn intercept_upgraded(&self, _conn: &Connection) -> (bool, u32) {
        if self.deny_upgraded.load(Ordering::SeqCst) {
            (false, self.upgraded_reason.load(Ordering::SeqCst) as u32)
        } else {
            (true, 0)
        }
    }
}

/// Notifiee recording connection events in order.
#[derive(Default)]
pub struct RecordingNotifiee {
    pub events: Mutex<Vec<(String, u64)>>,
}

impl RecordingNotifiee {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(String, u64)> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifiee for RecordingNotifiee {
    fn connected(&self, conn: &Connection) {
        self.events
            .lock()
            .unwrap()
            .push(("connected".to_string(), conn.id()));
    }

    fn disconnected(&self, conn: &Connection) {
        self.events
            .lock()
            .unwrap()
            .push(("disconnected".to_string(), conn.id()));
    }
}

// ---------------------------------------------------------------------------
// swarm builders

/// A swarm over the memory network with passthrough security and the stub
/// muxer.
pub fn make_swarm(seed: u8, network: &Arc<MemoryNetwork>) -> (Swarm, Arc<MemoryTransport>) {
    make_swarm_with(seed, network, SwarmConfig::default(), None, None)
}

/// [`make_swarm`] with an explicit config, gater, and resource manager.
pub fn make_swarm_with(
    seed: u8,
    network: &Arc<MemoryNetwork>,
    config: SwarmConfig,
    gater: Option<Arc<dyn Gater>>,
    rcmgr: Option<Arc<dyn ResourceManager>>,
) -> (Swarm, Arc<MemoryTransport>) {
    init_tracing();
    let (key, peer) = keypair(seed);
    let swarm = Swarm::with_parts(
        peer,
        Arc::new(PlaintextSecurity::new(key)),
        Arc::new(StubMuxer),
        gater.unwrap_or_else(|| Arc::new(peermesh_network::AllowAllGater)),
        rcmgr.unwrap_or_else(|| Arc::new(peermesh_network::NullResourceManager)),
        Arc::new(NetMetrics::new(format!("test-{}", seed))),
        config,
    );
    let transport = MemoryTransport::new(network.clone());
    swarm.add_transport(transport.clone());
    (swarm, transport)
}
