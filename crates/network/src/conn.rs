//! Capable connections: secured, multiplexed, resource-accounted.
//!
//! A [`Connection`] is the result of a successful upgrade. It owns the
//! multiplexed session, its live set of child streams, and the connection
//! resource scope, and it guarantees the connect-before-disconnect
//! notification ordering through a per-connection notification lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use multiaddr::Multiaddr;
use peermesh_common::{EventType, LogEvent};
use peermesh_types::{Direction, PeerId, ProtocolId, PublicKey};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::{NetworkError, NetworkResult};
use crate::muxing::{MuxedConn, MuxedStream};
use crate::rcmgr::{ConnScope, ConnScopeHandle, StreamScopeHandle};
use crate::stream::{Stream, StreamInfo, StreamShared};
use crate::swarm::SwarmInner;

pub(crate) struct ConnInner {
    pub(crate) id: u64,
    pub(crate) local_peer: PeerId,
    pub(crate) remote_peer: PeerId,
    pub(crate) remote_public_key: PublicKey,
    pub(crate) local_addr: Multiaddr,
    pub(crate) remote_addr: Multiaddr,
    pub(crate) direction: Direction,
    pub(crate) security_protocol: ProtocolId,
    pub(crate) muxer_protocol: ProtocolId,
    pub(crate) opened_at: Instant,
    pub(crate) muxer: Box<dyn MuxedConn>,
    pub(crate) scope: ConnScopeHandle,
    /// Live child streams. `None` is the closing sentinel: once taken, no
    /// further streams may be added.
    streams: Mutex<Option<HashMap<u64, Arc<StreamShared>>>>,
    /// Held while connect notifications run, so the disconnect notification
    /// cannot overtake them.
    pub(crate) notify_lock: AsyncMutex<()>,
    closed: AtomicBool,
    started: AtomicBool,
    /// Set once the connect notification fired; disconnect is only emitted
    /// for announced connections.
    pub(crate) announced: AtomicBool,
    pub(crate) swarm: Weak<SwarmInner>,
}

impl ConnInner {
    pub(crate) fn debug_id(&self) -> String {
        // format: <first 10 hex chars of peer id>-<process-wide ordinal>
        format!("{}-{}", self.remote_peer.short(), self.id)
    }

    pub(crate) fn detach_stream(&self, id: u64) {
        if let Some(map) = self.streams.lock().unwrap().as_mut() {
            map.remove(&id);
        }
    }

    async fn do_close(self: &Arc<Self>) -> NetworkResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing connection {}", self.debug_id());

        let swarm = self.swarm.upgrade();
        if let Some(swarm) = &swarm {
            swarm.remove_conn(self);
        }

        // Closing sentinel: no further streams may be added.
        let streams = { self.streams.lock().unwrap().take() };

        let res = self.muxer.close().await;

        // Resets all live streams; each record releases its scope through
        // the close state machine (streams still in accept processing are
        // released when that processing finishes).
        if let Some(map) = streams {
            for shared in map.into_values() {
                shared.on_closed();
            }
        }

        if let Some(swarm) = &swarm {
            // Counters and the disconnect notification pair with add_conn:
            // a connection that was never announced reports neither.
            if self.announced.load(Ordering::SeqCst) {
                swarm.metrics.inc_conns_closed();
                LogEvent::new(EventType::ConnClosed)
                    .with_correlation_id(self.debug_id())
                    .with_peer(&self.remote_peer)
                    .with_direction(self.direction)
                    .with_duration(self.opened_at.elapsed())
                    .emit();
            }

            // The disconnect notification must not overtake an in-flight
            // connect notification; it waits on the notification lock in a
            // background task so close cannot deadlock when called from
            // inside a connect notification.
            let inner = self.clone();
            let swarm_task = swarm.clone();
            swarm.tracker.spawn(async move {
                let _guard = inner.notify_lock.lock().await;
                if inner.announced.load(Ordering::SeqCst) {
                    let conn = Connection {
                        inner: inner.clone(),
                    };
                    swarm_task.notify_all(|n| n.disconnected(&conn));
                }
            });
        }

        self.scope.release();
        res
    }
}

/// A secured, multiplexed connection to a peer.
///
/// Cheap to clone; all clones refer to the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        swarm: Weak<SwarmInner>,
        muxer: Box<dyn MuxedConn>,
        scope: ConnScopeHandle,
        direction: Direction,
        local_peer: PeerId,
        remote_peer: PeerId,
        remote_public_key: PublicKey,
        local_addr: Multiaddr,
        remote_addr: Multiaddr,
        security_protocol: ProtocolId,
        muxer_protocol: ProtocolId,
    ) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                id,
                local_peer,
                remote_peer,
                remote_public_key,
                local_addr,
                remote_addr,
                direction,
                security_protocol,
                muxer_protocol,
                opened_at: Instant::now(),
                muxer,
                scope,
                streams: Mutex::new(Some(HashMap::new())),
                notify_lock: AsyncMutex::new(()),
                closed: AtomicBool::new(false),
                started: AtomicBool::new(false),
                announced: AtomicBool::new(false),
                swarm,
            }),
        }
    }

    /// Process-unique connection ordinal.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Debug identifier: `<peer-short>-<ordinal>`.
    pub fn debug_id(&self) -> String {
        self.inner.debug_id()
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn remote_peer(&self) -> PeerId {
        self.inner.remote_peer
    }

    pub fn remote_public_key(&self) -> &PublicKey {
        &self.inner.remote_public_key
    }

    pub fn local_addr(&self) -> &Multiaddr {
        &self.inner.local_addr
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.inner.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// The security protocol negotiated during the upgrade.
    pub fn security_protocol(&self) -> &ProtocolId {
        &self.inner.security_protocol
    }

    /// The stream multiplexer negotiated during the upgrade.
    pub fn muxer_protocol(&self) -> &ProtocolId {
        &self.inner.muxer_protocol
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.inner.muxer.is_closed()
    }

    /// When the connection finished its upgrade.
    pub fn opened_at(&self) -> Instant {
        self.inner.opened_at
    }

    /// Number of live streams.
    pub fn num_streams(&self) -> usize {
        match self.inner.streams.lock().unwrap().as_ref() {
            Some(map) => map.len(),
            None => 0,
        }
    }

    /// Metadata of all live streams.
    pub fn streams(&self) -> Vec<StreamInfo> {
        match self.inner.streams.lock().unwrap().as_ref() {
            Some(map) => map.values().map(|s| s.info()).collect(),
            None => Vec::new(),
        }
    }

    /// The connection's resource scope, for memory reservations.
    pub fn scope(&self) -> &dyn ConnScope {
        self.inner.scope.scope()
    }

    /// Open a new outbound stream on this connection.
    pub async fn new_stream(&self) -> NetworkResult<Stream> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionClosed);
        }
        let swarm = self
            .inner
            .swarm
            .upgrade()
            .ok_or(NetworkError::SwarmClosed)?;

        let scope = swarm
            .rcmgr
            .open_stream(&self.inner.remote_peer, Direction::Outbound)?;
        let scope = StreamScopeHandle::new(scope);

        let ts = match tokio::time::timeout(
            swarm.config.new_stream_timeout,
            self.inner.muxer.open_stream(),
        )
        .await
        {
            Ok(Ok(ts)) => ts,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(NetworkError::Timeout("new stream".to_string())),
        };

        Self::add_stream(&self.inner, &swarm, ts, Direction::Outbound, scope).await
    }

    /// Register a muxed stream with the connection and wrap it.
    pub(crate) async fn add_stream(
        inner: &Arc<ConnInner>,
        swarm: &Arc<SwarmInner>,
        ts: Box<dyn MuxedStream>,
        direction: Direction,
        scope: StreamScopeHandle,
    ) -> NetworkResult<Stream> {
        let id = swarm.next_stream_id.fetch_add(1, Ordering::Relaxed) + 1;
        let shared = Arc::new(StreamShared::new(
            id,
            direction,
            scope,
            Arc::downgrade(inner),
        ));

        let inserted = {
            let mut guard = inner.streams.lock().unwrap();
            match guard.as_mut() {
                Some(map) => {
                    map.insert(id, shared.clone());
                    true
                }
                None => false,
            }
        };

        if !inserted {
            let mut ts = ts;
            let _ = ts.reset().await;
            // dropping `shared` releases the stream scope
            return Err(NetworkError::ConnectionClosed);
        }

        swarm.metrics.inc_streams_opened();
        LogEvent::new(EventType::StreamOpened)
            .with_correlation_id(shared.debug_id())
            .with_peer(&inner.remote_peer)
            .with_direction(direction)
            .emit();

        Ok(Stream::new(ts, shared))
    }

    /// Start the inbound-stream accept loop. One background task per
    /// connection; idempotent.
    pub(crate) fn start(&self, swarm: &Arc<SwarmInner>) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let swarm = swarm.clone();
        let tracker = swarm.tracker.clone();
        tracker.spawn(async move {
            loop {
                let ts = match inner.muxer.accept_stream().await {
                    Ok(ts) => ts,
                    Err(_) => break,
                };
                let scope = match swarm
                    .rcmgr
                    .open_stream(&inner.remote_peer, Direction::Inbound)
                {
                    Ok(scope) => StreamScopeHandle::new(scope),
                    Err(e) => {
                        debug!(
                            "rejecting inbound stream from {}: {}",
                            inner.remote_peer.short(),
                            e
                        );
                        swarm.metrics.inc_resource_denials();
                        let mut ts = ts;
                        let _ = ts.reset().await;
                        continue;
                    }
                };
                let stream = match Connection::add_stream(
                    &inner,
                    &swarm,
                    ts,
                    Direction::Inbound,
                    scope,
                )
                .await
                {
                    Ok(stream) => stream,
                    Err(_) => break,
                };

                // Hand the stream to the application handler in its own
                // task; the stream's scope is only released once both the
                // stream closed and this processing finished.
                let shared = stream.shared().clone();
                let handler = swarm.stream_handler();
                swarm.tracker.spawn(async move {
                    if let Some(handler) = handler {
                        handler(stream);
                    }
                    shared.complete_accept();
                });
            }

            // Session is gone; tear the connection down.
            let conn = Connection {
                inner: inner.clone(),
            };
            let _ = conn.close().await;
        });
    }

    /// Close the connection: resets all live streams, closes the muxed
    /// session, releases the connection scope, and emits the disconnect
    /// notification after any in-flight connect notification.
    pub async fn close(&self) -> NetworkResult<()> {
        self.inner.do_close().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_peer", &self.inner.remote_peer)
            .field("direction", &self.inner.direction)
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
