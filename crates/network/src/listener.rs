//! Backpressure-gated upgrade listener.
//!
//! Decouples raw-accept throughput from application accept throughput.
//! Every accepted raw connection is upgraded in its own task so a slow
//! handshake cannot block other upgrades; a threshold counter of
//! upgraded-but-undelivered connections pauses the raw accept loop once
//! [`crate::SwarmConfig::accept_queue_len`] connections are waiting.
//! Transient raw-accept errors are logged and retried; permanent errors
//! terminate the loop and surface from [`Listener::accept`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use multiaddr::Multiaddr;
use peermesh_common::{EventType, LogEvent};
use peermesh_types::Direction;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ACCEPT_RETRY_DELAY;
use crate::conn::Connection;
use crate::error::{NetworkError, NetworkResult};
use crate::rcmgr::ConnScopeHandle;
use crate::swarm::SwarmInner;
use crate::transport::{RawConn, RawListener};

/// Counter of upgraded-but-undelivered connections.
///
/// `acquire` never blocks; it only makes later `wait` calls block while the
/// count is at or above the threshold. A threshold of zero disables
/// backpressure.
pub(crate) struct Threshold {
    max: usize,
    count: Mutex<usize>,
    notify: Notify,
}

impl Threshold {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max,
            count: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    pub(crate) async fn wait(&self) {
        if self.max == 0 {
            return;
        }
        loop {
            // Register for wakeups before re-checking, so a release landing
            // in between is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if *self.count.lock().unwrap() < self.max {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn acquire(&self) {
        *self.count.lock().unwrap() += 1;
    }

    pub(crate) fn release(&self) {
        let below = {
            let mut count = self.count.lock().unwrap();
            *count = count.saturating_sub(1);
            *count < self.max
        };
        if below {
            self.notify.notify_waiters();
        }
    }
}

struct QueueState<T> {
    queue: VecDeque<T>,
    closed: bool,
    err: Option<NetworkError>,
}

/// Delivery queue between upgrade tasks and `accept` callers.
pub(crate) struct ConnQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> ConnQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                closed: false,
                err: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue an item; hands it back if the queue is already closed.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                return Err(item);
            }
            st.queue.push_back(item);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait for the next item, or the close error once the queue drains.
    pub(crate) async fn pop(&self) -> NetworkResult<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().unwrap();
                if let Some(item) = st.queue.pop_front() {
                    return Ok(item);
                }
                if st.closed {
                    return Err(st.err.clone().unwrap_or(NetworkError::ListenerClosed));
                }
            }
            notified.await;
        }
    }

    /// Close the queue and drain whatever is still waiting.
    pub(crate) fn close(&self, err: NetworkError) -> Vec<T> {
        let drained = {
            let mut st = self.state.lock().unwrap();
            st.closed = true;
            st.err = Some(err);
            st.queue.drain(..).collect()
        };
        self.notify.notify_waiters();
        drained
    }
}

/// A listener whose raw connections are upgraded before delivery.
pub struct Listener {
    local_addr: Multiaddr,
    raw: Arc<dyn RawListener>,
    queue: Arc<ConnQueue<Connection>>,
    threshold: Arc<Threshold>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    swarm: Weak<SwarmInner>,
}

impl Listener {
    /// Start a listener over an already-bound raw listener.
    pub(crate) fn spawn(raw: Box<dyn RawListener>, swarm: &Arc<SwarmInner>) -> Arc<Self> {
        let raw: Arc<dyn RawListener> = Arc::from(raw);
        let queue = Arc::new(ConnQueue::new());
        let threshold = Arc::new(Threshold::new(swarm.config.accept_queue_len));
        let cancel = CancellationToken::new();

        let listener = Arc::new(Self {
            local_addr: raw.local_addr(),
            raw: raw.clone(),
            queue: queue.clone(),
            threshold: threshold.clone(),
            cancel: cancel.clone(),
            accept_task: Mutex::new(None),
            swarm: Arc::downgrade(swarm),
        });

        let task = tokio::spawn(handle_incoming(
            raw,
            queue,
            threshold,
            cancel,
            Arc::downgrade(swarm),
        ));
        *listener.accept_task.lock().unwrap() = Some(task);

        listener
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> &Multiaddr {
        &self.local_addr
    }

    /// Accept the next fully-upgraded inbound connection.
    ///
    /// Admits the connection into the swarm registry (emitting the connect
    /// notification and starting its stream-accept loop) before returning
    /// it. Connections that closed while queued are skipped.
    pub async fn accept(&self) -> NetworkResult<Connection> {
        loop {
            let conn = self.queue.pop().await?;
            self.threshold.release();

            // could have been sitting in the queue for a while
            if conn.is_closed() {
                continue;
            }

            let Some(swarm) = self.swarm.upgrade() else {
                let _ = conn.close().await;
                return Err(NetworkError::SwarmClosed);
            };
            swarm.add_conn(&conn).await?;
            return Ok(conn);
        }
    }

    /// Close the listener: stops the raw listener, joins all in-flight
    /// upgrade tasks, and drains and closes every queued-but-undelivered
    /// connection before returning.
    pub async fn close(&self) -> NetworkResult<()> {
        let res = self.raw.close().await;
        self.cancel.cancel();
        let task = { self.accept_task.lock().unwrap().take() };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("listener accept task panicked: {:?}", e);
            }
        }
        res
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Accept raw connections past the gater and resource manager.
///
/// Denied connections are closed and the loop keeps going; only raw-accept
/// errors propagate.
async fn gated_accept(
    raw: &dyn RawListener,
    swarm: &Arc<SwarmInner>,
) -> NetworkResult<(RawConn, ConnScopeHandle)> {
    loop {
        let conn = raw.accept().await?;

        if !swarm
            .gater
            .intercept_accept(&conn.local_addr, &conn.remote_addr)
        {
            debug!("gater blocked incoming connection from {}", conn.remote_addr);
            swarm.metrics.inc_gate_rejections();
            LogEvent::new(EventType::GateBlocked)
                .with_address(conn.remote_addr.to_string())
                .with_direction(Direction::Inbound)
                .with_context("phase", "accept")
                .emit();
            conn.close().await;
            continue;
        }

        match swarm
            .rcmgr
            .open_connection(Direction::Inbound, true, &conn.remote_addr)
        {
            // Wrapped immediately: the handle guarantees release even if
            // the upgrade task is dropped before it runs.
            Ok(scope) => return Ok((conn, ConnScopeHandle::new(scope))),
            Err(e) => {
                debug!("resource manager blocked accept of new connection: {}", e);
                swarm.metrics.inc_resource_denials();
                conn.close().await;
            }
        }
    }
}

/// The raw accept loop: gate, pause on backpressure, spawn one upgrade task
/// per accepted connection, and deliver completed upgrades into the queue.
async fn handle_incoming(
    raw: Arc<dyn RawListener>,
    queue: Arc<ConnQueue<Connection>>,
    threshold: Arc<Threshold>,
    cancel: CancellationToken,
    swarm: Weak<SwarmInner>,
) {
    let mut upgrades = JoinSet::new();
    let mut terminal_err: Option<NetworkError> = None;

    loop {
        // Backpressure: while enough upgraded connections await delivery,
        // simply stop accepting from the raw listener.
        tokio::select! {
            _ = threshold.wait() => {}
            _ = cancel.cancelled() => break,
        }

        let Some(swarm_strong) = swarm.upgrade() else {
            break;
        };

        let accepted = tokio::select! {
            res = gated_accept(raw.as_ref(), &swarm_strong) => res,
            _ = cancel.cancelled() => break,
        };

        let (raw_conn, scope) = match accepted {
            Ok(accepted) => accepted,
            Err(e) if e.is_transient() => {
                warn!("temporary accept error: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
            Err(e) => {
                terminal_err = Some(e);
                break;
            }
        };

        debug!(
            "listener {} got connection: {} <---> {}",
            raw.local_addr(),
            raw_conn.local_addr,
            raw_conn.remote_addr,
        );

        let accept_timeout = swarm_strong.config.accept_timeout;
        let queue = queue.clone();
        let threshold = threshold.clone();
        let metrics = swarm_strong.metrics.clone();
        upgrades.spawn(async move {
            let upgraded = tokio::time::timeout(
                accept_timeout,
                swarm_strong.upgrade(Direction::Inbound, raw_conn, None, scope),
            )
            .await;
            let conn = match upgraded {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    // Nothing to bubble up: the inbound attempt simply
                    // failed to negotiate. The upgrade released the scope.
                    debug!("accept upgrade error: {}", e);
                    return;
                }
                Err(_) => {
                    debug!("inbound upgrade timed out");
                    return;
                }
            };

            // Counts against the threshold until an accept call takes it.
            threshold.acquire();
            if let Err(conn) = queue.push(conn) {
                metrics.inc_accepts_dropped();
                LogEvent::new(EventType::AcceptDropped)
                    .with_peer(&conn.remote_peer())
                    .with_address(conn.remote_addr().to_string())
                    .emit();
                let _ = conn.close().await;
                threshold.release();
            }
        });
    }

    // Join all in-flight upgrade tasks before completing the close.
    while upgrades.join_next().await.is_some() {}

    let err = match terminal_err {
        Some(e) if e.indicates_closed() => NetworkError::ListenerClosed,
        Some(e) => e,
        None => NetworkError::ListenerClosed,
    };
    for conn in queue.close(err) {
        threshold.release();
        let _ = conn.close().await;
    }
}
