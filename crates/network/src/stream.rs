//! Logical streams multiplexed over a capable connection.
//!
//! A [`Stream`] is the user-facing handle: it owns the underlying muxed
//! stream's I/O exclusively. The connection's registry holds only the shared
//! bookkeeping record ([`StreamShared`]), which tracks the close lifecycle.
//!
//! ## Close lifecycle
//!
//! A stream's resource scope must be released exactly once, and only after
//! both of two independent completion signals have fired: the stream itself
//! closed (locally or via reset), and any task still processing its
//! acceptance finished. The record keeps an explicit
//! `closed` / `accept_done` / `released` state machine under one mutex;
//! whichever transition observes both bits set performs the release.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use peermesh_common::{EventType, LogEvent};
use peermesh_types::{Direction, ProtocolId};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::conn::ConnInner;
use crate::error::{NetworkError, NetworkResult};
use crate::muxing::MuxedStream;
use crate::rcmgr::{StreamScope, StreamScopeHandle};

/// Metadata about a live stream, for enumeration.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Stream ordinal, unique within the connection's process lifetime.
    pub id: u64,
    /// Who opened the stream.
    pub direction: Direction,
    /// Negotiated application protocol, once set.
    pub protocol: Option<ProtocolId>,
}

#[derive(Default)]
struct CloseState {
    closed: bool,
    accept_done: bool,
    released: bool,
}

/// Shared bookkeeping record of one stream, registered with its connection.
pub(crate) struct StreamShared {
    pub(crate) id: u64,
    pub(crate) direction: Direction,
    pub(crate) opened_at: Instant,
    protocol: RwLock<Option<ProtocolId>>,
    scope: StreamScopeHandle,
    state: Mutex<CloseState>,
    closed_flag: AtomicBool,
    conn: Weak<ConnInner>,
}

impl StreamShared {
    pub(crate) fn new(
        id: u64,
        direction: Direction,
        scope: StreamScopeHandle,
        conn: Weak<ConnInner>,
    ) -> Self {
        Self {
            id,
            direction,
            opened_at: Instant::now(),
            protocol: RwLock::new(None),
            scope,
            state: Mutex::new(CloseState {
                closed: false,
                // Outbound streams have no acceptance processing.
                accept_done: direction.is_outbound(),
                released: false,
            }),
            closed_flag: AtomicBool::new(false),
            conn,
        }
    }

    pub(crate) fn protocol(&self) -> Option<ProtocolId> {
        self.protocol.read().unwrap().clone()
    }

    pub(crate) fn set_protocol(&self, protocol: &ProtocolId) -> NetworkResult<()> {
        let mut guard = self.protocol.write().unwrap();
        if guard.is_some() {
            return Err(NetworkError::ProtocolAlreadySet);
        }
        self.scope.set_protocol(protocol)?;
        *guard = Some(protocol.clone());
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::SeqCst)
    }

    pub(crate) fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id,
            direction: self.direction,
            protocol: self.protocol(),
        }
    }

    pub(crate) fn debug_id(&self) -> String {
        match self.conn.upgrade() {
            Some(conn) => format!("{}-{}", conn.debug_id(), self.id),
            None => format!("-{}", self.id),
        }
    }

    /// The stream closed (local close, reset, or connection teardown).
    pub(crate) fn on_closed(&self) {
        let should_release = {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            self.closed_flag.store(true, Ordering::SeqCst);
            if st.accept_done && !st.released {
                st.released = true;
                true
            } else {
                false
            }
        };
        if should_release {
            self.release_slot();
        }
    }

    /// The task processing this stream's acceptance finished.
    pub(crate) fn complete_accept(&self) {
        let should_release = {
            let mut st = self.state.lock().unwrap();
            if st.accept_done {
                return;
            }
            st.accept_done = true;
            if st.closed && !st.released {
                st.released = true;
                true
            } else {
                false
            }
        };
        if should_release {
            self.release_slot();
        }
    }

    /// Remove the stream from its connection and release its scope.
    /// Reached exactly once, guarded by the `released` bit.
    fn release_slot(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.detach_stream(self.id);
            if let Some(swarm) = conn.swarm.upgrade() {
                swarm.metrics.inc_streams_closed();
                LogEvent::new(EventType::StreamClosed)
                    .with_correlation_id(self.debug_id())
                    .with_peer(&conn.remote_peer)
                    .with_duration(self.opened_at.elapsed())
                    .emit();
            }
        }
        self.scope.release();
    }
}

/// A logical duplex stream over a capable connection.
///
/// Implements `AsyncRead`/`AsyncWrite`; once closed, further reads and
/// writes fail with a "stream closed" I/O error.
pub struct Stream {
    io: Box<dyn MuxedStream>,
    shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn new(io: Box<dyn MuxedStream>, shared: Arc<StreamShared>) -> Self {
        Self { io, shared }
    }

    /// Stream ordinal, unique within the connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Debug identifier: `<peer-short>-<conn-ordinal>-<stream-ordinal>`.
    pub fn debug_id(&self) -> String {
        self.shared.debug_id()
    }

    /// Who opened this stream.
    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// The negotiated application protocol, once set.
    pub fn protocol(&self) -> Option<ProtocolId> {
        self.shared.protocol()
    }

    /// Record the application protocol spoken on this stream. May be set
    /// only once; fails if the stream's resource scope rejects the protocol.
    pub fn set_protocol(&self, protocol: &ProtocolId) -> NetworkResult<()> {
        self.shared.set_protocol(protocol)
    }

    /// Whether the stream is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// When the stream was opened.
    pub fn opened_at(&self) -> Instant {
        self.shared.opened_at
    }

    /// The stream's resource scope, for memory reservations.
    pub fn scope(&self) -> &dyn StreamScope {
        self.shared.scope.scope()
    }

    /// Close the stream, flushing buffered data and sending EOF.
    pub async fn close(mut self) -> NetworkResult<()> {
        let res = self.io.shutdown().await;
        self.shared.on_closed();
        res.map_err(Into::into)
    }

    /// Abruptly terminate the stream in both directions.
    pub async fn reset(mut self) -> NetworkResult<()> {
        let res = self.io.reset().await;
        self.shared.on_closed();
        res
    }

    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // A handle dropped without an explicit close still counts as closed;
        // the underlying muxed stream dies with the io box.
        self.shared.on_closed();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream closed")
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.shared.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shared.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
