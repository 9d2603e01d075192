//! Resource-manager capability interface.
//!
//! The core does not prescribe a resource-limit policy; it only speaks the
//! admission/release protocol: every scope obtained from
//! [`ResourceManager::open_connection`] / [`ResourceManager::open_stream`]
//! is released via [`ResourceScope::done`] exactly once, on every exit path.
//! Internally the core wraps each scope in a handle whose `Drop` guarantees
//! release even when an upgrade future is canceled mid-flight.

use std::sync::atomic::{AtomicBool, Ordering};

use multiaddr::Multiaddr;
use peermesh_types::{Direction, PeerId, ProtocolId};

use crate::error::NetworkResult;

/// Common operations of every resource scope.
pub trait ResourceScope: Send + Sync {
    /// Reserve `size` bytes against this scope's memory budget.
    ///
    /// `priority` (0..=255) lets implementations shed low-priority
    /// reservations first under pressure.
    fn reserve_memory(&self, size: usize, priority: u8) -> NetworkResult<()>;

    /// Return previously reserved memory.
    fn release_memory(&self, size: usize);

    /// Release the scope. Called exactly once by the core.
    fn done(&self);
}

/// Scope for one connection, from admission until close.
pub trait ConnScope: ResourceScope {
    /// Attach the verified peer identity, moving the scope under the peer's
    /// budget. May fail when peer-level limits are exceeded.
    fn set_peer(&self, peer: &PeerId) -> NetworkResult<()>;
}

/// Scope for one stream, from admission until close.
pub trait StreamScope: ResourceScope {
    /// Attach the negotiated application protocol, moving the scope under
    /// the protocol's budget.
    fn set_protocol(&self, protocol: &ProtocolId) -> NetworkResult<()>;
}

/// Hierarchical resource accounting: grants or denies admission for new
/// connections and streams.
pub trait ResourceManager: Send + Sync {
    /// Admit a new connection. `is_transient` marks connections whose peer
    /// is not yet known (inbound, pre-handshake).
    fn open_connection(
        &self,
        direction: Direction,
        is_transient: bool,
        remote_addr: &Multiaddr,
    ) -> NetworkResult<Box<dyn ConnScope>>;

    /// Admit a new stream on a connection to `peer`.
    fn open_stream(&self, peer: &PeerId, direction: Direction) -> NetworkResult<Box<dyn StreamScope>>;
}

/// A resource manager that admits everything and accounts nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResourceManager;

struct NullConnScope;
struct NullStreamScope;

impl ResourceScope for NullConnScope {
    fn reserve_memory(&self, _size: usize, _priority: u8) -> NetworkResult<()> {
        Ok(())
    }
    fn release_memory(&self, _size: usize) {}
    fn done(&self) {}
}

impl ConnScope for NullConnScope {
    fn set_peer(&self, _peer: &PeerId) -> NetworkResult<()> {
        Ok(())
    }
}

impl ResourceScope for NullStreamScope {
    fn reserve_memory(&self, _size: usize, _priority: u8) -> NetworkResult<()> {
        Ok(())
    }
    fn release_memory(&self, _size: usize) {}
    fn done(&self) {}
}

impl StreamScope for NullStreamScope {
    fn set_protocol(&self, _protocol: &ProtocolId) -> NetworkResult<()> {
        Ok(())
    }
}

impl ResourceManager for NullResourceManager {
    fn open_connection(
        &self,
        _direction: Direction,
        _is_transient: bool,
        _remote_addr: &Multiaddr,
    ) -> NetworkResult<Box<dyn ConnScope>> {
        Ok(Box::new(NullConnScope))
    }

    fn open_stream(
        &self,
        _peer: &PeerId,
        _direction: Direction,
    ) -> NetworkResult<Box<dyn StreamScope>> {
        Ok(Box::new(NullStreamScope))
    }
}

/// Owns a connection scope and releases it exactly once: either through an
/// explicit [`ConnScopeHandle::release`] on a failure/close path, or through
/// `Drop` when the owning future is canceled.
pub(crate) struct ConnScopeHandle {
    scope: Box<dyn ConnScope>,
    released: AtomicBool,
}

impl ConnScopeHandle {
    pub(crate) fn new(scope: Box<dyn ConnScope>) -> Self {
        Self {
            scope,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_peer(&self, peer: &PeerId) -> NetworkResult<()> {
        self.scope.set_peer(peer)
    }

    /// Access to the underlying scope, e.g. for memory reservations by
    /// higher layers.
    pub(crate) fn scope(&self) -> &dyn ConnScope {
        self.scope.as_ref()
    }

    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.scope.done();
        }
    }
}

impl Drop for ConnScopeHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Stream counterpart of [`ConnScopeHandle`].
pub(crate) struct StreamScopeHandle {
    scope: Box<dyn StreamScope>,
    released: AtomicBool,
}

impl StreamScopeHandle {
    pub(crate) fn new(scope: Box<dyn StreamScope>) -> Self {
        Self {
            scope,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_protocol(&self, protocol: &ProtocolId) -> NetworkResult<()> {
        self.scope.set_protocol(protocol)
    }

    pub(crate) fn scope(&self) -> &dyn StreamScope {
        self.scope.as_ref()
    }

    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.scope.done();
        }
    }
}

impl Drop for StreamScopeHandle {
    fn drop(&mut self) {
        self.release();
    }
}
