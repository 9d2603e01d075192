//! Connection gating.
//!
//! A [`Gater`] is a pluggable policy hook consulted at five checkpoints of
//! connection establishment. Refusal at any checkpoint aborts the attempt;
//! the `secured` and `upgraded` checkpoints run after authentication so the
//! policy can key on a verified identity.

use multiaddr::Multiaddr;
use peermesh_types::{Direction, PeerId};

use crate::conn::Connection;

/// Pluggable connection-admission policy.
///
/// All methods default to allow, so implementations only override the
/// checkpoints they care about.
pub trait Gater: Send + Sync {
    /// Called before any address of `peer` is dialed.
    fn intercept_peer_dial(&self, _peer: &PeerId) -> bool {
        true
    }

    /// Called before dialing a specific address of `peer`.
    fn intercept_addr_dial(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        true
    }

    /// Called when a raw inbound connection arrives, before any handshake.
    fn intercept_accept(&self, _local_addr: &Multiaddr, _remote_addr: &Multiaddr) -> bool {
        true
    }

    /// Called after the security handshake, with the verified identity.
    fn intercept_secured(
        &self,
        _direction: Direction,
        _peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> bool {
        true
    }

    /// Called on the fully-upgraded connection. Returns `(allow, reason)`
    /// where `reason` is an opaque policy code surfaced in the gating error
    /// when `allow` is false.
    fn intercept_upgraded(&self, _conn: &Connection) -> (bool, u32) {
        (true, 0)
    }
}

/// A gater that allows everything. The default when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllGater;

impl Gater for AllowAllGater {}
