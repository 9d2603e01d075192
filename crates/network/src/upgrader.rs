//! Connection upgrade pipeline.
//!
//! Turns one raw connection into one capable (secured + multiplexed)
//! connection, for both directions:
//!
//! ```text
//! raw conn ──> security handshake ──> gater (secured) ──> muxer ──>
//!     scope.set_peer ──> Connection ──> gater (upgraded)
//! ```
//!
//! Any failure cleans up fully: the raw connection is closed (the byte
//! stream is consumed by the failing stage and dropped) and the connection
//! scope is released, exactly once, via its owning handle. No partially
//! upgraded connection escapes on failure.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use peermesh_common::{EventType, LogEvent};
use peermesh_types::{Direction, PeerId};
use tracing::debug;

use crate::conn::Connection;
use crate::error::{GatePhase, NetworkError, NetworkResult};
use crate::rcmgr::ConnScopeHandle;
use crate::swarm::SwarmInner;
use crate::transport::RawConn;

impl SwarmInner {
    /// Upgrade a raw connection.
    ///
    /// Takes ownership of the connection scope handle: on failure it is
    /// released here (or by the handle's drop if the upgrade is canceled
    /// mid-flight); on success it transfers into the returned
    /// [`Connection`] and is released when that connection closes.
    pub(crate) async fn upgrade(
        self: &Arc<Self>,
        direction: Direction,
        raw: RawConn,
        expected_peer: Option<PeerId>,
        scope: ConnScopeHandle,
    ) -> NetworkResult<Connection> {
        let RawConn {
            io,
            local_addr,
            remote_addr,
        } = raw;

        // Security handshake. The provider verifies `expected_peer` and
        // consumes (closes) the raw stream on failure.
        let secured = match direction {
            Direction::Outbound => self.security.secure_outbound(io, expected_peer).await,
            Direction::Inbound => self.security.secure_inbound(io, expected_peer).await,
        };
        let secured = match secured {
            Ok(secured) => secured,
            Err(e) => {
                let e = match e {
                    e @ NetworkError::PeerIdMismatch { .. } => e,
                    e @ NetworkError::HandshakeFailed { .. } => e,
                    other => NetworkError::HandshakeFailed {
                        reason: other.to_string(),
                    },
                };
                self.metrics.inc_handshake_failures();
                LogEvent::new(EventType::HandshakeFailed)
                    .with_address(remote_addr.to_string())
                    .with_direction(direction)
                    .with_error(e.to_string())
                    .emit();
                return Err(e);
            }
        };

        // A pinned identity must match the verified key even if the
        // provider skipped the check.
        if let Some(expected) = expected_peer {
            if secured.remote_peer != expected {
                self.metrics.inc_handshake_failures();
                let e = NetworkError::PeerIdMismatch {
                    expected,
                    actual: secured.remote_peer,
                };
                LogEvent::new(EventType::HandshakeFailed)
                    .with_address(remote_addr.to_string())
                    .with_direction(direction)
                    .with_error(e.to_string())
                    .emit();
                return Err(e);
            }
        }

        // Gate with the verified identity; this runs strictly after
        // authentication so the policy can key on who the peer really is.
        if !self
            .gater
            .intercept_secured(direction, &secured.remote_peer, &remote_addr)
        {
            self.metrics.inc_gate_rejections();
            LogEvent::new(EventType::GateBlocked)
                .with_peer(&secured.remote_peer)
                .with_address(remote_addr.to_string())
                .with_direction(direction)
                .with_context("phase", GatePhase::Secured.to_string())
                .emit();
            return Err(NetworkError::GatingRejected {
                phase: GatePhase::Secured,
                reason: 0,
            });
        }

        let remote_peer = secured.remote_peer;
        let remote_public_key = secured.remote_public_key;

        // Stream multiplexer over the secured stream.
        let muxed = match self
            .muxer
            .new_muxed_conn(secured.io, direction.is_outbound())
            .await
        {
            Ok(muxed) => muxed,
            Err(e) => {
                let e = match e {
                    e @ NetworkError::MuxerFailed { .. } => e,
                    other => NetworkError::MuxerFailed {
                        reason: other.to_string(),
                    },
                };
                self.metrics.inc_muxer_failures();
                LogEvent::new(EventType::MuxerFailed)
                    .with_peer(&remote_peer)
                    .with_address(remote_addr.to_string())
                    .with_error(e.to_string())
                    .emit();
                return Err(e);
            }
        };

        // Attribute the connection to the peer now that identity is known.
        // May fail when peer-level limits are exceeded.
        if let Err(e) = scope.set_peer(&remote_peer) {
            self.metrics.inc_resource_denials();
            LogEvent::new(EventType::ResourceDenied)
                .with_peer(&remote_peer)
                .with_address(remote_addr.to_string())
                .with_error(e.to_string())
                .emit();
            let _ = muxed.close().await;
            return Err(e);
        }

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Connection::new(
            id,
            Arc::downgrade(self),
            muxed,
            scope,
            direction,
            self.local_peer,
            remote_peer,
            remote_public_key,
            local_addr,
            remote_addr.clone(),
            self.security.protocol_id(),
            self.muxer.protocol_id(),
        );

        // Final gate on the fully-formed connection. Refusal is observed
        // with the connection's identifiers before the close, so policy
        // rejections remain visible to metrics and logs.
        let (allow, reason) = self.gater.intercept_upgraded(&conn);
        if !allow {
            self.metrics.inc_gate_rejections();
            LogEvent::new(EventType::GateBlocked)
                .with_correlation_id(conn.debug_id())
                .with_peer(&remote_peer)
                .with_address(remote_addr.to_string())
                .with_direction(direction)
                .with_context("phase", GatePhase::Upgraded.to_string())
                .with_context("reason", reason.to_string())
                .emit();
            let _ = conn.close().await;
            return Err(NetworkError::GatingRejected {
                phase: GatePhase::Upgraded,
                reason,
            });
        }

        debug!(
            "upgraded {} connection {}: {} <---> {}",
            direction,
            conn.debug_id(),
            conn.local_addr(),
            conn.remote_addr(),
        );

        Ok(conn)
    }
}
