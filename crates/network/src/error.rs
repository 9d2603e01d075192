//! Network error types for the peermesh upgrade core.

use std::io;
use std::sync::Arc;

use multiaddr::Multiaddr;
use peermesh_types::PeerId;
use thiserror::Error;

/// The checkpoint at which the connection gater refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    /// `intercept_peer_dial`, before any address was attempted.
    PeerDial,
    /// `intercept_addr_dial`, before dialing a specific address.
    AddrDial,
    /// `intercept_accept`, before admitting a raw inbound connection.
    Accept,
    /// `intercept_secured`, after the security handshake verified the peer.
    Secured,
    /// `intercept_upgraded`, on the fully-formed connection.
    Upgraded,
}

impl std::fmt::Display for GatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PeerDial => "peer-dial",
            Self::AddrDial => "addr-dial",
            Self::Accept => "accept",
            Self::Secured => "secured",
            Self::Upgraded => "upgraded",
        };
        write!(f, "{}", s)
    }
}

/// Which resource budget an admission request exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Connection,
    Stream,
    Peer,
    Memory,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connection => "connection",
            Self::Stream => "stream",
            Self::Peer => "peer",
            Self::Memory => "memory",
        };
        write!(f, "{}", s)
    }
}

/// A single failed dial candidate, kept so multi-address dial failures can
/// report every candidate's outcome instead of only the last one.
#[derive(Debug, Clone)]
pub struct DialAttempt {
    /// The address that was attempted.
    pub addr: Multiaddr,
    /// Why this candidate failed.
    pub error: Box<NetworkError>,
}

/// Errors that can occur in the connection-upgrade core.
///
/// The enum is `Clone` so that the outcome of one shared dial can be fanned
/// out to every caller waiting on it; I/O causes are held behind an `Arc`.
#[derive(Debug, Error, Clone)]
pub enum NetworkError {
    /// The connection gater refused the connection.
    #[error("gater rejected connection at {phase} checkpoint")]
    GatingRejected {
        phase: GatePhase,
        /// Opaque policy reason code (0 when the gater gave none).
        reason: u32,
    },

    /// The security handshake failed.
    #[error("security handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    /// The handshake succeeded but authenticated a different peer than the
    /// dial expected. Never retried against the same address.
    #[error("peer id mismatch: expected {expected}, but remote key matches {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    /// Stream-multiplexer negotiation failed on a secured connection.
    #[error("stream multiplexer negotiation failed: {reason}")]
    MuxerFailed { reason: String },

    /// A resource-manager admission was denied.
    #[error("resource limit exceeded at {kind} level")]
    ResourceLimitExceeded { kind: ResourceKind },

    /// The listener is closed; no further connections will be accepted.
    #[error("listener closed")]
    ListenerClosed,

    /// A blocking operation ran out of time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Operation attempted on a closed connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation attempted on a closed stream.
    #[error("stream closed")]
    StreamClosed,

    /// The swarm has been shut down.
    #[error("swarm closed")]
    SwarmClosed,

    /// The application protocol on a stream may only be set once.
    #[error("protocol already set on stream")]
    ProtocolAlreadySet,

    /// A dial targeted the local peer itself.
    #[error("dial to self attempted")]
    DialToSelf,

    /// No addresses are known for the peer being dialed.
    #[error("no known addresses for peer {0}")]
    NoAddresses(PeerId),

    /// No registered transport can handle the address.
    #[error("no transport for address {0}")]
    NoTransport(Multiaddr),

    /// Every dial candidate failed; per-candidate outcomes are attached.
    #[error("dial to peer {peer} failed across {} candidate address(es)", .attempts.len())]
    DialFailed {
        peer: PeerId,
        attempts: Vec<DialAttempt>,
    },

    /// The dial was canceled before it produced a result.
    #[error("dial canceled")]
    DialCanceled,

    /// An internal channel closed unexpectedly.
    #[error("internal channel closed")]
    ChannelClosed,

    /// Underlying I/O error.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
}

impl NetworkError {
    /// True for errors the raw-accept loop should log and retry rather than
    /// treat as fatal (e.g. a transient file-descriptor shortage).
    pub fn is_transient(&self) -> bool {
        match self {
            NetworkError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// True if the error indicates the underlying socket was closed, in which
    /// case the listener surfaces the [`NetworkError::ListenerClosed`]
    /// sentinel instead.
    pub fn indicates_closed(&self) -> bool {
        match self {
            NetworkError::ListenerClosed => true,
            NetworkError::Io(e) => {
                matches!(
                    e.kind(),
                    io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
                ) || e.to_string().contains("closed")
            }
            _ => false,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(e: io::Error) -> Self {
        NetworkError::Io(Arc::new(e))
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_phase_display() {
        let err = NetworkError::GatingRejected {
            phase: GatePhase::Secured,
            reason: 0,
        };
        assert_eq!(
            err.to_string(),
            "gater rejected connection at secured checkpoint"
        );
    }

    #[test]
    fn test_peer_id_mismatch_display() {
        let expected = peermesh_types::PublicKey::new(vec![1]).peer_id();
        let actual = peermesh_types::PublicKey::new(vec![2]).peer_id();
        let err = NetworkError::PeerIdMismatch { expected, actual };
        let s = err.to_string();
        assert!(s.contains(&expected.to_string()));
        assert!(s.contains(&actual.to_string()));
    }

    #[test]
    fn test_transient_classification() {
        let transient: NetworkError =
            io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(transient.is_transient());

        let fatal: NetworkError =
            io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert!(!fatal.is_transient());

        assert!(!NetworkError::ListenerClosed.is_transient());
    }

    #[test]
    fn test_indicates_closed() {
        assert!(NetworkError::ListenerClosed.indicates_closed());
        let closed: NetworkError = io::Error::new(
            io::ErrorKind::Other,
            "use of closed network connection",
        )
        .into();
        assert!(closed.indicates_closed());
    }

    #[test]
    fn test_dial_failed_display_counts_attempts() {
        let peer = peermesh_types::PublicKey::new(vec![3]).peer_id();
        let addr: Multiaddr = "/memory/1".parse().unwrap();
        let err = NetworkError::DialFailed {
            peer,
            attempts: vec![DialAttempt {
                addr,
                error: Box::new(NetworkError::DialCanceled),
            }],
        };
        assert!(err.to_string().contains("1 candidate address(es)"));
    }

    #[test]
    fn test_errors_are_cloneable() {
        let err: NetworkError = io::Error::new(io::ErrorKind::Other, "boom").into();
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
