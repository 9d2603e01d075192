//! Secure-channel capability interface.
//!
//! Concrete handshake protocols (noise, TLS, ...) are out of scope; the
//! upgrade core consumes them through [`SecureChannel`]: given a raw duplex
//! stream, produce an authenticated, encrypted duplex stream plus the
//! verified remote identity.

use async_trait::async_trait;
use peermesh_types::{PeerId, ProtocolId, PublicKey};

use crate::error::NetworkResult;
use crate::transport::BoxedDuplex;

/// The result of a successful security handshake: an encrypted duplex stream
/// and the cryptographically verified remote identity.
pub struct SecuredStream {
    /// The encrypted byte stream. Carries exactly the raw stream's bytes,
    /// transformed by the provider's wire protocol.
    pub io: BoxedDuplex,
    /// Verified identity of the remote peer.
    pub remote_peer: PeerId,
    /// The remote peer's public key, as proven during the handshake.
    pub remote_public_key: PublicKey,
}

impl std::fmt::Debug for SecuredStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuredStream")
            .field("remote_peer", &self.remote_peer)
            .finish()
    }
}

/// A security-handshake provider.
///
/// On failure the provider consumes (and thereby closes) the raw stream; the
/// upgrade core never retries a handshake on the same connection.
#[async_trait]
pub trait SecureChannel: Send + Sync {
    /// Protocol id of this security protocol (e.g. "/noise").
    fn protocol_id(&self) -> ProtocolId;

    /// Secure an outbound connection.
    ///
    /// When `expected_peer` is set, the provider must fail with
    /// [`crate::NetworkError::PeerIdMismatch`] if the handshake authenticates
    /// a different peer.
    async fn secure_outbound(
        &self,
        io: BoxedDuplex,
        expected_peer: Option<PeerId>,
    ) -> NetworkResult<SecuredStream>;

    /// Secure an inbound connection.
    ///
    /// `expected_peer` is almost always `None` for inbound connections; when
    /// set, the same mismatch rule applies.
    async fn secure_inbound(
        &self,
        io: BoxedDuplex,
        expected_peer: Option<PeerId>,
    ) -> NetworkResult<SecuredStream>;
}
