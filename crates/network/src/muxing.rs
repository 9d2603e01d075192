//! Stream-multiplexer capability interface.
//!
//! Concrete muxer wire protocols are out of scope; the upgrade core consumes
//! them through [`StreamMuxer`]: given a secured duplex stream, produce a
//! session capable of opening and accepting independent ordered logical
//! streams.

use async_trait::async_trait;
use peermesh_types::ProtocolId;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::NetworkResult;
use crate::transport::BoxedDuplex;

/// A stream-multiplexer provider.
#[async_trait]
pub trait StreamMuxer: Send + Sync {
    /// Protocol id of this multiplexer (e.g. "/yamux/1.0.0").
    fn protocol_id(&self) -> ProtocolId;

    /// Build a multiplexed session over a secured stream.
    ///
    /// `is_initiator` is true on the dialing side; muxer wire protocols use
    /// it to assign non-colliding stream ids to the two sides.
    async fn new_muxed_conn(
        &self,
        io: BoxedDuplex,
        is_initiator: bool,
    ) -> NetworkResult<Box<dyn MuxedConn>>;
}

/// A live multiplexed session over one secured connection.
#[async_trait]
pub trait MuxedConn: Send + Sync {
    /// Open a new outbound logical stream.
    async fn open_stream(&self) -> NetworkResult<Box<dyn MuxedStream>>;

    /// Wait for the remote to open a logical stream.
    ///
    /// Returns an error once the session is closed; the per-connection
    /// accept loop treats any error as end-of-session.
    async fn accept_stream(&self) -> NetworkResult<Box<dyn MuxedStream>>;

    /// Close the session, resetting all live streams.
    async fn close(&self) -> NetworkResult<()>;

    /// Whether the session is closed.
    fn is_closed(&self) -> bool;
}

/// One logical duplex stream inside a multiplexed session.
///
/// Ordinary data flow uses the `AsyncRead`/`AsyncWrite` impls (shutdown is
/// the half-close); [`MuxedStream::reset`] abruptly terminates both ends.
#[async_trait]
pub trait MuxedStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Abruptly terminate the stream in both directions.
    async fn reset(&mut self) -> NetworkResult<()>;
}
