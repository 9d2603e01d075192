//! Peermesh Connection-Upgrade Core
//!
//! This crate turns raw, unauthenticated byte-stream connections into
//! secure, multiplexed, resource-accounted peer connections, and arbitrates
//! dialing, accepting, and per-stream lifecycle on top of them.
//!
//! ## Features
//!
//! - **Upgrade pipeline**: security handshake → gating → stream muxer →
//!   resource attribution, with exactly-once scope release on every path
//! - **Dial synchronization**: at most one ranked dial sequence per peer;
//!   concurrent callers share the outcome
//! - **Happy-Eyeballs dial ranking**: delay-staggered candidate tiers with
//!   configurable increments
//! - **Listener backpressure**: raw accepts pause once enough upgraded
//!   connections await delivery
//! - **Pluggable collaborators**: transports, security handshakes, stream
//!   muxers, connection gaters, and resource managers are capability traits
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Swarm                              │
//! │                                                             │
//! │  ┌──────────┐   ┌──────────────┐   ┌─────────────────────┐  │
//! │  │ DialSync │──>│  Upgrader    │<──│ Listener            │  │
//! │  │ (1/peer) │   │ sec+mux+gate │   │ (backpressure gate) │  │
//! │  └──────────┘   └──────────────┘   └─────────────────────┘  │
//! │        │               │                                    │
//! │        ▼               ▼                                    │
//! │  ┌──────────┐   ┌──────────────┐   ┌─────────────────────┐  │
//! │  │DialRanker│   │  Connection  │──>│ Stream (scoped)     │  │
//! │  └──────────┘   │  registry    │   └─────────────────────┘  │
//! │                 └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use peermesh_network::{Swarm, SwarmConfig};
//!
//! let swarm = Swarm::new(local_peer, security, muxer, SwarmConfig::default());
//! swarm.add_transport(transport);
//!
//! // inbound
//! let listener = swarm.listen(&"/ip4/0.0.0.0/tcp/4001".parse()?).await?;
//! let conn = listener.accept().await?;
//!
//! // outbound
//! swarm.address_book().add(peer, addr).await;
//! let conn = swarm.dial(peer).await?;
//! let mut stream = conn.new_stream().await?;
//! ```

pub mod addr;
pub mod address_book;
pub mod config;
pub mod conn;
pub mod dial;
pub mod dial_ranker;
pub mod error;
pub mod gater;
pub mod listener;
pub mod muxing;
pub mod rcmgr;
pub mod security;
pub mod stream;
pub mod swarm;
pub mod transport;

mod upgrader;

// Re-export commonly used types
pub use address_book::AddressBook;
pub use config::SwarmConfig;
pub use conn::Connection;
pub use dial::{DialCancelCause, DialOpts};
pub use dial_ranker::{default_ranking, no_delay_ranking, AddrDelay, DialRankerConfig};
pub use error::{DialAttempt, GatePhase, NetworkError, NetworkResult, ResourceKind};
pub use gater::{AllowAllGater, Gater};
pub use listener::Listener;
pub use muxing::{MuxedConn, MuxedStream, StreamMuxer};
pub use rcmgr::{ConnScope, NullResourceManager, ResourceManager, ResourceScope, StreamScope};
pub use security::{SecureChannel, SecuredStream};
pub use stream::{Stream, StreamInfo};
pub use swarm::{Notifiee, StreamHandler, Swarm};
pub use transport::{BoxedDuplex, Duplex, RawConn, RawListener, Transport, TransportRegistry};

// Re-export the identity types alongside the core.
pub use multiaddr::Multiaddr;
pub use peermesh_types::{Direction, PeerId, ProtocolId, PublicKey};
