//! Swarm configuration.

use std::time::Duration;

use crate::dial_ranker::DialRankerConfig;

/// Maximum number of fully-upgraded but not yet accepted inbound
/// connections per listener before raw accepts pause.
pub const DEFAULT_ACCEPT_QUEUE_LEN: usize = 16;

/// How long a just-accepted raw connection may spend in the
/// handshake + mux + gating pipeline before it is abandoned.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-candidate timeout for an outbound dial attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for opening a new stream on an existing connection.
pub const DEFAULT_NEW_STREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// Retry backoff after a transient raw-accept error.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration for a [`crate::Swarm`].
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Backpressure threshold of the listener accept queue.
    /// Zero disables backpressure.
    pub accept_queue_len: usize,
    /// Upgrade deadline for inbound connections.
    pub accept_timeout: Duration,
    /// Deadline for each outbound dial candidate (raw dial and upgrade are
    /// each bounded by this).
    pub dial_timeout: Duration,
    /// Deadline for opening a new stream.
    pub new_stream_timeout: Duration,
    /// Delay tiers for the dial ranker.
    pub ranker: DialRankerConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            accept_queue_len: DEFAULT_ACCEPT_QUEUE_LEN,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            new_stream_timeout: DEFAULT_NEW_STREAM_TIMEOUT,
            ranker: DialRankerConfig::default(),
        }
    }
}
