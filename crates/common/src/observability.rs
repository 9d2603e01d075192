//! Observability infrastructure for the peermesh stack.
//!
//! This module provides the observability primitives shared by the
//! connection-upgrade core:
//!
//! - **Structured events**: standardized event types for log aggregation
//! - **Metrics**: atomic counters for connection, stream, and dial activity
//!
//! ## Injected, not global
//!
//! Nothing in this module is process-global. A [`NetMetrics`] handle is
//! created by the embedding application and passed to each component at
//! construction time, so two independent swarms in one process never share
//! counters.
//!
//! ## Usage
//!
//! ```ignore
//! use peermesh_common::{NetMetrics, LogEvent, EventType};
//!
//! let metrics = Arc::new(NetMetrics::new("node-0"));
//! metrics.inc_conns_opened_outbound();
//!
//! LogEvent::new(EventType::DialStarted)
//!     .with_peer(&peer)
//!     .with_context("addrs", addr_count.to_string())
//!     .emit();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use peermesh_types::{Direction, PeerId};
use serde::{Deserialize, Serialize};

/// Standardized event types for structured logging.
///
/// These event types enable consistent log aggregation and filtering
/// across all peermesh components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Connection lifecycle
    ConnOpened,
    ConnClosed,

    // Stream lifecycle
    StreamOpened,
    StreamClosed,

    // Dialing
    DialStarted,
    DialSucceeded,
    DialFailed,

    // Upgrade pipeline
    HandshakeFailed,
    MuxerFailed,
    GateBlocked,
    ResourceDenied,

    // Listeners
    ListenerStarted,
    ListenerClosed,
    AcceptDropped,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ConnOpened => "conn_opened",
            Self::ConnClosed => "conn_closed",
            Self::StreamOpened => "stream_opened",
            Self::StreamClosed => "stream_closed",
            Self::DialStarted => "dial_started",
            Self::DialSucceeded => "dial_succeeded",
            Self::DialFailed => "dial_failed",
            Self::HandshakeFailed => "handshake_failed",
            Self::MuxerFailed => "muxer_failed",
            Self::GateBlocked => "gate_blocked",
            Self::ResourceDenied => "resource_denied",
            Self::ListenerStarted => "listener_started",
            Self::ListenerClosed => "listener_closed",
            Self::AcceptDropped => "accept_dropped",
        };
        write!(f, "{}", s)
    }
}

/// A structured log event with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Event type for filtering.
    pub event_type: EventType,
    /// Correlation id, e.g. a connection debug id.
    pub correlation_id: Option<String>,
    /// Remote peer, if known.
    pub peer: Option<PeerId>,
    /// Address involved, in string form.
    pub address: Option<String>,
    /// Direction, if applicable.
    pub direction: Option<Direction>,
    /// Duration in milliseconds, if applicable.
    pub duration_ms: Option<u64>,
    /// Additional context as key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
    /// Error message if this is a failure event.
    pub error: Option<String>,
}

impl LogEvent {
    /// Create a new log event.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            correlation_id: None,
            peer: None,
            address: None,
            direction: None,
            duration_ms: None,
            context: HashMap::new(),
            error: None,
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the remote peer.
    pub fn with_peer(mut self, peer: &PeerId) -> Self {
        self.peer = Some(*peer);
        self
    }

    /// Set the address.
    pub fn with_address(mut self, addr: impl Into<String>) -> Self {
        self.address = Some(addr.into());
        self
    }

    /// Set the direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Set the duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    /// Add a context key-value pair.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Set the error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Emit this event through tracing.
    pub fn emit(&self) {
        let json = serde_json::to_string(&self).unwrap_or_default();

        match self.event_type {
            EventType::DialFailed
            | EventType::HandshakeFailed
            | EventType::MuxerFailed
            | EventType::GateBlocked
            | EventType::ResourceDenied
            | EventType::AcceptDropped => {
                tracing::warn!(event = %json, "network_event");
            }
            _ => {
                tracing::info!(event = %json, "network_event");
            }
        }
    }
}

/// Metrics collector for network activity.
///
/// Thread-safe metrics collection with atomic counters. One instance per
/// swarm, injected at construction.
#[derive(Debug)]
pub struct NetMetrics {
    /// Identifier of the local node owning this collector.
    pub node_id: String,

    // Dial metrics
    dials_started: AtomicU64,
    dial_attempts: AtomicU64,
    dials_failed: AtomicU64,

    // Connection metrics
    conns_opened_inbound: AtomicU64,
    conns_opened_outbound: AtomicU64,
    conns_closed: AtomicU64,

    // Stream metrics
    streams_opened: AtomicU64,
    streams_closed: AtomicU64,

    // Upgrade failure metrics
    handshake_failures: AtomicU64,
    muxer_failures: AtomicU64,
    gate_rejections: AtomicU64,
    resource_denials: AtomicU64,

    // Listener metrics
    accepts_dropped: AtomicU64,
}

impl NetMetrics {
    /// Create a new metrics collector.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            dials_started: AtomicU64::new(0),
            dial_attempts: AtomicU64::new(0),
            dials_failed: AtomicU64::new(0),
            conns_opened_inbound: AtomicU64::new(0),
            conns_opened_outbound: AtomicU64::new(0),
            conns_closed: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            streams_closed: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            muxer_failures: AtomicU64::new(0),
            gate_rejections: AtomicU64::new(0),
            resource_denials: AtomicU64::new(0),
            accepts_dropped: AtomicU64::new(0),
        }
    }

    pub fn inc_dials_started(&self) {
        self.dials_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dial_attempts(&self) {
        self.dial_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dials_failed(&self) {
        self.dials_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conns_opened(&self, direction: Direction) {
        match direction {
            Direction::Inbound => self.conns_opened_inbound.fetch_add(1, Ordering::Relaxed),
            Direction::Outbound => self.conns_opened_outbound.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn inc_conns_closed(&self) {
        self.conns_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_streams_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_streams_closed(&self) {
        self.streams_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handshake_failures(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_muxer_failures(&self) {
        self.muxer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gate_rejections(&self) {
        self.gate_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resource_denials(&self) {
        self.resource_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_accepts_dropped(&self) {
        self.accepts_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            node_id: self.node_id.clone(),
            dials_started: self.dials_started.load(Ordering::Relaxed),
            dial_attempts: self.dial_attempts.load(Ordering::Relaxed),
            dials_failed: self.dials_failed.load(Ordering::Relaxed),
            conns_opened_inbound: self.conns_opened_inbound.load(Ordering::Relaxed),
            conns_opened_outbound: self.conns_opened_outbound.load(Ordering::Relaxed),
            conns_closed: self.conns_closed.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_closed: self.streams_closed.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            muxer_failures: self.muxer_failures.load(Ordering::Relaxed),
            gate_rejections: self.gate_rejections.load(Ordering::Relaxed),
            resource_denials: self.resource_denials.load(Ordering::Relaxed),
            accepts_dropped: self.accepts_dropped.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of current network metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub node_id: String,

    pub dials_started: u64,
    pub dial_attempts: u64,
    pub dials_failed: u64,
    pub conns_opened_inbound: u64,
    pub conns_opened_outbound: u64,
    pub conns_closed: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub handshake_failures: u64,
    pub muxer_failures: u64,
    pub gate_rejections: u64,
    pub resource_denials: u64,
    pub accepts_dropped: u64,
}
