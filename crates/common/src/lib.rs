//! Common infrastructure shared by peermesh components.
//!
//! Currently this is the observability layer: structured network events and
//! an injectable metrics handle. There are no process-wide singletons here;
//! every component receives its observability handles at construction.

pub mod observability;

pub use observability::{EventType, LogEvent, MetricsSnapshot, NetMetrics};
