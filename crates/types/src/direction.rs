//! Connection and stream direction.

use serde::{Deserialize, Serialize};

/// Whether a connection or stream was initiated locally or by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The remote peer initiated.
    Inbound,
    /// We initiated.
    Outbound,
}

impl Direction {
    /// True if we initiated.
    pub fn is_outbound(&self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Direction::Inbound.to_string(), "inbound");
        assert_eq!(Direction::Outbound.to_string(), "outbound");
    }

    #[test]
    fn test_is_outbound() {
        assert!(Direction::Outbound.is_outbound());
        assert!(!Direction::Inbound.is_outbound());
    }
}
