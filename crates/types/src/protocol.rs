//! Protocol identifiers.

use serde::{Deserialize, Serialize};

/// Identifier for a negotiated protocol.
///
/// Used for security protocols ("/noise"), stream multiplexers
/// ("/yamux/1.0.0"), and application protocols carried on streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolId(String);

impl ProtocolId {
    /// Create a protocol id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The protocol id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProtocolId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProtocolId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
