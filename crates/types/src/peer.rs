//! Peer identity types.
//!
//! A [`PeerId`] is the stable identity of a peer: the SHA-256 digest of its
//! public key. The upgrade core treats keys as opaque bytes; producing and
//! verifying them is the job of the secure-channel provider.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of bytes in a peer identity.
pub const PEER_ID_LEN: usize = 32;

/// Errors produced when parsing a [`PeerId`] from its string form.
#[derive(Debug, Error)]
pub enum PeerIdError {
    /// The string was not valid hex.
    #[error("peer id is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// The decoded bytes had the wrong length.
    #[error("peer id must be {PEER_ID_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// A peer's identity: the SHA-256 digest of its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Build a peer id directly from its raw bytes.
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the peer id for a public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Raw identity bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Short display form: the first 10 hex characters.
    ///
    /// Used in connection and stream debug identifiers.
    pub fn short(&self) -> String {
        let full = hex::encode(self.0);
        full[..10].to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}…)", self.short())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s)?;
        if raw.len() != PEER_ID_LEN {
            return Err(PeerIdError::InvalidLength(raw.len()));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Opaque public key material, as verified by a security handshake.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The identity derived from this key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_public_key_is_stable() {
        let key = PublicKey::new(vec![1, 2, 3, 4]);
        assert_eq!(key.peer_id(), key.peer_id());

        let other = PublicKey::new(vec![1, 2, 3, 5]);
        assert_ne!(key.peer_id(), other.peer_id());
    }

    #[test]
    fn test_peer_id_round_trips_through_string() {
        let id = PublicKey::new(vec![42; 16]).peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_peer_id_rejects_bad_strings() {
        assert!("zznothex".parse::<PeerId>().is_err());
        assert!("abcd".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_short_form_is_prefix() {
        let id = PublicKey::new(vec![7; 8]).peer_id();
        assert_eq!(id.short().len(), 10);
        assert!(id.to_string().starts_with(&id.short()));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = PublicKey::new(vec![9; 4]).peer_id();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
