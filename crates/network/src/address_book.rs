//! Known-address book.
//!
//! Maps peer identities to the addresses they are believed to be reachable
//! at. Outbound dials consult this book; discovery layers (out of scope)
//! populate it.

use std::collections::HashMap;

use multiaddr::Multiaddr;
use peermesh_types::PeerId;
use tokio::sync::RwLock;
use tracing::debug;

/// Address book mapping peers to known addresses.
#[derive(Debug, Default)]
pub struct AddressBook {
    addrs: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
}

impl AddressBook {
    /// Create an empty address book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address for a peer. Duplicates are ignored.
    pub async fn add(&self, peer: PeerId, addr: Multiaddr) {
        let mut addrs = self.addrs.write().await;
        let entry = addrs.entry(peer).or_default();
        if !entry.contains(&addr) {
            debug!("learned address {} for peer {}", addr, peer.short());
            entry.push(addr);
        }
    }

    /// Record several addresses for a peer.
    pub async fn extend(&self, peer: PeerId, new_addrs: impl IntoIterator<Item = Multiaddr>) {
        let mut addrs = self.addrs.write().await;
        let entry = addrs.entry(peer).or_default();
        for addr in new_addrs {
            if !entry.contains(&addr) {
                entry.push(addr);
            }
        }
    }

    /// The known addresses of a peer.
    pub async fn get(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.addrs
            .read()
            .await
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget one address of a peer, e.g. after a peer-id mismatch showed
    /// the entry to be stale.
    pub async fn remove(&self, peer: &PeerId, addr: &Multiaddr) {
        let mut addrs = self.addrs.write().await;
        if let Some(entry) = addrs.get_mut(peer) {
            entry.retain(|a| a != addr);
            if entry.is_empty() {
                addrs.remove(peer);
            }
        }
    }

    /// Forget everything known about a peer.
    pub async fn clear(&self, peer: &PeerId) {
        self.addrs.write().await.remove(peer);
    }

    /// Peers with at least one known address.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.addrs.read().await.keys().copied().collect()
    }
}
