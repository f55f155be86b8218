use std::vec::IntoIter;

use bytes::Bytes;

use crate::common::{Distance, Peer, PeerId};

#[derive(Debug, Clone)]
/// Peers sorted by XOR distance to a target key, closest first.
///
/// Ties are broken by peer id, so the order is deterministic even for keys
/// that don't look anything like a peer id.
pub struct ClosestPeers {
    target: Bytes,
    peers: Vec<(Distance, Peer)>,
}

impl ClosestPeers {
    pub fn new(target: Bytes) -> Self {
        Self {
            target,
            peers: Vec::with_capacity(32),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|(_, peer)| &peer.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().map(|(_, peer)| peer)
    }

    // === Public Methods ===

    /// Insert a peer at its place, returns `false` if it was already there.
    pub fn add(&mut self, peer: Peer) -> bool {
        let distance = peer.id.distance(&self.target);

        match self.peers.binary_search_by(|(other_distance, other)| {
            other_distance
                .cmp(&distance)
                .then_with(|| other.id.cmp(&peer.id))
        }) {
            Ok(_) => false,
            Err(pos) => {
                self.peers.insert(pos, (distance, peer));
                true
            }
        }
    }

    /// The `count` closest peers.
    pub fn take(&self, count: usize) -> Vec<Peer> {
        self.iter().take(count).cloned().collect()
    }
}

impl IntoIterator for ClosestPeers {
    type Item = Peer;
    type IntoIter = IntoIter<Peer>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers
            .into_iter()
            .map(|(_, peer)| peer)
            .collect::<Vec<_>>()
            .into_iter()
    }
}
