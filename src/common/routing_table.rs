//! Kademlia routing table

use std::collections::BTreeMap;
use std::slice::Iter;

use bytes::Bytes;

use crate::common::{ClosestPeers, Peer, PeerId};

#[derive(Debug, Clone)]
/// The peers this node knows about for DHT routing.
///
/// Peers are grouped in buckets by the length of the prefix their id shares
/// with the local id. A peer is present at most once, and whether it is
/// currently connected has no bearing on its presence.
pub struct RoutingTable {
    id: PeerId,
    buckets: BTreeMap<u32, Bucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: PeerId) -> Self {
        RoutingTable {
            id,
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [PeerId] of this node, where the distance is measured from.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    // === Public Methods ===

    /// Adds a peer to this routing table, and returns `true` if it wasn't there yet.
    pub fn add(&mut self, peer: Peer) -> bool {
        let distance = self.id.distance(peer.id.as_bytes());

        if distance.is_zero() {
            // Do not add self to the routing_table
            return false;
        }

        self.buckets
            .entry(distance.leading_zeros())
            .or_default()
            .add(peer)
    }

    /// Remove a peer from this routing table, and returns `true` if it was there.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        let prefix = self.id.distance(id.as_bytes()).leading_zeros();

        let Some(bucket) = self.buckets.get_mut(&prefix) else {
            return false;
        };

        let removed = bucket.remove(id);

        if bucket.is_empty() {
            self.buckets.remove(&prefix);
        }

        removed
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        let prefix = self.id.distance(id.as_bytes()).leading_zeros();

        self.buckets.get(&prefix)?.iter().find(|peer| &peer.id == id)
    }

    /// Return up to `count` peers, closest to `key` first.
    ///
    /// `key` is any byte string, see [crate::common::Distance] for how keys
    /// that aren't peer ids are measured.
    pub fn closest(&self, key: &[u8], count: usize) -> Vec<Peer> {
        let mut closest = ClosestPeers::new(Bytes::copy_from_slice(key));

        for peer in self.peers() {
            closest.add(peer.clone());
        }

        closest.take(count)
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of peers in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.peers.len())
    }

    /// Returns an iterator over the peers in this routing table, furthest buckets first.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Export an owned vector of peers from this routing table.
    pub fn to_owned_peers(&self) -> Vec<Peer> {
        self.peers().cloned().collect()
    }
}

/// Peers sharing the same prefix length with the local id, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    peers: Vec<Peer>,
}

impl Bucket {
    pub fn add(&mut self, incoming: Peer) -> bool {
        if self.contains(&incoming.id) {
            return false;
        }

        self.peers.push(incoming);
        true
    }

    pub fn remove(&mut self, id: &PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|peer| &peer.id != id);

        before != self.peers.len()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.iter().any(|peer| &peer.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Peer> {
        self.peers.iter()
    }
}
