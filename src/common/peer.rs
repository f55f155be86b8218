//! Identity record of a peer in the network.
use std::fmt::{self, Debug, Formatter};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::Rng;

use crate::common::{Multiaddr, PeerId};

#[derive(Clone, PartialEq, Eq)]
/// A peer as known by the swarm: its id, keys, versions and addresses.
///
/// The swarm owns these records; the DHT only copies them around and looks
/// them up by [PeerId].
pub struct Peer {
    pub id: PeerId,
    pub public_key: Option<VerifyingKey>,
    pub agent_version: Option<String>,
    pub protocol_version: Option<String>,
    /// Addresses this peer can be reached at.
    pub addresses: Vec<Multiaddr>,
    /// The address of the current connection to this peer, if connected.
    pub connected_address: Option<Multiaddr>,
}

impl Peer {
    pub fn new(id: PeerId) -> Peer {
        Peer {
            public_key: id.public_key(),
            id,
            agent_version: None,
            protocol_version: None,
            addresses: Vec::new(),
            connected_address: None,
        }
    }

    /// Peer with the given addresses.
    pub fn with_addresses(mut self, addresses: Vec<Multiaddr>) -> Peer {
        self.addresses = Vec::with_capacity(addresses.len());
        for address in addresses {
            self.add_address(address);
        }
        self
    }

    // === Getters ===

    pub fn is_connected(&self) -> bool {
        self.connected_address.is_some()
    }

    pub fn has_addresses(&self) -> bool {
        !self.addresses.is_empty()
    }

    // === Public Methods ===

    /// Add an address unless it is already known.
    pub fn add_address(&mut self, address: Multiaddr) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }

    /// Fold what `other` knows about the same peer into this record.
    pub fn merge(&mut self, other: Peer) {
        debug_assert_eq!(self.id, other.id);

        for address in other.addresses {
            self.add_address(address);
        }

        if other.public_key.is_some() {
            self.public_key = other.public_key;
        }
        if other.agent_version.is_some() {
            self.agent_version = other.agent_version;
        }
        if other.protocol_version.is_some() {
            self.protocol_version = other.protocol_version;
        }
        if other.connected_address.is_some() {
            self.connected_address = other.connected_address;
        }
    }
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addresses", &self.addresses)
            .field("connected_address", &self.connected_address)
            .finish()
    }
}

/// An Ed25519 signing key and the [PeerId] derived from it.
pub struct Keypair(SigningKey);

impl Keypair {
    pub fn random() -> Keypair {
        let secret: [u8; 32] = rand::thread_rng().gen();

        Keypair(SigningKey::from_bytes(&secret))
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Keypair {
        Keypair(SigningKey::from_bytes(secret))
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }
}

impl Debug for Keypair {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.peer_id())
    }
}
