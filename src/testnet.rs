//! In-process network of swarms, for tests, demos and benchmarks.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::common::{Keypair, Multiaddr, MultiaddrExt, Peer, PeerId, Protocol};
use crate::swarm::{BoxStream, ProtocolHandler, Swarm, SwarmEvent, MAX_MESSAGE_SIZE};
use crate::{Dht, DhtBuilder, Error, Result};

static NEXT_PORT: AtomicU16 = AtomicU16::new(10_000);

#[derive(Debug, Default)]
/// Registry of the [MemorySwarm]s that can dial each other.
pub struct Network {
    swarms: RwLock<HashMap<PeerId, Weak<MemorySwarm>>>,
}

impl Network {
    fn get(&self, id: &PeerId) -> Option<Arc<MemorySwarm>> {
        self.swarms.read().get(id).and_then(Weak::upgrade)
    }

    /// Number of swarms still alive in this network.
    pub fn len(&self) -> usize {
        self.swarms
            .read()
            .values()
            .filter(|swarm| swarm.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [Swarm] whose connections are in-memory pipes to other swarms of the
/// same [Network].
///
/// Dialing a peer registers the dialer in the remote swarm.
pub struct MemorySwarm {
    local: Peer,
    network: Arc<Network>,
    peers: RwLock<HashMap<PeerId, Peer>>,
    protocols: RwLock<HashMap<String, Arc<dyn ProtocolHandler>>>,
    subscribers: Mutex<Vec<flume::Sender<SwarmEvent>>>,
    dials: AtomicUsize,
}

impl MemorySwarm {
    /// A swarm alone in its own network.
    pub fn new() -> Arc<MemorySwarm> {
        MemorySwarm::join(&Arc::new(Network::default()))
    }

    /// A swarm with a random identity, reachable from the rest of `network`.
    pub fn join(network: &Arc<Network>) -> Arc<MemorySwarm> {
        let id = Keypair::random().peer_id();
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);

        let address = Multiaddr::empty()
            .with(Protocol::Ip4([127, 0, 0, 1].into()))
            .with(Protocol::Tcp(port));
        // Ids of Ed25519 keys always fit a `/p2p/` component.
        let address = address.clone().with_peer_id(&id).unwrap_or(address);

        let swarm = Arc::new(MemorySwarm {
            local: Peer::new(id.clone()).with_addresses(vec![address]),
            network: network.clone(),
            peers: RwLock::new(HashMap::new()),
            protocols: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            dials: AtomicUsize::new(0),
        });

        let mut swarms = network.swarms.write();
        swarms.retain(|_, swarm| swarm.strong_count() > 0);
        swarms.insert(id, Arc::downgrade(&swarm));
        drop(swarms);

        swarm
    }

    // === Getters ===

    /// Number of dials this swarm attempted, successful or not.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }

    pub fn has_protocol(&self, protocol: &str) -> bool {
        self.protocols.read().contains_key(protocol)
    }

    /// Number of live event subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| !sender.is_disconnected());

        subscribers.len()
    }

    // === Private Methods ===

    fn emit(&self, event: SwarmEvent) {
        self.subscribers
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    fn local_peer(&self) -> Peer {
        self.local.clone()
    }

    fn known_peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    fn peer(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    fn register_peer(&self, peer: Peer) -> Peer {
        if peer.id == self.local.id {
            return self.local.clone();
        }

        let (registered, discovered) = {
            let mut peers = self.peers.write();

            match peers.get_mut(&peer.id) {
                Some(existing) => {
                    existing.merge(peer);
                    (existing.clone(), false)
                }
                None => {
                    peers.insert(peer.id.clone(), peer.clone());
                    (peer, true)
                }
            }
        };

        if discovered {
            self.emit(SwarmEvent::PeerDiscovered(registered.clone()));
        }

        registered
    }

    fn deregister_peer(&self, id: &PeerId) -> Option<Peer> {
        let removed = self.peers.write().remove(id);

        if let Some(peer) = &removed {
            self.emit(SwarmEvent::PeerRemoved(peer.clone()));
        }

        removed
    }

    fn subscribe(&self) -> flume::Receiver<SwarmEvent> {
        let (sender, receiver) = flume::unbounded();
        self.subscribers.lock().push(sender);

        receiver
    }

    fn add_protocol(&self, protocol: &str, handler: Arc<dyn ProtocolHandler>) {
        self.protocols.write().insert(protocol.to_string(), handler);
    }

    fn remove_protocol(&self, protocol: &str) {
        self.protocols.write().remove(protocol);
    }

    async fn dial(&self, peer: &Peer, protocol: &str) -> Result<BoxStream> {
        self.dials.fetch_add(1, Ordering::Relaxed);

        let remote = self
            .network
            .get(&peer.id)
            .filter(|_| peer.id != self.local.id)
            .ok_or_else(|| Error::Unreachable(peer.id.to_string()))?;

        let handler = remote
            .protocols
            .read()
            .get(protocol)
            .cloned()
            .ok_or_else(|| Error::ProtocolNotSupported(protocol.to_string()))?;

        let mut dialer = self.local.clone();
        dialer.connected_address = dialer.addresses.first().cloned();
        let dialer = remote.register_peer(dialer);

        let (local, remote_stream) = tokio::io::duplex(MAX_MESSAGE_SIZE + 4);

        let protocol = protocol.to_string();
        tokio::spawn(async move {
            if let Err(error) = handler.handle(dialer, Box::new(remote_stream)).await {
                debug!(?error, %protocol, "Stream handler failed");
            }
        });

        Ok(Box::new(local))
    }
}

impl Debug for MemorySwarm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySwarm")
            .field("local", &self.local.id)
            .field("peers", &self.peers.read().len())
            .field("protocols", &self.protocols.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug)]
/// Create a testnet of started [Dht] nodes, over [MemorySwarm]s.
///
/// Every node knows the first node and the node created before it, and is
/// known by them.
pub struct Testnet {
    pub network: Arc<Network>,
    pub swarms: Vec<Arc<MemorySwarm>>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    pub async fn new(count: usize) -> Result<Testnet> {
        Testnet::with_builder(count, &DhtBuilder::default()).await
    }

    /// Create a testnet with nodes built by `builder`.
    pub async fn with_builder(count: usize, builder: &DhtBuilder) -> Result<Testnet> {
        let network = Arc::new(Network::default());

        let mut swarms: Vec<Arc<MemorySwarm>> = Vec::with_capacity(count);

        for i in 0..count {
            let swarm = MemorySwarm::join(&network);

            let neighbors = [0, i.saturating_sub(1)];
            for neighbor in neighbors.iter().filter_map(|&n| swarms.get(n)) {
                swarm.register_peer(neighbor.local_peer());
                neighbor.register_peer(swarm.local_peer());
            }

            swarms.push(swarm);
        }

        let mut nodes = Vec::with_capacity(count);

        for swarm in &swarms {
            let dht = builder.build(swarm.clone());
            dht.start().await?;

            nodes.push(dht);
        }

        Ok(Testnet {
            network,
            swarms,
            nodes,
        })
    }

    /// Total dials attempted by all swarms of this testnet.
    pub fn dial_count(&self) -> usize {
        self.swarms.iter().map(|swarm| swarm.dial_count()).sum()
    }
}
