//! Handle incoming DHT requests.

pub mod providers;

use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::common::messages::{Message, MessageType, PeerInfo};
use crate::common::{Cid, ContentId, Peer, PeerId, RoutingTable};
use crate::swarm::{read_message, write_message, BoxStream, ProtocolHandler, Swarm};
use crate::{Config, Result};

use providers::ContentRouter;

#[derive(Debug)]
/// The routing state of a DHT node, and the logic answering remote requests from it.
///
/// Handlers never fail: malformed keys and invalid peer entries degrade to
/// best-effort answers.
pub struct Server {
    swarm: Arc<dyn Swarm>,
    routing_table: RwLock<RoutingTable>,
    providers: ContentRouter,
    closer_peer_count: usize,
}

impl Server {
    pub fn new(swarm: Arc<dyn Swarm>, config: &Config) -> Self {
        let providers = ContentRouter::new(
            NonZeroUsize::new(config.max_provided_keys).unwrap_or(NonZeroUsize::MIN),
            NonZeroUsize::new(config.max_providers_per_key).unwrap_or(NonZeroUsize::MIN),
        );
        providers.set_provider_ttl(config.provider_ttl);

        Self {
            routing_table: RwLock::new(RoutingTable::new(swarm.local_peer().id)),
            swarm,
            providers,
            closer_peer_count: config.closer_peer_count,
        }
    }

    // === Getters ===

    pub fn swarm(&self) -> &Arc<dyn Swarm> {
        &self.swarm
    }

    pub fn routing_table(&self) -> &RwLock<RoutingTable> {
        &self.routing_table
    }

    pub fn providers(&self) -> &ContentRouter {
        &self.providers
    }

    /// The local peer id, which is also the routing table id.
    pub fn local_id(&self) -> PeerId {
        self.routing_table.read().id().clone()
    }

    // === Public Methods ===

    /// Up to `count` known peers closest to `key`, with their addresses as
    /// currently known by the swarm.
    pub fn closest_peers(&self, key: &[u8], count: usize) -> Vec<Peer> {
        let closest = self.routing_table.read().closest(key, count);

        closest
            .into_iter()
            .map(|peer| self.swarm.peer(&peer.id).unwrap_or(peer))
            .collect()
    }

    /// Resolve a peer id to the best record we have of it.
    pub fn resolve(&self, id: &PeerId) -> Option<Peer> {
        if id == self.routing_table.read().id() {
            return Some(self.swarm.local_peer());
        }

        self.swarm
            .peer(id)
            .or_else(|| self.routing_table.read().get(id).cloned())
    }

    /// Handle an incoming request, returning the response to send back, if any.
    pub fn handle_request(&self, from: &Peer, request: &Message) -> Option<Message> {
        trace!(?from, message_type = ?request.message_type, "Handling request");

        match request.message_type {
            MessageType::Ping => Some(request.response()),
            MessageType::FindNode => Some(self.process_find_node(request)),
            MessageType::GetProviders => Some(self.process_get_providers(request)),
            MessageType::AddProvider => {
                self.process_add_provider(from, request);
                None
            }
        }
    }

    /// Respond with the requested peer if known, otherwise with the closest
    /// peers to the requested key.
    pub fn process_find_node(&self, request: &Message) -> Message {
        let response = request.response();

        if request.key.as_ref() == self.local_id().as_bytes() {
            return response.with_closer_peers(vec![PeerInfo::from(&self.swarm.local_peer())]);
        }

        if let Some(peer) = PeerId::from_bytes(&request.key)
            .ok()
            .and_then(|id| self.resolve(&id))
        {
            return response.with_closer_peers(vec![PeerInfo::from(&peer)]);
        }

        response.with_closer_peers(self.closer_peers(&request.key))
    }

    /// Respond with the live providers of the requested key, and with closer
    /// peers to continue the search.
    pub fn process_get_providers(&self, request: &Message) -> Message {
        let providers = match Cid::from_key(&request.key) {
            Ok(cid) => self
                .providers
                .get(&cid)
                .into_iter()
                .map(|id| match self.resolve(&id) {
                    Some(peer) => PeerInfo::from(&peer),
                    None => PeerInfo {
                        id,
                        addresses: vec![],
                    },
                })
                .collect(),
            Err(error) => {
                trace!(?error, "GetProviders for a key that isn't a multihash");
                vec![]
            }
        };

        request
            .response()
            .with_provider_peers(providers)
            .with_closer_peers(self.closer_peers(&request.key))
    }

    /// Record the providers announced by `from`.
    ///
    /// Only entries naming the sender itself are accepted, their addresses
    /// are registered with the swarm.
    pub fn process_add_provider(&self, from: &Peer, request: &Message) {
        let cid = match Cid::from_key(&request.key) {
            Ok(cid) => cid,
            Err(error) => {
                debug!(?from, ?error, "Ignoring AddProvider with invalid key");
                return;
            }
        };

        for info in &request.provider_peers {
            if info.id != from.id {
                debug!(?from, provider = ?info.id, "Ignoring provider not matching the sender");
                continue;
            }

            let mut peer = Peer::from(info.clone());
            if !peer.has_addresses() {
                peer = peer.with_addresses(from.addresses.clone());
            }

            self.swarm.register_peer(peer);
            self.providers.add(&cid, info.id.clone());
        }
    }

    fn closer_peers(&self, key: &[u8]) -> Vec<PeerInfo> {
        self.closest_peers(key, self.closer_peer_count)
            .iter()
            .map(PeerInfo::from)
            .collect()
    }
}

/// Serves DHT streams for a [Server] without keeping it alive.
pub(crate) struct StreamHandler(pub(crate) Weak<Server>);

#[async_trait]
impl ProtocolHandler for StreamHandler {
    async fn handle(&self, from: Peer, mut stream: BoxStream) -> Result<()> {
        let request = read_message(&mut stream).await?;

        let response = match self.0.upgrade() {
            Some(server) => server.handle_request(&from, &request),
            None => return Ok(()),
        };

        if let Some(response) = response {
            write_message(&mut stream, &response).await?;
        }

        Ok(())
    }
}
