//! Serialize and deserialize DHT wire messages.

mod internal;

use bytes::Bytes;
use tracing::trace;

use crate::common::{Multiaddr, Peer, PeerId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ping,
    FindNode,
    GetProviders,
    AddProvider,
}

impl MessageType {
    fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::FindNode => "find_node",
            MessageType::GetProviders => "get_providers",
            MessageType::AddProvider => "add_provider",
        }
    }

    fn from_str(s: &str) -> Result<MessageType> {
        Ok(match s {
            "ping" => MessageType::Ping,
            "find_node" => MessageType::FindNode,
            "get_providers" => MessageType::GetProviders,
            "add_provider" => MessageType::AddProvider,
            _ => return Err(Error::UnknownMessageType(s.to_string())),
        })
    }

    /// AddProvider is a one way notification, everything else gets a response.
    pub fn expects_response(&self) -> bool {
        !matches!(self, MessageType::AddProvider)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A peer id and the addresses it can be reached at, as carried on the wire.
pub struct PeerInfo {
    pub id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        PeerInfo {
            id: peer.id.clone(),
            addresses: peer.addresses.clone(),
        }
    }
}

impl From<PeerInfo> for Peer {
    fn from(info: PeerInfo) -> Self {
        Peer::new(info.id).with_addresses(info.addresses)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Request and response envelope of the DHT protocol.
pub struct Message {
    pub message_type: MessageType,
    /// Peer id or content multihash, treated as an opaque byte string.
    pub key: Bytes,
    pub closer_peers: Vec<PeerInfo>,
    pub provider_peers: Vec<PeerInfo>,
}

impl Message {
    pub fn new(message_type: MessageType, key: Bytes) -> Self {
        Message {
            message_type,
            key,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
        }
    }

    /// An empty response of the same type and key as this request.
    pub fn response(&self) -> Self {
        Message::new(self.message_type, self.key.clone())
    }

    pub fn with_closer_peers(mut self, peers: Vec<PeerInfo>) -> Self {
        self.closer_peers = peers;
        self
    }

    pub fn with_provider_peers(mut self, peers: Vec<PeerInfo>) -> Self {
        self.provider_peers = peers;
        self
    }

    /// Decode a message, dropping individual peer entries that don't parse.
    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let message = internal::DHTMessage::from_bytes(bytes)?;

        Ok(Message {
            message_type: MessageType::from_str(&message.message_type)?,
            key: message.key.into_vec().into(),
            closer_peers: decode_peers(message.closer_peers),
            provider_peers: decode_peers(message.provider_peers),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        internal::DHTMessage {
            message_type: self.message_type.as_str().to_string(),
            key: self.key.to_vec().into(),
            closer_peers: encode_peers(&self.closer_peers),
            provider_peers: encode_peers(&self.provider_peers),
        }
        .to_bytes()
        .map_err(Error::from)
    }
}

fn encode_peers(peers: &[PeerInfo]) -> Vec<internal::DHTPeer> {
    peers
        .iter()
        .map(|peer| internal::DHTPeer {
            id: peer.id.as_bytes().to_vec().into(),
            addresses: peer
                .addresses
                .iter()
                .map(|address| address.to_vec().into())
                .collect(),
        })
        .collect()
}

fn decode_peers(peers: Vec<internal::DHTPeer>) -> Vec<PeerInfo> {
    peers
        .into_iter()
        .filter_map(|peer| {
            let id = match PeerId::from_bytes(&peer.id) {
                Ok(id) => id,
                Err(error) => {
                    trace!(?error, "Dropping peer with invalid id");
                    return None;
                }
            };

            let addresses = peer
                .addresses
                .iter()
                .filter_map(|bytes| match Multiaddr::try_from(bytes.to_vec()) {
                    Ok(address) => Some(address),
                    Err(error) => {
                        trace!(?id, ?error, "Dropping invalid address");
                        None
                    }
                })
                .collect();

            Some(PeerInfo { id, addresses })
        })
        .collect()
}
