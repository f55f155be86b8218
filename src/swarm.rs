//! What the DHT needs from the transport layer: a peer registry, peer
//! events, a stream dispatcher and a way to dial peers.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::messages::Message;
use crate::common::{Multiaddr, MultiaddrExt, Peer, PeerId};
use crate::{Error, Result};

/// Protocol id the DHT registers its handler under.
pub const DHT_PROTOCOL: &str = "/ipfs/kad/1.0.0";

/// Largest encoded message accepted on a stream.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A duplex byte stream to a remote peer.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Changes to the swarm's peer registry.
pub enum SwarmEvent {
    PeerDiscovered(Peer),
    PeerRemoved(Peer),
}

#[async_trait]
/// Serves incoming streams of one protocol.
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Handle a stream opened by `from`.
    async fn handle(&self, from: Peer, stream: BoxStream) -> Result<()>;
}

#[async_trait]
/// The peer registry and connection manager the DHT runs on top of.
///
/// Implementations are shared between many tasks, and must be cheap to call
/// from async code: none of the sync methods may block on I/O.
pub trait Swarm: Debug + Send + Sync + 'static {
    /// The local peer, with the addresses it listens on.
    fn local_peer(&self) -> Peer;

    /// Snapshot of every registered peer, excluding the local peer.
    fn known_peers(&self) -> Vec<Peer>;

    /// Registered peer by id.
    fn peer(&self, id: &PeerId) -> Option<Peer>;

    /// Register a peer, or merge it into the already registered one.
    ///
    /// Returns the registered record, and emits [SwarmEvent::PeerDiscovered]
    /// if the peer was not known before.
    fn register_peer(&self, peer: Peer) -> Peer;

    /// Register the peer named by the `/p2p/` component of `address`.
    fn register_peer_address(&self, address: Multiaddr) -> Result<Peer> {
        let id = address
            .peer_id()
            .ok_or_else(|| Error::MissingPeerId(address.clone()))?;

        Ok(self.register_peer(Peer::new(id).with_addresses(vec![address])))
    }

    /// Forget a peer, emitting [SwarmEvent::PeerRemoved] if it was known.
    fn deregister_peer(&self, id: &PeerId) -> Option<Peer>;

    /// Subscribe to registry events; dropping the receiver unsubscribes.
    fn subscribe(&self) -> flume::Receiver<SwarmEvent>;

    /// Dispatch incoming streams of `protocol` to `handler`.
    fn add_protocol(&self, protocol: &str, handler: Arc<dyn ProtocolHandler>);

    fn remove_protocol(&self, protocol: &str);

    /// Open a stream to `peer` speaking `protocol`.
    async fn dial(&self, peer: &Peer, protocol: &str) -> Result<BoxStream>;
}

/// Write one length prefixed message.
pub async fn write_message<S>(stream: &mut S, message: &Message) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let bytes = message.to_bytes()?;

    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge(bytes.len()));
    }

    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;

    Ok(())
}

/// Read one length prefixed message.
pub async fn read_message<S>(stream: &mut S) -> Result<Message>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let length = stream.read_u32().await? as usize;

    if length > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge(length));
    }

    let mut buf = vec![0; length];
    stream.read_exact(&mut buf).await?;

    Message::from_bytes(&buf)
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::common::messages::MessageType;

    #[tokio::test]
    async fn framing() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let message = Message::new(MessageType::FindNode, Bytes::from_static(b"key"));

        write_message(&mut a, &message).await.unwrap();
        write_message(&mut a, &message.response()).await.unwrap();

        assert_eq!(read_message(&mut b).await.unwrap(), message);
        assert_eq!(read_message(&mut b).await.unwrap(), message.response());
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        a.write_u32(MAX_MESSAGE_SIZE as u32 + 1).await.unwrap();

        assert!(matches!(
            read_message(&mut b).await,
            Err(Error::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_frame() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        a.write_u32(10).await.unwrap();
        a.write_all(b"short").await.unwrap();
        drop(a);

        assert!(matches!(read_message(&mut b).await, Err(Error::IO(_))));
    }
}
