//! Peer ids inside multiaddresses.

pub use multiaddr::{Multiaddr, Protocol};

use crate::common::PeerId;
use crate::Result;

/// Reading and writing the trailing `/p2p/<peer id>` component of a
/// [Multiaddr].
pub trait MultiaddrExt: Sized {
    /// The peer id in the trailing `/p2p/` component, if any.
    fn peer_id(&self) -> Option<PeerId>;

    /// This address ending in `/p2p/<id>`, replacing any existing peer id.
    fn with_peer_id(self, id: &PeerId) -> Result<Self>;

    /// This address with any trailing `/p2p/` component removed.
    fn without_peer_id(self) -> Self;
}

impl MultiaddrExt for Multiaddr {
    fn peer_id(&self) -> Option<PeerId> {
        match self.iter().last() {
            Some(Protocol::P2p(id)) => PeerId::from_bytes(id.to_bytes()).ok(),
            _ => None,
        }
    }

    fn with_peer_id(self, id: &PeerId) -> Result<Multiaddr> {
        Ok(self.without_peer_id().with(Protocol::P2p(id.to_libp2p()?)))
    }

    fn without_peer_id(mut self) -> Multiaddr {
        let has_peer_id = matches!(self.iter().last(), Some(Protocol::P2p(_)));
        if has_peer_id {
            self.pop();
        }
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn text() {
        let id = PeerId::random();
        let text = format!("/ip4/10.0.0.1/tcp/4001/p2p/{id}");

        let address: Multiaddr = text.parse().unwrap();

        assert_eq!(address.to_string(), text);
        assert_eq!(address.peer_id(), Some(id));
    }

    #[test]
    fn binary() {
        let id = PeerId::random();
        let address: Multiaddr = format!("/ip6/::1/udp/4001/quic/p2p/{id}").parse().unwrap();

        let bytes = address.to_vec();
        assert_eq!(bytes[0], 41);
        assert_eq!(Multiaddr::try_from(bytes).unwrap(), address);

        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/80".parse().unwrap();
        assert_eq!(tcp.to_vec(), vec![4, 127, 0, 0, 1, 6, 0, 80]);
    }

    #[test]
    fn peer_id_component() {
        let id = PeerId::random();
        let other = PeerId::random();

        let address: Multiaddr = "/ip4/127.0.0.1/tcp/80".parse().unwrap();
        assert_eq!(address.peer_id(), None);

        let address = address
            .with_peer_id(&id)
            .unwrap()
            .with_peer_id(&other)
            .unwrap();
        assert_eq!(address.peer_id(), Some(other));
        assert_eq!(address.iter().count(), 3);

        assert_eq!(address.without_peer_id().to_string(), "/ip4/127.0.0.1/tcp/80");
    }

    #[test]
    fn only_libp2p_ids_are_addressable() {
        let id = PeerId::from_multihash(crate::common::content::sha2_256(b"not a key"));
        let address: Multiaddr = "/ip4/127.0.0.1/tcp/80".parse().unwrap();

        // Sha2-256 hashed ids are valid libp2p ids.
        assert!(address.clone().with_peer_id(&id).is_ok());

        let id = PeerId::from_bytes([0x11, 2, 1, 2]).unwrap();
        assert!(address.with_peer_id(&id).is_err());
    }
}
