//! Peer ids and the XOR metric over opaque keys.
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use bytes::Bytes;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::Rng;

use crate::common::content::{wrap_digest, Multihash, IDENTITY};
use crate::{Error, Result};

/// Protobuf framing of an Ed25519 public key (`KeyType::Ed25519`, 32 bytes of data),
/// hashed with the identity multihash to form a peer id.
const ED25519_PUBLIC_KEY_PREFIX: [u8; 4] = [0x08, 0x01, 0x12, 0x20];

#[derive(Clone)]
/// Multihash of a peer's public key, and the key space of the DHT.
///
/// Compared, hashed and ordered by its encoded bytes.
pub struct PeerId {
    hash: Multihash,
    bytes: Bytes,
}

impl PeerId {
    /// Peer id of an Ed25519 public key.
    pub fn from_public_key(key: &VerifyingKey) -> PeerId {
        let mut encoded = Vec::with_capacity(ED25519_PUBLIC_KEY_PREFIX.len() + 32);
        encoded.extend_from_slice(&ED25519_PUBLIC_KEY_PREFIX);
        encoded.extend_from_slice(key.as_bytes());

        PeerId::from_multihash(wrap_digest(IDENTITY, &encoded))
    }

    pub fn from_multihash(hash: Multihash) -> PeerId {
        PeerId {
            bytes: hash.to_bytes().into(),
            hash,
        }
    }

    /// Peer id of a freshly generated key, mostly useful in tests.
    pub fn random() -> PeerId {
        let secret: [u8; 32] = rand::thread_rng().gen();

        PeerId::from_public_key(&SigningKey::from_bytes(&secret).verifying_key())
    }

    /// Parse a multihash encoded peer id.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<PeerId> {
        Multihash::from_bytes(bytes.as_ref())
            .map(PeerId::from_multihash)
            .map_err(|error| Error::InvalidPeerId(error.to_string()))
    }

    // === Getters ===

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn multihash(&self) -> &Multihash {
        &self.hash
    }

    /// The Ed25519 key this id was derived from, if it embeds one.
    pub fn public_key(&self) -> Option<VerifyingKey> {
        if self.hash.code() != IDENTITY {
            return None;
        }

        let key = self.hash.digest().strip_prefix(&ED25519_PUBLIC_KEY_PREFIX)?;
        let key: [u8; 32] = key.try_into().ok()?;

        VerifyingKey::from_bytes(&key).ok()
    }

    /// XOR distance between this id and an arbitrary key.
    pub fn distance(&self, key: &[u8]) -> Distance {
        Distance::between(self.as_bytes(), key)
    }

    /// The libp2p form used in `/p2p/` address components.
    ///
    /// Fails for ids that are neither an inlined key nor a sha2-256 hash.
    pub(crate) fn to_libp2p(&self) -> Result<libp2p_identity::PeerId> {
        libp2p_identity::PeerId::from_bytes(self.as_bytes())
            .map_err(|error| Error::InvalidPeerId(error.to_string()))
    }
}

impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for PeerId {}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

/// Base58 like libp2p for ids libp2p accepts, hex otherwise.
impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.to_libp2p() {
            Ok(id) => write!(f, "{id}"),
            Err(_) => write!(f, "{}", hex::encode(self.as_bytes())),
        }
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<PeerId> {
        if let Ok(id) = s.parse::<libp2p_identity::PeerId>() {
            return PeerId::from_bytes(id.to_bytes());
        }

        let bytes = hex::decode(s).map_err(|error| Error::InvalidPeerId(error.to_string()))?;

        PeerId::from_bytes(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// XOR distance between two keys, ordered as a big endian number.
///
/// Keys are opaque byte strings that may differ in length. The distance spans
/// the longer of the two, and every byte present in only one of them counts as
/// `0xff`, so a malformed key still sorts deterministically, just far away.
pub struct Distance(Box<[u8]>);

impl Distance {
    /// Distance between `a` and `b`, symmetric in its arguments.
    pub fn between(a: &[u8], b: &[u8]) -> Distance {
        let length = a.len().max(b.len());

        Distance(
            (0..length)
                .map(|i| match (a.get(i), b.get(i)) {
                    (Some(x), Some(y)) => x ^ y,
                    _ => 0xff,
                })
                .collect(),
        )
    }

    /// Distance to self.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    /// Number of leading zero bits, the length of the prefix both keys share.
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;

        for byte in self.0.iter() {
            if *byte != 0 {
                return zeros + byte.leading_zeros();
            }
            zeros += 8;
        }

        zeros
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self() {
        let id = PeerId::random();

        assert!(id.distance(id.as_bytes()).is_zero());
        assert_eq!(
            id.distance(id.as_bytes()).leading_zeros(),
            id.as_bytes().len() as u32 * 8
        );
    }

    #[test]
    fn distance_is_symmetric() {
        let a = PeerId::random();
        let b = PeerId::random();

        assert_eq!(a.distance(b.as_bytes()), b.distance(a.as_bytes()));

        let short = [1, 2, 3];
        assert_eq!(a.distance(&short), Distance::between(&short, a.as_bytes()));
    }

    #[test]
    fn mismatched_lengths_are_far() {
        let id = PeerId::random();

        let mut longer = id.as_bytes().to_vec();
        longer.push(0);

        let distance = id.distance(&longer);
        assert!(!distance.is_zero());
        assert_eq!(distance.as_bytes().len(), longer.len());
        assert_eq!(distance.as_bytes().last(), Some(&0xff));

        let empty = id.distance(&[]);
        assert!(empty.as_bytes().iter().all(|byte| *byte == 0xff));
    }

    #[test]
    fn leading_zeros() {
        assert_eq!(Distance::between(&[0, 0], &[0, 1]).leading_zeros(), 15);
        assert_eq!(Distance::between(&[0x80], &[0]).leading_zeros(), 0);
        assert_eq!(Distance::between(&[0x0f, 0], &[0, 0]).leading_zeros(), 4);
    }

    #[test]
    fn embeds_public_key() {
        let key = SigningKey::from_bytes(&[3; 32]).verifying_key();
        let id = PeerId::from_public_key(&key);

        assert_eq!(id.as_bytes().len(), 38);
        assert_eq!(&id.as_bytes()[..2], &[0x00, 0x24]);
        assert_eq!(id.public_key(), Some(key));
    }

    #[test]
    fn parse() {
        let id = PeerId::random();

        assert_eq!(PeerId::from_str(&id.to_string()).unwrap(), id);
        assert!(id.to_string().starts_with("12D3KooW"));
        assert_eq!(PeerId::from_bytes(id.as_bytes()).unwrap(), id);
        assert!(PeerId::from_bytes([1, 2, 3]).is_err());
        assert!(PeerId::from_str("not an id").is_err());

        // Not a libp2p id, shown and parsed as hex.
        let other = PeerId::from_bytes([0x11, 2, 1, 2]).unwrap();
        assert_eq!(other.to_string(), "11020102");
        assert_eq!(PeerId::from_str("11020102").unwrap(), other);
    }
}
