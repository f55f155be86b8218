//! Content identifiers, and the multihash keys the DHT stores them under.

use bytes::Bytes;
use sha2::{Digest, Sha256};

pub use cid::Cid;

use crate::Result;

/// Multihash with room for digests of up to 64 bytes.
pub type Multihash = multihash::Multihash<64>;

/// Multihash code of the identity "hash" (the digest is the data itself).
pub const IDENTITY: u64 = 0x00;
/// Multihash code of sha2-256.
pub const SHA2_256: u64 = 0x12;

/// Multicodec of raw binary content.
pub const RAW: u64 = 0x55;
/// Multicodec of protobuf merkle-dag nodes, the only codec of a v0 cid.
pub const DAG_PB: u64 = 0x70;
/// Multicodec of cbor merkle-dag nodes.
pub const DAG_CBOR: u64 = 0x71;

/// Sha2-256 multihash of `data`.
pub fn sha2_256(data: &[u8]) -> Multihash {
    wrap_digest(SHA2_256, &Sha256::digest(data))
}

/// Wrap a digest that fits a [Multihash].
pub(crate) fn wrap_digest(code: u64, digest: &[u8]) -> Multihash {
    debug_assert!(digest.len() <= 64);

    Multihash::wrap(code, digest).unwrap_or_default()
}

/// How a [Cid] maps to and from DHT keys.
///
/// The DHT locates providers by [ContentId::key], the bare multihash, so a v0
/// and a v1 cid of the same content share their providers.
pub trait ContentId: Sized {
    /// A v1 cid of `data` hashed with sha2-256.
    fn from_content(codec: u64, data: &[u8]) -> Self;

    /// Interpret a raw DHT key as the multihash of some raw content.
    fn from_key(key: &[u8]) -> Result<Self>;

    /// The key this content is stored and looked up under in the DHT.
    fn key(&self) -> Bytes;
}

impl ContentId for Cid {
    fn from_content(codec: u64, data: &[u8]) -> Cid {
        Cid::new_v1(codec, sha2_256(data))
    }

    fn from_key(key: &[u8]) -> Result<Cid> {
        Ok(Cid::new_v1(RAW, Multihash::from_bytes(key)?))
    }

    fn key(&self) -> Bytes {
        self.hash().to_bytes().into()
    }
}
