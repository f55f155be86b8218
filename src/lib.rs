//! # ipfs-dht
//!
//! Kademlia peer and content routing for a content-addressed peer-to-peer
//! network.
//!
//! A [Dht] runs on top of a [Swarm], the transport layer that knows peers and
//! opens streams to them. It keeps a [RoutingTable] of the swarm's peers,
//! answers the `FindNode`, `GetProviders` and `AddProvider` requests of
//! remote peers, and finds peers and content providers by asking
//! successively closer peers with a [DistributedQuery].
//!
//! ```no_run
//! use ipfs_dht::{common::content::RAW, testnet::MemorySwarm, Cid, ContentId, Dht};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> ipfs_dht::Result<()> {
//! let dht = Dht::builder().concurrency(3).build(MemorySwarm::new());
//! dht.start().await?;
//!
//! let cid = Cid::from_content(RAW, b"hello world");
//! let cancel = CancellationToken::new();
//!
//! dht.provide(&cid, true, &cancel).await?;
//! let providers = dht.find_providers(&cid, 20, &cancel).await?;
//!
//! dht.stop().await;
//! # Ok(())
//! # }
//! ```

// Public modules
pub mod common;

mod config;
mod dht;
mod error;
pub mod query;
pub mod server;
pub mod swarm;
pub mod testnet;

pub use crate::common::{
    Cid, ContentId, Keypair, Multiaddr, MultiaddrExt, Multihash, Peer, PeerId, RoutingTable,
};
pub use bytes::Bytes;
pub use config::{Config, DhtBuilder};
pub use dht::{Dht, DhtEvent, Info};
pub use error::{Error, Result};
pub use query::DistributedQuery;
pub use server::providers::ContentRouter;
pub use swarm::{Swarm, SwarmEvent};

pub use ed25519_dalek::{SigningKey, VerifyingKey};
