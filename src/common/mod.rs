//! Identity, addressing and routing types shared throughout the library.

mod address;
mod closest_peers;
pub mod content;
mod id;
pub mod messages;
mod peer;
mod routing_table;

pub use address::*;
pub use closest_peers::*;
pub use content::{Cid, ContentId, Multihash};
pub use id::*;
pub use peer::*;
pub use routing_table::*;
