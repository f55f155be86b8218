//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// ipfs-dht crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse message bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// The [crate::Dht] was used before [crate::Dht::start] or after [crate::Dht::stop].
    #[error("Dht is not started")]
    NotStarted,

    /// Bytes are not a valid multihash encoded peer id.
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Bytes are not a valid multihash.
    #[error("Invalid multihash: {0}")]
    InvalidMultihash(#[from] multihash::Error),

    /// Bytes or text are not a valid content identifier.
    #[error("Invalid cid: {0}")]
    InvalidCid(#[from] cid::Error),

    /// Bytes or text are not a valid multiaddress.
    #[error("Invalid multiaddress: {0}")]
    InvalidMultiAddress(#[from] multiaddr::Error),

    /// An address was expected to end with a `/p2p/` component.
    #[error("Address has no peer id: {0}")]
    MissingPeerId(multiaddr::Multiaddr),

    /// The message type tag of a wire message is not one this node speaks.
    #[error("Unknown message type: {0:?}")]
    UnknownMessageType(String),

    /// A framed message exceeds [crate::swarm::MAX_MESSAGE_SIZE].
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// The remote peer answered with a message that doesn't match the request.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(&'static str),

    /// The remote peer didn't answer within [crate::Config::request_timeout].
    #[error("Request timed out")]
    Timeout,

    /// The swarm couldn't reach the remote peer.
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    /// The remote peer doesn't speak the requested protocol.
    #[error("Protocol not supported: {0}")]
    ProtocolNotSupported(String),
}

/// Alias for `Result<T, ipfs_dht::Error>`.
pub type Result<T, E = Error> = core::result::Result<T, E>;
