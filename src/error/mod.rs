//! Error handling for the node
//!
//! Every failure a peer, the miner or the operator can cause maps onto one of these
//! variants. None of them is fatal to the node as a whole.

use std::fmt;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Error types for chain, mining and networking operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    /// Socket-level failure: refused, reset, closed. The link is dropped.
    Transport(String),
    /// A frame arrived but could not be decoded into a message
    Protocol(String),
    /// A block or chain broke a chain invariant
    Validation(String),
    /// A dial or handshake refused locally: ourselves, a known peer, or over the limit
    PeerRejected(String),
    /// The nonce space ran out before a valid hash was found
    MiningExhausted { index: u64 },
    /// Bad configuration value or file
    Config(String),
    /// Encoding an outbound value failed
    Serialization(String),
    /// Local I/O errors outside a peer link (binding, files)
    Io(String),
    /// `start_node` was called on a running node
    AlreadyStarted,
    /// An operation needed a running node
    NotStarted,
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Transport(msg) => write!(f, "Transport error: {msg}"),
            BlockchainError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            BlockchainError::Validation(msg) => write!(f, "Validation error: {msg}"),
            BlockchainError::PeerRejected(msg) => write!(f, "Peer rejected: {msg}"),
            BlockchainError::MiningExhausted { index } => {
                write!(f, "Mining exhausted the nonce space for block {index}")
            }
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::AlreadyStarted => write!(f, "Node is already started"),
            BlockchainError::NotStarted => write!(f, "Node is not started"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Protocol(err.to_string())
    }
}

impl From<toml::de::Error> for BlockchainError {
    fn from(err: toml::de::Error) -> Self {
        BlockchainError::Config(err.to_string())
    }
}
