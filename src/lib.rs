//! # Peerchain - a minimal proof-of-work peer-to-peer chain node
//!
//! Every node owns one in-memory chain, mines on top of it, and keeps it in agreement
//! with its peers over plain TCP.
//!
//! ## What's Here
//! - **Chain**: append-only blocks linked by SHA-256, leading-zero proof-of-work, periodic
//!   difficulty retargeting, and heaviest-chain selection by cumulative work
//! - **Wire protocol**: length-prefixed bincode frames carrying `Connect`, `SyncRequest`,
//!   `ChainResponse` and `Block`
//! - **Node**: listener, outbound dialing, one handler thread per peer, a miner thread
//!   that restarts whenever the tail moves, and an optional periodic resync
//!
//! ## Layout
//! - `core/`: blocks, proof-of-work, difficulty adjustment, the chain
//! - `network/`: framing, peer links, the peer registry and the node
//! - `config/`: node tunables from defaults, TOML or `PEERCHAIN_*` variables
//! - `error/`: the crate-wide error type
//! - `utils/`: hashing, timestamps, the bincode codec and lock helpers
//!
//! ## Things To Keep In Mind
//! - The chain lock and the peer registry lock are never held at the same time
//! - Mining and socket reads never hold the chain lock
//! - A peer can at worst get its own link dropped; nothing it sends stops the node

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod utils;

#[cfg(test)]
pub mod testnet;

// Re-export commonly used types for convenience
pub use config::{ChainSelection, NodeConfig, GLOBAL_CONFIG};
pub use crate::core::{Block, Blockchain, DifficultyAdjustment, MiningOutcome, ProofOfWork};
pub use error::{BlockchainError, Result};
pub use network::{LinkState, LogSink, Message, Node, Severity};
pub use utils::{current_timestamp, sha256_digest, sha256_hex};
