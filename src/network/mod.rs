//! Peer-to-peer networking
//!
//! Length-prefixed framing, the four protocol messages, per-peer links, and the node that
//! ties them to a shared chain: accepting and dialing peers, answering sync requests,
//! resolving chain conflicts, gossiping blocks and mining.

pub mod message;
mod miner;
pub mod node;
pub mod peer;
pub mod peer_registry;
mod protocol;

pub use message::{encode_frame, read_frame, write_frame, Message, FRAME_HEADER_LEN};
pub use node::{LogSink, Node, Severity};
pub use peer::{Direction, LinkReader, LinkState, PeerLink};
pub use peer_registry::PeerRegistry;
