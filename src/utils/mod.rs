//! Utility functions and helpers
//!
//! Hashing, timestamps, the bincode codec used on the wire, and lock helpers.

pub mod crypto;
pub mod serialization;
pub mod sync;

pub use crypto::{current_timestamp, sha256_digest, sha256_hex};

pub use serialization::{deserialize, serialize};
