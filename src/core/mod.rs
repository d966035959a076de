//! Core chain functionality
//!
//! Blocks, proof-of-work, difficulty retargeting and the validated chain itself.

pub mod block;
pub mod blockchain;
pub mod difficulty;
pub mod proof_of_work;

pub use block::{Block, GENESIS_PREVIOUS_HASH};
pub use blockchain::Blockchain;
pub use difficulty::{DifficultyAdjustment, MIN_DIFFICULTY};
pub use proof_of_work::{MiningOutcome, ProofOfWork, CANCEL_CHECK_INTERVAL};
