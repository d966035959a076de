use crate::core::Block;
use crate::error::{BlockchainError, Result};
use log::debug;

/// Nonces tried between two polls of the cancellation predicate
pub const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Hex characters in a SHA-256 digest
const HASH_HEX_LEN: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningOutcome {
    /// The block now carries a hash meeting the target
    Mined,
    /// The cancellation predicate fired first; the block is left partially searched
    Cancelled,
}

/// Leading-zero-hex-digit proof-of-work
pub struct ProofOfWork {
    difficulty: u32,
}

impl ProofOfWork {
    pub fn new(difficulty: u32) -> ProofOfWork {
        ProofOfWork { difficulty }
    }

    pub fn meets_target(hash: &str, difficulty: u32) -> bool {
        let zeros = difficulty as usize;
        hash.len() >= zeros && hash.bytes().take(zeros).all(|b| b == b'0')
    }

    /// Stored hash matches a recomputation and satisfies the block's own difficulty
    pub fn validate(block: &Block) -> bool {
        block.get_hash() == block.calculate_hash() && block.is_valid(block.get_difficulty())
    }

    pub fn run<F>(&self, block: &mut Block, should_stop: F) -> Result<MiningOutcome>
    where
        F: Fn() -> bool,
    {
        if self.difficulty > HASH_HEX_LEN {
            return Err(BlockchainError::Validation(format!(
                "Difficulty {} can never be met by a {HASH_HEX_LEN}-digit hash",
                self.difficulty
            )));
        }

        let mut attempts: u64 = 0;
        loop {
            if block.is_valid(self.difficulty) {
                debug!(
                    "Found nonce {} for block {} after {attempts} attempts",
                    block.get_nonce(),
                    block.get_index()
                );
                return Ok(MiningOutcome::Mined);
            }
            if attempts % CANCEL_CHECK_INTERVAL == 0 && should_stop() {
                return Ok(MiningOutcome::Cancelled);
            }
            block.increment_nonce()?;
            attempts = attempts.wrapping_add(1);
        }
    }
}
