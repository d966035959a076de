use crate::core::proof_of_work::{MiningOutcome, ProofOfWork};
use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, deserialize, serialize, sha256_hex};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Previous-hash sentinel carried by every genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Block {
    index: u64,
    timestamp: i64, // milliseconds since the Unix epoch
    data: Vec<u8>,
    previous_hash: String,
    difficulty: u32,
    nonce: u64,
    hash: String,
}

impl Block {
    /// Unmined block stamped with the current time
    pub fn new(
        index: u64,
        difficulty: u32,
        previous_hash: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Block {
        Self::with_timestamp(index, current_timestamp(), difficulty, previous_hash, data)
    }

    pub fn with_timestamp(
        index: u64,
        timestamp: i64,
        difficulty: u32,
        previous_hash: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Block {
        let mut block = Block {
            index,
            timestamp,
            data: data.into(),
            previous_hash: previous_hash.into(),
            difficulty,
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    pub fn genesis(difficulty: u32, data: impl Into<Vec<u8>>) -> Block {
        Self::new(0, difficulty, GENESIS_PREVIOUS_HASH, data)
    }

    /// Canonical preimage: fixed-width big-endian integers, length-prefixed byte fields.
    pub fn hash_preimage(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(8 + 8 + 8 + self.data.len() + 8 + self.previous_hash.len() + 4 + 8);
        bytes.extend(self.index.to_be_bytes());
        bytes.extend(self.timestamp.to_be_bytes());
        bytes.extend((self.data.len() as u64).to_be_bytes());
        bytes.extend(&self.data);
        bytes.extend((self.previous_hash.len() as u64).to_be_bytes());
        bytes.extend(self.previous_hash.as_bytes());
        bytes.extend(self.difficulty.to_be_bytes());
        bytes.extend(self.nonce.to_be_bytes());
        bytes
    }

    pub fn calculate_hash(&self) -> String {
        sha256_hex(&self.hash_preimage())
    }

    /// Stored hash has at least `difficulty` leading zero hex digits. Never rehashes.
    pub fn is_valid(&self, difficulty: u32) -> bool {
        ProofOfWork::meets_target(&self.hash, difficulty)
    }

    pub fn increment_nonce(&mut self) -> Result<()> {
        self.nonce = self
            .nonce
            .checked_add(1)
            .ok_or(BlockchainError::MiningExhausted { index: self.index })?;
        self.hash = self.calculate_hash();
        Ok(())
    }

    /// Search nonces until the hash meets `difficulty` or `should_stop` fires.
    pub fn mine_until_valid<F>(&mut self, difficulty: u32, should_stop: F) -> Result<MiningOutcome>
    where
        F: Fn() -> bool,
    {
        ProofOfWork::new(difficulty).run(self, should_stop)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_index(&self) -> u64 {
        self.index
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    pub fn get_previous_hash(&self) -> &str {
        self.previous_hash.as_str()
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_hash(&self) -> &str {
        self.hash.as_str()
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    #[cfg(test)]
    pub(crate) fn tamper_data(&mut self, data: &[u8]) {
        self.data = data.to_vec();
    }

    #[cfg(test)]
    pub(crate) fn tamper_hash(&mut self, hash: &str) {
        self.hash = hash.to_string();
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block {} | Hash: {} | Nonce: {} | Diff: {}",
            self.index, self.hash, self.nonce, self.difficulty
        )
    }
}
