// The chain is an ordered, in-memory vector of blocks owned by exactly one node.
// Everything here is single-threaded; the node wraps the whole struct in a lock.

use crate::config::{ChainSelection, NodeConfig};
use crate::core::block::GENESIS_PREVIOUS_HASH;
use crate::core::{Block, DifficultyAdjustment, MIN_DIFFICULTY};
use crate::error::{BlockchainError, Result};
use crate::utils::current_timestamp;
use log::info;
use num_bigint::BigUint;
use std::time::Duration;

pub const DEFAULT_TIMESTAMP_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    difficulty: u32, // difficulty the next mined block should declare
    adjustment: DifficultyAdjustment,
    timestamp_skew: Option<Duration>,
}

impl Blockchain {
    /// Empty chain with the default retarget parameters and a 60s skew window
    pub fn new(difficulty: u32) -> Blockchain {
        Self::with_params(
            difficulty,
            DifficultyAdjustment::default(),
            Some(DEFAULT_TIMESTAMP_SKEW),
        )
    }

    pub fn with_params(
        difficulty: u32,
        adjustment: DifficultyAdjustment,
        timestamp_skew: Option<Duration>,
    ) -> Blockchain {
        Blockchain {
            blocks: Vec::new(),
            difficulty,
            adjustment,
            timestamp_skew,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Blockchain {
        Self::with_params(
            config.initial_difficulty,
            DifficultyAdjustment::new(
                config.block_interval_target_secs,
                config.difficulty_adjustment_period,
            ),
            config.timestamp_skew(),
        )
    }

    /// Mine and append block 0. Only valid on an empty chain.
    pub fn create_genesis(&mut self, payload: impl Into<Vec<u8>>) -> Result<()> {
        if !self.blocks.is_empty() {
            return Err(BlockchainError::Validation(
                "Genesis block already exists".to_string(),
            ));
        }

        let mut genesis = Block::genesis(self.difficulty, payload);
        genesis.mine_until_valid(self.difficulty, || false)?;
        info!("Created genesis block {}", genesis.get_hash());
        self.try_append(&genesis)
    }

    pub fn latest(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.blocks.get(i))
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn adjustment(&self) -> DifficultyAdjustment {
        self.adjustment
    }

    pub fn timestamp_skew(&self) -> Option<Duration> {
        self.timestamp_skew
    }

    /// The block at `index` is already ours
    pub fn contains_block(&self, index: u64, hash: &str) -> bool {
        self.get(index).is_some_and(|b| b.get_hash() == hash)
    }

    /// Extend by one block; false (and no change) if the candidate does not fit the tail.
    pub fn append(&mut self, candidate: &Block) -> bool {
        self.try_append(candidate).is_ok()
    }

    pub fn try_append(&mut self, candidate: &Block) -> Result<()> {
        self.check_next(candidate)?;
        self.blocks.push(candidate.clone());
        let next = self.adjust_difficulty();
        if next != self.difficulty {
            info!(
                "Difficulty at length {}: {} -> {next}",
                self.blocks.len(),
                self.difficulty
            );
        }
        self.difficulty = next;
        Ok(())
    }

    pub fn validate_next(&self, candidate: &Block) -> bool {
        self.check_next(candidate).is_ok()
    }

    pub fn check_next(&self, candidate: &Block) -> Result<()> {
        let expected_index = self.blocks.len() as u64;
        if candidate.get_index() != expected_index {
            return Err(BlockchainError::Validation(format!(
                "Block index {} does not extend chain of length {expected_index}",
                candidate.get_index()
            )));
        }

        let expected_previous = self
            .latest()
            .map(Block::get_hash)
            .unwrap_or(GENESIS_PREVIOUS_HASH);
        if candidate.get_previous_hash() != expected_previous {
            return Err(BlockchainError::Validation(format!(
                "Block {} links to {} instead of tail {expected_previous}",
                candidate.get_index(),
                candidate.get_previous_hash()
            )));
        }

        Self::check_block_integrity(candidate)?;

        // Genesis declares whatever the chain was created with
        if !self.blocks.is_empty() && candidate.get_difficulty() < self.difficulty {
            return Err(BlockchainError::Validation(format!(
                "Block {} declares difficulty {} below the required {}",
                candidate.get_index(),
                candidate.get_difficulty(),
                self.difficulty
            )));
        }

        if let Some(skew) = self.timestamp_skew {
            Self::check_timestamp(candidate, self.latest(), skew, current_timestamp())?;
        }
        Ok(())
    }

    fn check_block_integrity(block: &Block) -> Result<()> {
        if block.get_hash() != block.calculate_hash() {
            return Err(BlockchainError::Validation(format!(
                "Block {} hash does not match its contents",
                block.get_index()
            )));
        }
        if !block.is_genesis() && block.get_difficulty() < MIN_DIFFICULTY {
            return Err(BlockchainError::Validation(format!(
                "Block {} declares difficulty {} below the minimum {MIN_DIFFICULTY}",
                block.get_index(),
                block.get_difficulty()
            )));
        }
        if !block.is_valid(block.get_difficulty()) {
            return Err(BlockchainError::Validation(format!(
                "Block {} does not meet its difficulty {}",
                block.get_index(),
                block.get_difficulty()
            )));
        }
        Ok(())
    }

    /// `candidate` must fall within `[parent - skew, now + skew]`
    fn check_timestamp(
        candidate: &Block,
        parent: Option<&Block>,
        skew: Duration,
        now: i64,
    ) -> Result<()> {
        let skew_ms = i64::try_from(skew.as_millis()).unwrap_or(i64::MAX);
        let upper = now.saturating_add(skew_ms);
        if candidate.get_timestamp() > upper {
            return Err(BlockchainError::Validation(format!(
                "Block {} is dated too far in the future",
                candidate.get_index()
            )));
        }
        if let Some(latest) = parent {
            let lower = latest.get_timestamp().saturating_sub(skew_ms);
            if candidate.get_timestamp() < lower {
                return Err(BlockchainError::Validation(format!(
                    "Block {} is older than its parent beyond the allowed skew",
                    candidate.get_index()
                )));
            }
        }
        Ok(())
    }

    pub fn validate_chain(blocks: &[Block]) -> bool {
        Self::check_chain(blocks).is_ok()
    }

    /// Replay index, linkage, hash and proof-of-work checks from genesis forward.
    pub fn check_chain(blocks: &[Block]) -> Result<()> {
        let genesis = blocks
            .first()
            .ok_or_else(|| BlockchainError::Validation("Chain is empty".to_string()))?;
        if !genesis.is_genesis() {
            return Err(BlockchainError::Validation(
                "First block is not a genesis block".to_string(),
            ));
        }
        Self::check_block_integrity(genesis)?;

        for pair in blocks.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);
            if current.get_index() != previous.get_index() + 1 {
                return Err(BlockchainError::Validation(format!(
                    "Block index {} follows {}",
                    current.get_index(),
                    previous.get_index()
                )));
            }
            if current.get_previous_hash() != previous.get_hash() {
                return Err(BlockchainError::Validation(format!(
                    "Block {} is not linked to its predecessor",
                    current.get_index()
                )));
            }
            Self::check_block_integrity(current)?;
        }
        Ok(())
    }

    /// [`Blockchain::check_chain`] plus the rules a node applies to each block it appends:
    /// the retarget schedule and, when a skew is set, the timestamp window. A chain from a
    /// peer must pass this before it can replace ours.
    pub fn check_chain_with(
        blocks: &[Block],
        adjustment: DifficultyAdjustment,
        timestamp_skew: Option<Duration>,
    ) -> Result<()> {
        Self::check_chain(blocks)?;
        Self::replay_difficulty(blocks, adjustment)?;

        if let Some(skew) = timestamp_skew {
            let now = current_timestamp();
            let mut parent = None;
            for block in blocks {
                Self::check_timestamp(block, parent, skew, now)?;
                parent = Some(block);
            }
        }
        Ok(())
    }

    /// Walk the retarget schedule from genesis. Returns the difficulty the block after
    /// `blocks` must declare, or fails on the first block declaring less than its share.
    fn replay_difficulty(blocks: &[Block], adjustment: DifficultyAdjustment) -> Result<u32> {
        let genesis = blocks
            .first()
            .ok_or_else(|| BlockchainError::Validation("Chain is empty".to_string()))?;
        let mut required = genesis.get_difficulty();
        for (i, block) in blocks.iter().enumerate() {
            if i > 0 && block.get_difficulty() < required {
                return Err(BlockchainError::Validation(format!(
                    "Block {} declares difficulty {} below the required {required}",
                    block.get_index(),
                    block.get_difficulty()
                )));
            }
            required = adjustment
                .next_difficulty(&blocks[..=i], required)
                .max(MIN_DIFFICULTY);
        }
        Ok(required)
    }

    /// Difficulty after the current tail; never below [`MIN_DIFFICULTY`]
    pub fn adjust_difficulty(&self) -> u32 {
        self.adjustment
            .next_difficulty(&self.blocks, self.difficulty)
            .max(MIN_DIFFICULTY)
    }

    pub fn cumulative_work(&self) -> BigUint {
        Self::work_of(&self.blocks)
    }

    /// Sum of `2^difficulty`
    pub fn work_of(blocks: &[Block]) -> BigUint {
        blocks
            .iter()
            .map(|b| BigUint::from(1u32) << b.get_difficulty())
            .sum()
    }

    /// Strictly better than ours under `selection`. Ties keep the incumbent.
    pub fn is_better_chain(&self, candidate: &[Block], selection: ChainSelection) -> bool {
        match selection {
            ChainSelection::CumulativeWork => Self::work_of(candidate) > self.cumulative_work(),
            ChainSelection::Length => candidate.len() > self.blocks.len(),
        }
    }

    /// Swap in a validated chain wholesale and resync difficulty from its schedule.
    pub fn replace(&mut self, blocks: Vec<Block>) -> Result<()> {
        Self::check_chain_with(&blocks, self.adjustment, self.timestamp_skew)?;
        self.install(blocks);
        Ok(())
    }

    /// `replace` without the checks; callers must have run `check_chain_with` on `blocks`.
    pub(crate) fn install(&mut self, blocks: Vec<Block>) {
        if let Ok(next) = Self::replay_difficulty(&blocks, self.adjustment) {
            self.difficulty = next;
        }
        self.blocks = blocks;
        info!(
            "Replaced chain: length {}, next difficulty {}",
            self.blocks.len(),
            self.difficulty
        );
    }
}
