use crate::core::Block;

/// Difficulty never adjusts below this
pub const MIN_DIFFICULTY: u32 = 1;

pub const DEFAULT_BLOCK_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_ADJUSTMENT_PERIOD: usize = 10;

/// Retargets difficulty every `adjustment_period` blocks so that blocks arrive roughly
/// every `block_interval_target_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DifficultyAdjustment {
    block_interval_target_secs: u64,
    adjustment_period: usize,
}

impl Default for DifficultyAdjustment {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_INTERVAL_SECS, DEFAULT_ADJUSTMENT_PERIOD)
    }
}

impl DifficultyAdjustment {
    /// A zero period is treated as 1.
    pub fn new(block_interval_target_secs: u64, adjustment_period: usize) -> Self {
        Self {
            block_interval_target_secs,
            adjustment_period: adjustment_period.max(1),
        }
    }

    pub fn get_adjustment_period(&self) -> usize {
        self.adjustment_period
    }

    pub fn get_block_interval_target_secs(&self) -> u64 {
        self.block_interval_target_secs
    }

    /// Chain lengths at which a retarget happens
    pub fn is_adjustment_point(&self, chain_len: usize) -> bool {
        chain_len >= self.adjustment_period && chain_len % self.adjustment_period == 0
    }

    /// Difficulty to use after `blocks` (oldest first), given the current one
    pub fn next_difficulty(&self, blocks: &[Block], current_difficulty: u32) -> u32 {
        let len = blocks.len();
        if !self.is_adjustment_point(len) {
            return current_difficulty;
        }

        let latest = &blocks[len - 1];
        let anchor = &blocks[len - self.adjustment_period];
        let actual_ms = i128::from(latest.get_timestamp()) - i128::from(anchor.get_timestamp());
        let expected_ms = i128::from(self.block_interval_target_secs)
            * self.adjustment_period as i128
            * 1000;

        Self::adjust_difficulty(current_difficulty, actual_ms, expected_ms)
    }

    fn adjust_difficulty(current_difficulty: u32, actual_ms: i128, expected_ms: i128) -> u32 {
        if actual_ms * 2 < expected_ms {
            // Blocks arrived more than twice as fast as targeted
            current_difficulty.saturating_add(1)
        } else if actual_ms > expected_ms * 2 {
            current_difficulty.saturating_sub(1).max(MIN_DIFFICULTY)
        } else {
            current_difficulty
        }
    }
}
