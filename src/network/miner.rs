use crate::core::{Block, MiningOutcome};
use crate::error::{BlockchainError, Result};
use crate::network::message::Message;
use crate::network::node::{Node, Severity};
use crate::utils::sync::lock;
use log::debug;
use std::thread;
use std::time::Duration;

/// Pause before retrying after a mining error that a fresh candidate will not fix by itself
const MINER_BACKOFF: Duration = Duration::from_millis(500);

impl Node {
    /// Mine one block carrying `payload` on the current tail and append it.
    ///
    /// Returns `Ok(None)` when the chain moved while mining (a peer's block or chain won
    /// the race) and the candidate was discarded.
    pub fn mine_block(&self, payload: impl Into<Vec<u8>>) -> Result<Option<Block>> {
        self.mine_round(payload.into(), || false)
    }

    pub(crate) fn mine_round<F>(&self, payload: Vec<u8>, interrupted: F) -> Result<Option<Block>>
    where
        F: Fn() -> bool,
    {
        let (mut candidate, epoch) = self.prepare_candidate(payload)?;
        let difficulty = candidate.get_difficulty();

        // The only long-running step, and it runs without the chain lock
        let outcome =
            candidate.mine_until_valid(difficulty, || self.chain_epoch() != epoch || interrupted())?;
        if outcome == MiningOutcome::Cancelled {
            debug!("Abandoned candidate {}", candidate.get_index());
            return Ok(None);
        }

        if !self.commit_mined(&candidate)? {
            debug!(
                "Discarded stale candidate {}: tail moved",
                candidate.get_index()
            );
            return Ok(None);
        }

        self.emit(
            format!(
                "Mined block {} ({})",
                candidate.get_index(),
                candidate.get_hash()
            ),
            Severity::Success,
        );
        self.broadcast(
            &Message::Block {
                block: candidate.clone(),
            },
            None,
        );
        Ok(Some(candidate))
    }

    /// Unmined successor of the tail, with the epoch it was read at
    fn prepare_candidate(&self, payload: Vec<u8>) -> Result<(Block, u64)> {
        let chain = lock(&self.inner.chain);
        let tail = chain.latest().ok_or_else(|| {
            BlockchainError::Validation("Cannot mine without a genesis block".to_string())
        })?;
        let candidate = Block::new(
            tail.get_index() + 1,
            chain.difficulty(),
            tail.get_hash(),
            payload,
        );
        Ok((candidate, self.chain_epoch()))
    }

    /// Append `candidate` if its parent is still the tail; the check and the append share one
    /// critical section. `Ok(false)` means a rival got there first.
    pub(crate) fn commit_mined(&self, candidate: &Block) -> Result<bool> {
        let mut chain = lock(&self.inner.chain);
        let parent_is_tail = chain
            .latest()
            .is_some_and(|tail| tail.get_hash() == candidate.get_previous_hash());
        if !parent_is_tail {
            return Ok(false);
        }
        chain.try_append(candidate)?;
        self.bump_epoch();
        Ok(true)
    }

    /// Body of the miner thread: mine on whatever the tail is until the node stops.
    pub(crate) fn run_miner(&self) {
        while self.is_running() {
            let payload = format!(
                "block {} mined on port {}",
                self.height(),
                self.local_port().unwrap_or_default()
            );
            match self.mine_round(payload.into_bytes(), || !self.is_running()) {
                Ok(_) => {}
                Err(BlockchainError::MiningExhausted { index }) => {
                    // A new candidate gets a new timestamp and therefore a fresh nonce space
                    self.emit(
                        format!("Nonce space exhausted for block {index}; restarting"),
                        Severity::Error,
                    );
                }
                Err(e) => {
                    self.emit(format!("Mining failed: {e}"), Severity::Error);
                    thread::sleep(MINER_BACKOFF);
                }
            }
        }
        debug!("Miner exiting");
    }
}
