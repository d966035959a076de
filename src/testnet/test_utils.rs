//! Test utilities for chain and network testing

use crate::config::NodeConfig;
use crate::core::{Block, Blockchain};
use std::thread;
use std::time::{Duration, Instant};

/// Test configuration: cheap proof-of-work, no background threads that race assertions
pub fn test_config() -> NodeConfig {
    NodeConfig {
        initial_difficulty: 1,
        mining_enabled: false,
        resync_interval_secs: 0,
        ..NodeConfig::default()
    }
}

/// Mine a block at `difficulty` on top of `parent`
pub fn mine_child(parent: &Block, difficulty: u32, data: &[u8]) -> Block {
    let mut block = Block::new(
        parent.get_index() + 1,
        difficulty,
        parent.get_hash(),
        data.to_vec(),
    );
    block.mine_until_valid(difficulty, || false).unwrap();
    block
}

/// Chain of `len` blocks (genesis included), every block mined at `difficulty`
pub fn build_chain(len: usize, difficulty: u32) -> Blockchain {
    let mut chain = Blockchain::new(difficulty);
    chain.create_genesis("Genesis Block").unwrap();
    while chain.len() < len {
        let block = mine_child(
            chain.latest().unwrap(),
            difficulty,
            format!("block {}", chain.len()).as_bytes(),
        );
        assert!(chain.append(&block));
    }
    chain
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_chain() {
        let chain = build_chain(4, 1);
        assert_eq!(chain.len(), 4);
        assert!(Blockchain::validate_chain(chain.blocks()));
    }

    #[test]
    fn test_mine_child_links_to_parent() {
        let chain = build_chain(1, 1);
        let child = mine_child(chain.latest().unwrap(), 2, b"c");
        assert_eq!(child.get_previous_hash(), chain.latest().unwrap().get_hash());
        assert!(child.is_valid(2));
    }
}
