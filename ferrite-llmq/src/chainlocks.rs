//! Boundary toward the ChainLock subsystem: it only tells us which
//! block is the best ChainLocked one.

use std::sync::{Arc, Mutex};

use ferrite_shared_types::Hash;

use crate::chain::{BlockInfo, ChainView};

/// Tracks the best ChainLocked block and answers coverage queries.
pub struct ChainLockHandler {
    chain: Arc<dyn ChainView>,
    best: Mutex<Option<BlockInfo>>,
}

impl ChainLockHandler {
    pub fn new(chain: Arc<dyn ChainView>) -> Self {
        ChainLockHandler { chain, best: Mutex::new(None) }
    }

    pub fn best_chain_lock(&self) -> Option<BlockInfo> {
        *self.best.lock().unwrap()
    }

    pub fn set_best_chain_lock(&self, block: BlockInfo) {
        let mut best = self.best.lock().unwrap();
        if best.map(|b| b.height < block.height).unwrap_or(true) {
            *best = Some(block);
        }
    }

    /// Whether the block at `(height, hash)` is covered by the best
    /// ChainLock, i.e. it is a main-chain ancestor of it.
    pub fn has_chain_lock(&self, height: u64, hash: &Hash) -> bool {
        let best = match self.best_chain_lock() {
            Some(best) => best,
            None => return false,
        };
        if height > best.height {
            return false;
        }
        self.chain
            .block_at_height(height)
            .map(|b| b.hash == *hash)
            .unwrap_or(false)
    }
}
