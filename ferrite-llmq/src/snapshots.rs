//! Storage for quarter-rotation quorum snapshots.

use std::sync::{Arc, Mutex};

use log::debug;

use ferrite_shared_types::params::LlmqType;
use ferrite_shared_types::snapshot::QuorumSnapshot;
use ferrite_shared_types::Hash;

use crate::cache::LruCache;
use crate::db::LlmqDb;
use crate::error::Result;

const SNAPSHOT_CACHE_SIZE: usize = 32;

/// Read-through store of per-cycle quorum snapshots, keyed by
/// `(llmqType, cycleAnchorBlockHash)`.
pub struct SnapshotManager {
    db: Arc<LlmqDb>,
    cache: Mutex<LruCache<(LlmqType, Hash), QuorumSnapshot>>,
}

impl SnapshotManager {
    pub fn new(db: Arc<LlmqDb>) -> Self {
        SnapshotManager {
            db,
            cache: Mutex::new(LruCache::new(SNAPSHOT_CACHE_SIZE)),
        }
    }

    pub fn get(&self, llmq_type: LlmqType, cycle_hash: &Hash) -> Result<Option<QuorumSnapshot>> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(snapshot) = cache.get(&(llmq_type, *cycle_hash)) {
                return Ok(Some(snapshot.clone()));
            }
        }
        let loaded = self.db.snapshot(llmq_type, cycle_hash)?;
        if let Some(snapshot) = &loaded {
            let mut cache = self.cache.lock().unwrap();
            cache.insert((llmq_type, *cycle_hash), snapshot.clone());
        }
        Ok(loaded)
    }

    pub fn store(&self, llmq_type: LlmqType, cycle_hash: &Hash, snapshot: &QuorumSnapshot) -> Result<()> {
        debug!(
            "storing quorum snapshot type={:?} cycle={} mode={:?}",
            llmq_type,
            hex::encode(cycle_hash),
            snapshot.skip_list_mode
        );
        self.db.write_snapshot(llmq_type, cycle_hash, snapshot)?;
        let mut cache = self.cache.lock().unwrap();
        cache.insert((llmq_type, *cycle_hash), snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_shared_types::snapshot::SnapshotSkipMode;

    #[test]
    fn store_then_get_hits_cache_and_db() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(LlmqDb::open(dir.path()).unwrap());
        let manager = SnapshotManager::new(Arc::clone(&db));

        let snapshot = QuorumSnapshot {
            active_quorum_members: vec![true, false],
            skip_list_mode: SnapshotSkipMode::NoSkipping,
            skip_list: vec![],
        };
        manager.store(LlmqType::LlmqTestDip24, &[5; 32], &snapshot).unwrap();
        assert_eq!(manager.get(LlmqType::LlmqTestDip24, &[5; 32]).unwrap(), Some(snapshot.clone()));

        // a fresh manager over the same db reads through
        let manager2 = SnapshotManager::new(db);
        assert_eq!(manager2.get(LlmqType::LlmqTestDip24, &[5; 32]).unwrap(), Some(snapshot));
        assert!(manager2.get(LlmqType::LlmqTest, &[5; 32]).unwrap().is_none());
    }
}
