//! Masternode list snapshots as the quorum subsystem consumes them.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use threshold_crypto::PublicKey;

use crate::Hash;

/// One registered masternode at a given block, immutable per block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasternodeEntry {
    /// Identity: the hash of the provider registration transaction.
    pub pro_tx_hash: Hash,
    /// The operator BLS public key messages are authenticated with.
    pub operator_pubkey: PublicKey,
    /// Network address of the node.
    pub address: SocketAddr,
    /// False while the masternode is PoSe-banned or unconfirmed.
    pub valid: bool,
}

/// A read-only snapshot of the masternode list at one block.
///
/// Entries are kept in canonical order (ascending `pro_tx_hash`); the
/// quorum snapshot bitset indexes this order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasternodeList {
    pub block_hash: Hash,
    pub height: u64,
    entries: Vec<MasternodeEntry>,
}

impl MasternodeList {
    pub fn new(block_hash: Hash, height: u64, mut entries: Vec<MasternodeEntry>) -> Self {
        entries.sort_by(|a, b| a.pro_tx_hash.cmp(&b.pro_tx_hash));
        entries.dedup_by(|a, b| a.pro_tx_hash == b.pro_tx_hash);
        MasternodeList { block_hash, height, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in canonical order, banned ones included.
    pub fn entries(&self) -> &[MasternodeEntry] {
        &self.entries
    }

    /// Entries eligible for quorum membership.
    pub fn valid_entries(&self) -> impl Iterator<Item = &MasternodeEntry> {
        self.entries.iter().filter(|e| e.valid)
    }

    pub fn get(&self, pro_tx_hash: &Hash) -> Option<&MasternodeEntry> {
        self.position(pro_tx_hash).map(|i| &self.entries[i])
    }

    pub fn contains(&self, pro_tx_hash: &Hash) -> bool {
        self.position(pro_tx_hash).is_some()
    }

    /// Index of a masternode in the canonical order.
    pub fn position(&self, pro_tx_hash: &Hash) -> Option<usize> {
        self.entries
            .binary_search_by(|e| e.pro_tx_hash.cmp(pro_tx_hash))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seed: u8) -> MasternodeEntry {
        MasternodeEntry {
            pro_tx_hash: [seed; 32],
            operator_pubkey: threshold_crypto::SecretKey::random().public_key(),
            address: format!("10.0.0.{}:9999", seed).parse().unwrap(),
            valid: true,
        }
    }

    #[test]
    fn list_is_canonically_ordered() {
        let list = MasternodeList::new([0; 32], 1, vec![entry(3), entry(1), entry(2), entry(1)]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.position(&[1; 32]), Some(0));
        assert_eq!(list.position(&[2; 32]), Some(1));
        assert_eq!(list.position(&[3; 32]), Some(2));
        assert!(list.get(&[4; 32]).is_none());
    }
}
