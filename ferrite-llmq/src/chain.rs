//! Narrow interfaces toward the surrounding node.
//!
//! Block validation, mempool policy, masternode list maintenance and
//! the P2P transport all live outside this subsystem; these traits are
//! the only way the quorum code reaches them.

use std::collections::BTreeSet;

use threshold_crypto::SecretKey;

use ferrite_shared_types::masternode::MasternodeList;
use ferrite_shared_types::messages::WireMessage;
use ferrite_shared_types::params::LlmqType;
use ferrite_shared_types::{Hash, OutPoint, Transaction};

pub type PeerId = u64;

/// A block's position in the active chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: Hash,
    pub prev_hash: Hash,
    pub height: u64,
}

/// Read-only view of the active chain and the UTXO set.
pub trait ChainView: Send + Sync {
    fn tip(&self) -> Option<BlockInfo>;
    /// True once initial block download is finished.
    fn is_synced(&self) -> bool;
    fn block_at_height(&self, height: u64) -> Option<BlockInfo>;
    fn block_by_hash(&self, hash: &Hash) -> Option<BlockInfo>;
    /// Txids of a block, in block order.
    fn block_txids(&self, block_hash: &Hash) -> Vec<Hash>;
    /// A transaction, wherever it currently lives, together with the
    /// block it was mined in if any.
    fn get_transaction(&self, txid: &Hash) -> Option<(Transaction, Option<BlockInfo>)>;
    /// Height of the block that created this unspent outpoint; `None`
    /// when the outpoint is unknown, spent, or still in the mempool.
    fn utxo_mined_height(&self, outpoint: &OutPoint) -> Option<u64>;
}

/// Read and eviction access to the surrounding node's mempool.
pub trait MempoolView: Send + Sync {
    fn get(&self, txid: &Hash) -> Option<Transaction>;
    /// The mempool transaction spending the outpoint, if any.
    fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash>;
    /// Mempool transactions spending any output of `txid`.
    fn children_of(&self, txid: &Hash) -> Vec<Transaction>;
    fn all(&self) -> Vec<Transaction>;
    /// Evict a transaction and its descendants.
    fn remove_recursive(&self, txid: &Hash);
}

/// Provider of per-block masternode list snapshots.
pub trait MasternodeListSource: Send + Sync {
    fn list_at(&self, block_hash: &Hash) -> Option<MasternodeList>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    IsLock,
    RecoveredSig,
}

/// Inventory announcement handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash,
}

/// Outbound surface toward the P2P layer.
pub trait NetworkBridge: Send + Sync {
    /// Gossip a message to all peers.
    fn broadcast(&self, msg: WireMessage);
    /// Gossip a message to members and watchers of one quorum only.
    fn relay_to_quorum(&self, llmq_type: LlmqType, quorum_hash: &Hash, msg: WireMessage);
    fn relay_inv(&self, inv: Inv);
    fn misbehaving(&self, peer: PeerId, score: u32);
    /// Ask the connection manager to keep links to these masternodes.
    fn set_quorum_connections(
        &self,
        llmq_type: LlmqType,
        quorum_hash: &Hash,
        members: BTreeSet<Hash>,
    );
    /// Ask peers for a quorum's verification data.
    fn request_quorum_data(&self, llmq_type: LlmqType, quorum_hash: &Hash);
}

/// Receiver of final commitments, i.e. the external block producer.
pub trait CommitmentSink: Send + Sync {
    fn submit_commitment(&self, commitment: ferrite_shared_types::messages::FinalCommitment);
}

/// The local masternode identity, absent on ordinary full nodes.
#[derive(Clone)]
pub struct LocalIdentity {
    pub pro_tx_hash: Hash,
    pub operator_key: SecretKey,
}

impl LocalIdentity {
    pub fn new(pro_tx_hash: Hash, operator_key: SecretKey) -> Self {
        LocalIdentity { pro_tx_hash, operator_key }
    }
}
