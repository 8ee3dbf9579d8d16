//! Sled-backed persistence for the LLMQ subsystem.
//!
//! One tree per logical keyspace; keys inside a tree carry short
//! prefixes so that everything belonging to one object can be written
//! in a single-tree transaction. A failed write poisons the store:
//! the node must restart rather than continue on partial state.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;

use ferrite_shared_types::encode;
use ferrite_shared_types::messages::{DkgContribution, FinalCommitment, InstantSendLock, RecoveredSig};
use ferrite_shared_types::params::LlmqType;
use ferrite_shared_types::snapshot::QuorumSnapshot;
use ferrite_shared_types::{Hash, OutPoint};

use crate::error::{LlmqError, Result};

const TREE_INSTANTSEND: &str = "is";
const TREE_RECOVERED_SIGS: &str = "rs";
const TREE_DKG: &str = "dkg";
const TREE_SNAPSHOTS: &str = "qs";
const TREE_MINED_COMMITMENTS: &str = "q_mined";

const KEY_LAST_CHAINLOCK_BLOCK: &[u8] = b"is_lcb";

/// Result of trying to bind a vote for a request id.
#[derive(Debug, PartialEq, Eq)]
pub enum VoteBinding {
    /// First vote for this id; it is now durable.
    New,
    /// A vote already existed; the stored message hash is returned.
    Existing(Hash),
}

/// A mined final commitment together with where it was mined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinedCommitment {
    pub commitment: FinalCommitment,
    pub block_hash: Hash,
    pub height: u64,
}

/// Persisted result of a completed DKG: the aggregated verification
/// vector plus, for members, the own share of the quorum secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgResult {
    pub vvec: threshold_crypto::poly::Commitment,
    pub own_share: Option<[u8; 32]>,
}

pub struct LlmqDb {
    _db: sled::Db,
    instantsend: sled::Tree,
    recovered_sigs: sled::Tree,
    dkg: sled::Tree,
    snapshots: sled::Tree,
    mined: sled::Tree,
    poisoned: AtomicBool,
}

fn islock_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(b"is_i");
    key.extend_from_slice(hash);
    key
}

fn islock_txid_key(txid: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.extend_from_slice(b"is_tx");
    key.extend_from_slice(txid);
    key
}

fn islock_input_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.extend_from_slice(b"is_in");
    key.extend_from_slice(&encode::serialize(outpoint));
    key
}

fn typed_id_key(prefix: u8, llmq_type: LlmqType, id: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.push(prefix);
    key.push(llmq_type as u8);
    key.extend_from_slice(id);
    key
}

fn recsig_key(llmq_type: LlmqType, id: &Hash, msg_hash: &Hash) -> Vec<u8> {
    let mut key = typed_id_key(b's', llmq_type, id);
    key.extend_from_slice(msg_hash);
    key
}

fn dkg_msg_key(prefix: u8, llmq_type: LlmqType, quorum_hash: &Hash, pro_tx_hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(66);
    key.push(prefix);
    key.push(llmq_type as u8);
    key.extend_from_slice(quorum_hash);
    key.extend_from_slice(pro_tx_hash);
    key
}

fn dkg_result_key(llmq_type: LlmqType, quorum_hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.push(b'r');
    key.push(llmq_type as u8);
    key.extend_from_slice(quorum_hash);
    key
}

fn snapshot_key(llmq_type: LlmqType, cycle_hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(llmq_type as u8);
    key.extend_from_slice(cycle_hash);
    key
}

fn mined_key(llmq_type: LlmqType, height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(llmq_type as u8);
    // big-endian so iteration order is ascending height
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn hash_from_ivec(ivec: &sled::IVec) -> Option<Hash> {
    <[u8; 32]>::try_from(ivec.as_ref()).ok()
}

impl LlmqDb {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(LlmqDb {
            instantsend: db.open_tree(TREE_INSTANTSEND)?,
            recovered_sigs: db.open_tree(TREE_RECOVERED_SIGS)?,
            dkg: db.open_tree(TREE_DKG)?,
            snapshots: db.open_tree(TREE_SNAPSHOTS)?,
            mined: db.open_tree(TREE_MINED_COMMITMENTS)?,
            _db: db,
            poisoned: AtomicBool::new(false),
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(LlmqError::StorePoisoned);
        }
        Ok(())
    }

    fn poison_on_error<T>(&self, res: std::result::Result<T, sled::Error>) -> Result<T> {
        res.map_err(|e| {
            self.poisoned.store(true, Ordering::SeqCst);
            LlmqError::Db(e)
        })
    }

    // instantsend

    /// Atomically store an islock under all three indices.
    pub fn write_islock(&self, hash: &Hash, islock: &InstantSendLock) -> Result<()> {
        self.check_writable()?;
        let body = bincode::serialize(islock)?;
        let result: std::result::Result<(), TransactionError<()>> =
            self.instantsend.transaction(|tx| {
                tx.insert(islock_key(hash), body.clone())?;
                tx.insert(islock_txid_key(&islock.txid), hash.to_vec())?;
                for input in &islock.inputs {
                    tx.insert(islock_input_key(input), hash.to_vec())?;
                }
                Ok(())
            });
        self.unwrap_transaction(result)
    }

    /// Atomically drop an islock and all of its indices.
    pub fn remove_islock(&self, hash: &Hash, islock: &InstantSendLock) -> Result<()> {
        self.check_writable()?;
        let result: std::result::Result<(), TransactionError<()>> =
            self.instantsend.transaction(|tx| {
                tx.remove(islock_key(hash))?;
                tx.remove(islock_txid_key(&islock.txid))?;
                for input in &islock.inputs {
                    tx.remove(islock_input_key(input))?;
                }
                Ok(())
            });
        self.unwrap_transaction(result)
    }

    pub fn islock_by_hash(&self, hash: &Hash) -> Result<Option<InstantSendLock>> {
        match self.instantsend.get(islock_key(hash))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn islock_hash_by_txid(&self, txid: &Hash) -> Result<Option<Hash>> {
        Ok(self.instantsend.get(islock_txid_key(txid))?.as_ref().and_then(hash_from_ivec))
    }

    pub fn islock_hash_by_input(&self, outpoint: &OutPoint) -> Result<Option<Hash>> {
        Ok(self
            .instantsend
            .get(islock_input_key(outpoint))?
            .as_ref()
            .and_then(hash_from_ivec))
    }

    pub fn write_last_chainlock_block(&self, hash: &Hash) -> Result<()> {
        self.check_writable()?;
        let res = self.instantsend.insert(KEY_LAST_CHAINLOCK_BLOCK, hash.to_vec());
        self.poison_on_error(res)?;
        Ok(())
    }

    pub fn last_chainlock_block(&self) -> Result<Option<Hash>> {
        Ok(self
            .instantsend
            .get(KEY_LAST_CHAINLOCK_BLOCK)?
            .as_ref()
            .and_then(hash_from_ivec))
    }

    // recovered signatures

    /// Bind the first vote for `(llmqType, id)`. A later call with any
    /// message hash reports the stored one; nothing is overwritten.
    pub fn try_bind_vote(&self, llmq_type: LlmqType, id: &Hash, msg_hash: &Hash) -> Result<VoteBinding> {
        self.check_writable()?;
        let key = typed_id_key(b'v', llmq_type, id);
        let res = self.recovered_sigs.compare_and_swap(
            key,
            None as Option<&[u8]>,
            Some(msg_hash.to_vec()),
        );
        match self.poison_on_error(res)? {
            Ok(()) => Ok(VoteBinding::New),
            Err(cas) => {
                let current = cas
                    .current
                    .as_ref()
                    .and_then(hash_from_ivec)
                    .ok_or_else(|| LlmqError::Serialization("corrupt vote record".into()))?;
                Ok(VoteBinding::Existing(current))
            }
        }
    }

    pub fn vote_for_id(&self, llmq_type: LlmqType, id: &Hash) -> Result<Option<Hash>> {
        Ok(self
            .recovered_sigs
            .get(typed_id_key(b'v', llmq_type, id))?
            .as_ref()
            .and_then(hash_from_ivec))
    }

    /// Persist a recovered signature. Returns false when one for the
    /// same id already existed (nothing is written then).
    pub fn write_recovered_sig(&self, rec: &RecoveredSig) -> Result<bool> {
        self.check_writable()?;
        let body = bincode::serialize(rec)?;
        let id_key = typed_id_key(b'h', rec.llmq_type, &rec.id);
        let body_key = recsig_key(rec.llmq_type, &rec.id, &rec.msg_hash);
        let result: std::result::Result<bool, TransactionError<()>> =
            self.recovered_sigs.transaction(|tx| {
                if tx.get(id_key.clone())?.is_some() {
                    return Ok(false);
                }
                tx.insert(id_key.clone(), rec.msg_hash.to_vec())?;
                tx.insert(body_key.clone(), body.clone())?;
                Ok(true)
            });
        self.unwrap_transaction(result)
    }

    pub fn recovered_sig_msg_hash(&self, llmq_type: LlmqType, id: &Hash) -> Result<Option<Hash>> {
        Ok(self
            .recovered_sigs
            .get(typed_id_key(b'h', llmq_type, id))?
            .as_ref()
            .and_then(hash_from_ivec))
    }

    pub fn recovered_sig(
        &self,
        llmq_type: LlmqType,
        id: &Hash,
        msg_hash: &Hash,
    ) -> Result<Option<RecoveredSig>> {
        match self.recovered_sigs.get(recsig_key(llmq_type, id, msg_hash))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // DKG archive

    pub fn write_dkg_contribution(&self, contribution: &DkgContribution) -> Result<()> {
        self.check_writable()?;
        let key = dkg_msg_key(
            b'c',
            contribution.llmq_type,
            &contribution.quorum_hash,
            &contribution.pro_tx_hash,
        );
        let res = self.dkg.insert(key, bincode::serialize(contribution)?);
        self.poison_on_error(res)?;
        Ok(())
    }

    /// All persisted contributions for one session, sender-keyed.
    pub fn dkg_contributions(&self, llmq_type: LlmqType, quorum_hash: &Hash) -> Result<Vec<DkgContribution>> {
        let mut prefix = Vec::with_capacity(34);
        prefix.push(b'c');
        prefix.push(llmq_type as u8);
        prefix.extend_from_slice(quorum_hash);
        let mut out = Vec::new();
        for item in self.dkg.scan_prefix(prefix) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Persist the decrypted secret contribution a sender addressed to
    /// the local node, so a restart inside the DKG window keeps it.
    pub fn write_dkg_share(
        &self,
        llmq_type: LlmqType,
        quorum_hash: &Hash,
        sender: &Hash,
        share: &[u8; 32],
    ) -> Result<()> {
        self.check_writable()?;
        let key = dkg_msg_key(b'k', llmq_type, quorum_hash, sender);
        let res = self.dkg.insert(key, share.to_vec());
        self.poison_on_error(res)?;
        Ok(())
    }

    pub fn dkg_share(
        &self,
        llmq_type: LlmqType,
        quorum_hash: &Hash,
        sender: &Hash,
    ) -> Result<Option<[u8; 32]>> {
        Ok(self
            .dkg
            .get(dkg_msg_key(b'k', llmq_type, quorum_hash, sender))?
            .as_ref()
            .and_then(hash_from_ivec))
    }

    pub fn write_dkg_result(&self, llmq_type: LlmqType, quorum_hash: &Hash, result: &DkgResult) -> Result<()> {
        self.check_writable()?;
        let res = self
            .dkg
            .insert(dkg_result_key(llmq_type, quorum_hash), bincode::serialize(result)?);
        self.poison_on_error(res)?;
        Ok(())
    }

    pub fn dkg_result(&self, llmq_type: LlmqType, quorum_hash: &Hash) -> Result<Option<DkgResult>> {
        match self.dkg.get(dkg_result_key(llmq_type, quorum_hash))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // quorum snapshots

    pub fn write_snapshot(
        &self,
        llmq_type: LlmqType,
        cycle_hash: &Hash,
        snapshot: &QuorumSnapshot,
    ) -> Result<()> {
        self.check_writable()?;
        let res = self
            .snapshots
            .insert(snapshot_key(llmq_type, cycle_hash), bincode::serialize(snapshot)?);
        self.poison_on_error(res)?;
        Ok(())
    }

    pub fn snapshot(&self, llmq_type: LlmqType, cycle_hash: &Hash) -> Result<Option<QuorumSnapshot>> {
        match self.snapshots.get(snapshot_key(llmq_type, cycle_hash))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // mined commitments

    pub fn write_mined_commitment(&self, mined: &MinedCommitment) -> Result<()> {
        self.check_writable()?;
        let key = mined_key(mined.commitment.llmq_type, mined.height);
        let res = self.mined.insert(key, bincode::serialize(mined)?);
        self.poison_on_error(res)?;
        Ok(())
    }

    /// Mined commitments of one type, ascending by height.
    pub fn mined_commitments(&self, llmq_type: LlmqType) -> Result<Vec<MinedCommitment>> {
        let mut out = Vec::new();
        for item in self.mined.scan_prefix([llmq_type as u8]) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Drop mined commitments above the new tip after a reorg.
    pub fn remove_mined_commitments_above(&self, llmq_type: LlmqType, height: u64) -> Result<Vec<Hash>> {
        self.check_writable()?;
        let mut evicted = Vec::new();
        for item in self.mined.scan_prefix([llmq_type as u8]) {
            let (key, value) = item?;
            let mined: MinedCommitment = bincode::deserialize(&value)?;
            if mined.height > height {
                let res = self.mined.remove(key);
                self.poison_on_error(res)?;
                evicted.push(mined.commitment.quorum_hash);
            }
        }
        Ok(evicted)
    }

    fn unwrap_transaction<T>(&self, result: std::result::Result<T, TransactionError<()>>) -> Result<T> {
        match result {
            Ok(v) => Ok(v),
            Err(TransactionError::Abort(())) => {
                Err(LlmqError::Serialization("aborted transaction".into()))
            }
            Err(TransactionError::Storage(e)) => {
                self.poisoned.store(true, Ordering::SeqCst);
                Err(LlmqError::Db(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_shared_types::params::LlmqType;
    use threshold_crypto::SecretKey;

    fn test_db() -> (tempfile::TempDir, LlmqDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = LlmqDb::open(dir.path()).unwrap();
        (dir, db)
    }

    fn dummy_islock(seed: u8) -> InstantSendLock {
        InstantSendLock {
            txid: [seed; 32],
            inputs: vec![OutPoint::new([seed ^ 0xff; 32], 0), OutPoint::new([seed ^ 0xf0; 32], 1)],
            sig: SecretKey::random().sign(b"islock"),
        }
    }

    #[test]
    fn islock_indices_roundtrip() {
        let (_dir, db) = test_db();
        let islock = dummy_islock(7);
        let hash = islock.hash();
        db.write_islock(&hash, &islock).unwrap();

        assert_eq!(db.islock_by_hash(&hash).unwrap().unwrap(), islock);
        assert_eq!(db.islock_hash_by_txid(&islock.txid).unwrap(), Some(hash));
        for input in &islock.inputs {
            assert_eq!(db.islock_hash_by_input(input).unwrap(), Some(hash));
        }

        db.remove_islock(&hash, &islock).unwrap();
        assert!(db.islock_by_hash(&hash).unwrap().is_none());
        assert!(db.islock_hash_by_txid(&islock.txid).unwrap().is_none());
        for input in &islock.inputs {
            assert!(db.islock_hash_by_input(input).unwrap().is_none());
        }
    }

    #[test]
    fn vote_binding_is_first_writer_wins() {
        let (_dir, db) = test_db();
        let id = [1; 32];
        assert_eq!(
            db.try_bind_vote(LlmqType::LlmqTest, &id, &[2; 32]).unwrap(),
            VoteBinding::New
        );
        assert_eq!(
            db.try_bind_vote(LlmqType::LlmqTest, &id, &[3; 32]).unwrap(),
            VoteBinding::Existing([2; 32])
        );
        // the stored binding is untouched
        assert_eq!(db.vote_for_id(LlmqType::LlmqTest, &id).unwrap(), Some([2; 32]));
    }

    #[test]
    fn recovered_sig_written_once() {
        let (_dir, db) = test_db();
        let rec = RecoveredSig {
            llmq_type: LlmqType::LlmqTest,
            quorum_hash: [1; 32],
            id: [2; 32],
            msg_hash: [3; 32],
            sig: SecretKey::random().sign(b"rs"),
        };
        assert!(db.write_recovered_sig(&rec).unwrap());
        assert!(!db.write_recovered_sig(&rec).unwrap());
        assert_eq!(
            db.recovered_sig_msg_hash(LlmqType::LlmqTest, &rec.id).unwrap(),
            Some(rec.msg_hash)
        );
        assert_eq!(
            db.recovered_sig(LlmqType::LlmqTest, &rec.id, &rec.msg_hash).unwrap().unwrap(),
            rec
        );
    }

    #[test]
    fn mined_commitments_ordered_and_reorgable() {
        let (_dir, db) = test_db();
        let sk = SecretKey::random();
        for height in [30u64, 10, 20] {
            let mined = MinedCommitment {
                commitment: FinalCommitment {
                    version: 1,
                    llmq_type: LlmqType::LlmqTest,
                    quorum_hash: [height as u8; 32],
                    quorum_index: 0,
                    signers: vec![true; 10],
                    valid_members: vec![true; 10],
                    quorum_public_key: sk.public_key(),
                    quorum_vvec_hash: [0; 32],
                    quorum_sig: sk.sign(b"q"),
                    members_sig: sk.sign(b"m"),
                },
                block_hash: [height as u8 + 1; 32],
                height,
            };
            db.write_mined_commitment(&mined).unwrap();
        }
        let all = db.mined_commitments(LlmqType::LlmqTest).unwrap();
        assert_eq!(all.iter().map(|m| m.height).collect::<Vec<_>>(), vec![10, 20, 30]);

        let evicted = db.remove_mined_commitments_above(LlmqType::LlmqTest, 15).unwrap();
        assert_eq!(evicted, vec![[20u8; 32], [30u8; 32]]);
        let left = db.mined_commitments(LlmqType::LlmqTest).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].height, 10);
    }

    #[test]
    fn snapshot_storage_roundtrip() {
        let (_dir, db) = test_db();
        let snapshot = QuorumSnapshot {
            active_quorum_members: vec![true, false, true],
            skip_list_mode: ferrite_shared_types::snapshot::SnapshotSkipMode::SkipEntries,
            skip_list: vec![7, 4, 3],
        };
        db.write_snapshot(LlmqType::LlmqTestDip24, &[9; 32], &snapshot).unwrap();
        assert_eq!(
            db.snapshot(LlmqType::LlmqTestDip24, &[9; 32]).unwrap().unwrap(),
            snapshot
        );
        assert!(db.snapshot(LlmqType::LlmqTestDip24, &[8; 32]).unwrap().is_none());
    }
}
