//! The InstantSend engine: per-input lock votes, islock assembly,
//! batched verification of inbound islocks, conflict handling and
//! ChainLock supersession.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};

use ferrite_crypto::batch_verifier::BatchVerifier;
use ferrite_shared_types::messages::{
    build_sign_hash, input_lock_request_id, islock_request_id, InstantSendLock, RecoveredSig,
};
use ferrite_shared_types::{Hash, OutPoint, Transaction};

use crate::cache::LruCache;
use crate::chain::{ChainView, Inv, InvKind, MempoolView, NetworkBridge, PeerId};
use crate::chainlocks::ChainLockHandler;
use crate::config::LlmqConfig;
use crate::db::LlmqDb;
use crate::error::{MessageOutcome, MISBEHAVE_STALE, MISBEHAVE_VIOLATION};
use crate::signing::{RecoveredSigListener, SigningManager};
use crate::workers::Scheduler;

/// Delay before a batch of pending islocks is verified, so bursts
/// coalesce into one batched BLS check.
const PENDING_ISLOCK_DELAY: Duration = Duration::from_millis(100);
const ISLOCK_CACHE_SIZE: usize = 1024;

/// Outcome of feeding a transaction into the lock engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessTxResult {
    /// Signing was requested (or had already happened).
    Accepted,
    /// The transaction conflicts with an existing lock or vote.
    Conflicting(Hash),
    /// Inputs are not lockable yet.
    NotLockable,
    /// InstantSend is off, we are not a masternode, or not synced.
    Skipped,
}

struct IsState {
    /// Request ids of input locks we voted on.
    input_request_ids: BTreeSet<Hash>,
    /// islocks being assembled, keyed by their request id.
    creating: BTreeMap<Hash, (Hash, Vec<OutPoint>)>,
    tx_to_creating: BTreeMap<Hash, Hash>,
    pending: BTreeMap<Hash, (PeerId, InstantSendLock)>,
    pending_scheduled: bool,
}

/// Read-through cache over the three persisted islock indices.
struct InstantSendDb {
    db: Arc<LlmqDb>,
    islock_cache: Mutex<LruCache<Hash, Arc<InstantSendLock>>>,
    txid_cache: Mutex<LruCache<Hash, Hash>>,
    outpoint_cache: Mutex<LruCache<OutPoint, Hash>>,
}

impl InstantSendDb {
    fn new(db: Arc<LlmqDb>) -> Self {
        InstantSendDb {
            db,
            islock_cache: Mutex::new(LruCache::new(ISLOCK_CACHE_SIZE)),
            txid_cache: Mutex::new(LruCache::new(ISLOCK_CACHE_SIZE)),
            outpoint_cache: Mutex::new(LruCache::new(ISLOCK_CACHE_SIZE)),
        }
    }

    fn write(&self, hash: &Hash, islock: &InstantSendLock) -> crate::error::Result<()> {
        self.db.write_islock(hash, islock)?;
        let shared = Arc::new(islock.clone());
        self.islock_cache.lock().unwrap().insert(*hash, Arc::clone(&shared));
        self.txid_cache.lock().unwrap().insert(islock.txid, *hash);
        let mut outpoints = self.outpoint_cache.lock().unwrap();
        for input in &islock.inputs {
            outpoints.insert(*input, *hash);
        }
        Ok(())
    }

    fn remove(&self, hash: &Hash, islock: &InstantSendLock) -> crate::error::Result<()> {
        self.db.remove_islock(hash, islock)?;
        self.islock_cache.lock().unwrap().remove(hash);
        self.txid_cache.lock().unwrap().remove(&islock.txid);
        let mut outpoints = self.outpoint_cache.lock().unwrap();
        for input in &islock.inputs {
            outpoints.remove(input);
        }
        Ok(())
    }

    fn by_hash(&self, hash: &Hash) -> Option<Arc<InstantSendLock>> {
        if let Some(islock) = self.islock_cache.lock().unwrap().get(hash) {
            return Some(Arc::clone(islock));
        }
        let islock = self.db.islock_by_hash(hash).ok().flatten()?;
        let shared = Arc::new(islock);
        self.islock_cache.lock().unwrap().insert(*hash, Arc::clone(&shared));
        Some(shared)
    }

    fn hash_by_txid(&self, txid: &Hash) -> Option<Hash> {
        if let Some(hash) = self.txid_cache.lock().unwrap().get(txid) {
            return Some(*hash);
        }
        let hash = self.db.islock_hash_by_txid(txid).ok().flatten()?;
        self.txid_cache.lock().unwrap().insert(*txid, hash);
        Some(hash)
    }

    fn hash_by_input(&self, outpoint: &OutPoint) -> Option<Hash> {
        if let Some(hash) = self.outpoint_cache.lock().unwrap().get(outpoint) {
            return Some(*hash);
        }
        let hash = self.db.islock_hash_by_input(outpoint).ok().flatten()?;
        self.outpoint_cache.lock().unwrap().insert(*outpoint, hash);
        Some(hash)
    }

    fn by_txid(&self, txid: &Hash) -> Option<Arc<InstantSendLock>> {
        self.hash_by_txid(txid).and_then(|hash| self.by_hash(&hash))
    }

    fn by_input(&self, outpoint: &OutPoint) -> Option<Arc<InstantSendLock>> {
        self.hash_by_input(outpoint).and_then(|hash| self.by_hash(&hash))
    }
}

pub struct InstantSendManager {
    config: LlmqConfig,
    chain: Arc<dyn ChainView>,
    mempool: Arc<dyn MempoolView>,
    network: Arc<dyn NetworkBridge>,
    scheduler: Arc<Scheduler>,
    signing: Arc<SigningManager>,
    chainlocks: Arc<ChainLockHandler>,
    db: InstantSendDb,
    state: Mutex<IsState>,
    /// Whether this node participates in signing (is a masternode).
    is_masternode: bool,
    self_ref: Mutex<Weak<InstantSendManager>>,
}

impl InstantSendManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LlmqConfig,
        chain: Arc<dyn ChainView>,
        mempool: Arc<dyn MempoolView>,
        network: Arc<dyn NetworkBridge>,
        scheduler: Arc<Scheduler>,
        signing: Arc<SigningManager>,
        chainlocks: Arc<ChainLockHandler>,
        db: Arc<LlmqDb>,
        is_masternode: bool,
    ) -> Self {
        InstantSendManager {
            config,
            chain,
            mempool,
            network,
            scheduler,
            signing,
            chainlocks,
            db: InstantSendDb::new(db),
            state: Mutex::new(IsState {
                input_request_ids: BTreeSet::new(),
                creating: BTreeMap::new(),
                tx_to_creating: BTreeMap::new(),
                pending: BTreeMap::new(),
                pending_scheduled: false,
            }),
            is_masternode,
            self_ref: Mutex::new(Weak::new()),
        }
    }

    /// Must be called once after construction so the scheduler can
    /// call back into the manager.
    pub fn set_self(&self, weak: Weak<InstantSendManager>) {
        *self.self_ref.lock().unwrap() = weak;
    }

    // outbound path

    /// Ask the signing quorums to lock every input of `tx`.
    pub fn process_tx(&self, tx: &Transaction) -> ProcessTxResult {
        if !self.config.instant_send_enabled || !self.is_masternode {
            return ProcessTxResult::Skipped;
        }
        if !self.chain.is_synced() {
            return ProcessTxResult::Skipped;
        }
        if tx.inputs.is_empty() {
            return ProcessTxResult::NotLockable;
        }
        let txid = tx.txid();
        if let Some(conflict) = self.get_conflicting_tx(tx) {
            return ProcessTxResult::Conflicting(conflict);
        }

        let llmq_type = self.config.instant_send_type;
        let ids: Vec<Hash> = tx.inputs.iter().map(|i| input_lock_request_id(&i.prevout)).collect();

        let mut already_voted = 0usize;
        for (input, id) in tx.inputs.iter().zip(&ids) {
            if let Some(other) = self.signing.get_vote_for_id(llmq_type, id) {
                if other != txid {
                    debug!(
                        "txid {}: input {}:{} conflicts with vote for {}",
                        hex::encode(txid),
                        hex::encode(input.prevout.txid),
                        input.prevout.vout,
                        hex::encode(other)
                    );
                    return ProcessTxResult::Conflicting(other);
                }
                already_voted += 1;
            }
            if self.signing.is_conflicting(llmq_type, id, &txid) {
                return ProcessTxResult::Conflicting(txid);
            }
        }
        if already_voted == ids.len() {
            // all inputs voted; the islock may still be pending
            self.try_sign_islock(tx);
            return ProcessTxResult::Accepted;
        }

        if !self.check_can_lock_tx(tx) {
            return ProcessTxResult::NotLockable;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.input_request_ids.extend(ids.iter().copied());
        }
        for id in &ids {
            if let Err(e) = self.signing.async_sign_if_member(llmq_type, id, &txid) {
                warn!("failed to request input lock: {}", e);
            }
        }
        // all input locks might already be recovered
        self.try_sign_islock(tx);
        ProcessTxResult::Accepted
    }

    fn check_can_lock_tx(&self, tx: &Transaction) -> bool {
        if tx.inputs.is_empty() {
            return false;
        }
        tx.inputs.iter().all(|i| self.check_can_lock_outpoint(&i.prevout))
    }

    /// An outpoint is lockable if its parent is locked, or mined deep
    /// enough, or its block is ChainLocked.
    fn check_can_lock_outpoint(&self, outpoint: &OutPoint) -> bool {
        if self.is_locked(&outpoint.txid) {
            // locked parents make descendants lockable
            return true;
        }
        if self.mempool.get(&outpoint.txid).is_some() {
            debug!(
                "parent {} is an unlocked mempool transaction",
                hex::encode(outpoint.txid)
            );
            return false;
        }
        let mined_height = match self.chain.utxo_mined_height(outpoint) {
            Some(height) => height,
            None => return false,
        };
        let tip = match self.chain.tip() {
            Some(tip) => tip,
            None => return false,
        };
        let age = tip.height.saturating_sub(mined_height) + 1;
        // one less than the wallet-facing confirmation count, in case
        // a block is propagating right now
        let required = self.config.required_confirmations.saturating_sub(1);
        if age < required {
            let mined = match self.chain.block_at_height(mined_height) {
                Some(block) => block,
                None => return false,
            };
            return self.chainlocks.has_chain_lock(mined.height, &mined.hash);
        }
        true
    }

    /// Assemble and sign the islock once every input has a recovered
    /// signature.
    fn try_sign_islock(&self, tx: &Transaction) {
        let llmq_type = self.config.instant_send_type;
        let txid = tx.txid();
        for input in &tx.inputs {
            let id = input_lock_request_id(&input.prevout);
            if !self.signing.has_recovered_sig(llmq_type, &id, &txid) {
                return;
            }
        }

        let inputs: Vec<OutPoint> = tx.inputs.iter().map(|i| i.prevout).collect();
        let request_id = islock_request_id(&inputs);
        if self.signing.has_recovered_sig_for_id(llmq_type, &request_id) {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.creating.contains_key(&request_id) {
                return;
            }
            state.creating.insert(request_id, (txid, inputs));
            state.tx_to_creating.insert(txid, request_id);
        }
        info!(
            "all input locks recovered for {}, signing islock",
            hex::encode(txid)
        );
        if let Err(e) = self.signing.async_sign_if_member(llmq_type, &request_id, &txid) {
            warn!("failed to request islock signature: {}", e);
        }
    }

    fn handle_islock_recovered(&self, rec: &RecoveredSig) {
        let entry = {
            let mut state = self.state.lock().unwrap();
            let entry = state.creating.remove(&rec.id);
            if let Some((txid, _)) = &entry {
                state.tx_to_creating.remove(txid);
            }
            entry
        };
        let (txid, inputs) = match entry {
            Some(entry) => entry,
            None => return,
        };
        if txid != rec.msg_hash {
            debug!(
                "own islock for {} conflicts with {}, dropping our version",
                hex::encode(txid),
                hex::encode(rec.msg_hash)
            );
            return;
        }
        let islock = InstantSendLock { txid, inputs, sig: rec.sig.clone() };
        let hash = islock.hash();
        self.process_islock(None, &hash, islock);
    }

    // inbound path

    /// Shape checks a peer-supplied islock must pass before queueing.
    pub fn pre_verify_islock(islock: &InstantSendLock) -> bool {
        if islock.txid == ferrite_shared_types::NULL_HASH || islock.inputs.is_empty() {
            return false;
        }
        let mut seen = BTreeSet::new();
        islock.inputs.iter().all(|input| seen.insert(*input))
    }

    pub fn process_islock_message(&self, peer: PeerId, islock: InstantSendLock) -> MessageOutcome {
        if !self.config.instant_send_enabled {
            return MessageOutcome::Ignored;
        }
        if !Self::pre_verify_islock(&islock) {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        let hash = islock.hash();
        let mut state = self.state.lock().unwrap();
        if self.db.by_hash(&hash).is_some() || state.pending.contains_key(&hash) {
            return MessageOutcome::Ignored;
        }
        debug!(
            "received islock {} for txid {} from peer {}",
            hex::encode(hash),
            hex::encode(islock.txid),
            peer
        );
        state.pending.insert(hash, (peer, islock));
        if !state.pending_scheduled {
            state.pending_scheduled = true;
            let weak = self.self_ref.lock().unwrap().clone();
            self.scheduler.schedule_in(PENDING_ISLOCK_DELAY, move || {
                if let Some(manager) = weak.upgrade() {
                    manager.process_pending_islocks();
                }
            });
        }
        MessageOutcome::Accepted
    }

    /// Verify the queued islocks in one BLS batch, reusing already
    /// recovered signatures where possible.
    pub fn process_pending_islocks(&self) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.pending_scheduled = false;
            std::mem::take(&mut state.pending)
        };
        if pending.is_empty() {
            return;
        }
        let llmq_type = self.config.instant_send_type;

        let mut verifier: BatchVerifier<PeerId, Hash> = BatchVerifier::new();
        let mut skip_verification: BTreeSet<Hash> = BTreeSet::new();
        let mut queued: BTreeSet<Hash> = BTreeSet::new();
        let mut reconstructed: BTreeMap<Hash, RecoveredSig> = BTreeMap::new();

        for (hash, (peer, islock)) in &pending {
            let id = islock.request_id();
            if self.signing.has_recovered_sig(llmq_type, &id, &islock.txid) {
                // the recovered sig was already verified elsewhere
                skip_verification.insert(*hash);
                continue;
            }
            let quorum = match self.signing.select_quorum_for_signing(llmq_type, &id) {
                Some(quorum) => quorum,
                None => {
                    debug!("no signing quorum available for islock {}", hex::encode(hash));
                    continue;
                }
            };
            let sign_hash = build_sign_hash(llmq_type, &quorum.quorum_hash, &id, &islock.txid);
            verifier.push_message(
                *peer,
                *hash,
                sign_hash,
                islock.sig.clone(),
                quorum.quorum_public_key.clone(),
            );
            queued.insert(*hash);
            if !self.signing.has_recovered_sig_for_id(llmq_type, &id) {
                reconstructed.insert(
                    *hash,
                    RecoveredSig {
                        llmq_type,
                        quorum_hash: quorum.quorum_hash,
                        id,
                        msg_hash: islock.txid,
                        sig: islock.sig.clone(),
                    },
                );
            }
        }
        verifier.verify();
        for peer in &verifier.bad_sources {
            // the peer might just have sent an old lock whose quorum
            // rotated out, so keep the score mild
            self.network.misbehaving(*peer, MISBEHAVE_STALE);
        }

        for (hash, (peer, islock)) in pending {
            if verifier.bad_messages.contains(&hash) {
                debug!(
                    "islock {} from peer {} has an invalid signature",
                    hex::encode(hash),
                    peer
                );
                continue;
            }
            if !skip_verification.contains(&hash) && !queued.contains(&hash) {
                // never made it into the batch (no quorum available)
                continue;
            }
            self.process_islock(Some(peer), &hash, islock);
            if let Some(rec) = reconstructed.get(&hash) {
                if !self.signing.has_recovered_sig_for_id(llmq_type, &rec.id) {
                    self.signing.push_reconstructed_recovered_sig(rec.clone());
                }
            }
        }
    }

    /// Store one verified islock, settle conflicts, relay, and kick
    /// the mempool.
    pub fn process_islock(&self, from: Option<PeerId>, hash: &Hash, islock: InstantSendLock) {
        // a ChainLock over the mined block subsumes the islock
        if let Some((_, Some(mined))) = self.chain.get_transaction(&islock.txid) {
            if self.chainlocks.has_chain_lock(mined.height, &mined.hash) {
                debug!(
                    "dropping islock {}: txid {} already ChainLocked",
                    hex::encode(hash),
                    hex::encode(islock.txid)
                );
                return;
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.creating.remove(&islock.request_id());
            state.tx_to_creating.remove(&islock.txid);

            if self.db.by_hash(hash).is_some() {
                return;
            }
            if let Some(other_hash) = self.db.hash_by_txid(&islock.txid) {
                debug!(
                    "duplicate islock for txid {}: have {}, got {}",
                    hex::encode(islock.txid),
                    hex::encode(other_hash),
                    hex::encode(hash)
                );
                return;
            }
            let mut conflicting_input = false;
            for input in &islock.inputs {
                if let Some(other) = self.db.by_input(input) {
                    if other.txid != islock.txid {
                        warn!(
                            "islock {} input {}:{} conflicts with stored islock for {}",
                            hex::encode(hash),
                            hex::encode(input.txid),
                            input.vout,
                            hex::encode(other.txid)
                        );
                        conflicting_input = true;
                    }
                }
            }
            if conflicting_input {
                // the stored lock takes precedence; every input keeps
                // at most one binding
                return;
            }

            if let Err(e) = self.db.write(hash, &islock) {
                warn!("failed to persist islock: {}", e);
                return;
            }
            info!(
                "stored islock {} for txid {} (peer {:?})",
                hex::encode(hash),
                hex::encode(islock.txid),
                from
            );
        }

        // relay only after the lock is durable
        self.network.relay_inv(Inv { kind: InvKind::IsLock, hash: *hash });
        self.remove_mempool_conflicts(hash, &islock);
        self.retry_lock_mempool_txs(Some(islock.txid));
    }

    fn remove_mempool_conflicts(&self, hash: &Hash, islock: &InstantSendLock) {
        for input in &islock.inputs {
            if let Some(spender) = self.mempool.spender_of(input) {
                if spender != islock.txid {
                    info!(
                        "islock {}: evicting conflicting mempool tx {}",
                        hex::encode(hash),
                        hex::encode(spender)
                    );
                    self.mempool.remove_recursive(&spender);
                }
            }
        }
    }

    /// Retry mempool transactions whose parents just became lockable;
    /// `None` retries the whole pool (after a new ChainLock).
    fn retry_lock_mempool_txs(&self, locked_parent: Option<Hash>) {
        let candidates = match locked_parent {
            Some(parent) => self.mempool.children_of(&parent),
            None => self.mempool.all(),
        };
        for tx in candidates {
            let txid = tx.txid();
            {
                let state = self.state.lock().unwrap();
                if state.tx_to_creating.contains_key(&txid) {
                    continue;
                }
            }
            if self.is_locked(&txid) {
                continue;
            }
            if self.get_conflicting_tx(&tx).is_some() {
                continue;
            }
            if !self.check_can_lock_tx(&tx) {
                continue;
            }
            debug!("retrying lock of {}", hex::encode(txid));
            self.process_tx(&tx);
        }
    }

    // ChainLock supersession

    /// Walk from `block` back to the previous watermark and drop
    /// every islock whose transaction the ChainLocked chain contains.
    pub fn notify_chain_lock(&self, block: &crate::chain::BlockInfo) {
        let watermark = self.db.db.last_chainlock_block().ok().flatten();
        let mut cursor = Some(*block);
        while let Some(current) = cursor {
            if Some(current.hash) == watermark {
                break;
            }
            for txid in self.chain.block_txids(&current.hash) {
                let hash = match self.db.hash_by_txid(&txid) {
                    Some(hash) => hash,
                    None => continue,
                };
                let islock = match self.db.by_hash(&hash) {
                    Some(islock) => islock,
                    None => continue,
                };
                debug!(
                    "removing islock {}: txid {} ChainLocked in {}",
                    hex::encode(hash),
                    hex::encode(txid),
                    hex::encode(current.hash)
                );
                self.remove_final_islock(&hash, &islock);
            }
            cursor = self.chain.block_by_hash(&current.prev_hash);
        }
        if let Err(e) = self.db.db.write_last_chainlock_block(&block.hash) {
            warn!("failed to persist ChainLock watermark: {}", e);
        }
        self.retry_lock_mempool_txs(None);
    }

    fn remove_final_islock(&self, hash: &Hash, islock: &InstantSendLock) {
        if let Err(e) = self.db.remove(hash, islock) {
            warn!("failed to remove islock: {}", e);
            return;
        }
        let mut state = self.state.lock().unwrap();
        for input in &islock.inputs {
            let id = input_lock_request_id(input);
            state.input_request_ids.remove(&id);
        }
    }

    // queries

    pub fn is_locked(&self, txid: &Hash) -> bool {
        if !self.config.instant_send_enabled {
            return false;
        }
        self.db.hash_by_txid(txid).is_some()
    }

    pub fn is_conflicted(&self, tx: &Transaction) -> bool {
        self.get_conflicting_tx(tx).is_some()
    }

    /// The txid of a stored islock spending any of `tx`'s inputs with
    /// a different transaction.
    pub fn get_conflicting_tx(&self, tx: &Transaction) -> Option<Hash> {
        if !self.config.instant_send_enabled {
            return None;
        }
        let txid = tx.txid();
        for input in &tx.inputs {
            if let Some(other) = self.db.by_input(&input.prevout) {
                if other.txid != txid {
                    return Some(other.txid);
                }
            }
        }
        None
    }

    pub fn get_islock_by_hash(&self, hash: &Hash) -> Option<InstantSendLock> {
        self.db.by_hash(hash).map(|islock| (*islock).clone())
    }

    pub fn already_have(&self, inv: &Inv) -> bool {
        if inv.kind != InvKind::IsLock {
            return false;
        }
        if self.db.by_hash(&inv.hash).is_some() {
            return true;
        }
        self.state.lock().unwrap().pending.contains_key(&inv.hash)
    }
}

impl RecoveredSigListener for InstantSendManager {
    fn on_recovered_sig(&self, rec: &RecoveredSig) {
        if !self.config.instant_send_enabled || rec.llmq_type != self.config.instant_send_type {
            return;
        }
        let (is_input_lock, is_islock) = {
            let state = self.state.lock().unwrap();
            (
                state.input_request_ids.contains(&rec.id),
                state.creating.contains_key(&rec.id),
            )
        };
        if is_input_lock {
            let txid = rec.msg_hash;
            debug!(
                "got input lock recovered sig bound to txid {}",
                hex::encode(txid)
            );
            if let Some((tx, _)) = self.chain.get_transaction(&txid) {
                self.try_sign_islock(&tx);
            }
        } else if is_islock {
            self.handle_islock_recovered(rec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threshold_crypto::SecretKey;

    #[test]
    fn pre_verify_rejects_malformed_islocks() {
        let sk = SecretKey::random();
        let good = InstantSendLock {
            txid: [1; 32],
            inputs: vec![OutPoint::new([2; 32], 0), OutPoint::new([2; 32], 1)],
            sig: sk.sign(b"x"),
        };
        assert!(InstantSendManager::pre_verify_islock(&good));

        let null_txid = InstantSendLock { txid: ferrite_shared_types::NULL_HASH, ..good.clone() };
        assert!(!InstantSendManager::pre_verify_islock(&null_txid));

        let empty_inputs = InstantSendLock { inputs: vec![], ..good.clone() };
        assert!(!InstantSendManager::pre_verify_islock(&empty_inputs));

        let dup_inputs = InstantSendLock {
            inputs: vec![OutPoint::new([2; 32], 0), OutPoint::new([2; 32], 0)],
            ..good
        };
        assert!(!InstantSendManager::pre_verify_islock(&dup_inputs));
    }
}
