//! The signing engine: request-id vote binding, quorum selection and
//! recovered-signature bookkeeping.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};

use ferrite_shared_types::encode::{Encodable, HashWriter};
use ferrite_shared_types::messages::RecoveredSig;
use ferrite_shared_types::params::{llmq_params, LlmqType};
use ferrite_shared_types::Hash;

use crate::chain::{Inv, InvKind, NetworkBridge};
use crate::config::LlmqConfig;
use crate::db::{LlmqDb, VoteBinding};
use crate::error::{MessageOutcome, Result, MISBEHAVE_STALE, MISBEHAVE_VIOLATION};
use crate::quorums::{Quorum, QuorumManager};

/// Consumer of freshly recovered signatures. Listeners are called
/// synchronously from the signing worker and must not call back into
/// the signing engine's locks.
pub trait RecoveredSigListener: Send + Sync {
    fn on_recovered_sig(&self, rec: &RecoveredSig);
}

/// A queued request to emit our signature share.
#[derive(Debug, Clone)]
pub struct PendingSignRequest {
    pub llmq_type: LlmqType,
    pub quorum_hash: Hash,
    pub id: Hash,
    pub msg_hash: Hash,
}

/// Hand-off queue between the signing engine and the share worker.
pub struct SignQueue {
    queue: Mutex<VecDeque<PendingSignRequest>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl SignQueue {
    pub fn new() -> Self {
        SignQueue {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn push(&self, request: PendingSignRequest) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(request);
        self.cv.notify_one();
    }

    /// Wait up to `timeout` for the next request; `None` on timeout
    /// or shutdown.
    pub fn pop_wait(&self, timeout: Duration) -> Option<PendingSignRequest> {
        let mut queue = self.queue.lock().unwrap();
        if self.shutdown.load(Ordering::SeqCst) {
            return None;
        }
        if queue.is_empty() {
            let (guard, _) = self.cv.wait_timeout(queue, timeout).unwrap();
            queue = guard;
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return None;
        }
        queue.pop_front()
    }

    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cv.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for SignQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SigningManager {
    config: LlmqConfig,
    db: Arc<LlmqDb>,
    network: Arc<dyn NetworkBridge>,
    quorums: Arc<QuorumManager>,
    listeners: Mutex<Vec<Weak<dyn RecoveredSigListener>>>,
    sign_queue: Arc<SignQueue>,
}

impl SigningManager {
    pub fn new(
        config: LlmqConfig,
        db: Arc<LlmqDb>,
        network: Arc<dyn NetworkBridge>,
        quorums: Arc<QuorumManager>,
        sign_queue: Arc<SignQueue>,
    ) -> Self {
        SigningManager {
            config,
            db,
            network,
            quorums,
            listeners: Mutex::new(Vec::new()),
            sign_queue,
        }
    }

    pub fn register_listener(&self, listener: Weak<dyn RecoveredSigListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn sign_queue(&self) -> Arc<SignQueue> {
        Arc::clone(&self.sign_queue)
    }

    /// Pick the signing quorum for a request id: of the active
    /// quorums, the one minimizing `H(id || quorumHash)`. Stable
    /// under minor reorgs because only the hash enters the score.
    pub fn select_quorum_for_signing(&self, llmq_type: LlmqType, id: &Hash) -> Option<Arc<Quorum>> {
        let params = llmq_params(llmq_type);
        let quorums = self.quorums.scan_quorums(llmq_type, params.signing_active_quorum_count);
        quorums.into_iter().min_by_key(|quorum| {
            let mut hw = HashWriter::new();
            id.consensus_encode(&mut hw).expect("hash writer");
            quorum.quorum_hash.consensus_encode(&mut hw).expect("hash writer");
            hw.finalize()
        })
    }

    /// Queue our signature share for `(id, msgHash)` if we are a
    /// valid member of the selected quorum. The first message hash
    /// seen for an id is durably bound; a later conflicting request
    /// is ignored locally but reported.
    pub fn async_sign_if_member(&self, llmq_type: LlmqType, id: &Hash, msg_hash: &Hash) -> Result<bool> {
        if self.db.recovered_sig_msg_hash(llmq_type, id)?.is_some() {
            return Ok(false);
        }
        if let Some(bound) = self.db.vote_for_id(llmq_type, id)? {
            if bound != *msg_hash {
                warn!(
                    "not signing id {}: already voted for {} (requested {})",
                    hex::encode(id),
                    hex::encode(bound),
                    hex::encode(msg_hash)
                );
                return Ok(false);
            }
        }

        let quorum = match self.select_quorum_for_signing(llmq_type, id) {
            Some(quorum) => quorum,
            None => return Ok(false),
        };
        if quorum.own_secret_share.is_none() {
            return Ok(false);
        }
        // the binding becomes durable only once we are really signing
        if let VoteBinding::Existing(bound) = self.db.try_bind_vote(llmq_type, id, msg_hash)? {
            if bound != *msg_hash {
                return Ok(false);
            }
        }
        debug!(
            "queueing signature share for id {} in quorum {}",
            hex::encode(id),
            hex::encode(quorum.quorum_hash)
        );
        self.sign_queue.push(PendingSignRequest {
            llmq_type,
            quorum_hash: quorum.quorum_hash,
            id: *id,
            msg_hash: *msg_hash,
        });
        Ok(true)
    }

    pub fn has_recovered_sig(&self, llmq_type: LlmqType, id: &Hash, msg_hash: &Hash) -> bool {
        matches!(self.db.recovered_sig(llmq_type, id, msg_hash), Ok(Some(_)))
    }

    pub fn has_recovered_sig_for_id(&self, llmq_type: LlmqType, id: &Hash) -> bool {
        matches!(self.db.recovered_sig_msg_hash(llmq_type, id), Ok(Some(_)))
    }

    pub fn get_recovered_sig(&self, llmq_type: LlmqType, id: &Hash, msg_hash: &Hash) -> Option<RecoveredSig> {
        self.db.recovered_sig(llmq_type, id, msg_hash).ok().flatten()
    }

    /// The message hash our local vote binds the id to, if any.
    pub fn get_vote_for_id(&self, llmq_type: LlmqType, id: &Hash) -> Option<Hash> {
        self.db.vote_for_id(llmq_type, id).ok().flatten()
    }

    /// Whether `(id, msgHash)` contradicts a stored recovered sig or
    /// a stored vote. The same pair again is a duplicate, never a
    /// conflict.
    pub fn is_conflicting(&self, llmq_type: LlmqType, id: &Hash, msg_hash: &Hash) -> bool {
        if let Ok(Some(bound)) = self.db.recovered_sig_msg_hash(llmq_type, id) {
            if bound != *msg_hash {
                return true;
            }
        }
        if let Ok(Some(voted)) = self.db.vote_for_id(llmq_type, id) {
            if voted != *msg_hash {
                return true;
            }
        }
        false
    }

    /// Verify and ingest a recovered signature received from a peer.
    pub fn process_recovered_sig(&self, rec: RecoveredSig) -> MessageOutcome {
        if !self.config.is_type_enabled(rec.llmq_type) {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        if self.has_recovered_sig(rec.llmq_type, &rec.id, &rec.msg_hash) {
            return MessageOutcome::Ignored;
        }
        let quorum = match self.quorums.get_quorum(rec.llmq_type, &rec.quorum_hash) {
            Some(quorum) if self.quorums.is_quorum_active(rec.llmq_type, &rec.quorum_hash) => quorum,
            _ => return MessageOutcome::Rejected { ban: MISBEHAVE_STALE },
        };
        if !quorum.quorum_public_key.verify(&rec.sig, rec.sign_hash()) {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        if let Ok(Some(bound)) = self.db.recovered_sig_msg_hash(rec.llmq_type, &rec.id) {
            if bound != rec.msg_hash {
                // the quorum signed two different messages for one id
                warn!(
                    "conflicting recovered sig for id {}: have {}, got {}",
                    hex::encode(rec.id),
                    hex::encode(bound),
                    hex::encode(rec.msg_hash)
                );
                return MessageOutcome::Ignored;
            }
        }
        self.store_and_notify(rec);
        MessageOutcome::Accepted
    }

    /// Ingest a signature somebody else already batch-verified (e.g.
    /// an islock signature), skipping re-verification.
    pub fn push_reconstructed_recovered_sig(&self, rec: RecoveredSig) {
        if self.has_recovered_sig_for_id(rec.llmq_type, &rec.id) {
            return;
        }
        debug!(
            "accepting reconstructed recovered sig for id {}",
            hex::encode(rec.id)
        );
        self.store_and_notify(rec);
    }

    /// Ingest a signature we aggregated ourselves.
    pub fn process_own_recovered_sig(&self, rec: RecoveredSig) {
        self.store_and_notify(rec);
    }

    fn store_and_notify(&self, rec: RecoveredSig) {
        match self.db.write_recovered_sig(&rec) {
            Ok(true) => {}
            Ok(false) => return, // already stored, notify exactly once
            Err(e) => {
                warn!("failed to persist recovered sig: {}", e);
                return;
            }
        }
        info!(
            "recovered sig for id {} msgHash {} (quorum {})",
            hex::encode(rec.id),
            hex::encode(rec.msg_hash),
            hex::encode(rec.quorum_hash)
        );
        self.network.relay_inv(Inv { kind: InvKind::RecoveredSig, hash: rec.hash() });

        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|weak| weak.upgrade().is_some());
        let strong: Vec<_> = listeners.iter().filter_map(|weak| weak.upgrade()).collect();
        drop(listeners);
        for listener in strong {
            listener.on_recovered_sig(&rec);
        }
    }
}
