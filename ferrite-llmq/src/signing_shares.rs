//! Gossip, batching and aggregation of BLS signature shares between
//! members of active signing quorums.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use threshold_crypto::SignatureShare;

use ferrite_crypto::batch_verifier::BatchVerifier;
use ferrite_crypto::bls::{pk_share_as_public_key, recover_signature, share_as_signature};
use ferrite_shared_types::messages::{RecoveredSig, SigShareMessage, WireMessage};
use ferrite_shared_types::params::{llmq_params, LlmqType};
use ferrite_shared_types::Hash;

use crate::chain::{LocalIdentity, NetworkBridge, PeerId};
use crate::config::LlmqConfig;
use crate::error::{MessageOutcome, MISBEHAVE_STALE, MISBEHAVE_SUSPECT, MISBEHAVE_VIOLATION};
use crate::quorums::QuorumManager;
use crate::signing::{PendingSignRequest, SignQueue, SigningManager};
use crate::utils;

/// Cap on unverified shares queued per peer and quorum.
const MAX_PENDING_SHARES_PER_PEER: usize = 32;
/// Cadence of the signing worker's drain loop.
const WORKER_WAIT: Duration = Duration::from_millis(100);

struct ShareCollector {
    llmq_type: LlmqType,
    quorum_hash: Hash,
    id: Hash,
    msg_hash: Hash,
    shares: BTreeMap<usize, SignatureShare>,
}

#[derive(Default)]
struct ShareState {
    pending: Vec<(PeerId, SigShareMessage)>,
    pending_counts: HashMap<(PeerId, LlmqType, Hash), usize>,
    collectors: HashMap<Hash, ShareCollector>,
}

/// Routes signature shares: quota-limits and batch-verifies inbound
/// ones, aggregates at the threshold, and emits our own shares from
/// the sign queue.
pub struct SigShareManager {
    config: LlmqConfig,
    network: Arc<dyn NetworkBridge>,
    quorums: Arc<QuorumManager>,
    signing: Arc<SigningManager>,
    identity: Option<LocalIdentity>,
    /// Process-local seed for watcher connections.
    watch_seed: Hash,
    state: Mutex<ShareState>,
    sign_queue: Arc<SignQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SigShareManager {
    pub fn new(
        config: LlmqConfig,
        network: Arc<dyn NetworkBridge>,
        quorums: Arc<QuorumManager>,
        signing: Arc<SigningManager>,
        identity: Option<LocalIdentity>,
    ) -> Self {
        let sign_queue = signing.sign_queue();
        SigShareManager {
            config,
            network,
            quorums,
            signing,
            identity,
            watch_seed: rand::random(),
            state: Mutex::new(ShareState::default()),
            sign_queue,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the signing worker draining the share queues.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("llmq-sigshares".into())
            .spawn(move || manager.worker_loop())
            .expect("failed to spawn signing worker");
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.sign_queue.shut_down();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(&self) {
        loop {
            if self.sign_queue.is_shut_down() {
                return;
            }
            if let Some(request) = self.sign_queue.pop_wait(WORKER_WAIT) {
                self.sign_share(request);
            }
            self.process_pending_shares();
        }
    }

    /// Inbound share from a peer: shape checks, quota, then queue for
    /// the batched verifier.
    pub fn handle_sig_share(&self, peer: PeerId, msg: SigShareMessage) -> MessageOutcome {
        if !self.config.is_type_enabled(msg.llmq_type) {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        if !self.quorums.is_quorum_active(msg.llmq_type, &msg.quorum_hash) {
            return MessageOutcome::Rejected { ban: MISBEHAVE_STALE };
        }
        let quorum = match self.quorums.get_quorum(msg.llmq_type, &msg.quorum_hash) {
            Some(quorum) => quorum,
            None => return MessageOutcome::Rejected { ban: MISBEHAVE_STALE },
        };
        let signer = msg.signer_index as usize;
        if signer >= quorum.members.len() || !quorum.valid_members[signer] {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        if self.signing.has_recovered_sig_for_id(msg.llmq_type, &msg.id) {
            return MessageOutcome::Ignored;
        }

        let mut state = self.state.lock().unwrap();
        let sign_hash = msg.sign_hash();
        if let Some(collector) = state.collectors.get(&sign_hash) {
            if collector.shares.contains_key(&signer) {
                return MessageOutcome::Ignored;
            }
        }
        let count = state
            .pending_counts
            .entry((peer, msg.llmq_type, msg.quorum_hash))
            .or_insert(0);
        if *count >= MAX_PENDING_SHARES_PER_PEER {
            return MessageOutcome::Rejected { ban: MISBEHAVE_SUSPECT };
        }
        *count += 1;
        state.pending.push((peer, msg));
        MessageOutcome::Accepted
    }

    /// Batch-verify everything queued and feed the collectors.
    pub fn process_pending_shares(&self) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.pending_counts.clear();
            std::mem::take(&mut state.pending)
        };
        if pending.is_empty() {
            return;
        }

        let mut verifier: BatchVerifier<PeerId, Hash> = BatchVerifier::new();
        let mut candidates = Vec::new();
        for (peer, msg) in pending {
            let quorum = match self.quorums.get_quorum(msg.llmq_type, &msg.quorum_hash) {
                Some(quorum) => quorum,
                None => continue,
            };
            let pk_share = match quorum.public_key_share(msg.signer_index as usize) {
                Some(share) => share,
                None => {
                    debug!(
                        "no verification vector for quorum {}, dropping share",
                        hex::encode(msg.quorum_hash)
                    );
                    continue;
                }
            };
            let (sig, pubkey) = match (share_as_signature(&msg.share), pk_share_as_public_key(&pk_share))
            {
                (Ok(sig), Ok(pubkey)) => (sig, pubkey),
                _ => {
                    self.network.misbehaving(peer, MISBEHAVE_VIOLATION);
                    continue;
                }
            };
            let key = msg.msg_hash_key();
            verifier.push_message(peer, key, msg.sign_hash(), sig, pubkey);
            candidates.push((peer, key, msg));
        }
        verifier.verify();
        for peer in &verifier.bad_sources {
            self.network.misbehaving(*peer, MISBEHAVE_VIOLATION);
        }

        let mut recovered = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for (_, key, msg) in &candidates {
                if verifier.bad_messages.contains(key) {
                    continue;
                }
                self.add_share_locked(&mut state, msg, &mut recovered);
            }
        }
        for (_, key, msg) in candidates {
            if !verifier.bad_messages.contains(&key) {
                let llmq_type = msg.llmq_type;
                let quorum_hash = msg.quorum_hash.clone();
                self.network.relay_to_quorum(
                    llmq_type,
                    &quorum_hash,
                    WireMessage::SigShare(msg),
                );
            }
        }
        for rec in recovered {
            self.signing.process_own_recovered_sig(rec);
        }
    }

    /// Insert one verified share; aggregate once the threshold is
    /// reached.
    fn add_share_locked(
        &self,
        state: &mut ShareState,
        msg: &SigShareMessage,
        recovered: &mut Vec<RecoveredSig>,
    ) {
        if self.signing.has_recovered_sig_for_id(msg.llmq_type, &msg.id) {
            return;
        }
        let sign_hash = msg.sign_hash();
        let collector = state.collectors.entry(sign_hash).or_insert_with(|| ShareCollector {
            llmq_type: msg.llmq_type,
            quorum_hash: msg.quorum_hash,
            id: msg.id,
            msg_hash: msg.msg_hash,
            shares: BTreeMap::new(),
        });
        collector.shares.insert(msg.signer_index as usize, msg.share.clone());

        let params = llmq_params(collector.llmq_type);
        if collector.shares.len() < params.threshold {
            return;
        }
        let quorum = match self.quorums.get_quorum(collector.llmq_type, &collector.quorum_hash) {
            Some(quorum) => quorum,
            None => return,
        };
        let vvec = match &quorum.verification_vector {
            Some(vvec) => vvec,
            None => return,
        };
        match recover_signature(vvec, params.threshold, &collector.shares) {
            Ok(sig) => {
                let rec = RecoveredSig {
                    llmq_type: collector.llmq_type,
                    quorum_hash: collector.quorum_hash,
                    id: collector.id,
                    msg_hash: collector.msg_hash,
                    sig,
                };
                if quorum.quorum_public_key.verify(&rec.sig, rec.sign_hash()) {
                    info!(
                        "aggregated {} shares into recovered sig for id {}",
                        collector.shares.len(),
                        hex::encode(collector.id)
                    );
                    recovered.push(rec);
                } else {
                    warn!(
                        "aggregated signature failed verification for id {}",
                        hex::encode(collector.id)
                    );
                }
                state.collectors.remove(&sign_hash);
            }
            Err(e) => {
                warn!("share aggregation failed: {}", e);
            }
        }
    }

    /// Emit our own share for a queued signing request.
    fn sign_share(&self, request: PendingSignRequest) {
        let identity = match &self.identity {
            Some(identity) => identity,
            None => return,
        };
        let quorum = match self.quorums.get_quorum(request.llmq_type, &request.quorum_hash) {
            Some(quorum) => quorum,
            None => {
                debug!(
                    "quorum {} retired before signing id {}",
                    hex::encode(request.quorum_hash),
                    hex::encode(request.id)
                );
                return;
            }
        };
        let (own_share, signer) = match (
            &quorum.own_secret_share,
            quorum.member_index(&identity.pro_tx_hash),
        ) {
            (Some(share), Some(idx)) => (share, idx),
            _ => return,
        };

        let msg = SigShareMessage {
            llmq_type: request.llmq_type,
            quorum_hash: request.quorum_hash,
            signer_index: signer as u16,
            id: request.id,
            msg_hash: request.msg_hash,
            share: own_share.sign(ferrite_shared_types::messages::build_sign_hash(
                request.llmq_type,
                &request.quorum_hash,
                &request.id,
                &request.msg_hash,
            )),
        };

        let mut recovered = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            self.add_share_locked(&mut state, &msg, &mut recovered);
        }
        let llmq_type = msg.llmq_type;
        let quorum_hash = msg.quorum_hash.clone();
        self.network
            .relay_to_quorum(llmq_type, &quorum_hash, WireMessage::SigShare(msg));
        for rec in recovered {
            self.signing.process_own_recovered_sig(rec);
        }
    }

    /// Keep connections to the quorums we sign with, and watcher
    /// links for observed ones.
    pub fn maintain_connections(&self) {
        for llmq_type in self.config.enabled_types.clone() {
            let params = llmq_params(llmq_type);
            let recent = self
                .quorums
                .scan_quorums(llmq_type, params.keep_old_connections);
            for quorum in recent {
                let my_membership = self
                    .identity
                    .as_ref()
                    .and_then(|id| quorum.member_index(&id.pro_tx_hash).map(|_| id.pro_tx_hash));
                let connections: BTreeSet<Hash> = match my_membership {
                    Some(my_protx) => {
                        utils::quorum_connections(params, &quorum.members, &my_protx, false)
                    }
                    None if self.config.watch_quorums => utils::calc_deterministic_watch_connections(
                        &self.watch_seed,
                        llmq_type,
                        &quorum.quorum_hash,
                        quorum.members.len(),
                        1,
                    )
                    .into_iter()
                    .map(|idx| quorum.members[idx].pro_tx_hash)
                    .collect(),
                    None => continue,
                };
                if !connections.is_empty() {
                    self.network
                        .set_quorum_connections(llmq_type, &quorum.quorum_hash, connections);
                }
            }
        }
    }

    /// Drop collectors bound to quorums that rotated out or were
    /// reorged away; their signing requests are failed for good.
    pub fn cleanup_retired_quorums(&self) {
        let mut state = self.state.lock().unwrap();
        state.collectors.retain(|_, collector| {
            self.quorums.is_quorum_active(collector.llmq_type, &collector.quorum_hash)
        });
    }
}
