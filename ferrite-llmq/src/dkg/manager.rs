//! Phase scheduling and message routing for DKG sessions.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};

use log::{debug, info, warn};

use ferrite_crypto::bls::verify_contribution_share;
use ferrite_shared_types::messages::{
    DkgComplaint, DkgContribution, DkgJustification, DkgPrematureCommitment, WireMessage,
};
use ferrite_shared_types::params::{llmq_params, LlmqParams, LlmqType};
use ferrite_shared_types::Hash;

use crate::chain::{
    BlockInfo, ChainView, CommitmentSink, LocalIdentity, MasternodeListSource, NetworkBridge,
};
use crate::config::LlmqConfig;
use crate::db::{DkgResult, LlmqDb};
use crate::dkg::session::DkgSession;
use crate::error::{MessageOutcome, MISBEHAVE_STALE};
use crate::snapshots::SnapshotManager;
use crate::utils;
use crate::workers::WorkerPool;

/// Where a session stands inside its DKG window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DkgPhase {
    Initialize,
    Contribute,
    Complain,
    Justify,
    Commit,
    Finalize,
    Idle,
}

fn phase_at_offset(offset: u64, phase_blocks: u64) -> DkgPhase {
    match offset / phase_blocks {
        0 => DkgPhase::Initialize,
        1 => DkgPhase::Contribute,
        2 => DkgPhase::Complain,
        3 => DkgPhase::Justify,
        4 => DkgPhase::Commit,
        5 => DkgPhase::Finalize,
        _ => DkgPhase::Idle,
    }
}

struct ActiveDkg {
    quorum_hash: Hash,
    phase: DkgPhase,
    session: DkgSession,
}

/// Drives one DKG session per enabled quorum type across chain
/// height and dispatches inbound DKG messages to them.
pub struct DkgManager {
    config: LlmqConfig,
    chain: Arc<dyn ChainView>,
    mn_source: Arc<dyn MasternodeListSource>,
    network: Arc<dyn NetworkBridge>,
    db: Arc<LlmqDb>,
    snapshots: Arc<SnapshotManager>,
    commitment_sink: Arc<dyn CommitmentSink>,
    bls_pool: Arc<WorkerPool>,
    identity: Option<LocalIdentity>,
    sessions: Mutex<HashMap<LlmqType, ActiveDkg>>,
}

impl DkgManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LlmqConfig,
        chain: Arc<dyn ChainView>,
        mn_source: Arc<dyn MasternodeListSource>,
        network: Arc<dyn NetworkBridge>,
        db: Arc<LlmqDb>,
        snapshots: Arc<SnapshotManager>,
        commitment_sink: Arc<dyn CommitmentSink>,
        bls_pool: Arc<WorkerPool>,
        identity: Option<LocalIdentity>,
    ) -> Self {
        DkgManager {
            config,
            chain,
            mn_source,
            network,
            db,
            snapshots,
            commitment_sink,
            bls_pool,
            identity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Advance every enabled type's session to the phase the new tip
    /// dictates, executing the protocol steps in between.
    pub fn update_block_tip(&self, tip: &BlockInfo) {
        for llmq_type in self.config.enabled_types.clone() {
            let params = llmq_params(llmq_type);
            let window_start = tip.height - tip.height % params.dkg_interval;
            let target_phase = phase_at_offset(tip.height - window_start, params.dkg_phase_blocks);
            let anchor = match self.chain.block_at_height(window_start) {
                Some(anchor) => anchor,
                None => continue,
            };

            let mut sessions = self.sessions.lock().unwrap();
            let needs_new = sessions
                .get(&llmq_type)
                .map(|a| a.quorum_hash != anchor.hash)
                .unwrap_or(true);
            if needs_new && target_phase != DkgPhase::Idle {
                sessions.remove(&llmq_type);
                if let Some(active) = self.init_session(params, &anchor) {
                    sessions.insert(llmq_type, active);
                }
            }
            let active = match sessions.get_mut(&llmq_type) {
                Some(active) if active.quorum_hash == anchor.hash => active,
                _ => continue,
            };
            while active.phase < target_phase {
                let next = match active.phase {
                    DkgPhase::Initialize => DkgPhase::Contribute,
                    DkgPhase::Contribute => DkgPhase::Complain,
                    DkgPhase::Complain => DkgPhase::Justify,
                    DkgPhase::Justify => DkgPhase::Commit,
                    DkgPhase::Commit => DkgPhase::Finalize,
                    DkgPhase::Finalize | DkgPhase::Idle => DkgPhase::Idle,
                };
                self.enter_phase(active, next);
                active.phase = next;
            }
        }
    }

    fn init_session(&self, params: &LlmqParams, anchor: &BlockInfo) -> Option<ActiveDkg> {
        let members = if params.rotation {
            match utils::rotated_quorum_members(
                params,
                self.chain.as_ref(),
                self.mn_source.as_ref(),
                &self.snapshots,
                anchor,
            ) {
                Ok(members) => members,
                Err(e) => {
                    warn!("failed to build rotated member set: {}", e);
                    return None;
                }
            }
        } else {
            utils::quorum_members(params, self.chain.as_ref(), self.mn_source.as_ref(), anchor)
        };
        if members.len() != params.size {
            debug!(
                "not forming {} quorum at {}: {} of {} members",
                params.name,
                hex::encode(anchor.hash),
                members.len(),
                params.size
            );
            return None;
        }

        let am_member = self
            .identity
            .as_ref()
            .map(|id| members.iter().any(|m| m.pro_tx_hash == id.pro_tx_hash))
            .unwrap_or(false);
        if !am_member && !self.config.watch_quorums {
            return None;
        }
        if am_member {
            let my_protx = self.identity.as_ref().unwrap().pro_tx_hash;
            let connections = utils::quorum_connections(params, &members, &my_protx, true);
            if !connections.is_empty() {
                self.network
                    .set_quorum_connections(params.llmq_type, &anchor.hash, connections);
            }
        }

        info!(
            "starting {} DKG session for quorum {} (member: {})",
            params.name,
            hex::encode(anchor.hash),
            am_member
        );
        let mut session = DkgSession::new(
            params.clone(),
            anchor,
            0,
            members,
            am_member.then(|| self.identity.clone().unwrap()),
        );
        // replay contributions persisted before a restart
        match self.db.dkg_contributions(params.llmq_type, &anchor.hash) {
            Ok(persisted) => {
                for contribution in persisted {
                    session.receive_contribution(contribution);
                }
            }
            Err(e) => warn!("failed to load persisted contributions: {}", e),
        }
        Some(ActiveDkg { quorum_hash: anchor.hash, phase: DkgPhase::Initialize, session })
    }

    fn enter_phase(&self, active: &mut ActiveDkg, phase: DkgPhase) {
        debug!(
            "quorum {} entering phase {:?}",
            hex::encode(active.quorum_hash),
            phase
        );
        match phase {
            DkgPhase::Contribute => {
                if let Some(msg) = active.session.contribute() {
                    if let Err(e) = self.db.write_dkg_contribution(&msg) {
                        warn!("failed to persist contribution: {}", e);
                    }
                    active.session.receive_contribution(msg.clone());
                    self.persist_decrypted_share(&active.session, &msg.pro_tx_hash);
                    self.network.broadcast(WireMessage::Contribution(msg));
                }
            }
            DkgPhase::Complain => {
                self.run_share_verifications(&mut active.session);
                if let Some(msg) = active.session.verify_and_complain() {
                    active.session.receive_complaint(msg.clone());
                    self.network.broadcast(WireMessage::Complaint(msg));
                }
            }
            DkgPhase::Justify => {
                if let Some(msg) = active.session.verify_and_justify() {
                    active.session.receive_justification(msg.clone());
                    self.network.broadcast(WireMessage::Justification(msg));
                }
            }
            DkgPhase::Commit => {
                if let Some(msg) = active.session.verify_and_commit() {
                    self.store_dkg_result(&active.session);
                    active.session.receive_premature_commitment(msg.clone());
                    self.network.broadcast(WireMessage::PrematureCommitment(msg));
                }
            }
            DkgPhase::Finalize => {
                for commitment in active.session.finalize_commitments() {
                    self.commitment_sink.submit_commitment(commitment);
                }
            }
            DkgPhase::Initialize | DkgPhase::Idle => {}
        }
    }

    fn persist_decrypted_share(&self, session: &DkgSession, sender: &Hash) {
        let share = session
            .members()
            .iter()
            .position(|m| m.entry.pro_tx_hash == *sender)
            .and_then(|idx| session.decrypted_share_from(idx));
        if let Some(share) = share {
            if let Err(e) = self.db.write_dkg_share(
                session.params().llmq_type,
                session.quorum_hash(),
                sender,
                &share,
            ) {
                warn!("failed to persist decrypted share: {}", e);
            }
        }
    }

    fn store_dkg_result(&self, session: &DkgSession) {
        if let Some(vvec) = session.quorum_vvec() {
            let result = DkgResult { vvec: vvec.clone(), own_share: session.own_share_bytes() };
            if let Err(e) =
                self.db.write_dkg_result(session.params().llmq_type, session.quorum_hash(), &result)
            {
                warn!("failed to persist DKG result: {}", e);
            }
        }
    }

    /// Run the deferred share checks through the bounded BLS pool.
    fn run_share_verifications(&self, session: &mut DkgSession) {
        let checks = session.take_pending_share_checks();
        if checks.is_empty() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        let mut expected = 0usize;
        for check in checks {
            let tx = tx.clone();
            // a full queue blocks here, which caps this session's
            // in-flight work and keeps other sessions responsive
            let queued = self.bls_pool.execute(move || {
                let ok = verify_contribution_share(&check.vvec, check.recipient, &check.share);
                let _ = tx.send((check.contributor, ok));
            });
            if queued.is_ok() {
                expected += 1;
            }
        }
        drop(tx);
        let mut results = Vec::with_capacity(expected);
        while let Ok(result) = rx.recv() {
            results.push(result);
        }
        session.apply_share_check_results(results);
    }

    fn with_session<T>(
        &self,
        llmq_type: LlmqType,
        quorum_hash: &Hash,
        f: impl FnOnce(&mut DkgSession) -> T,
    ) -> Option<T> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&llmq_type) {
            Some(active) if active.quorum_hash == *quorum_hash => Some(f(&mut active.session)),
            _ => None,
        }
    }

    pub fn handle_contribution(&self, msg: DkgContribution) -> MessageOutcome {
        let llmq_type = msg.llmq_type;
        let quorum_hash = msg.quorum_hash;
        let sender = msg.pro_tx_hash;
        let relay = msg.clone();
        let outcome = self.with_session(llmq_type, &quorum_hash, |session| {
            let outcome = session.receive_contribution(msg);
            if outcome.accepted() {
                self.persist_decrypted_share(session, &sender);
            }
            outcome
        });
        match outcome {
            Some(outcome) => {
                if outcome.accepted() {
                    if let Err(e) = self.db.write_dkg_contribution(&relay) {
                        warn!("failed to persist contribution: {}", e);
                    }
                    self.network
                        .relay_to_quorum(llmq_type, &quorum_hash, WireMessage::Contribution(relay));
                }
                outcome
            }
            None => MessageOutcome::Rejected { ban: MISBEHAVE_STALE },
        }
    }

    pub fn handle_complaint(&self, msg: DkgComplaint) -> MessageOutcome {
        let llmq_type = msg.llmq_type;
        let quorum_hash = msg.quorum_hash;
        let relay = msg.clone();
        match self.with_session(llmq_type, &quorum_hash, |session| session.receive_complaint(msg)) {
            Some(outcome) => {
                if outcome.accepted() {
                    self.network
                        .relay_to_quorum(llmq_type, &quorum_hash, WireMessage::Complaint(relay));
                }
                outcome
            }
            None => MessageOutcome::Rejected { ban: MISBEHAVE_STALE },
        }
    }

    pub fn handle_justification(&self, msg: DkgJustification) -> MessageOutcome {
        let llmq_type = msg.llmq_type;
        let quorum_hash = msg.quorum_hash;
        let relay = msg.clone();
        match self
            .with_session(llmq_type, &quorum_hash, |session| session.receive_justification(msg))
        {
            Some(outcome) => {
                if outcome.accepted() {
                    self.network
                        .relay_to_quorum(llmq_type, &quorum_hash, WireMessage::Justification(relay));
                }
                outcome
            }
            None => MessageOutcome::Rejected { ban: MISBEHAVE_STALE },
        }
    }

    pub fn handle_premature_commitment(&self, msg: DkgPrematureCommitment) -> MessageOutcome {
        let llmq_type = msg.llmq_type;
        let quorum_hash = msg.quorum_hash;
        let relay = msg.clone();
        match self.with_session(llmq_type, &quorum_hash, |session| {
            session.receive_premature_commitment(msg)
        }) {
            Some(outcome) => {
                if outcome.accepted() {
                    self.network.relay_to_quorum(
                        llmq_type,
                        &quorum_hash,
                        WireMessage::PrematureCommitment(relay),
                    );
                }
                outcome
            }
            None => MessageOutcome::Rejected { ban: MISBEHAVE_STALE },
        }
    }
}

