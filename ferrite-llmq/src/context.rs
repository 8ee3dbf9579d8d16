//! The LLMQ context: one object owning the whole subsystem.
//!
//! There is no process-wide state; tests spin up isolated contexts.
//! Construction wires the components together, `stop` tears them down
//! in reverse dependency order (listeners, engines, stores).

use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info};

use ferrite_shared_types::messages::{FinalCommitment, WireMessage};
use ferrite_shared_types::Transaction;

use crate::chain::{
    BlockInfo, ChainView, CommitmentSink, LocalIdentity, MasternodeListSource, MempoolView,
    NetworkBridge, PeerId,
};
use crate::chainlocks::ChainLockHandler;
use crate::config::LlmqConfig;
use crate::db::LlmqDb;
use crate::dkg::DkgManager;
use crate::error::{MessageOutcome, Result};
use crate::instantsend::{InstantSendManager, ProcessTxResult};
use crate::quorums::QuorumManager;
use crate::signing::{RecoveredSigListener, SignQueue, SigningManager};
use crate::signing_shares::SigShareManager;
use crate::snapshots::SnapshotManager;
use crate::workers::{Scheduler, WorkerPool};

const BLS_POOL_QUEUE_CAP: usize = 256;

pub struct LlmqContext {
    pub config: LlmqConfig,
    pub db: Arc<LlmqDb>,
    pub scheduler: Arc<Scheduler>,
    pub bls_pool: Arc<WorkerPool>,
    pub snapshots: Arc<SnapshotManager>,
    pub dkg_manager: Arc<DkgManager>,
    pub quorum_manager: Arc<QuorumManager>,
    pub signing: Arc<SigningManager>,
    pub share_manager: Arc<SigShareManager>,
    pub instantsend: Arc<InstantSendManager>,
    pub chainlocks: Arc<ChainLockHandler>,
    network: Arc<dyn NetworkBridge>,
    last_tip: Mutex<Option<BlockInfo>>,
}

impl LlmqContext {
    /// Construct the whole subsystem over one database directory.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LlmqConfig,
        chain: Arc<dyn ChainView>,
        mempool: Arc<dyn MempoolView>,
        mn_source: Arc<dyn MasternodeListSource>,
        network: Arc<dyn NetworkBridge>,
        commitment_sink: Arc<dyn CommitmentSink>,
        identity: Option<LocalIdentity>,
        db_path: &Path,
    ) -> Result<Arc<Self>> {
        let db = Arc::new(LlmqDb::open(db_path)?);
        let scheduler = Arc::new(Scheduler::new());
        let bls_pool = Arc::new(WorkerPool::new(
            "llmq-bls",
            WorkerPool::default_thread_count(),
            BLS_POOL_QUEUE_CAP,
        ));
        let snapshots = Arc::new(SnapshotManager::new(Arc::clone(&db)));

        let quorum_manager = Arc::new(QuorumManager::new(
            config.clone(),
            Arc::clone(&chain),
            Arc::clone(&mn_source),
            Arc::clone(&network),
            Arc::clone(&db),
            Arc::clone(&snapshots),
            identity.clone(),
        ));
        let sign_queue = Arc::new(SignQueue::new());
        let signing = Arc::new(SigningManager::new(
            config.clone(),
            Arc::clone(&db),
            Arc::clone(&network),
            Arc::clone(&quorum_manager),
            sign_queue,
        ));
        let share_manager = Arc::new(SigShareManager::new(
            config.clone(),
            Arc::clone(&network),
            Arc::clone(&quorum_manager),
            Arc::clone(&signing),
            identity.clone(),
        ));
        let dkg_manager = Arc::new(DkgManager::new(
            config.clone(),
            Arc::clone(&chain),
            Arc::clone(&mn_source),
            Arc::clone(&network),
            Arc::clone(&db),
            Arc::clone(&snapshots),
            commitment_sink,
            Arc::clone(&bls_pool),
            identity.clone(),
        ));
        let chainlocks = Arc::new(ChainLockHandler::new(Arc::clone(&chain)));
        let instantsend = Arc::new(InstantSendManager::new(
            config.clone(),
            chain,
            mempool,
            Arc::clone(&network),
            Arc::clone(&scheduler),
            Arc::clone(&signing),
            Arc::clone(&chainlocks),
            Arc::clone(&db),
            identity.is_some(),
        ));
        instantsend.set_self(Arc::downgrade(&instantsend));
        let listener: Weak<dyn RecoveredSigListener> = {
            let weak: Weak<InstantSendManager> = Arc::downgrade(&instantsend);
            weak
        };
        signing.register_listener(listener);

        info!(
            "LLMQ subsystem initialized (masternode: {})",
            identity.is_some()
        );
        Ok(Arc::new(LlmqContext {
            config,
            db,
            scheduler,
            bls_pool,
            snapshots,
            dkg_manager,
            quorum_manager,
            signing,
            share_manager,
            instantsend,
            chainlocks,
            network,
            last_tip: Mutex::new(None),
        }))
    }

    /// Spawn the background workers.
    pub fn start(&self) {
        self.share_manager.start();
    }

    /// Stop workers in reverse dependency order.
    pub fn stop(&self) {
        self.share_manager.stop();
        self.scheduler.stop();
        self.bls_pool.stop();
        info!("LLMQ subsystem stopped");
    }

    /// Chain tip moved: handle reorgs, advance DKG phases, refresh
    /// quorum connections.
    pub fn updated_block_tip(&self, tip: BlockInfo) {
        let reorged = {
            let mut last = self.last_tip.lock().unwrap();
            let reorged = match *last {
                Some(previous) => {
                    tip.height <= previous.height
                        || (tip.height == previous.height + 1 && tip.prev_hash != previous.hash)
                }
                None => false,
            };
            *last = Some(tip);
            reorged
        };
        if reorged {
            debug!("reorg detected at height {}", tip.height);
            let evicted = self.quorum_manager.handle_reorg(&tip);
            if !evicted.is_empty() {
                self.share_manager.cleanup_retired_quorums();
            }
        }
        self.dkg_manager.update_block_tip(&tip);
        self.share_manager.maintain_connections();
    }

    /// A block got ChainLocked; supersession completes before this
    /// returns.
    pub fn notify_chain_lock(&self, block: BlockInfo) {
        self.chainlocks.set_best_chain_lock(block);
        self.instantsend.notify_chain_lock(&block);
    }

    /// A final commitment was mined; materialize the quorum.
    pub fn process_mined_commitment(&self, commitment: FinalCommitment, block: BlockInfo) -> Result<()> {
        self.quorum_manager.process_mined_commitment(commitment, block)
    }

    /// Application entry point: request locks for a transaction.
    pub fn process_tx(&self, tx: &Transaction) -> ProcessTxResult {
        self.instantsend.process_tx(tx)
    }

    /// Dispatch one wire message and apply any earned ban score.
    pub fn handle_message(&self, peer: PeerId, msg: WireMessage) -> MessageOutcome {
        let outcome = match msg {
            WireMessage::Contribution(msg) => self.dkg_manager.handle_contribution(msg),
            WireMessage::Complaint(msg) => self.dkg_manager.handle_complaint(msg),
            WireMessage::Justification(msg) => self.dkg_manager.handle_justification(msg),
            WireMessage::PrematureCommitment(msg) => {
                self.dkg_manager.handle_premature_commitment(msg)
            }
            WireMessage::SigShare(msg) => self.share_manager.handle_sig_share(peer, msg),
            WireMessage::RecoveredSig(msg) => self.signing.process_recovered_sig(msg),
            WireMessage::IsLock(msg) => self.instantsend.process_islock_message(peer, msg),
        };
        if let Some(score) = outcome.ban_score() {
            self.network.misbehaving(peer, score);
        }
        outcome
    }
}
