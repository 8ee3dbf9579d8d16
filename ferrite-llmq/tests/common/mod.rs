//! Shared mock harness for integration tests: an in-memory chain,
//! mempool, network bridge and masternode list, plus a helper that
//! runs a complete DKG for the test quorum type.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use threshold_crypto::SecretKey;

use ferrite_crypto::bls::{fr_from_bytes, secret_key_share_from_fr};
use ferrite_llmq::chain::{
    BlockInfo, ChainView, CommitmentSink, Inv, LocalIdentity, MasternodeListSource, MempoolView,
    NetworkBridge, PeerId,
};
use ferrite_llmq::dkg::DkgSession;
use ferrite_llmq::utils;
use ferrite_shared_types::encode::double_sha256;
use ferrite_shared_types::masternode::{MasternodeEntry, MasternodeList};
use ferrite_shared_types::messages::{
    build_sign_hash, FinalCommitment, SigShareMessage, WireMessage,
};
use ferrite_shared_types::params::{llmq_params, LlmqType};
use ferrite_shared_types::{Hash, OutPoint, Transaction, TxInput, TxOutput};

pub fn block_hash_at(height: u64) -> Hash {
    let mut data = b"block".to_vec();
    data.extend_from_slice(&height.to_le_bytes());
    double_sha256(&data)
}

pub fn block_at(height: u64) -> BlockInfo {
    BlockInfo {
        hash: block_hash_at(height),
        prev_hash: if height == 0 { ferrite_shared_types::NULL_HASH } else { block_hash_at(height - 1) },
        height,
    }
}

struct ChainData {
    tip_height: u64,
    block_txids: HashMap<Hash, Vec<Hash>>,
    txs: HashMap<Hash, (Transaction, Option<u64>)>,
    utxos: HashMap<OutPoint, u64>,
}

pub struct MockChain {
    data: Mutex<ChainData>,
    synced: AtomicBool,
}

impl MockChain {
    pub fn with_height(tip_height: u64) -> Arc<Self> {
        Arc::new(MockChain {
            data: Mutex::new(ChainData {
                tip_height,
                block_txids: HashMap::new(),
                txs: HashMap::new(),
                utxos: HashMap::new(),
            }),
            synced: AtomicBool::new(true),
        })
    }

    pub fn add_tx(&self, tx: Transaction, mined_height: Option<u64>) {
        let txid = tx.txid();
        let mut data = self.data.lock().unwrap();
        if let Some(height) = mined_height {
            data.block_txids.entry(block_hash_at(height)).or_default().push(txid);
        }
        data.txs.insert(txid, (tx, mined_height));
    }

    pub fn add_utxo(&self, outpoint: OutPoint, mined_height: u64) {
        self.data.lock().unwrap().utxos.insert(outpoint, mined_height);
    }

    pub fn set_tip(&self, height: u64) {
        self.data.lock().unwrap().tip_height = height;
    }

    /// Record `txid` as mined in the block at `height`.
    pub fn mine_tx(&self, txid: &Hash, height: u64) {
        let mut data = self.data.lock().unwrap();
        data.block_txids.entry(block_hash_at(height)).or_default().push(*txid);
        if let Some((_, mined)) = data.txs.get_mut(txid) {
            *mined = Some(height);
        }
    }
}

impl ChainView for MockChain {
    fn tip(&self) -> Option<BlockInfo> {
        Some(block_at(self.data.lock().unwrap().tip_height))
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn block_at_height(&self, height: u64) -> Option<BlockInfo> {
        if height > self.data.lock().unwrap().tip_height {
            return None;
        }
        Some(block_at(height))
    }

    fn block_by_hash(&self, hash: &Hash) -> Option<BlockInfo> {
        let tip = self.data.lock().unwrap().tip_height;
        (0..=tip).map(block_at).find(|b| b.hash == *hash)
    }

    fn block_txids(&self, block_hash: &Hash) -> Vec<Hash> {
        self.data
            .lock()
            .unwrap()
            .block_txids
            .get(block_hash)
            .cloned()
            .unwrap_or_default()
    }

    fn get_transaction(&self, txid: &Hash) -> Option<(Transaction, Option<BlockInfo>)> {
        let data = self.data.lock().unwrap();
        let (tx, mined) = data.txs.get(txid)?.clone();
        Some((tx, mined.map(block_at)))
    }

    fn utxo_mined_height(&self, outpoint: &OutPoint) -> Option<u64> {
        self.data.lock().unwrap().utxos.get(outpoint).copied()
    }
}

#[derive(Default)]
pub struct MockMempool {
    txs: Mutex<HashMap<Hash, Transaction>>,
}

impl MockMempool {
    pub fn new() -> Arc<Self> {
        Arc::new(MockMempool::default())
    }

    pub fn add(&self, tx: Transaction) {
        self.txs.lock().unwrap().insert(tx.txid(), tx);
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.txs.lock().unwrap().contains_key(txid)
    }
}

impl MempoolView for MockMempool {
    fn get(&self, txid: &Hash) -> Option<Transaction> {
        self.txs.lock().unwrap().get(txid).cloned()
    }

    fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash> {
        let txs = self.txs.lock().unwrap();
        txs.values()
            .find(|tx| tx.inputs.iter().any(|i| i.prevout == *outpoint))
            .map(|tx| tx.txid())
    }

    fn children_of(&self, txid: &Hash) -> Vec<Transaction> {
        let txs = self.txs.lock().unwrap();
        txs.values()
            .filter(|tx| tx.inputs.iter().any(|i| i.prevout.txid == *txid))
            .cloned()
            .collect()
    }

    fn all(&self) -> Vec<Transaction> {
        self.txs.lock().unwrap().values().cloned().collect()
    }

    fn remove_recursive(&self, txid: &Hash) {
        let mut txs = self.txs.lock().unwrap();
        let mut to_remove = vec![*txid];
        while let Some(victim) = to_remove.pop() {
            txs.remove(&victim);
            let children: Vec<Hash> = txs
                .values()
                .filter(|tx| tx.inputs.iter().any(|i| i.prevout.txid == victim))
                .map(|tx| tx.txid())
                .collect();
            to_remove.extend(children);
        }
    }
}

#[derive(Default)]
pub struct MockNetwork {
    pub broadcasts: Mutex<Vec<WireMessage>>,
    pub invs: Mutex<Vec<Inv>>,
    pub misbehaving: Mutex<Vec<(PeerId, u32)>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(MockNetwork::default())
    }

    pub fn inv_count(&self, inv: &Inv) -> usize {
        self.invs.lock().unwrap().iter().filter(|i| *i == inv).count()
    }
}

impl NetworkBridge for MockNetwork {
    fn broadcast(&self, msg: WireMessage) {
        self.broadcasts.lock().unwrap().push(msg);
    }

    fn relay_to_quorum(&self, _llmq_type: LlmqType, _quorum_hash: &Hash, msg: WireMessage) {
        self.broadcasts.lock().unwrap().push(msg);
    }

    fn relay_inv(&self, inv: Inv) {
        self.invs.lock().unwrap().push(inv);
    }

    fn misbehaving(&self, peer: PeerId, score: u32) {
        self.misbehaving.lock().unwrap().push((peer, score));
    }

    fn set_quorum_connections(&self, _: LlmqType, _: &Hash, _: BTreeSet<Hash>) {}

    fn request_quorum_data(&self, _: LlmqType, _: &Hash) {}
}

pub struct FixedMnSource {
    list: MasternodeList,
}

impl FixedMnSource {
    pub fn new(list: MasternodeList) -> Arc<Self> {
        Arc::new(FixedMnSource { list })
    }
}

impl MasternodeListSource for FixedMnSource {
    fn list_at(&self, _block_hash: &Hash) -> Option<MasternodeList> {
        Some(self.list.clone())
    }
}

#[derive(Default)]
pub struct CollectingSink {
    pub commitments: Mutex<Vec<FinalCommitment>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(CollectingSink::default())
    }
}

impl CommitmentSink for CollectingSink {
    fn submit_commitment(&self, commitment: FinalCommitment) {
        self.commitments.lock().unwrap().push(commitment);
    }
}

/// One simulated masternode with its operator key.
pub struct TestMasternode {
    pub identity: LocalIdentity,
    pub entry: MasternodeEntry,
}

pub fn spawn_masternodes(count: usize) -> Vec<TestMasternode> {
    (0..count)
        .map(|i| {
            let key = SecretKey::random();
            let pro_tx_hash = double_sha256(format!("masternode {}", i).as_bytes());
            TestMasternode {
                identity: LocalIdentity::new(pro_tx_hash, key.clone()),
                entry: MasternodeEntry {
                    pro_tx_hash,
                    operator_pubkey: key.public_key(),
                    address: format!("10.2.0.{}:9999", i + 1).parse().unwrap(),
                    valid: true,
                },
            }
        })
        .collect()
}

pub fn masternode_list(nodes: &[TestMasternode]) -> MasternodeList {
    MasternodeList::new(
        block_hash_at(0),
        0,
        nodes.iter().map(|n| n.entry.clone()).collect(),
    )
}

/// Run the complete four-phase DKG of the `llmq_test` quorum anchored
/// at `anchor`, returning the final commitment and every member's
/// session (holding its share of the quorum secret).
pub fn run_full_dkg(
    llmq_type: LlmqType,
    anchor: &BlockInfo,
    nodes: &[TestMasternode],
    chain: &MockChain,
    mn_source: &FixedMnSource,
) -> (FinalCommitment, Vec<DkgSession>) {
    let params = llmq_params(llmq_type);
    let members = utils::quorum_members(params, chain, mn_source, anchor);
    assert_eq!(members.len(), params.size, "masternode population too small");

    let mut sessions: Vec<DkgSession> = members
        .iter()
        .map(|member| {
            let node = nodes
                .iter()
                .find(|n| n.entry.pro_tx_hash == member.pro_tx_hash)
                .expect("member is one of the spawned masternodes");
            DkgSession::new(params.clone(), anchor, 0, members.clone(), Some(node.identity.clone()))
        })
        .collect();

    let contributions: Vec<_> = sessions.iter_mut().map(|s| s.contribute().unwrap()).collect();
    for contribution in &contributions {
        for session in sessions.iter_mut() {
            session.receive_contribution(contribution.clone());
        }
    }
    let complaints: Vec<_> =
        sessions.iter_mut().filter_map(|s| s.verify_and_complain()).collect();
    for complaint in &complaints {
        for session in sessions.iter_mut() {
            session.receive_complaint(complaint.clone());
        }
    }
    let justifications: Vec<_> =
        sessions.iter_mut().filter_map(|s| s.verify_and_justify()).collect();
    for justification in &justifications {
        for session in sessions.iter_mut() {
            session.receive_justification(justification.clone());
        }
    }
    let commitments: Vec<_> = sessions.iter_mut().filter_map(|s| s.verify_and_commit()).collect();
    for commitment in &commitments {
        for session in sessions.iter_mut() {
            session.receive_premature_commitment(commitment.clone());
        }
    }
    let finals = sessions[0].finalize_commitments();
    assert_eq!(finals.len(), 1, "DKG should finalize exactly one commitment");
    (finals.into_iter().next().unwrap(), sessions)
}

/// Build the signature share of one DKG participant for a signing
/// request, as it would arrive over the wire.
pub fn share_from_session(
    session: &DkgSession,
    llmq_type: LlmqType,
    quorum_hash: &Hash,
    id: &Hash,
    msg_hash: &Hash,
) -> SigShareMessage {
    let fr = fr_from_bytes(&session.own_share_bytes().expect("member has a share")).unwrap();
    let share = secret_key_share_from_fr(&fr)
        .sign(build_sign_hash(llmq_type, quorum_hash, id, msg_hash));
    SigShareMessage {
        llmq_type,
        quorum_hash: *quorum_hash,
        signer_index: session.my_index().unwrap() as u16,
        id: *id,
        msg_hash: *msg_hash,
        share,
    }
}

/// Simple transaction spending the given outpoints.
pub fn spend_tx(outpoints: &[OutPoint], salt: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: outpoints
            .iter()
            .map(|o| TxInput { prevout: *o, script_sig: vec![salt], sequence: 0xffff_ffff })
            .collect(),
        outputs: vec![TxOutput { value: 5000, script_pubkey: vec![0x51] }],
        lock_time: 0,
    }
}

/// Poll until `predicate` holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
