//! The DKG session manager driven through chain-tip updates: one
//! context plays a real member while the other nine members are
//! simulated sessions wired up through the message handlers.

mod common;

use common::*;

use std::sync::Arc;

use ferrite_llmq::chain::{
    ChainView, CommitmentSink, MasternodeListSource, MempoolView, NetworkBridge,
};
use ferrite_llmq::config::LlmqConfig;
use ferrite_llmq::context::LlmqContext;
use ferrite_llmq::dkg::DkgSession;
use ferrite_llmq::utils;
use ferrite_shared_types::messages::WireMessage;
use ferrite_shared_types::params::{llmq_params, LlmqType};

const LLMQ: LlmqType = LlmqType::LlmqTest;

#[test]
fn manager_runs_dkg_across_phase_windows() {
    let params = llmq_params(LLMQ).clone();
    let nodes = spawn_masternodes(10);
    let list = masternode_list(&nodes);
    let chain = MockChain::with_height(48);
    let mempool = MockMempool::new();
    let network = MockNetwork::new();
    let mn_source = FixedMnSource::new(list);
    let sink = CollectingSink::new();
    let anchor = block_at(48);

    let members = utils::quorum_members(&params, chain.as_ref(), mn_source.as_ref(), &anchor);
    assert_eq!(members.len(), 10);
    // the context impersonates the quorum's first member
    let me = nodes
        .iter()
        .find(|n| n.entry.pro_tx_hash == members[0].pro_tx_hash)
        .unwrap()
        .identity
        .clone();

    let config = LlmqConfig {
        enabled_types: vec![LLMQ],
        instant_send_type: LLMQ,
        instant_send_enabled: true,
        required_confirmations: 6,
        watch_quorums: false,
        data_recovery: false,
        qvvec_sync: Default::default(),
    };
    let dir = tempfile::tempdir().unwrap();
    let chain_dyn: Arc<dyn ChainView> = chain.clone();
    let mempool_dyn: Arc<dyn MempoolView> = mempool;
    let mn_dyn: Arc<dyn MasternodeListSource> = mn_source;
    let net_dyn: Arc<dyn NetworkBridge> = network.clone();
    let sink_dyn: Arc<dyn CommitmentSink> = sink.clone();
    let ctx =
        LlmqContext::new(config, chain_dyn, mempool_dyn, mn_dyn, net_dyn, sink_dyn, Some(me), dir.path())
            .unwrap();

    // the other nine members run plain sessions beside the context
    let mut others: Vec<DkgSession> = members[1..]
        .iter()
        .map(|member| {
            let node = nodes.iter().find(|n| n.entry.pro_tx_hash == member.pro_tx_hash).unwrap();
            DkgSession::new(params.clone(), &anchor, 0, members.clone(), Some(node.identity.clone()))
        })
        .collect();

    let drain_broadcasts = || {
        let mut broadcasts = network.broadcasts.lock().unwrap();
        std::mem::take(&mut *broadcasts)
    };

    // window start: the session initializes
    ctx.updated_block_tip(block_at(48));

    // contribute phase: cross-deliver contributions both ways
    chain.set_tip(50);
    ctx.updated_block_tip(block_at(50));
    let our_msgs = drain_broadcasts();
    assert!(our_msgs
        .iter()
        .any(|m| matches!(m, WireMessage::Contribution(_))));
    for msg in &our_msgs {
        if let WireMessage::Contribution(c) = msg {
            for session in others.iter_mut() {
                session.receive_contribution(c.clone());
            }
        }
    }
    let their_contributions: Vec<_> =
        others.iter_mut().map(|s| s.contribute().unwrap()).collect();
    for contribution in &their_contributions {
        for session in others.iter_mut() {
            session.receive_contribution(contribution.clone());
        }
        assert!(ctx
            .handle_message(5, WireMessage::Contribution(contribution.clone()))
            .accepted());
    }

    // complain phase: a clean run complains about nobody
    chain.set_tip(52);
    ctx.updated_block_tip(block_at(52));
    for session in others.iter_mut() {
        assert!(session.verify_and_complain().is_none());
    }

    // justify phase: nothing to answer
    chain.set_tip(54);
    ctx.updated_block_tip(block_at(54));

    // commit phase: cross-deliver premature commitments
    chain.set_tip(56);
    ctx.updated_block_tip(block_at(56));
    let our_msgs = drain_broadcasts();
    for msg in &our_msgs {
        if let WireMessage::PrematureCommitment(pc) = msg {
            for session in others.iter_mut() {
                session.receive_premature_commitment(pc.clone());
            }
        }
    }
    let their_commitments: Vec<_> =
        others.iter_mut().map(|s| s.verify_and_commit().unwrap()).collect();
    for pc in &their_commitments {
        assert!(ctx
            .handle_message(5, WireMessage::PrematureCommitment(pc.clone()))
            .accepted());
    }

    // finalize: the manager hands the aggregate to the block producer
    chain.set_tip(58);
    ctx.updated_block_tip(block_at(58));
    let mined = {
        let commitments = sink.commitments.lock().unwrap();
        assert_eq!(commitments.len(), 1);
        commitments[0].clone()
    };
    assert_eq!(mined.quorum_hash, anchor.hash);
    assert_eq!(mined.count_valid_members(), 10);
    assert!(mined.count_signers() >= params.threshold);
    assert!(mined.quorum_public_key.verify(&mined.quorum_sig, mined.commitment_hash(false)));

    // mining it back materializes the quorum, with the share the
    // manager persisted during the commit phase
    chain.set_tip(60);
    ctx.process_mined_commitment(mined, block_at(59)).unwrap();
    let quorum = ctx.quorum_manager.get_quorum(LLMQ, &anchor.hash).expect("quorum materialized");
    assert!(quorum.own_secret_share.is_some());
    assert!(quorum.verification_vector.is_some());
    assert_eq!(quorum.members.len(), 10);

    // a message for a rotated-out anchor scores as stale
    let stale = {
        let mut c = their_contributions[0].clone();
        c.quorum_hash = [0xde; 32];
        c
    };
    let outcome = ctx.handle_message(6, WireMessage::Contribution(stale));
    assert_eq!(outcome.ban_score(), Some(ferrite_llmq::error::MISBEHAVE_STALE));

    ctx.stop();
}
