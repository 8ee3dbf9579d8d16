//! Quarter rotation over a 120-masternode list: snapshot round-trips
//! and the cycle-by-cycle composition of the rotated member set.

mod common;

use common::*;

use std::collections::BTreeSet;
use std::sync::Arc;

use ferrite_llmq::db::LlmqDb;
use ferrite_llmq::snapshots::SnapshotManager;
use ferrite_llmq::utils;
use ferrite_shared_types::encode::{deserialize, serialize};
use ferrite_shared_types::masternode::MasternodeList;
use ferrite_shared_types::params::{LlmqParams, LlmqType};
use ferrite_shared_types::snapshot::{QuorumSnapshot, SnapshotSkipMode};
use ferrite_shared_types::Hash;

fn rotated_params() -> LlmqParams {
    LlmqParams {
        llmq_type: LlmqType::LlmqTestDip24,
        name: "llmq_test_dip24",
        size: 80,
        threshold: 60,
        dkg_interval: 24,
        dkg_phase_blocks: 2,
        signing_active_quorum_count: 2,
        keep_old_connections: 3,
        rotation: true,
        all_members_connected: true,
        activation_height: 0,
    }
}

fn list_of(count: usize) -> MasternodeList {
    let nodes = spawn_masternodes(count);
    masternode_list(&nodes)
}

#[test]
fn built_quarter_matches_snapshot_rebuild() {
    let params = rotated_params();
    let list = list_of(120);
    let modifier = utils::selection_modifier(params.llmq_type, &[0x42; 32]);
    // three earlier quarters consumed 30 masternodes
    let used: BTreeSet<Hash> =
        list.entries().iter().take(30).map(|e| e.pro_tx_hash).collect();

    let (quarter, snapshot) = utils::build_new_quarter(&params, &list, &modifier, &used);
    assert_eq!(quarter.len(), 20);
    assert!(quarter.iter().all(|m| !used.contains(&m.pro_tx_hash)));
    assert_eq!(snapshot.skip_list_mode, SnapshotSkipMode::SkipEntries);
    assert_eq!(snapshot.active_quorum_members.len(), 120);
    assert_eq!(
        snapshot.active_quorum_members.iter().filter(|b| **b).count(),
        30
    );

    // the snapshot reproduces the quarter bit-exactly, also after a
    // wire round-trip
    let rebuilt = utils::quarter_members_by_snapshot(&params, &list, &modifier, &snapshot);
    assert_eq!(rebuilt, quarter);
    let decoded: QuorumSnapshot = deserialize(&serialize(&snapshot)).unwrap();
    assert_eq!(decoded, snapshot);
    let rebuilt2 = utils::quarter_members_by_snapshot(&params, &list, &modifier, &decoded);
    assert_eq!(rebuilt2, quarter);
}

/// Applying a mode-1 skip list `[7, 4, 3]` removes the combined-list
/// entries at indices 7, 7+4 and 7+3.
#[test]
fn skip_list_deltas_apply_from_first_entry() {
    let params = rotated_params();
    let list = list_of(120);
    let modifier = utils::selection_modifier(params.llmq_type, &[0x42; 32]);

    let snapshot = QuorumSnapshot {
        active_quorum_members: vec![false; 120],
        skip_list_mode: SnapshotSkipMode::SkipEntries,
        skip_list: vec![7, 4, 3],
    };
    let quarter = utils::quarter_members_by_snapshot(&params, &list, &modifier, &snapshot);
    assert_eq!(quarter.len(), 20);

    // expected: the score-sorted list minus indices {7, 10, 11}
    let mut scored: Vec<(Hash, Hash)> = list
        .valid_entries()
        .map(|e| (utils::member_score(&modifier, &e.pro_tx_hash), e.pro_tx_hash))
        .collect();
    scored.sort();
    let expected: Vec<Hash> = scored
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 7 && *i != 10 && *i != 11)
        .take(20)
        .map(|(_, (_, protx))| *protx)
        .collect();
    let got: Vec<Hash> = quarter.iter().map(|m| m.pro_tx_hash).collect();
    assert_eq!(got, expected);
}

#[test]
fn rotated_member_set_fills_quarter_by_quarter() {
    let params = rotated_params();
    let nodes = spawn_masternodes(120);
    let list = masternode_list(&nodes);
    let chain = MockChain::with_height(200);
    let mn_source = FixedMnSource::new(list);

    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(LlmqDb::open(dir.path()).unwrap());
    let snapshots = SnapshotManager::new(db);

    // cycle anchors every 24 blocks; with no history the first set is
    // a single fresh quarter, growing by one quarter per cycle
    let mut seen_sizes = Vec::new();
    for cycle in 0..5u64 {
        let anchor = block_at(24 + cycle * 24);
        let members = utils::rotated_quorum_members(
            &params,
            chain.as_ref(),
            mn_source.as_ref(),
            &snapshots,
            &anchor,
        )
        .unwrap();
        // all quarters stay disjoint
        let unique: BTreeSet<Hash> = members.iter().map(|m| m.pro_tx_hash).collect();
        assert_eq!(unique.len(), members.len());
        seen_sizes.push(members.len());
    }
    assert_eq!(seen_sizes, vec![20, 40, 60, 80, 80]);
}
