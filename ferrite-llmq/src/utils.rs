//! Deterministic quorum member selection and connection layout.

use std::collections::BTreeSet;

use ferrite_shared_types::encode::{Encodable, HashWriter};
use ferrite_shared_types::masternode::{MasternodeEntry, MasternodeList};
use ferrite_shared_types::params::{LlmqParams, LlmqType};
use ferrite_shared_types::snapshot::{QuorumSnapshot, SnapshotSkipMode};
use ferrite_shared_types::Hash;

use crate::chain::{BlockInfo, ChainView, MasternodeListSource};
use crate::error::Result;
use crate::snapshots::SnapshotManager;

/// `modifier = H(llmqType || anchorBlockHash)`.
pub fn selection_modifier(llmq_type: LlmqType, block_hash: &Hash) -> Hash {
    let mut hw = HashWriter::new();
    llmq_type.consensus_encode(&mut hw).expect("hash writer");
    block_hash.consensus_encode(&mut hw).expect("hash writer");
    hw.finalize()
}

/// `H(modifier || proTxHash)`, the per-masternode ranking score.
pub fn member_score(modifier: &Hash, pro_tx_hash: &Hash) -> Hash {
    let mut hw = HashWriter::new();
    modifier.consensus_encode(&mut hw).expect("hash writer");
    pro_tx_hash.consensus_encode(&mut hw).expect("hash writer");
    hw.finalize()
}

/// Rank the valid masternodes by score ascending and take the first
/// `count`.
pub fn calculate_quorum(list: &MasternodeList, modifier: &Hash, count: usize) -> Vec<MasternodeEntry> {
    let mut scored: Vec<(Hash, &MasternodeEntry)> = list
        .valid_entries()
        .map(|e| (member_score(modifier, &e.pro_tx_hash), e))
        .collect();
    scored.sort_by(|a, b| a.0.cmp(&b.0));
    scored.into_iter().take(count).map(|(_, e)| e.clone()).collect()
}

/// Whether this type may form a quorum anchored right after `parent`.
/// The gate is evaluated at the anchor's parent block; a type with
/// activation height `h` first anchors at `h + 1`.
pub fn is_quorum_type_enabled(params: &LlmqParams, parent: &BlockInfo) -> bool {
    parent.height >= params.activation_height
}

fn enabled_at_anchor(params: &LlmqParams, chain: &dyn ChainView, anchor: &BlockInfo) -> bool {
    match chain.block_by_hash(&anchor.prev_hash) {
        Some(parent) => is_quorum_type_enabled(params, &parent),
        None => params.activation_height == 0,
    }
}

/// Member set of a non-rotated quorum at `anchor`. Empty when the
/// type is not yet enabled or no list is available.
pub fn quorum_members(
    params: &LlmqParams,
    chain: &dyn ChainView,
    mn_source: &dyn MasternodeListSource,
    anchor: &BlockInfo,
) -> Vec<MasternodeEntry> {
    if !enabled_at_anchor(params, chain, anchor) {
        return Vec::new();
    }
    let list = match mn_source.list_at(&anchor.hash) {
        Some(list) => list,
        None => return Vec::new(),
    };
    let modifier = selection_modifier(params.llmq_type, &anchor.hash);
    calculate_quorum(&list, &modifier, params.size)
}

/// The combined sorted list the quarter logic indexes into: the
/// not-yet-used masternodes first, then the used ones, each sorted by
/// score ascending.
fn combined_sorted_list<'a>(
    list: &'a MasternodeList,
    modifier: &Hash,
    used: &BTreeSet<Hash>,
) -> Vec<&'a MasternodeEntry> {
    let mut not_used: Vec<(Hash, &MasternodeEntry)> = Vec::new();
    let mut used_sorted: Vec<(Hash, &MasternodeEntry)> = Vec::new();
    for entry in list.valid_entries() {
        let score = member_score(modifier, &entry.pro_tx_hash);
        if used.contains(&entry.pro_tx_hash) {
            used_sorted.push((score, entry));
        } else {
            not_used.push((score, entry));
        }
    }
    not_used.sort_by(|a, b| a.0.cmp(&b.0));
    used_sorted.sort_by(|a, b| a.0.cmp(&b.0));
    not_used.into_iter().chain(used_sorted).map(|(_, e)| e).collect()
}

/// Resolve a skip list back into absolute indices: the first entry is
/// absolute, every later one is a delta from the first.
fn skip_list_indices(skip_list: &[u32]) -> BTreeSet<usize> {
    let mut indices = BTreeSet::new();
    let mut first = None;
    for &entry in skip_list {
        match first {
            None => {
                first = Some(entry);
                indices.insert(entry as usize);
            }
            Some(first) => {
                indices.insert((first + entry) as usize);
            }
        }
    }
    indices
}

/// Rebuild the fresh quarter of a past cycle from its snapshot.
pub fn quarter_members_by_snapshot(
    params: &LlmqParams,
    list: &MasternodeList,
    modifier: &Hash,
    snapshot: &QuorumSnapshot,
) -> Vec<MasternodeEntry> {
    if snapshot.active_quorum_members.len() != list.len() {
        return Vec::new();
    }
    let used: BTreeSet<Hash> = list
        .entries()
        .iter()
        .zip(&snapshot.active_quorum_members)
        .filter(|(_, used)| **used)
        .map(|(e, _)| e.pro_tx_hash)
        .collect();
    let combined = combined_sorted_list(list, modifier, &used);
    let quarter_size = params.quarter_size();

    match snapshot.skip_list_mode {
        SnapshotSkipMode::NoSkipping => {
            combined.iter().take(quarter_size).map(|e| (*e).clone()).collect()
        }
        SnapshotSkipMode::SkipEntries => {
            let skip = skip_list_indices(&snapshot.skip_list);
            combined
                .iter()
                .enumerate()
                .filter(|(i, _)| !skip.contains(i))
                .take(quarter_size)
                .map(|(_, e)| (*e).clone())
                .collect()
        }
        SnapshotSkipMode::KeepEntries => {
            let keep = skip_list_indices(&snapshot.skip_list);
            combined
                .iter()
                .enumerate()
                .filter(|(i, _)| keep.contains(i))
                .take(quarter_size)
                .map(|(_, e)| (*e).clone())
                .collect()
        }
        SnapshotSkipMode::AllSkipped => Vec::new(),
    }
}

/// Build the fresh quarter at a cycle anchor and the snapshot that
/// lets everyone else rebuild it. `used` holds the proTxHashes of the
/// three inherited quarters.
pub fn build_new_quarter(
    params: &LlmqParams,
    list: &MasternodeList,
    modifier: &Hash,
    used: &BTreeSet<Hash>,
) -> (Vec<MasternodeEntry>, QuorumSnapshot) {
    let active_quorum_members: Vec<bool> = list
        .entries()
        .iter()
        .map(|e| used.contains(&e.pro_tx_hash))
        .collect();
    let combined = combined_sorted_list(list, modifier, used);
    let quarter_size = params.quarter_size();
    let used_in_combined = combined.iter().filter(|e| used.contains(&e.pro_tx_hash)).count();

    let mut quarter: Vec<MasternodeEntry> = Vec::with_capacity(quarter_size);
    let mut skip_list: Vec<u32> = Vec::new();
    let mode;

    if used_in_combined == 0 {
        mode = SnapshotSkipMode::NoSkipping;
        quarter.extend(combined.iter().take(quarter_size).map(|e| (*e).clone()));
    } else if used_in_combined < combined.len() / 2 {
        // record the entries that must be skipped
        mode = SnapshotSkipMode::SkipEntries;
        let mut first: Option<u32> = None;
        for (i, entry) in combined.iter().enumerate() {
            if quarter.len() >= quarter_size {
                break;
            }
            if used.contains(&entry.pro_tx_hash) {
                match first {
                    None => {
                        first = Some(i as u32);
                        skip_list.push(i as u32);
                    }
                    Some(first) => skip_list.push(i as u32 - first),
                }
            } else {
                quarter.push((*entry).clone());
            }
        }
    } else {
        // record the entries that are kept
        mode = SnapshotSkipMode::KeepEntries;
        let mut first: Option<u32> = None;
        for (i, entry) in combined.iter().enumerate() {
            if quarter.len() >= quarter_size {
                break;
            }
            if !used.contains(&entry.pro_tx_hash) {
                match first {
                    None => {
                        first = Some(i as u32);
                        skip_list.push(i as u32);
                    }
                    Some(first) => skip_list.push(i as u32 - first),
                }
                quarter.push((*entry).clone());
            }
        }
    }

    if quarter.len() < quarter_size {
        // not enough fresh masternodes to form the quarter
        return (
            Vec::new(),
            QuorumSnapshot {
                active_quorum_members,
                skip_list_mode: SnapshotSkipMode::AllSkipped,
                skip_list: Vec::new(),
            },
        );
    }

    (
        quarter,
        QuorumSnapshot { active_quorum_members, skip_list_mode: mode, skip_list },
    )
}

/// Member set of a rotated quorum at a cycle anchor: the quarters of
/// the three previous cycles (oldest first) plus a freshly drawn one.
/// The fresh quarter's snapshot is persisted as a side effect.
pub fn rotated_quorum_members(
    params: &LlmqParams,
    chain: &dyn ChainView,
    mn_source: &dyn MasternodeListSource,
    snapshots: &SnapshotManager,
    cycle_anchor: &BlockInfo,
) -> Result<Vec<MasternodeEntry>> {
    if !enabled_at_anchor(params, chain, cycle_anchor) {
        return Ok(Vec::new());
    }
    let cycle = params.dkg_interval;

    let mut prev_quarters: Vec<Vec<MasternodeEntry>> = Vec::with_capacity(3);
    // oldest first: H-3C, H-2C, H-C
    for k in (1..=3u64).rev() {
        let quarter = match cycle_anchor.height.checked_sub(k * cycle) {
            Some(height) => match chain.block_at_height(height) {
                Some(block) => match snapshots.get(params.llmq_type, &block.hash)? {
                    Some(snapshot) => {
                        let list = mn_source.list_at(&block.hash);
                        let modifier = selection_modifier(params.llmq_type, &block.hash);
                        list.map(|l| quarter_members_by_snapshot(params, &l, &modifier, &snapshot))
                            .unwrap_or_default()
                    }
                    None => Vec::new(),
                },
                None => Vec::new(),
            },
            None => Vec::new(),
        };
        prev_quarters.push(quarter);
    }

    let list = match mn_source.list_at(&cycle_anchor.hash) {
        Some(list) => list,
        None => return Ok(Vec::new()),
    };
    let modifier = selection_modifier(params.llmq_type, &cycle_anchor.hash);
    let used: BTreeSet<Hash> = prev_quarters
        .iter()
        .flatten()
        .map(|e| e.pro_tx_hash)
        .collect();

    let (new_quarter, snapshot) = build_new_quarter(params, &list, &modifier, &used);
    snapshots.store(params.llmq_type, &cycle_anchor.hash, &snapshot)?;

    let mut members = Vec::with_capacity(params.size);
    for quarter in prev_quarters {
        members.extend(quarter);
    }
    members.extend(new_quarter);
    Ok(members)
}

/// Decide which of two masternodes initiates the connection. The
/// naive `min(a, b)` would bias toward numerically low hashes, so the
/// initiator is the side whose canonical triple hashes lower.
pub fn deterministic_outbound_connection(a: &Hash, b: &Hash) -> Hash {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let score = |candidate: &Hash| {
        let mut hw = HashWriter::new();
        lo.consensus_encode(&mut hw).expect("hash writer");
        hi.consensus_encode(&mut hw).expect("hash writer");
        candidate.consensus_encode(&mut hw).expect("hash writer");
        hw.finalize()
    };
    if score(a) < score(b) {
        *a
    } else {
        *b
    }
}

/// Ring neighbours at gaps 1, 2, 4, ... from position `i`.
fn relay_outbound_indices(i: usize, n: usize) -> BTreeSet<usize> {
    let mut result = BTreeSet::new();
    if n < 2 {
        return result;
    }
    let mut gap: usize = 1;
    let mut gap_max = n - 1;
    let mut k = 0u32;
    loop {
        gap_max >>= 1;
        if gap_max == 0 && k > 1 {
            break;
        }
        let idx = (i + gap) % n;
        gap <<= 1;
        k += 1;
        if idx != i {
            result.insert(idx);
        }
    }
    result
}

/// The DHT-like relay set for a member: its doubling-ring neighbours,
/// plus (when `only_outbound` is unset) every member that relays to
/// it.
pub fn quorum_relay_members(
    members: &[MasternodeEntry],
    for_member: &Hash,
    only_outbound: bool,
) -> BTreeSet<Hash> {
    let my_index = match members.iter().position(|m| m.pro_tx_hash == *for_member) {
        Some(i) => i,
        None => return BTreeSet::new(),
    };
    let mut result: BTreeSet<Hash> = relay_outbound_indices(my_index, members.len())
        .into_iter()
        .map(|i| members[i].pro_tx_hash)
        .collect();
    if !only_outbound {
        for (i, member) in members.iter().enumerate() {
            if i == my_index {
                continue;
            }
            let outbound = relay_outbound_indices(i, members.len());
            if outbound.contains(&my_index) {
                result.insert(member.pro_tx_hash);
            }
        }
    }
    result
}

/// The peers a member should hold connections to: everyone it
/// initiates toward in all-connected mode, the relay ring otherwise.
pub fn quorum_connections(
    params: &LlmqParams,
    members: &[MasternodeEntry],
    for_member: &Hash,
    only_outbound: bool,
) -> BTreeSet<Hash> {
    if params.all_members_connected {
        let mut result = BTreeSet::new();
        for member in members {
            if member.pro_tx_hash == *for_member {
                continue;
            }
            let initiator = deterministic_outbound_connection(for_member, &member.pro_tx_hash);
            if !only_outbound || initiator == *for_member {
                result.insert(member.pro_tx_hash);
            }
        }
        result
    } else {
        quorum_relay_members(members, for_member, only_outbound)
    }
}

/// Member indices a non-member watcher connects to, drawn from a
/// process-local seed so watch patterns differ between nodes.
pub fn calc_deterministic_watch_connections(
    seed: &Hash,
    llmq_type: LlmqType,
    quorum_hash: &Hash,
    member_count: usize,
    connection_count: usize,
) -> BTreeSet<usize> {
    let mut result = BTreeSet::new();
    if member_count == 0 {
        return result;
    }
    let mut rnd = *seed;
    for _ in 0..connection_count {
        let mut hw = HashWriter::new();
        rnd.consensus_encode(&mut hw).expect("hash writer");
        llmq_type.consensus_encode(&mut hw).expect("hash writer");
        quorum_hash.consensus_encode(&mut hw).expect("hash writer");
        rnd = hw.finalize();
        let raw = u64::from_le_bytes(rnd[0..8].try_into().expect("8 bytes"));
        result.insert((raw % member_count as u64) as usize);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_shared_types::params::{llmq_params, LlmqType};
    use hex_literal::hex;

    pub(crate) fn dummy_entry(seed: u8) -> MasternodeEntry {
        MasternodeEntry {
            pro_tx_hash: [seed; 32],
            operator_pubkey: threshold_crypto::SecretKey::random().public_key(),
            address: format!("10.0.{}.{}:9999", seed / 250, seed).parse().unwrap(),
            valid: true,
        }
    }

    fn dummy_list(seeds: &[u8]) -> MasternodeList {
        MasternodeList::new([0xee; 32], 100, seeds.iter().map(|s| dummy_entry(*s)).collect())
    }

    #[test]
    fn modifier_pins_known_vector() {
        let modifier = selection_modifier(LlmqType::Llmq50_60, &[0xee; 32]);
        assert_eq!(
            modifier,
            hex!("abd9cd0f13c4456d29733af8b466ed2ba2ba378f8df6cdfa6fdb5206af7b400a")
        );
    }

    #[test]
    fn ranking_pins_known_order() {
        // scores computed for modifier H(1 || ee*32): 2 < 4 < 3 < 1
        let list = dummy_list(&[1, 2, 3, 4]);
        let modifier = selection_modifier(LlmqType::Llmq50_60, &[0xee; 32]);
        let members = calculate_quorum(&list, &modifier, 3);
        let order: Vec<u8> = members.iter().map(|m| m.pro_tx_hash[0]).collect();
        assert_eq!(order, vec![2, 4, 3]);
    }

    #[test]
    fn selection_is_deterministic() {
        let list = dummy_list(&[5, 9, 13, 21, 34, 55]);
        let modifier = selection_modifier(LlmqType::Llmq50_60, &[0x77; 32]);
        let a = calculate_quorum(&list, &modifier, 4);
        let b = calculate_quorum(&list, &modifier, 4);
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_masternodes_are_not_selected() {
        let mut entries: Vec<MasternodeEntry> = (1..=6).map(dummy_entry).collect();
        entries[2].valid = false;
        let banned = entries[2].pro_tx_hash;
        let list = MasternodeList::new([0xee; 32], 100, entries);
        let modifier = selection_modifier(LlmqType::Llmq50_60, &[0xee; 32]);
        let members = calculate_quorum(&list, &modifier, 6);
        assert_eq!(members.len(), 5);
        assert!(members.iter().all(|m| m.pro_tx_hash != banned));
    }

    #[test]
    fn type_enabled_gate_uses_parent_block() {
        let mut params = llmq_params(LlmqType::Llmq50_60).clone();
        params.activation_height = 100;
        let parent_99 = BlockInfo { hash: [1; 32], prev_hash: [0; 32], height: 99 };
        let parent_100 = BlockInfo { hash: [2; 32], prev_hash: [1; 32], height: 100 };
        // an anchor AT the activation height is still gated off,
        // because the gate looks at its parent
        assert!(!is_quorum_type_enabled(&params, &parent_99));
        assert!(is_quorum_type_enabled(&params, &parent_100));
    }

    #[test]
    fn outbound_connection_is_symmetric_and_pinned() {
        let a = [0x01; 32];
        let b = [0x02; 32];
        assert_eq!(
            deterministic_outbound_connection(&a, &b),
            deterministic_outbound_connection(&b, &a)
        );
        // the canonical-triple hash of B is the smaller one
        assert_eq!(deterministic_outbound_connection(&a, &b), b);
    }

    #[test]
    fn relay_ring_has_doubling_gaps() {
        let outbound = relay_outbound_indices(0, 16);
        assert_eq!(outbound, BTreeSet::from([1, 2, 4]));
        let outbound = relay_outbound_indices(3, 16);
        assert_eq!(outbound, BTreeSet::from([4, 5, 7]));
        // tiny rings still reach the other member
        assert_eq!(relay_outbound_indices(0, 2), BTreeSet::from([1]));
    }

    #[test]
    fn relay_members_include_inbound() {
        let members: Vec<MasternodeEntry> = (1..=16).map(dummy_entry).collect();
        let me = members[0].pro_tx_hash;
        let outbound_only = quorum_relay_members(&members, &me, true);
        let with_inbound = quorum_relay_members(&members, &me, false);
        assert!(outbound_only.is_subset(&with_inbound));
        // members 15 (idx 14: 14+2=16%16=0) relay to index 0
        assert!(with_inbound.contains(&members[14].pro_tx_hash));
    }

    #[test]
    fn skip_list_indices_apply_first_plus_delta() {
        let skip = skip_list_indices(&[7, 4, 3]);
        assert_eq!(skip, BTreeSet::from([7, 11, 10]));
    }

    #[test]
    fn new_quarter_roundtrips_through_snapshot() {
        let params = llmq_params(LlmqType::LlmqTestDip24).clone();
        let seeds: Vec<u8> = (1..=30).collect();
        let list = dummy_list(&seeds);
        let modifier = selection_modifier(params.llmq_type, &[0x42; 32]);
        // mark ten arbitrary masternodes as used by earlier quarters
        let used: BTreeSet<Hash> = (1..=10).map(|s| [s as u8; 32]).collect();

        let (quarter, snapshot) = build_new_quarter(&params, &list, &modifier, &used);
        assert_eq!(quarter.len(), params.quarter_size());
        assert!(quarter.iter().all(|m| !used.contains(&m.pro_tx_hash)));

        let rebuilt = quarter_members_by_snapshot(&params, &list, &modifier, &snapshot);
        assert_eq!(rebuilt, quarter);
    }

    #[test]
    fn mostly_used_list_produces_keep_mode() {
        let params = llmq_params(LlmqType::LlmqTestDip24).clone();
        let seeds: Vec<u8> = (1..=12).collect();
        let list = dummy_list(&seeds);
        let modifier = selection_modifier(params.llmq_type, &[0x42; 32]);
        let used: BTreeSet<Hash> = (1..=9).map(|s| [s as u8; 32]).collect();

        let (quarter, snapshot) = build_new_quarter(&params, &list, &modifier, &used);
        assert_eq!(snapshot.skip_list_mode, SnapshotSkipMode::KeepEntries);
        let rebuilt = quarter_members_by_snapshot(&params, &list, &modifier, &snapshot);
        assert_eq!(rebuilt, quarter);
    }

    #[test]
    fn exhausted_list_produces_all_skipped() {
        let params = llmq_params(LlmqType::LlmqTestDip24).clone();
        let seeds: Vec<u8> = (1..=4).collect();
        let list = dummy_list(&seeds);
        let modifier = selection_modifier(params.llmq_type, &[0x42; 32]);
        let used: BTreeSet<Hash> = (1..=4).map(|s| [s as u8; 32]).collect();

        let (quarter, snapshot) = build_new_quarter(&params, &list, &modifier, &used);
        assert!(quarter.is_empty());
        assert_eq!(snapshot.skip_list_mode, SnapshotSkipMode::AllSkipped);
        assert!(quarter_members_by_snapshot(&params, &list, &modifier, &snapshot).is_empty());
    }

    #[test]
    fn watch_connections_stay_in_range() {
        let picked = calc_deterministic_watch_connections(&[0x11; 32], LlmqType::Llmq50_60, &[0x22; 32], 50, 3);
        assert!(!picked.is_empty());
        assert!(picked.len() <= 3);
        assert!(picked.iter().all(|i| *i < 50));
    }
}
