//! Persisted quorum snapshots for the quarter-rotation selector.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::encode::{
    read_dyn_bitset, DynBitSet, Decodable, Encodable, EncodeError,
};

/// How the skip list of a snapshot is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SnapshotSkipMode {
    /// Take the first `size / 4` of the sorted combined list.
    NoSkipping = 0,
    /// The skip list enumerates entries to remove before taking.
    SkipEntries = 1,
    /// The skip list enumerates entries to keep; drop everything else.
    KeepEntries = 2,
    /// Degenerate: the quarter is empty.
    AllSkipped = 3,
}

impl SnapshotSkipMode {
    pub fn from_u32(v: u32) -> Result<Self, EncodeError> {
        match v {
            0 => Ok(SnapshotSkipMode::NoSkipping),
            1 => Ok(SnapshotSkipMode::SkipEntries),
            2 => Ok(SnapshotSkipMode::KeepEntries),
            3 => Ok(SnapshotSkipMode::AllSkipped),
            other => Err(EncodeError::InvalidPayload(format!(
                "unknown skip mode {}",
                other
            ))),
        }
    }
}

/// Which masternodes the active quorums used at a cycle boundary,
/// plus the skip list that reconstructs the fresh quarter.
///
/// The bitset has one bit per entry of the masternode list at the
/// cycle anchor, in the list's canonical order. Skip-list deltas are
/// relative to the first (absolute) entry: entry `k > 0` encodes
/// `index_k − index_0` and is applied as `index_0 + delta` on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumSnapshot {
    pub active_quorum_members: Vec<bool>,
    pub skip_list_mode: SnapshotSkipMode,
    pub skip_list: Vec<u32>,
}

impl Encodable for QuorumSnapshot {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = (self.skip_list_mode as u32).consensus_encode(w)?;
        len += DynBitSet(&self.active_quorum_members).consensus_encode(w)?;
        len += self.skip_list.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for QuorumSnapshot {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        let mode = SnapshotSkipMode::from_u32(u32::consensus_decode(r)?)?;
        let active_quorum_members = read_dyn_bitset(r)?;
        let skip_list = Vec::<u32>::consensus_decode(r)?;
        Ok(QuorumSnapshot {
            active_quorum_members,
            skip_list_mode: mode,
            skip_list,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{deserialize, serialize};

    #[test]
    fn snapshot_roundtrip() {
        let snapshot = QuorumSnapshot {
            active_quorum_members: vec![true, false, true, true, false, true, false],
            skip_list_mode: SnapshotSkipMode::SkipEntries,
            skip_list: vec![7, 4, 3],
        };
        let bytes = serialize(&snapshot);
        assert_eq!(deserialize::<QuorumSnapshot>(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn snapshot_rejects_unknown_mode() {
        let snapshot = QuorumSnapshot {
            active_quorum_members: vec![true],
            skip_list_mode: SnapshotSkipMode::AllSkipped,
            skip_list: vec![],
        };
        let mut bytes = serialize(&snapshot);
        bytes[0] = 9;
        assert!(deserialize::<QuorumSnapshot>(&bytes).is_err());
    }
}
