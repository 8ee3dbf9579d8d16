//! The long-living masternode quorum parameter registry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encode::{Decodable, Encodable, EncodeError};

/// Identifies one quorum type on the wire and in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LlmqType {
    Llmq50_60 = 1,
    Llmq400_60 = 2,
    Llmq400_85 = 3,
    Llmq100_67 = 4,
    /// The rotated InstantSend quorum.
    Llmq60_75 = 5,
    LlmqTest = 100,
    LlmqTestDip24 = 102,
}

#[derive(Error, Debug)]
#[error("unknown LLMQ type {0}")]
pub struct UnknownLlmqType(pub u8);

impl LlmqType {
    pub fn from_u8(v: u8) -> Result<Self, UnknownLlmqType> {
        match v {
            1 => Ok(LlmqType::Llmq50_60),
            2 => Ok(LlmqType::Llmq400_60),
            3 => Ok(LlmqType::Llmq400_85),
            4 => Ok(LlmqType::Llmq100_67),
            5 => Ok(LlmqType::Llmq60_75),
            100 => Ok(LlmqType::LlmqTest),
            102 => Ok(LlmqType::LlmqTestDip24),
            other => Err(UnknownLlmqType(other)),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL_LLMQ_PARAMS
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.llmq_type)
    }
}

impl Encodable for LlmqType {
    fn consensus_encode<W: std::io::Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        (*self as u8).consensus_encode(w)
    }
}

impl Decodable for LlmqType {
    fn consensus_decode<R: std::io::Read>(r: &mut R) -> Result<Self, EncodeError> {
        let v = u8::consensus_decode(r)?;
        LlmqType::from_u8(v).map_err(|e| EncodeError::InvalidPayload(e.to_string()))
    }
}

/// Fixed parameters of one quorum type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmqParams {
    pub llmq_type: LlmqType,
    pub name: &'static str,
    /// Member count. Divisible by 4 when `rotation` is set.
    pub size: usize,
    /// Minimum valid members for a commitment and minimum shares for
    /// a recovered signature.
    pub threshold: usize,
    /// Blocks between new quorums of this type (the DKG window, and
    /// for rotated types the cycle length).
    pub dkg_interval: u64,
    /// Blocks each DKG phase lasts.
    pub dkg_phase_blocks: u64,
    /// How many recent quorums of this type stay signing-active.
    pub signing_active_quorum_count: usize,
    /// How many retired quorums keep their connections alive.
    pub keep_old_connections: usize,
    /// Quarter rotation (DIP24-style member reuse).
    pub rotation: bool,
    /// Every member connects to every other member.
    pub all_members_connected: bool,
    /// First block height at which this type may form quorums. The
    /// gate is evaluated at the anchor's parent block.
    pub activation_height: u64,
}

impl LlmqParams {
    pub fn quarter_size(&self) -> usize {
        self.size / 4
    }
}

pub static ALL_LLMQ_PARAMS: &[LlmqParams] = &[
    LlmqParams {
        llmq_type: LlmqType::Llmq50_60,
        name: "llmq_50_60",
        size: 50,
        threshold: 30,
        dkg_interval: 24,
        dkg_phase_blocks: 2,
        signing_active_quorum_count: 24,
        keep_old_connections: 25,
        rotation: false,
        all_members_connected: false,
        activation_height: 0,
    },
    LlmqParams {
        llmq_type: LlmqType::Llmq400_60,
        name: "llmq_400_60",
        size: 400,
        threshold: 240,
        dkg_interval: 288,
        dkg_phase_blocks: 4,
        signing_active_quorum_count: 4,
        keep_old_connections: 5,
        rotation: false,
        all_members_connected: false,
        activation_height: 0,
    },
    LlmqParams {
        llmq_type: LlmqType::Llmq400_85,
        name: "llmq_400_85",
        size: 400,
        threshold: 340,
        dkg_interval: 576,
        dkg_phase_blocks: 4,
        signing_active_quorum_count: 4,
        keep_old_connections: 5,
        rotation: false,
        all_members_connected: false,
        activation_height: 0,
    },
    LlmqParams {
        llmq_type: LlmqType::Llmq100_67,
        name: "llmq_100_67",
        size: 100,
        threshold: 67,
        dkg_interval: 24,
        dkg_phase_blocks: 2,
        signing_active_quorum_count: 24,
        keep_old_connections: 25,
        rotation: false,
        all_members_connected: true,
        activation_height: 0,
    },
    LlmqParams {
        llmq_type: LlmqType::Llmq60_75,
        name: "llmq_60_75",
        size: 60,
        threshold: 45,
        dkg_interval: 288,
        dkg_phase_blocks: 2,
        signing_active_quorum_count: 32,
        keep_old_connections: 33,
        rotation: true,
        all_members_connected: true,
        activation_height: 0,
    },
    LlmqParams {
        llmq_type: LlmqType::LlmqTest,
        name: "llmq_test",
        size: 10,
        threshold: 6,
        dkg_interval: 24,
        dkg_phase_blocks: 2,
        signing_active_quorum_count: 2,
        keep_old_connections: 3,
        rotation: false,
        all_members_connected: true,
        activation_height: 0,
    },
    LlmqParams {
        llmq_type: LlmqType::LlmqTestDip24,
        name: "llmq_test_dip24",
        size: 8,
        threshold: 6,
        dkg_interval: 24,
        dkg_phase_blocks: 2,
        signing_active_quorum_count: 2,
        keep_old_connections: 3,
        rotation: true,
        all_members_connected: true,
        activation_height: 0,
    },
];

/// Look up the registry entry for a type.
pub fn llmq_params(llmq_type: LlmqType) -> &'static LlmqParams {
    ALL_LLMQ_PARAMS
        .iter()
        .find(|p| p.llmq_type == llmq_type)
        .expect("every LlmqType has a registry entry")
}
