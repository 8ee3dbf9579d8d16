//! Runtime configuration knobs of the LLMQ subsystem.

use std::collections::BTreeMap;

use ferrite_shared_types::params::LlmqType;

use crate::error::{LlmqError, Result};

/// Per-type policy for syncing quorum verification vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QvvecSyncMode {
    Always = 0,
    OnlyIfTypeMember = 1,
}

#[derive(Debug, Clone)]
pub struct LlmqConfig {
    /// Quorum types this network runs.
    pub enabled_types: Vec<LlmqType>,
    /// The quorum type signing InstantSend requests.
    pub instant_send_type: LlmqType,
    pub instant_send_enabled: bool,
    /// Confirmations a non-ChainLocked input needs before it is
    /// lockable.
    pub required_confirmations: u64,
    /// Observe quorums we are not a member of (`watchquorums`).
    pub watch_quorums: bool,
    /// Proactively resync missing quorum verification data
    /// (`llmq-data-recovery`).
    pub data_recovery: bool,
    /// Parsed `llmq-qvvec-sync` entries.
    pub qvvec_sync: BTreeMap<LlmqType, QvvecSyncMode>,
}

impl Default for LlmqConfig {
    fn default() -> Self {
        LlmqConfig {
            enabled_types: vec![
                LlmqType::Llmq50_60,
                LlmqType::Llmq400_60,
                LlmqType::Llmq400_85,
            ],
            instant_send_type: LlmqType::Llmq50_60,
            instant_send_enabled: true,
            required_confirmations: 6,
            watch_quorums: false,
            data_recovery: true,
            qvvec_sync: BTreeMap::new(),
        }
    }
}

impl LlmqConfig {
    pub fn is_type_enabled(&self, llmq_type: LlmqType) -> bool {
        self.enabled_types.contains(&llmq_type)
    }

    /// Whether we should fetch the verification vector of a quorum we
    /// do not hold DKG state for.
    pub fn wants_qvvec_sync(&self, llmq_type: LlmqType, is_type_member: bool) -> bool {
        match self.qvvec_sync.get(&llmq_type) {
            Some(QvvecSyncMode::Always) => true,
            Some(QvvecSyncMode::OnlyIfTypeMember) => is_type_member,
            None => false,
        }
    }
}

/// Parse `llmq-qvvec-sync` entries of the form `<llmq_name>:<mode>`.
/// Duplicated types, unknown names and unknown modes are rejected.
pub fn parse_qvvec_sync_entries(entries: &[String]) -> Result<BTreeMap<LlmqType, QvvecSyncMode>> {
    let mut map = BTreeMap::new();
    for entry in entries {
        let mut parts = entry.split(':');
        let name = parts.next().unwrap_or("");
        let mode_str = parts.next().unwrap_or("");
        if name.is_empty() || mode_str.is_empty() || parts.next().is_some() {
            return Err(LlmqError::InvalidConfig(format!(
                "invalid format in llmq-qvvec-sync: {}",
                entry
            )));
        }
        let llmq_type = LlmqType::from_name(name).ok_or_else(|| {
            LlmqError::InvalidConfig(format!("invalid llmq type in llmq-qvvec-sync: {}", entry))
        })?;
        let mode = match mode_str.parse::<i32>() {
            Ok(0) => QvvecSyncMode::Always,
            Ok(1) => QvvecSyncMode::OnlyIfTypeMember,
            _ => {
                return Err(LlmqError::InvalidConfig(format!(
                    "invalid mode in llmq-qvvec-sync: {}",
                    entry
                )))
            }
        };
        if map.insert(llmq_type, mode).is_some() {
            return Err(LlmqError::InvalidConfig(format!(
                "duplicated llmq type in llmq-qvvec-sync: {}",
                entry
            )));
        }
    }
    Ok(map)
}
