//! Error taxonomy and peer-facing message outcomes.

use ferrite_shared_types::encode::EncodeError;
use thiserror::Error;

/// Banning score for an unambiguous protocol violation.
pub const MISBEHAVE_VIOLATION: u32 = 100;
/// Banning score for a plausible but wrong message.
pub const MISBEHAVE_SUSPECT: u32 = 10;
/// Banning score for stale or unlucky messages.
pub const MISBEHAVE_STALE: u32 = 20;

#[derive(Error, Debug)]
pub enum LlmqError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("store is poisoned after a failed write")]
    StorePoisoned,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("unknown quorum {0}")]
    UnknownQuorum(String),
    #[error("unknown block {0}")]
    UnknownBlock(String),
    #[error("invalid commitment: {0}")]
    InvalidCommitment(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("not a masternode")]
    NotAMasternode,
    #[error("shutting down")]
    ShuttingDown,
}

impl From<ferrite_crypto::bls::BlsError> for LlmqError {
    fn from(e: ferrite_crypto::bls::BlsError) -> Self {
        LlmqError::Crypto(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for LlmqError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        LlmqError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LlmqError>;

/// Structured outcome of a peer message, carrying the banning score
/// the transport should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Processed and worth relaying.
    Accepted,
    /// Duplicate or no-op; drop without scoring.
    Ignored,
    /// Dropped; the peer earns the contained score.
    Rejected { ban: u32 },
}

impl MessageOutcome {
    pub fn ban_score(&self) -> Option<u32> {
        match self {
            MessageOutcome::Rejected { ban } if *ban > 0 => Some(*ban),
            _ => None,
        }
    }

    pub fn accepted(&self) -> bool {
        matches!(self, MessageOutcome::Accepted)
    }
}
